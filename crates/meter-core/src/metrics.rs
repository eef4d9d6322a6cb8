//! Line-oriented metrics exposition
//!
//! One `<name> <value>` pair per line, Prometheus text format compatible.
//! Timestamps are milliseconds since the Unix epoch, which is what
//! Prometheus expects.

use core::fmt::{self, Write};

extern crate alloc;
use alloc::string::String;

use crate::averager::PowerAverager;
use crate::ledger::EnergyLedger;
use crate::queue::DropStats;
use crate::storage::KeyValueStore;

/// Emitted instead of the metrics until the first averaging tick.
pub const NOT_READY: &str = "# Please wait for the first power sample\n";

/// Averaging windows in samples, and the metric suffix for each.
///
/// Suffixes assume the default 60 s tick.
pub const AVERAGE_WINDOWS: [(usize, &str); 5] =
    [(1, "1m"), (5, "5m"), (15, "15m"), (60, "60m"), (120, "120m")];

/// Read-only projection of the ledger and averager.
///
/// Holds only shared borrows, so rendering cannot change meter state and
/// repeated renders with the same `now_ms` are identical.
pub struct MetricsExporter<'a, S: KeyValueStore> {
    ledger: &'a EnergyLedger<S>,
    averager: &'a PowerAverager,
    dropped: DropStats,
}

impl<'a, S: KeyValueStore> MetricsExporter<'a, S> {
    pub fn new(ledger: &'a EnergyLedger<S>, averager: &'a PowerAverager) -> Self {
        Self {
            ledger,
            averager,
            dropped: DropStats::default(),
        }
    }

    /// Include work-queue overflow counts in the export.
    pub fn with_dropped(mut self, dropped: DropStats) -> Self {
        self.dropped = dropped;
        self
    }

    pub fn render(&self, now_ms: u64) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail
        let _ = self.write_to(&mut out, now_ms);
        out
    }

    pub fn write_to<W: Write>(&self, out: &mut W, now_ms: u64) -> fmt::Result {
        let Some(timestamp) = self.averager.last_sample_timestamp() else {
            return out.write_str(NOT_READY);
        };

        writeln!(out, "power_meter_time_now_ms {}", now_ms)?;
        writeln!(out, "power_meter_last_sample_timestamp_ms {}", timestamp)?;
        writeln!(out, "power_meter_kwh {}", self.ledger.read())?;
        for (samples, suffix) in AVERAGE_WINDOWS {
            // Each window is omitted on its own if it has no data
            if let Some(kw) = self.averager.windowed_mean(samples) {
                writeln!(out, "power_meter_watts_avg_{} {}", suffix, kw * 1000.0)?;
            }
        }
        writeln!(
            out,
            "power_meter_joules_total {}",
            self.averager.cumulative_energy_joules()
        )?;
        writeln!(
            out,
            "power_meter_dropped_pulses_total {}",
            self.dropped.pulses
        )?;
        writeln!(
            out,
            "power_meter_flush_failures_total {}",
            self.ledger.flush_failures()
        )?;
        writeln!(
            out,
            "power_meter_store_read_failures_total {}",
            self.ledger.read_failures()
        )?;
        writeln!(
            out,
            "power_meter_store_unread {}",
            u8::from(self.ledger.is_degraded())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeterConfig;
    use crate::storage::{KWH_KEY, MemoryStore};

    extern crate alloc;
    use alloc::vec::Vec;

    fn ledger(kwh: &str) -> EnergyLedger<MemoryStore> {
        let mut store = MemoryStore::new();
        store.put(KWH_KEY, kwh.as_bytes()).unwrap();
        store.flush().unwrap();
        EnergyLedger::open(store, &MeterConfig::default())
    }

    fn value<'a>(text: &'a str, name: &str) -> Option<&'a str> {
        text.lines().find_map(|line| {
            let (key, value) = line.split_once(' ')?;
            (key == name).then_some(value)
        })
    }

    #[test]
    fn test_not_ready_before_first_tick() {
        let ledger = ledger("12.5");
        let averager = PowerAverager::new(1000, 60);
        let text = MetricsExporter::new(&ledger, &averager).render(1_000);
        assert_eq!(text, NOT_READY);
        assert_eq!(text.lines().count(), 1);
    }

    #[test]
    fn test_every_line_is_name_and_number() {
        let ledger = ledger("12.5");
        let mut averager = PowerAverager::new(1, 3600);
        averager.record_tick_window(2, 1_700_000_000_000);
        averager.record_tick_window(4, 1_700_000_060_000);

        let text = MetricsExporter::new(&ledger, &averager).render(1_700_000_061_000);
        for line in text.lines() {
            let parts: Vec<&str> = line.split(' ').collect();
            assert_eq!(parts.len(), 2, "bad line {line:?}");
            assert!(parts[1].parse::<f64>().is_ok(), "bad value {line:?}");
        }

        assert_eq!(value(&text, "power_meter_kwh"), Some("12.5"));
        assert_eq!(value(&text, "power_meter_time_now_ms"), Some("1700000061000"));
        assert_eq!(
            value(&text, "power_meter_last_sample_timestamp_ms"),
            Some("1700000060000")
        );
        assert_eq!(value(&text, "power_meter_watts_avg_1m"), Some("4000"));
        // Only two samples: every wider window is their mean
        assert_eq!(value(&text, "power_meter_watts_avg_5m"), Some("3000"));
        assert_eq!(value(&text, "power_meter_watts_avg_120m"), Some("3000"));
        assert_eq!(value(&text, "power_meter_dropped_pulses_total"), Some("0"));
        assert_eq!(value(&text, "power_meter_store_read_failures_total"), Some("0"));
        assert_eq!(value(&text, "power_meter_store_unread"), Some("0"));
    }

    #[test]
    fn test_unreadable_store_is_exported() {
        let mut store = MemoryStore::new();
        store.fail_reads(true);
        let ledger = EnergyLedger::open(store, &MeterConfig::default());
        let mut averager = PowerAverager::new(1000, 60);
        averager.record_tick_window(0, 0);

        let text = MetricsExporter::new(&ledger, &averager).render(0);
        assert_eq!(value(&text, "power_meter_store_read_failures_total"), Some("1"));
        assert_eq!(value(&text, "power_meter_store_unread"), Some("1"));
    }

    #[test]
    fn test_dropped_pulses_are_exported() {
        let ledger = ledger("1");
        let mut averager = PowerAverager::new(1000, 60);
        averager.record_tick_window(0, 0);

        let dropped = DropStats {
            submissions: 2,
            pulses: 2,
            ticks: 0,
        };
        let text = MetricsExporter::new(&ledger, &averager)
            .with_dropped(dropped)
            .render(0);
        assert_eq!(value(&text, "power_meter_dropped_pulses_total"), Some("2"));
    }

    #[test]
    fn test_render_is_idempotent() {
        let ledger = ledger("7");
        let mut averager = PowerAverager::new(1000, 60);
        averager.record_tick_window(3, 60_000);

        let exporter = MetricsExporter::new(&ledger, &averager);
        assert_eq!(exporter.render(61_000), exporter.render(61_000));
        assert_eq!(averager.history().len(), 1);
        assert_eq!(ledger.read(), 7.0);
    }
}
