//! The accounting engine as seen by the main loop.

use core::fmt::Display;

use log::info;
use thiserror_no_std::Error;

extern crate alloc;
use alloc::string::String;
use alloc::vec::Vec;

use crate::averager::PowerAverager;
use crate::config::{ConfigError, MeterConfig};
use crate::ledger::{EnergyLedger, LedgerError};
use crate::metrics::MetricsExporter;
use crate::queue::{DeferredWorkQueue, DropStats, Work};
use crate::storage::{FaultKind, KeyValueStore};

/// Total write attempts for an operator calibration.
pub const CALIBRATION_FLUSH_ATTEMPTS: u32 = 3;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Ledger plus averager, mutated only from the main loop's drain point.
///
/// Interrupt handlers and timers never see this type; they get a
/// [`QueueHandle`](crate::queue::QueueHandle) and submit [`Work`] which
/// [`service`](Self::service) later runs. Request handling calls the
/// query and calibration methods from the same loop, so every access is
/// single-writer without a lock.
pub struct PowerMeter<S: KeyValueStore> {
    ledger: EnergyLedger<S>,
    averager: PowerAverager,
    dropped: DropStats,
}

impl<S: KeyValueStore> PowerMeter<S> {
    pub fn open(store: S, config: &MeterConfig) -> Result<Self, MeterError> {
        config.validate()?;
        let ledger = EnergyLedger::open(store, config);
        let averager = PowerAverager::new(config.pulse_per_kwh, config.tick_period_secs);
        Ok(Self {
            ledger,
            averager,
            dropped: DropStats::default(),
        })
    }

    /// Execute one deferred work item.
    pub fn run(&mut self, work: Work, now_ms: u64) {
        match work {
            Work::Pulses(pulses) => self.ledger.apply(pulses),
            Work::Tick => {
                let pulses = self.ledger.take_period_pulses();
                self.averager.record_tick_window(pulses, now_ms);
            }
        }
    }

    /// Drain `queue`, running everything it holds. Returns the number run.
    pub fn service<const N: usize>(&mut self, queue: &DeferredWorkQueue<N>, now_ms: u64) -> usize {
        let ran = queue.drain_and_run(|work| self.run(work, now_ms));
        self.dropped = queue.dropped();
        ran
    }

    /// Operator calibration of the running total.
    ///
    /// Transient storage faults get a bounded number of retries; the new
    /// total is in effect in memory either way.
    pub fn calibrate(&mut self, kwh: f64) -> Result<(), LedgerError> {
        match self.ledger.set(kwh) {
            Err(LedgerError::Flush(FaultKind::Transient)) => {
                self.ledger.retry_flush(CALIBRATION_FLUSH_ATTEMPTS - 1)
            }
            result => result,
        }
    }

    pub fn kwh(&self) -> f64 {
        self.ledger.read()
    }

    pub fn status(&self, now_ms: u64) -> Status {
        Status {
            kwh: self.ledger.read(),
            history: self.averager.history().collect(),
            cumulative_joules: self.averager.cumulative_energy_joules(),
            last_sample_timestamp: self.averager.last_sample_timestamp(),
            now_ms,
            dropped: self.dropped,
            flush_failures: self.ledger.flush_failures(),
            store_unread: self.ledger.is_degraded(),
        }
    }

    pub fn metrics(&self) -> MetricsExporter<'_, S> {
        MetricsExporter::new(&self.ledger, &self.averager).with_dropped(self.dropped)
    }

    pub fn metrics_text(&self, now_ms: u64) -> String {
        self.metrics().render(now_ms)
    }

    /// Persist whatever is pending, e.g. before a planned shutdown.
    pub fn shutdown(&mut self) -> Result<(), LedgerError> {
        info!("Flushing kwh before shutdown");
        self.ledger.flush()
    }

    pub fn ledger(&self) -> &EnergyLedger<S> {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut EnergyLedger<S> {
        &mut self.ledger
    }

    pub fn averager(&self) -> &PowerAverager {
        &self.averager
    }
}

/// Snapshot answering a status request.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub kwh: f64,
    /// Power samples in kW, oldest first
    pub history: Vec<f64>,
    pub cumulative_joules: f64,
    pub last_sample_timestamp: Option<u64>,
    pub now_ms: u64,
    pub dropped: DropStats,
    pub flush_failures: u32,
    /// Flushes are held back until the stored total can be read
    pub store_unread: bool,
}

impl Display for Status {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "kWh: {}", self.kwh)?;
        if self.store_unread {
            writeln!(f, "Stored total unreadable, kWh counts from boot")?;
        }
        match self.last_sample_timestamp {
            Some(ts) => writeln!(f, "Last sample: {} ms", ts)?,
            None => writeln!(f, "Last sample: none yet")?,
        }
        writeln!(f, "Time now: {} ms", self.now_ms)?;
        writeln!(f, "Energy since startup: {} J", self.cumulative_joules)?;
        writeln!(
            f,
            "Dropped: {} pulses, {} ticks; flush failures: {}",
            self.dropped.pulses, self.dropped.ticks, self.flush_failures
        )?;
        write!(f, "Last {} samples (kW):", self.history.len())?;
        for kw in &self.history {
            write!(f, " {}", kw)?;
        }
        writeln!(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{KWH_KEY, MemoryStore};

    fn meter(kwh: &str) -> PowerMeter<MemoryStore> {
        let mut store = MemoryStore::new();
        store.put(KWH_KEY, kwh.as_bytes()).unwrap();
        store.flush().unwrap();
        PowerMeter::open(store, &MeterConfig::default()).unwrap()
    }

    #[test]
    fn test_open_rejects_bad_config() {
        let config = MeterConfig {
            pulse_per_kwh: 0,
            ..MeterConfig::default()
        };
        assert_eq!(
            PowerMeter::open(MemoryStore::new(), &config).err(),
            Some(MeterError::Config(ConfigError::ZeroPulsesPerKwh))
        );
    }

    #[test]
    fn test_open_survives_unreadable_store() {
        let mut store = MemoryStore::new();
        store.put(KWH_KEY, b"100").unwrap();
        store.flush().unwrap();
        store.fail_reads(true);
        let mut meter = PowerMeter::open(store, &MeterConfig::default()).unwrap();

        meter.run(Work::Pulses(5), 0);
        assert_eq!(meter.kwh(), -0.005);
        assert!(meter.status(0).store_unread);
        assert!(meter.shutdown().is_err());
        assert_eq!(meter.ledger().store().durable(KWH_KEY), Some(&b"100"[..]));

        meter.ledger_mut().store_mut().fail_reads(false);
        meter.shutdown().unwrap();
        assert_eq!(meter.kwh(), 99.995);
        assert!(!meter.status(0).store_unread);
    }

    #[test]
    fn test_overflow_scenario_applies_only_queued_pulses() {
        let mut meter = meter("100");
        let queue: DeferredWorkQueue<8> = DeferredWorkQueue::new();
        let handle = queue.handle();

        let mut dropped = 0;
        for _ in 0..10 {
            if handle.submit(Work::Pulses(1)).is_err() {
                dropped += 1;
            }
        }
        assert_eq!(dropped, 2);

        assert_eq!(meter.service(&queue, 0), 8);
        assert_eq!(meter.ledger().pulses_this_period(), 8);
        assert_eq!(meter.kwh(), 99.992);
        assert_eq!(meter.status(0).dropped.pulses, 2);
    }

    #[test]
    fn test_tick_through_queue_closes_window() {
        let mut meter = meter("100");
        let queue: DeferredWorkQueue<8> = DeferredWorkQueue::new();

        for _ in 0..3 {
            queue.submit(Work::Pulses(10)).unwrap();
        }
        queue.submit(Work::Tick).unwrap();
        queue.submit(Work::Tick).unwrap();
        meter.service(&queue, 120_000);

        let status = meter.status(120_000);
        assert_eq!(status.history.len(), 2);
        assert_eq!(status.history, [1.8, 0.0]);
        assert_eq!(status.cumulative_joules, 108_000.0);
        assert_eq!(status.last_sample_timestamp, Some(120_000));
        assert_eq!(meter.ledger().pulses_this_period(), 0);
    }

    #[test]
    fn test_calibrate_retries_transient_faults() {
        let mut meter = meter("100");
        meter.ledger_mut().store_mut().fail_writes(2, FaultKind::Transient);

        assert!(meter.calibrate(250.0).is_ok());
        assert_eq!(meter.kwh(), 250.0);
        assert_eq!(meter.ledger().store().durable(KWH_KEY), Some(&b"250"[..]));
    }

    #[test]
    fn test_calibrate_gives_up_on_corruption() {
        let mut meter = meter("100");
        meter.ledger_mut().store_mut().fail_writes(1, FaultKind::Corruption);

        assert_eq!(
            meter.calibrate(250.0),
            Err(LedgerError::Flush(FaultKind::Corruption))
        );
        // Accounting carries on from the new value
        assert_eq!(meter.kwh(), 250.0);
        assert_eq!(meter.ledger().flush_failures(), 1);
    }

    #[test]
    fn test_queries_are_idempotent() {
        let mut meter = meter("42");
        meter.run(Work::Pulses(5), 0);
        meter.run(Work::Tick, 60_000);

        assert_eq!(meter.status(61_000), meter.status(61_000));
        assert_eq!(meter.metrics_text(61_000), meter.metrics_text(61_000));
        assert_eq!(meter.kwh(), meter.kwh());
    }

    #[test]
    fn test_status_display_lists_history() {
        let mut meter = meter("42");
        meter.run(Work::Tick, 60_000);
        let text = alloc::format!("{}", meter.status(61_000));
        assert!(text.contains("kWh: 42"));
        assert!(text.contains("Last 1 samples (kW): 0"));
    }

    #[test]
    fn test_shutdown_flushes_pending_pulses() {
        let mut meter = meter("10");
        meter.run(Work::Pulses(1), 0);
        assert_eq!(meter.ledger().store().durable(KWH_KEY), Some(&b"10"[..]));

        meter.shutdown().unwrap();
        assert_eq!(meter.ledger().store().durable(KWH_KEY), Some(&b"9.999"[..]));
    }
}
