//! Running energy total with batched write-through to durable storage.

use log::{debug, error, info, warn};
use thiserror_no_std::Error;

use crate::config::{MeterConfig, Precision};
use crate::storage::{CounterStore, FaultKind, KeyValueStore};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerError {
    #[error("persisted total could not be read, refusing to overwrite it")]
    Read,
    #[error("persisting the total failed ({0:?})")]
    Flush(FaultKind),
}

/// Owns the running kWh total and the store it is persisted to.
///
/// The total counts *down*: it mirrors the "remaining" register on a
/// prepaid meter's display, and each pulse subtracts one pulse worth of kWh.
///
/// Flush policy:
/// - [`apply`](Self::apply) batches; the total is written every
///   `flush_threshold` applications. Between flushes the store lags the
///   in-memory total but never leads it.
/// - [`set`](Self::set) always flushes before returning.
/// - A failed flush is logged and counted, the in-memory total stays
///   authoritative, and nothing is retried automatically. The next
///   successful flush reconciles.
///
/// If the store cannot be read at startup the ledger still opens, counting
/// from zero in memory. Until a later read succeeds or an operator
/// [`set`](Self::set) supplies a total, flushes are refused so the unread
/// total on storage is never clobbered. When the read does succeed, the
/// pulses counted meanwhile are subtracted from the stored total.
///
/// Must only be driven from the main loop's drain point, never from an
/// interrupt handler.
pub struct EnergyLedger<S: KeyValueStore> {
    store: CounterStore<S>,
    kwh: f64,
    kwh_per_pulse: f64,
    precision: Precision,
    flush_threshold: u32,
    /// Pulse applications since the last flush
    dirty_count: u32,
    /// Pulses since the last averaging tick
    pulses_this_period: u32,
    flush_failures: u32,
    /// The persisted total has not been read yet; `kwh` holds only the
    /// change since boot
    unread: bool,
    read_failures: u32,
}

impl<S: KeyValueStore> EnergyLedger<S> {
    /// Load the persisted total, creating the record on first run.
    ///
    /// Never fails: an unreadable store leaves the ledger degraded, see
    /// [`is_degraded`](Self::is_degraded).
    pub fn open(store: S, config: &MeterConfig) -> Self {
        let mut ledger = Self {
            store: CounterStore::new(store),
            kwh: 0.0,
            kwh_per_pulse: config.kwh_per_pulse(),
            precision: config.precision(),
            flush_threshold: config.flush_threshold.max(1),
            dirty_count: 0,
            pulses_this_period: 0,
            flush_failures: 0,
            unread: true,
            read_failures: 0,
        };
        if !ledger.reload() {
            warn!("Counting from 0 kWh until the stored total can be read");
        }
        ledger
    }

    /// Read the persisted total and fold in whatever was counted while it
    /// was unreadable. Returns whether the total is now known.
    fn reload(&mut self) -> bool {
        match self.store.load() {
            Ok(stored) => {
                self.kwh = self.precision.round(stored + self.kwh);
                self.unread = false;
                info!("kwh = {}", self.kwh);
                true
            }
            Err(e) => {
                self.read_failures = self.read_failures.wrapping_add(1);
                error!("Failed to read persisted kwh: {:?}", e);
                false
            }
        }
    }

    /// Account for `pulses` accepted pulses.
    pub fn apply(&mut self, pulses: u32) {
        if pulses == 0 {
            return;
        }

        self.pulses_this_period = self.pulses_this_period.saturating_add(pulses);
        // Round on every step so error from repeated subtraction can't build
        // up over millions of pulses.
        self.kwh = self
            .precision
            .round(self.kwh - f64::from(pulses) * self.kwh_per_pulse);
        self.dirty_count += 1;

        if self.dirty_count >= self.flush_threshold {
            // Failures are already logged and counted inside flush
            let _ = self.flush();
        }
    }

    /// Operator calibration: overwrite the total and persist it immediately.
    ///
    /// `kwh` must already be validated as finite by the caller.
    pub fn set(&mut self, kwh: f64) -> Result<(), LedgerError> {
        debug_assert!(kwh.is_finite());
        self.kwh = self.precision.round(kwh);
        // The operator's total supersedes whatever storage held
        self.unread = false;
        info!("Calibrated kwh to {}", self.kwh);
        self.flush()
    }

    /// Write the current total through to durable storage.
    pub fn flush(&mut self) -> Result<(), LedgerError> {
        self.dirty_count = 0;
        if self.unread && !self.reload() {
            return Err(LedgerError::Read);
        }
        match self.store.write(self.kwh) {
            Ok(()) => {
                debug!("Saved kwh to store: {}", self.kwh);
                Ok(())
            }
            Err(e) => {
                self.flush_failures = self.flush_failures.wrapping_add(1);
                let kind = self.store.classify(&e);
                error!("Failed to save kwh {} to store ({:?}): {:?}", self.kwh, kind, e);
                Err(LedgerError::Flush(kind))
            }
        }
    }

    /// Flush, retrying up to `attempts` times in total while the store
    /// reports the fault as transient.
    pub fn retry_flush(&mut self, attempts: u32) -> Result<(), LedgerError> {
        let mut result = self.flush();
        for attempt in 1..attempts {
            match result {
                Err(LedgerError::Flush(FaultKind::Transient)) => {
                    warn!("Retrying kwh flush (attempt {} of {})", attempt + 1, attempts);
                    result = self.flush();
                }
                _ => break,
            }
        }
        result
    }

    pub fn read(&self) -> f64 {
        self.kwh
    }

    /// Hand the pulses counted since the last tick to the averager.
    pub fn take_period_pulses(&mut self) -> u32 {
        core::mem::take(&mut self.pulses_this_period)
    }

    pub fn pulses_this_period(&self) -> u32 {
        self.pulses_this_period
    }

    pub fn dirty_count(&self) -> u32 {
        self.dirty_count
    }

    pub fn flush_failures(&self) -> u32 {
        self.flush_failures
    }

    /// Whether the stored total is still unread and writes are held back.
    pub fn is_degraded(&self) -> bool {
        self.unread
    }

    pub fn read_failures(&self) -> u32 {
        self.read_failures
    }

    pub fn kwh_per_pulse(&self) -> f64 {
        self.kwh_per_pulse
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn store(&self) -> &S {
        self.store.backend()
    }

    pub fn store_mut(&mut self) -> &mut S {
        self.store.backend_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{KWH_KEY, MemoryStore};

    fn config(pulse_per_kwh: u32, flush_threshold: u32) -> MeterConfig {
        MeterConfig {
            pulse_per_kwh,
            flush_threshold,
            ..MeterConfig::default()
        }
    }

    fn ledger_at(kwh: &str, config: &MeterConfig) -> EnergyLedger<MemoryStore> {
        let mut store = MemoryStore::new();
        store.put(KWH_KEY, kwh.as_bytes()).unwrap();
        store.flush().unwrap();
        EnergyLedger::open(store, config)
    }

    fn durable(ledger: &EnergyLedger<MemoryStore>) -> f64 {
        let bytes = ledger.store().durable(KWH_KEY).unwrap();
        core::str::from_utf8(bytes).unwrap().parse().unwrap()
    }

    #[test]
    fn test_open_fresh_store_starts_at_zero() {
        let ledger = EnergyLedger::open(MemoryStore::new(), &MeterConfig::default());
        assert_eq!(ledger.read(), 0.0);
        assert!(!ledger.is_degraded());
        assert_eq!(ledger.precision().digits(), 3);
    }

    fn unreadable_ledger(kwh: &str, config: &MeterConfig) -> EnergyLedger<MemoryStore> {
        let mut store = MemoryStore::new();
        store.put(KWH_KEY, kwh.as_bytes()).unwrap();
        store.flush().unwrap();
        store.fail_reads(true);
        EnergyLedger::open(store, config)
    }

    #[test]
    fn test_unreadable_store_opens_degraded_and_keeps_total() {
        let config = config(1000, 2);
        let mut ledger = unreadable_ledger("500", &config);
        assert!(ledger.is_degraded());
        assert_eq!(ledger.read_failures(), 1);
        assert_eq!(ledger.read(), 0.0);

        // Threshold reached, but the unread total is not overwritten
        ledger.apply(1);
        ledger.apply(1);
        assert_eq!(ledger.dirty_count(), 0);
        assert_eq!(ledger.flush(), Err(LedgerError::Read));
        assert_eq!(durable(&ledger), 500.0);
        assert_eq!(ledger.read_failures(), 3);
        assert_eq!(ledger.flush_failures(), 0);
    }

    #[test]
    fn test_degraded_ledger_recovers_counted_pulses() {
        let config = config(1000, 2);
        let mut ledger = unreadable_ledger("500", &config);
        ledger.apply(1);
        ledger.apply(1);
        ledger.apply(3);

        ledger.store_mut().fail_reads(false);
        ledger.apply(1);
        assert!(!ledger.is_degraded());
        assert_eq!(ledger.read(), 499.994);
        assert_eq!(durable(&ledger), 499.994);
    }

    #[test]
    fn test_set_ends_degraded_mode() {
        let config = config(1000, 100);
        let mut ledger = unreadable_ledger("500", &config);
        ledger.set(42.0).unwrap();
        assert!(!ledger.is_degraded());
        assert_eq!(durable(&ledger), 42.0);
    }

    #[test]
    fn test_thousand_single_pulses_make_one_kwh() {
        let config = config(1000, 100);
        let mut ledger = ledger_at("5000", &config);

        for _ in 0..1000 {
            ledger.apply(1);
            // Always exactly 3 decimal places
            let scaled = ledger.read() * 1000.0;
            assert!(libm::fabs(scaled - libm::round(scaled)) < 1e-6);
        }

        assert_eq!(ledger.read(), 4999.0);
        assert_eq!(ledger.pulses_this_period(), 1000);
    }

    #[test]
    fn test_batching_does_not_change_result() {
        let config = config(1000, 100);
        let mut one_by_one = ledger_at("123.456", &config);
        let mut batched = ledger_at("123.456", &config);
        let mut mixed = ledger_at("123.456", &config);

        for _ in 0..777 {
            one_by_one.apply(1);
        }
        batched.apply(777);
        for n in [300, 1, 76, 400] {
            mixed.apply(n);
        }

        assert_eq!(one_by_one.read(), 122.679);
        assert_eq!(batched.read(), 122.679);
        assert_eq!(mixed.read(), 122.679);
    }

    #[test]
    fn test_fractional_pulse_values_are_not_rounded_away() {
        // 800 imp/kWh -> 0.00125 kWh per pulse
        let config = config(800, 100);
        let mut ledger = ledger_at("10", &config);
        for _ in 0..800 {
            ledger.apply(1);
        }
        assert_eq!(ledger.read(), 9.0);
    }

    #[test]
    fn test_zero_pulses_are_ignored() {
        let config = config(1000, 1);
        let mut ledger = ledger_at("1", &config);
        let flushes = ledger.store().flushes();
        ledger.apply(0);
        assert_eq!(ledger.read(), 1.0);
        assert_eq!(ledger.dirty_count(), 0);
        assert_eq!(ledger.store().flushes(), flushes);
    }

    #[test]
    fn test_store_lags_until_threshold() {
        let config = config(1000, 10);
        let mut ledger = ledger_at("50", &config);

        for i in 1..10 {
            ledger.apply(1);
            assert_eq!(ledger.dirty_count(), i);
            // Lags, never leads
            assert_eq!(durable(&ledger), 50.0);
            assert!(durable(&ledger) >= ledger.read());
        }

        ledger.apply(1);
        assert_eq!(ledger.dirty_count(), 0);
        assert_eq!(durable(&ledger), ledger.read());
        assert_eq!(ledger.read(), 49.99);
    }

    #[test]
    fn test_set_flushes_immediately() {
        let config = config(1000, 100);
        let mut ledger = ledger_at("50", &config);
        ledger.apply(3);

        ledger.set(1234.5).unwrap();
        assert_eq!(ledger.read(), 1234.5);
        assert_eq!(durable(&ledger), 1234.5);
        assert_eq!(ledger.dirty_count(), 0);
    }

    #[test]
    fn test_set_accepts_negative_totals() {
        let config = config(1000, 100);
        let mut ledger = ledger_at("0", &config);
        ledger.set(-2.0).unwrap();
        ledger.apply(1);
        assert_eq!(ledger.read(), -2.001);
    }

    #[test]
    fn test_set_rounds_to_precision() {
        let config = config(1000, 100);
        let mut ledger = ledger_at("0", &config);
        ledger.set(10.12345).unwrap();
        assert_eq!(ledger.read(), 10.123);
        assert_eq!(ledger.store().durable(KWH_KEY), Some(&b"10.123"[..]));
    }

    #[test]
    fn test_failed_flush_keeps_memory_authoritative() {
        let config = config(1000, 2);
        let mut ledger = ledger_at("10", &config);
        ledger.store_mut().fail_writes(1, FaultKind::Transient);

        ledger.apply(1);
        ledger.apply(1);
        assert_eq!(ledger.read(), 9.998);
        assert_eq!(ledger.flush_failures(), 1);
        assert_eq!(durable(&ledger), 10.0);

        // Accounting continues and the next flush reconciles
        ledger.apply(1);
        ledger.apply(1);
        assert_eq!(durable(&ledger), 9.996);
        assert_eq!(ledger.flush_failures(), 1);
    }

    #[test]
    fn test_set_reports_flush_failure() {
        let config = config(1000, 100);
        let mut ledger = ledger_at("10", &config);
        ledger.store_mut().fail_writes(1, FaultKind::Corruption);

        assert_eq!(
            ledger.set(20.0),
            Err(LedgerError::Flush(FaultKind::Corruption))
        );
        assert_eq!(ledger.read(), 20.0);
        assert_eq!(durable(&ledger), 10.0);
    }

    #[test]
    fn test_retry_flush_retries_transient_faults_only() {
        let config = config(1000, 100);

        let mut ledger = ledger_at("10", &config);
        ledger.store_mut().fail_writes(2, FaultKind::Transient);
        assert!(ledger.retry_flush(3).is_ok());
        assert_eq!(ledger.flush_failures(), 2);

        let mut ledger = ledger_at("10", &config);
        ledger.store_mut().fail_writes(5, FaultKind::Transient);
        assert!(ledger.retry_flush(3).is_err());
        assert_eq!(ledger.flush_failures(), 3);

        let mut ledger = ledger_at("10", &config);
        ledger.store_mut().fail_writes(2, FaultKind::Corruption);
        assert!(ledger.retry_flush(3).is_err());
        assert_eq!(ledger.flush_failures(), 1);
    }

    #[test]
    fn test_take_period_pulses_resets() {
        let config = config(1000, 100);
        let mut ledger = ledger_at("10", &config);
        ledger.apply(2);
        ledger.apply(5);
        assert_eq!(ledger.take_period_pulses(), 7);
        assert_eq!(ledger.take_period_pulses(), 0);
    }
}
