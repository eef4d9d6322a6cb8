//! Durable storage for the running energy total.
//!
//! The ledger persists a single logical record: key [`KWH_KEY`], value the
//! decimal string of the running total. Backends implement [`KeyValueStore`];
//! [`CounterStore`] layers the single-record semantics on top.

pub mod memory;
pub mod sd_card;

pub use memory::{MemoryStore, MemoryStoreError};
pub use sd_card::SdCardStore;

extern crate alloc;
use alloc::string::ToString;
use alloc::vec::Vec;

use log::{info, warn};

/// Key of the persisted running total.
pub const KWH_KEY: &str = "kwh";

/// How a storage backend judges one of its own faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The write may succeed if repeated (bus glitch, card busy).
    Transient,
    /// Repeating the write will not help (bad filesystem, worn media).
    Corruption,
}

/// Minimal durable key/value interface required by the ledger.
///
/// Writes made through [`put`](KeyValueStore::put) are only guaranteed to
/// survive power loss after [`flush`](KeyValueStore::flush) returns `Ok`.
/// Only sequential consistency for a single key is required.
pub trait KeyValueStore {
    type Error: core::fmt::Debug;

    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, Self::Error>;

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), Self::Error>;

    fn flush(&mut self) -> Result<(), Self::Error>;

    /// Distinguish faults worth retrying from permanent ones.
    fn classify(&self, _error: &Self::Error) -> FaultKind {
        FaultKind::Transient
    }
}

/// Single-record view of a [`KeyValueStore`] holding the kWh total.
///
/// Exclusively owned by the ledger; nothing else touches the handle.
pub struct CounterStore<S: KeyValueStore> {
    store: S,
}

impl<S: KeyValueStore> CounterStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Read the persisted total, initialising the record to zero on first run.
    ///
    /// A missing or unparsable record is normal first-run state and is
    /// replaced by `"0"`. Only a failure to read at all is returned, so a
    /// flaky bus at boot never overwrites a good total.
    pub fn load(&mut self) -> Result<f64, S::Error> {
        match self.store.get(KWH_KEY)? {
            Some(bytes) => match parse_total(&bytes) {
                Some(kwh) => {
                    info!("Opened counter store, kwh = {}", kwh);
                    Ok(kwh)
                }
                None => {
                    warn!("Stored kwh record is corrupt, reinitialising to 0");
                    self.initialise();
                    Ok(0.0)
                }
            },
            None => {
                info!("Created counter store");
                self.initialise();
                Ok(0.0)
            }
        }
    }

    fn initialise(&mut self) {
        match self.write(0.0) {
            Ok(()) => info!("Initialised counter store"),
            // The in-memory zero is still authoritative; the next flush retries.
            Err(e) => warn!("Failed to initialise counter store: {:?}", e),
        }
    }

    /// Write the total and force it to durable storage.
    pub fn write(&mut self, kwh: f64) -> Result<(), S::Error> {
        let value = kwh.to_string();
        self.store.put(KWH_KEY, value.as_bytes())?;
        self.store.flush()
    }

    pub fn classify(&self, error: &S::Error) -> FaultKind {
        self.store.classify(error)
    }

    /// Access the underlying backend.
    pub fn backend(&self) -> &S {
        &self.store
    }

    pub fn backend_mut(&mut self) -> &mut S {
        &mut self.store
    }
}

fn parse_total(bytes: &[u8]) -> Option<f64> {
    let text = core::str::from_utf8(bytes).ok()?;
    let kwh: f64 = text.trim().parse().ok()?;
    kwh.is_finite().then_some(kwh)
}
