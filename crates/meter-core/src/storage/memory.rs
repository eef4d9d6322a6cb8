//! RAM-backed key/value store with explicit durability and fault injection.
//!
//! Writes are staged until [`KeyValueStore::flush`], so callers can observe
//! the difference between "written" and "durable" exactly like on flash.

extern crate alloc;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use thiserror_no_std::Error;

use super::{FaultKind, KeyValueStore};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryStoreError {
    #[error("injected read fault")]
    Read,
    #[error("injected write fault ({0:?})")]
    Write(FaultKind),
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    durable: BTreeMap<String, Vec<u8>>,
    staged: BTreeMap<String, Vec<u8>>,
    fail_reads: bool,
    /// Remaining write faults to inject, and their kind
    write_faults: u32,
    write_fault_kind: Option<FaultKind>,
    flushes: u32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value as it would survive a power cut right now.
    pub fn durable(&self, key: &str) -> Option<&[u8]> {
        self.durable.get(key).map(Vec::as_slice)
    }

    /// Number of successful flushes so far.
    pub fn flushes(&self) -> u32 {
        self.flushes
    }

    pub fn fail_reads(&mut self, fail: bool) {
        self.fail_reads = fail;
    }

    /// Make the next `count` puts or flushes fail with `kind`.
    pub fn fail_writes(&mut self, count: u32, kind: FaultKind) {
        self.write_faults = count;
        self.write_fault_kind = Some(kind);
    }

    fn take_write_fault(&mut self) -> Result<(), MemoryStoreError> {
        match self.write_fault_kind {
            Some(kind) if self.write_faults > 0 => {
                self.write_faults -= 1;
                Err(MemoryStoreError::Write(kind))
            }
            _ => Ok(()),
        }
    }
}

impl KeyValueStore for MemoryStore {
    type Error = MemoryStoreError;

    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        if self.fail_reads {
            return Err(MemoryStoreError::Read);
        }
        Ok(self
            .staged
            .get(key)
            .or_else(|| self.durable.get(key))
            .cloned())
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), Self::Error> {
        self.take_write_fault()?;
        self.staged.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.take_write_fault()?;
        self.durable.append(&mut self.staged);
        self.flushes += 1;
        Ok(())
    }

    fn classify(&self, error: &Self::Error) -> FaultKind {
        match error {
            MemoryStoreError::Read => FaultKind::Transient,
            MemoryStoreError::Write(kind) => *kind,
        }
    }
}
