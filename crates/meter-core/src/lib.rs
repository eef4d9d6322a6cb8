//! Hardware-independent core library for pulse-meter
//!
//! This crate contains all platform-agnostic logic for the pulse-counting
//! electricity meter: debouncing, the deferred work queue that moves counting
//! out of interrupt context, the persisted energy ledger, the rolling power
//! averager, metrics exposition and request routing.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! embedded targets (ESP32-S3) and desktop hosts (for the simulator and tests).

#![no_std]

extern crate alloc;

pub mod averager;
pub mod clock;
pub mod config;
pub mod debounce;
pub mod http;
pub mod ledger;
pub mod meter;
pub mod metrics;
pub mod queue;
pub mod storage;

pub use averager::{AveragerState, PowerAverager};
pub use config::{ConfigError, MeterConfig, Precision};
pub use debounce::PulseDebouncer;
pub use ledger::{EnergyLedger, LedgerError};
pub use meter::{PowerMeter, Status};
pub use metrics::MetricsExporter;
pub use queue::{DeferredWorkQueue, QueueFull, QueueHandle, Work};
pub use storage::{CounterStore, FaultKind, KeyValueStore};
