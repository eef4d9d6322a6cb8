//! ESP32-S3 firmware-specific modules for the pulse meter
//!
//! This crate contains the hardware-specific code that cannot compile on
//! desktop targets: the pulse GPIO interrupt, SD card bring-up, Wi-Fi and
//! the network stack, and SNTP time sync. Accounting itself lives in
//! `meter_core`.

#![no_std]

extern crate alloc;

pub mod config;
pub mod http;
pub mod net;
pub mod pulse;
pub mod sntp;
pub mod storage;
