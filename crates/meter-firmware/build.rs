//! Bakes the meter configuration and Wi-Fi credentials into the firmware.
//!
//! Values come from the environment, with a `.env` file in the crate or
//! workspace root filling in anything not already set. Everything except the
//! Wi-Fi credentials has a default.

use std::env;
use std::fmt::Write as _;
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

const SETTINGS: &[(&str, &str)] = &[
    ("METER_PULSE_PER_KWH", "1000"),
    ("METER_FLUSH_THRESHOLD", "100"),
    ("METER_DEBOUNCE_MS", "50"),
    ("METER_TICK_PERIOD_SECS", "60"),
    ("METER_PULSE_PIN", "4"),
    ("METER_LED_PIN", "2"),
];

fn var(name: &str) -> Option<String> {
    println!("cargo:rerun-if-env-changed={name}");
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn number<T: FromStr>(name: &str, default: &str) -> String {
    let value = var(name).unwrap_or_else(|| default.to_owned());
    if value.parse::<T>().is_err() {
        panic!("{name}={value:?} is not a valid number");
    }
    value
}

fn main() {
    println!("cargo:rerun-if-changed=.env");
    println!("cargo:rerun-if-changed=../../.env");
    dotenvy::dotenv().ok();

    let ssid = var("METER_WIFI_SSID").unwrap_or_else(|| {
        println!("cargo:warning=METER_WIFI_SSID is not set, Wi-Fi will not connect");
        String::new()
    });
    let password = var("METER_WIFI_PASSWORD").unwrap_or_default();
    let ntp_server = var("METER_NTP_SERVER").unwrap_or_else(|| "162.159.200.1".to_owned());
    let ntp: Ipv4Addr = ntp_server
        .parse()
        .unwrap_or_else(|_| panic!("METER_NTP_SERVER={ntp_server:?} is not an IPv4 address"));

    let mut out = String::new();
    writeln!(out, "pub const WIFI_SSID: &str = {ssid:?};").unwrap();
    writeln!(out, "pub const WIFI_PASSWORD: &str = {password:?};").unwrap();
    writeln!(out, "pub const NTP_SERVER: [u8; 4] = {:?};", ntp.octets()).unwrap();
    for &(name, default) in SETTINGS {
        let konst = name.trim_start_matches("METER_");
        let (ty, value) = if name.ends_with("_PIN") {
            ("u8", number::<u8>(name, default))
        } else {
            ("u32", number::<u32>(name, default))
        };
        writeln!(out, "pub const {konst}: {ty} = {value};").unwrap();
    }

    let path = PathBuf::from(env::var("OUT_DIR").unwrap()).join("baked_config.rs");
    fs::write(path, out).unwrap();
}
