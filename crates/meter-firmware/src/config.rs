//! Configuration baked in at build time from the environment or `.env`.

use meter_core::MeterConfig;

mod baked {
    include!(concat!(env!("OUT_DIR"), "/baked_config.rs"));
}

pub use baked::{NTP_SERVER, WIFI_PASSWORD, WIFI_SSID};

/// GPIOs taken by the SD card SPI bus (SCK, MOSI, MISO, CS).
pub const SD_CARD_PINS: [u8; 4] = [12, 11, 13, 10];

pub const HTTP_PORT: u16 = 80;

pub fn meter_config() -> MeterConfig {
    MeterConfig {
        pulse_per_kwh: baked::PULSE_PER_KWH,
        flush_threshold: baked::FLUSH_THRESHOLD,
        debounce_ms: baked::DEBOUNCE_MS,
        tick_period_secs: baked::TICK_PERIOD_SECS,
        pulse_pin: baked::PULSE_PIN,
        led_pin: baked::LED_PIN,
    }
}

/// Whether the configured pulse and LED pins are free for the meter to claim.
pub fn pins_available(config: &MeterConfig) -> bool {
    config.pulse_pin != config.led_pin
        && !SD_CARD_PINS.contains(&config.pulse_pin)
        && !SD_CARD_PINS.contains(&config.led_pin)
}
