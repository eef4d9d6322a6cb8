//! Meter configuration and the constants derived from it once at startup.

use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

/// Most decimal digits a running total is ever rounded to.
pub const MAX_PRECISION: u32 = 9;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct MeterConfig {
    /// Pulses emitted by the utility meter per consumed kWh (printed on the meter face).
    pub pulse_per_kwh: u32,
    /// Pulse applications between durable writes of the running total.
    pub flush_threshold: u32,
    /// Minimum spacing between two accepted pulse edges.
    pub debounce_ms: u32,
    /// Period of the power averaging tick.
    pub tick_period_secs: u32,
    /// GPIO wired to the meter's pulse output.
    pub pulse_pin: u8,
    /// GPIO driving the on-board LED, held high impedance.
    pub led_pin: u8,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            pulse_per_kwh: 1000,
            flush_threshold: 100,
            debounce_ms: 50,
            tick_period_secs: 60,
            pulse_pin: 4,
            led_pin: 2,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("pulse_per_kwh must be greater than zero")]
    ZeroPulsesPerKwh,
    #[error("flush_threshold must be greater than zero")]
    ZeroFlushThreshold,
    #[error("tick_period_secs must be greater than zero")]
    ZeroTickPeriod,
}

impl MeterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pulse_per_kwh == 0 {
            return Err(ConfigError::ZeroPulsesPerKwh);
        }
        if self.flush_threshold == 0 {
            return Err(ConfigError::ZeroFlushThreshold);
        }
        if self.tick_period_secs == 0 {
            return Err(ConfigError::ZeroTickPeriod);
        }
        Ok(())
    }

    /// Energy represented by a single pulse.
    pub fn kwh_per_pulse(&self) -> f64 {
        1.0 / f64::from(self.pulse_per_kwh)
    }

    pub fn precision(&self) -> Precision {
        Precision::for_pulses_per_kwh(self.pulse_per_kwh)
    }
}

/// Decimal rounding applied to the running total after every change.
///
/// The digit count is the smallest one at which a single pulse's kWh value is
/// exactly representable, so 1000 imp/kWh rounds to 3 places and 800 imp/kWh
/// (0.00125 kWh per pulse) to 5. Pulse rates with a prime factor other than 2
/// or 5 never terminate and fall back to [`MAX_PRECISION`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Precision {
    digits: u32,
    scale: f64,
}

impl Precision {
    pub fn for_pulses_per_kwh(pulse_per_kwh: u32) -> Self {
        let n = u64::from(pulse_per_kwh.max(1));
        let digits = (0..=MAX_PRECISION)
            .find(|&p| 10u64.pow(p) % n == 0)
            .unwrap_or(MAX_PRECISION);
        Self::with_digits(digits)
    }

    pub fn with_digits(digits: u32) -> Self {
        let digits = digits.min(MAX_PRECISION);
        Self {
            digits,
            scale: 10u64.pow(digits) as f64,
        }
    }

    pub const fn digits(&self) -> u32 {
        self.digits
    }

    /// Round half away from zero to `digits` decimal places.
    pub fn round(&self, value: f64) -> f64 {
        // `+ 0.0` folds a rounded -0.0 into 0.0
        libm::round(value * self.scale) / self.scale + 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MeterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.kwh_per_pulse(), 0.001);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = MeterConfig::default();
        config.pulse_per_kwh = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroPulsesPerKwh));

        let mut config = MeterConfig::default();
        config.flush_threshold = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroFlushThreshold));

        let mut config = MeterConfig::default();
        config.tick_period_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroTickPeriod));
    }

    #[test]
    fn test_precision_from_power_of_ten() {
        assert_eq!(Precision::for_pulses_per_kwh(1).digits(), 0);
        assert_eq!(Precision::for_pulses_per_kwh(10).digits(), 1);
        assert_eq!(Precision::for_pulses_per_kwh(1000).digits(), 3);
        assert_eq!(Precision::for_pulses_per_kwh(10000).digits(), 4);
    }

    #[test]
    fn test_precision_keeps_fractional_pulse_values() {
        // 800 imp/kWh -> 0.00125 kWh per pulse
        assert_eq!(Precision::for_pulses_per_kwh(800).digits(), 5);
        // 1600 imp/kWh -> 0.000625 kWh per pulse
        assert_eq!(Precision::for_pulses_per_kwh(1600).digits(), 6);
        // Never terminates in decimal
        assert_eq!(Precision::for_pulses_per_kwh(3).digits(), MAX_PRECISION);
    }

    #[test]
    fn test_round() {
        let precision = Precision::with_digits(3);
        assert_eq!(precision.round(1.23449), 1.234);
        assert_eq!(precision.round(1.2346), 1.235);
        let zero = precision.round(-0.0004);
        assert_eq!(zero, 0.0);
        assert!(zero.is_sign_positive());
        assert_eq!(alloc::format!("{}", zero), "0");
        assert_eq!(precision.round(99.999 - 0.001), 99.998);
    }
}
