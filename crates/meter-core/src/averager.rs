//! Rolling power averages built from per-period pulse counts.

use log::info;

extern crate alloc;
use alloc::collections::VecDeque;

/// Number of per-period power samples kept (two hours at the default 60 s tick).
pub const HISTORY_LEN: usize = 120;

const SECONDS_PER_HOUR: f64 = 3600.0;

const JOULES_PER_KWH: f64 = 3_600_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AveragerState {
    /// No tick yet; every windowed query is unavailable
    WarmingUp,
    /// At least one sample recorded
    Steady,
}

/// Converts the pulses counted in each tick period into an average power.
///
/// ## Memory Usage
///
/// - History: 120 × 8 bytes = 960 bytes, allocated once at construction
///
/// Samples are in kW. The history is a ring buffer: the newest sample is at
/// the back and the oldest is evicted once it holds [`HISTORY_LEN`] entries,
/// so iteration order is time order.
#[derive(Debug, Clone)]
pub struct PowerAverager {
    history: VecDeque<f64>,
    /// Energy since boot in joules, not persisted
    cumulative_energy_joules: f64,
    /// Wall-clock ms of the most recent tick
    last_sample_timestamp: Option<u64>,
    period_secs: u32,
    pulse_per_kwh: u32,
}

impl PowerAverager {
    pub fn new(pulse_per_kwh: u32, period_secs: u32) -> Self {
        Self {
            history: VecDeque::with_capacity(HISTORY_LEN),
            cumulative_energy_joules: 0.0,
            last_sample_timestamp: None,
            period_secs: period_secs.max(1),
            pulse_per_kwh: pulse_per_kwh.max(1),
        }
    }

    /// Close the current window with the `pulses` counted during it.
    ///
    /// Returns the window's average power in kW.
    pub fn record_tick_window(&mut self, pulses: u32, now_ms: u64) -> f64 {
        // Integer-valued products first so whole-number rates divide exactly
        let pulses = f64::from(pulses);
        let avg_kw = pulses * SECONDS_PER_HOUR
            / f64::from(self.period_secs)
            / f64::from(self.pulse_per_kwh);

        if self.history.len() >= HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(avg_kw);

        // Same as avg_kw * 1000 * period_secs, without the rounding of avg_kw
        self.cumulative_energy_joules += pulses * JOULES_PER_KWH / f64::from(self.pulse_per_kwh);
        self.last_sample_timestamp = Some(now_ms);

        info!(
            "Pulses in last {} s: {}, avg {} kW, {} J since startup",
            self.period_secs, pulses, avg_kw, self.cumulative_energy_joules
        );

        avg_kw
    }

    pub fn state(&self) -> AveragerState {
        if self.history.is_empty() {
            AveragerState::WarmingUp
        } else {
            AveragerState::Steady
        }
    }

    /// Most recent sample in kW.
    pub fn latest(&self) -> Option<f64> {
        self.history.back().copied()
    }

    /// Mean of the most recent `n` samples, or of all of them if fewer exist.
    ///
    /// `None` before the first tick, so that "no data yet" is never mistaken
    /// for zero consumption.
    pub fn windowed_mean(&self, n: usize) -> Option<f64> {
        let count = n.min(self.history.len());
        if count == 0 {
            return None;
        }
        let sum: f64 = self.history.iter().rev().take(count).sum();
        Some(sum / count as f64)
    }

    /// Samples oldest first.
    pub fn history(&self) -> impl ExactSizeIterator<Item = f64> + '_ {
        self.history.iter().copied()
    }

    pub fn cumulative_energy_joules(&self) -> f64 {
        self.cumulative_energy_joules
    }

    pub fn last_sample_timestamp(&self) -> Option<u64> {
        self.last_sample_timestamp
    }

    pub fn period_secs(&self) -> u32 {
        self.period_secs
    }
}
