//! Synthetic meter LED for the simulator.
//!
//! Plays the role of the GPIO interrupt on the device: every raw edge goes
//! through a [`PulseDebouncer`], and accepted pulses are submitted to the
//! work queue. Nothing here touches the ledger.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};
use meter_core::{PulseDebouncer, QueueHandle, Work};

/// Delay between a real edge and its contact-bounce echo.
const BOUNCE_DELAY: Duration = Duration::from_millis(3);

/// Rising edges a bouncing LED output would produce for one pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseTrain {
    period: Duration,
    bounces: u32,
}

impl PulseTrain {
    /// Pulses at `rate_hz`, each followed by `bounces` spurious edges.
    pub fn new(rate_hz: f64, bounces: u32) -> Self {
        let rate_hz = if rate_hz.is_finite() && rate_hz > 0.0 {
            rate_hz
        } else {
            1.0
        };
        Self {
            period: Duration::from_secs_f64(1.0 / rate_hz),
            bounces,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Offsets of every edge of one pulse, relative to its first edge.
    pub fn edges(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..=self.bounces).map(|i| BOUNCE_DELAY * i)
    }
}

/// Feed edges through the debouncer. Returns whether the edge was submitted.
pub fn on_edge<const N: usize>(
    debouncer: &mut PulseDebouncer,
    queue: &QueueHandle<'_, N>,
    now_ms: u32,
) -> bool {
    if !debouncer.accept(now_ms) {
        return false;
    }
    // A full queue counts the drop itself
    queue.submit(Work::Pulses(1)).is_ok()
}

/// Run the pulse source forever on the calling thread.
pub fn run<const N: usize>(
    train: PulseTrain,
    mut debouncer: PulseDebouncer,
    queue: QueueHandle<'static, N>,
) -> ! {
    info!(
        "Pulse source running: one pulse every {:?}",
        train.period()
    );
    let start = Instant::now();
    loop {
        let pulse_start = Instant::now();
        for offset in train.edges() {
            if let Some(wait) = (pulse_start + offset).checked_duration_since(Instant::now()) {
                thread::sleep(wait);
            }
            // Wraps after ~49 days, as the device's tick counter does
            let now_ms = start.elapsed().as_millis() as u32;
            if !on_edge(&mut debouncer, &queue, now_ms) {
                debug!("Edge at {} ms suppressed", now_ms);
            }
        }
        if let Some(wait) = (pulse_start + train.period()).checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
    }
}
