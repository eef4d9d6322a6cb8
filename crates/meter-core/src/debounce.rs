//! Contact-bounce filter for pulse edges.

/// Rejects pulse edges arriving closer together than a minimum interval.
///
/// Timestamps are a free-running millisecond tick counter that may wrap
/// around `u32::MAX`; the interval is taken with wrapping subtraction so a
/// wrap is indistinguishable from any other tick.
///
/// `accept` does no I/O and no allocation, so it is safe to call from the
/// pulse interrupt handler. The struct is `Copy` so it can live inside a
/// `critical_section::Mutex<Cell<_>>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseDebouncer {
    window_ms: u32,
    last_pulse_ms: Option<u32>,
}

impl PulseDebouncer {
    /// Recommended window for mechanical and opto-coupled meter outputs.
    pub const DEFAULT_WINDOW_MS: u32 = 50;

    pub const fn new(window_ms: u32) -> Self {
        Self {
            window_ms,
            last_pulse_ms: None,
        }
    }

    /// Returns `true` if the edge at `now_ms` counts as a new pulse.
    #[inline]
    pub fn accept(&mut self, now_ms: u32) -> bool {
        if let Some(last) = self.last_pulse_ms {
            if now_ms.wrapping_sub(last) < self.window_ms {
                return false;
            }
        }
        self.last_pulse_ms = Some(now_ms);
        true
    }

    /// Tick of the last accepted pulse.
    pub const fn last_pulse_ms(&self) -> Option<u32> {
        self.last_pulse_ms
    }

    pub const fn window_ms(&self) -> u32 {
        self.window_ms
    }
}

impl Default for PulseDebouncer {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_edge_is_accepted() {
        let mut debouncer = PulseDebouncer::default();
        assert!(debouncer.accept(0));
        assert_eq!(debouncer.last_pulse_ms(), Some(0));
    }

    #[test]
    fn test_bounce_within_window_is_rejected() {
        let mut debouncer = PulseDebouncer::new(50);
        assert!(debouncer.accept(1000));
        assert!(!debouncer.accept(1010));
        assert!(!debouncer.accept(1049));
        // Rejected edges do not move the reference point
        assert_eq!(debouncer.last_pulse_ms(), Some(1000));
    }

    #[test]
    fn test_edges_outside_window_are_both_accepted() {
        let mut debouncer = PulseDebouncer::new(50);
        assert!(debouncer.accept(1000));
        assert!(debouncer.accept(1050));
        assert!(debouncer.accept(1200));
    }

    #[test]
    fn test_tick_wraparound() {
        let mut debouncer = PulseDebouncer::new(50);
        assert!(debouncer.accept(u32::MAX - 10));
        // 20 ms later, after the counter wrapped
        assert!(!debouncer.accept(9));
        // 61 ms later
        assert!(debouncer.accept(50));
    }
}
