//! Bounded hand-off of pulse and tick work from interrupt context to the main loop.

use core::cell::Cell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, TrySendError};
use log::warn;
use thiserror_no_std::Error;

/// Default queue depth.
/// Pulses arrive at single-digit Hz at most, so 8 covers any realistic gap
/// between two drains of the main loop.
pub const WORK_QUEUE_CAPACITY: usize = 8;

/// Unit of work deferred from interrupt or timer context to the main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Work {
    /// Apply this many accepted pulses to the ledger
    Pulses(u32),
    /// Close the current averaging window
    Tick,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("deferred work queue is full")]
pub struct QueueFull;

/// Submissions lost to a full queue since boot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropStats {
    pub submissions: u32,
    /// Pulses carried by dropped `Work::Pulses` entries
    pub pulses: u32,
    pub ticks: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct Telemetry {
    dropped: DropStats,
    /// `dropped.submissions` at the time of the last warning
    reported: u32,
}

/// Bounded FIFO hand-off from interrupt context to the main loop.
///
/// [`submit`](Self::submit) never blocks and never allocates, so interrupt
/// handlers and timer callbacks may call it. Work only ever runs from
/// [`drain_and_run`](Self::drain_and_run), which the main loop calls at a
/// single cooperative point; that is what keeps the ledger and the averager
/// single-writer without a lock of their own.
///
/// Overflow drops the submission and counts it. A dropped pulse is lost
/// energy, so the count is kept separately from normal operation and surfaced
/// in metrics instead of being folded into a later entry.
///
/// ## Usage
///
/// ```rust,ignore
/// static WORK_QUEUE: DeferredWorkQueue<8> = DeferredWorkQueue::new();
///
/// // interrupt handler
/// let _ = WORK_QUEUE.submit(Work::Pulses(1));
///
/// // main loop
/// WORK_QUEUE.drain_and_run(|work| meter.run(work, now_ms));
/// ```
pub struct DeferredWorkQueue<const N: usize> {
    channel: Channel<CriticalSectionRawMutex, Work, N>,
    telemetry: Mutex<CriticalSectionRawMutex, Cell<Telemetry>>,
}

impl<const N: usize> Default for DeferredWorkQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> DeferredWorkQueue<N> {
    pub const fn new() -> Self {
        Self {
            channel: Channel::new(),
            telemetry: Mutex::new(Cell::new(Telemetry {
                dropped: DropStats {
                    submissions: 0,
                    pulses: 0,
                    ticks: 0,
                },
                reported: 0,
            })),
        }
    }

    /// Queue work for the next drain. Interrupt safe.
    pub fn submit(&self, work: Work) -> Result<(), QueueFull> {
        match self.channel.try_send(work) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(work)) => {
                self.telemetry.lock(|cell| {
                    let mut telemetry = cell.get();
                    let dropped = &mut telemetry.dropped;
                    dropped.submissions = dropped.submissions.wrapping_add(1);
                    match work {
                        Work::Pulses(pulses) => {
                            dropped.pulses = dropped.pulses.wrapping_add(pulses)
                        }
                        Work::Tick => dropped.ticks = dropped.ticks.wrapping_add(1),
                    }
                    cell.set(telemetry);
                });
                Err(QueueFull)
            }
        }
    }

    /// Submission-only capability for interrupt handlers.
    pub const fn handle(&self) -> QueueHandle<'_, N> {
        QueueHandle { queue: self }
    }

    /// Run every entry queued so far, oldest first.
    ///
    /// Entries submitted while draining wait for the next call, so one drain
    /// is bounded by the queue capacity. Returns the number of entries run.
    pub fn drain_and_run<F>(&self, mut run: F) -> usize
    where
        F: FnMut(Work),
    {
        self.report_drops();

        let pending = self.channel.len();
        let mut ran = 0;
        for _ in 0..pending {
            match self.channel.try_receive() {
                Ok(work) => {
                    run(work);
                    ran += 1;
                }
                Err(_) => break,
            }
        }
        ran
    }

    /// Wait until at least one entry is queued and return it.
    pub async fn next(&self) -> Work {
        self.channel.receive().await
    }

    pub fn len(&self) -> usize {
        self.channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }

    pub fn dropped(&self) -> DropStats {
        self.telemetry.lock(|cell| cell.get().dropped)
    }

    /// Log new drops from the main loop; the interrupt path stays silent.
    fn report_drops(&self) {
        let new_drops = self.telemetry.lock(|cell| {
            let mut telemetry = cell.get();
            let new_drops = telemetry.dropped.submissions.wrapping_sub(telemetry.reported);
            telemetry.reported = telemetry.dropped.submissions;
            cell.set(telemetry);
            (new_drops > 0).then_some(telemetry.dropped)
        });

        if let Some(dropped) = new_drops {
            warn!(
                "Work queue overflowed: {} submissions dropped since boot ({} pulses, {} ticks)",
                dropped.submissions, dropped.pulses, dropped.ticks
            );
        }
    }
}

/// A handle that can only submit to a [`DeferredWorkQueue`].
///
/// This is what the pulse interrupt and the tick timer are given. Neither has
/// a path to the ledger itself.
#[derive(Clone, Copy)]
pub struct QueueHandle<'a, const N: usize> {
    queue: &'a DeferredWorkQueue<N>,
}

impl<const N: usize> QueueHandle<'_, N> {
    #[inline]
    pub fn submit(&self, work: Work) -> Result<(), QueueFull> {
        self.queue.submit(work)
    }
}
