//! Pulse input interrupt and averaging tick.
//!
//! Both run outside the main loop and only ever submit to [`WORK_QUEUE`].

use core::cell::{Cell, RefCell};

use critical_section::Mutex;
use embassy_time::{Duration, Ticker};
use esp_hal::gpio::{AnyPin, Event, Input, InputConfig, Io, Pull};
use esp_hal::handler;
use esp_hal::time::Instant;
use log::info;
use meter_core::queue::WORK_QUEUE_CAPACITY;
use meter_core::{DeferredWorkQueue, PulseDebouncer, Work};

/// Hand-off from interrupt and timer context to the accounting loop.
pub static WORK_QUEUE: DeferredWorkQueue<WORK_QUEUE_CAPACITY> = DeferredWorkQueue::new();

static PULSE_INPUT: Mutex<RefCell<Option<Input<'static>>>> = Mutex::new(RefCell::new(None));

static DEBOUNCER: Mutex<Cell<PulseDebouncer>> = Mutex::new(Cell::new(PulseDebouncer::new(
    PulseDebouncer::DEFAULT_WINDOW_MS,
)));

/// Claim `pin` as the meter's pulse input and start listening for rising edges.
pub fn install(io: &mut Io<'_>, pin: AnyPin<'static>, debounce_ms: u32) {
    io.set_interrupt_handler(on_pulse_edge);

    let mut input = Input::new(pin, InputConfig::default().with_pull(Pull::Down));
    critical_section::with(|cs| {
        DEBOUNCER.borrow(cs).set(PulseDebouncer::new(debounce_ms));
        input.listen(Event::RisingEdge);
        PULSE_INPUT.borrow_ref_mut(cs).replace(input);
    });
    info!("Pulse input armed ({} ms debounce)", debounce_ms);
}

#[handler]
fn on_pulse_edge() {
    critical_section::with(|cs| {
        let mut input = PULSE_INPUT.borrow_ref_mut(cs);
        let Some(input) = input.as_mut() else {
            return;
        };
        if !input.is_interrupt_set() {
            return;
        }
        input.clear_interrupt();

        // Truncation is intended; the debouncer works on a wrapping counter
        let now_ms = Instant::now().duration_since_epoch().as_millis() as u32;
        let cell = DEBOUNCER.borrow(cs);
        let mut debouncer = cell.get();
        if debouncer.accept(now_ms) {
            // Overflow is counted by the queue and reported from the main loop
            let _ = WORK_QUEUE.submit(Work::Pulses(1));
        }
        cell.set(debouncer);
    });
}

#[embassy_executor::task]
pub async fn tick_task(period: Duration) {
    let queue = WORK_QUEUE.handle();
    let mut ticker = Ticker::every(period);
    loop {
        ticker.next().await;
        let _ = queue.submit(Work::Tick);
    }
}
