#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

use core::future::pending;

use embassy_executor::Spawner;
use embassy_futures::select::{Either3, select3};
use embassy_net::tcp::TcpSocket;
use embassy_time::{Duration, Instant, Timer};
use esp_hal::clock::CpuClock;
use esp_hal::gpio::{AnyPin, Input, InputConfig, Io, Pull};
use esp_hal::timer::timg::TimerGroup;
use log::{info, warn};

use meter_core::clock::WallClock;
use meter_core::{KeyValueStore, PowerMeter};
use meter_firmware::config::{self, HTTP_PORT};
use meter_firmware::pulse::{self, WORK_QUEUE};
use meter_firmware::sntp::{self, TIME_SYNC};
use meter_firmware::storage::{self, SdCardPins};
use meter_firmware::{http, net};

const HTTP_TIMEOUT: Duration = Duration::from_secs(2);

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rtt_target::rprintln!("PANIC: {}", info);
    loop {}
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    rtt_target::rtt_init_log!();

    let hal_config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(hal_config);

    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 73744);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    let config = config::meter_config();
    info!("Starting pulse meter with {:?}", config);
    assert!(
        config::pins_available(&config),
        "pulse/LED pins collide with each other or the SD card bus"
    );

    // SAFETY: the pins were checked above to be distinct from every pin
    // claimed through `peripherals` below, and nothing else steals them.
    let (pulse_pin, led_pin) =
        unsafe { (AnyPin::steal(config.pulse_pin), AnyPin::steal(config.led_pin)) };

    // The board LED is held high impedance so it stays dark
    let _led = Input::new(led_pin, InputConfig::default().with_pull(Pull::None));

    let mut io = Io::new(peripherals.IO_MUX);
    pulse::install(&mut io, pulse_pin, config.debounce_ms);

    let store = storage::init_sd_card(
        peripherals.SPI2,
        SdCardPins {
            sck: peripherals.GPIO12.into(),
            mosi: peripherals.GPIO11.into(),
            miso: peripherals.GPIO13.into(),
            cs: peripherals.GPIO10.into(),
        },
    );
    let mut meter = PowerMeter::open(store, &config).expect("Invalid meter configuration");
    info!("Resuming at {} kWh", meter.kwh());

    let tick_period = Duration::from_secs(u64::from(config.tick_period_secs));
    spawner.spawn(pulse::tick_task(tick_period).expect("tick_task spawn"));

    match net::start(&spawner, peripherals.WIFI) {
        Some(stack) => {
            spawner.spawn(sntp::sntp_task(stack).expect("sntp_task spawn"));

            let mut rx_buf = [0u8; 1024];
            let mut tx_buf = [0u8; 2048];
            let mut socket = TcpSocket::new(stack, &mut rx_buf, &mut tx_buf);
            socket.set_timeout(Some(HTTP_TIMEOUT));
            account(&mut meter, Some(&mut socket)).await
        }
        None => account(&mut meter, None).await,
    }
}

/// The single drain point: queued work, clock sync and HTTP requests all
/// reach the meter from here and nowhere else.
async fn account<S: KeyValueStore>(
    meter: &mut PowerMeter<S>,
    mut socket: Option<&mut TcpSocket<'_>>,
) -> ! {
    let mut clock = WallClock::new();
    let now = |clock: &WallClock| clock.now_ms(Instant::now().as_millis());

    loop {
        let accept = async {
            match socket.as_deref_mut() {
                Some(socket) => socket.accept(HTTP_PORT).await,
                None => pending().await,
            }
        };
        let event = select3(WORK_QUEUE.next(), TIME_SYNC.wait(), accept).await;

        match event {
            Either3::First(work) => {
                meter.run(work, now(&clock));
                meter.service(&WORK_QUEUE, now(&clock));
            }
            Either3::Second(sync) => {
                clock.sync(sync.unix_ms, sync.monotonic_ms);
                info!("Wall clock synced");
            }
            Either3::Third(result) => {
                let Some(socket) = socket.as_deref_mut() else {
                    continue;
                };
                match result {
                    Ok(()) => {
                        // Answer with every pulse counted so far
                        meter.service(&WORK_QUEUE, now(&clock));
                        if let Err(e) = http::serve(meter, socket, now(&clock)).await {
                            warn!("HTTP connection error: {:?}", e);
                        }
                        socket.close();
                        let _ = socket.flush().await;
                    }
                    Err(e) => {
                        warn!("HTTP accept error: {:?}", e);
                        Timer::after(Duration::from_millis(200)).await;
                    }
                }
                socket.abort();
            }
        }
    }
}
