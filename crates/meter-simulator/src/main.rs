//! Desktop simulator for the pulse-meter firmware.
//!
//! Runs the meter-core engine on a host: a file-backed store replaces the SD
//! card, a thread of synthetic (bouncing) pulse edges replaces the GPIO
//! interrupt, a second thread replaces the averaging tick timer, and a
//! `std::net` loop serves the same endpoints as the device.
//!
//! ```text
//! meter-simulator [config.json]
//! ```
//!
//! | Endpoint        | Action                                       |
//! |-----------------|----------------------------------------------|
//! | `GET /`         | Status page                                  |
//! | `POST /`        | Calibrate, e.g. `curl -d kwh=1234.5 host/`   |
//! | `GET /metrics`  | Metrics exposition                           |
//!
//! Set `RUST_LOG=debug` to see every suppressed bounce edge.

mod file_store;
mod pulse_source;

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::Deserialize;

use meter_core::clock::WallClock;
use meter_core::http::{Request, request_complete, respond};
use meter_core::queue::WORK_QUEUE_CAPACITY;
use meter_core::{DeferredWorkQueue, KeyValueStore, MeterConfig, PowerMeter, PulseDebouncer, Work};

use crate::file_store::FileStore;
use crate::pulse_source::PulseTrain;

/// Deferred work from the pulse and tick threads to the main loop.
static WORK_QUEUE: DeferredWorkQueue<WORK_QUEUE_CAPACITY> = DeferredWorkQueue::new();

/// Largest request the server reads before giving up on it.
const MAX_REQUEST_BYTES: usize = 4096;

/// How long the main loop idles when there is no connection to serve.
const IDLE_POLL: Duration = Duration::from_millis(20);

const CLIENT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
struct SimulatorConfig {
    meter: MeterConfig,
    /// Address the HTTP server binds to
    listen: String,
    /// Directory holding the persisted counter
    db_path: PathBuf,
    /// Rate of synthetic pulses
    pulse_rate_hz: f64,
    /// Spurious edges emitted after every real one
    bounces_per_pulse: u32,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            meter: MeterConfig::default(),
            listen: String::from("127.0.0.1:8080"),
            db_path: PathBuf::from("meter-db"),
            pulse_rate_hz: 1.0,
            bounces_per_pulse: 2,
        }
    }
}

impl SimulatorConfig {
    fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn main() -> Result<()> {
    env_logger::init();

    let config = match std::env::args_os().nth(1) {
        Some(path) => SimulatorConfig::load(Path::new(&path))?,
        None => {
            info!("No config file given, using defaults");
            SimulatorConfig::default()
        }
    };
    info!("Starting simulator with {:?}", config);

    let store = FileStore::open(&config.db_path)
        .with_context(|| format!("opening store at {}", config.db_path.display()))?;
    let mut meter = PowerMeter::open(store, &config.meter)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("opening meter")?;
    info!("Resuming at {} kWh", meter.kwh());

    let boot = Instant::now();
    let mut clock = WallClock::new();
    clock.sync(unix_ms(), 0);

    let train = PulseTrain::new(config.pulse_rate_hz, config.bounces_per_pulse);
    let debouncer = PulseDebouncer::new(config.meter.debounce_ms);
    thread::Builder::new()
        .name("pulse-source".into())
        .spawn(move || pulse_source::run(train, debouncer, WORK_QUEUE.handle()))
        .context("spawning pulse source")?;

    let tick_period = Duration::from_secs(u64::from(config.meter.tick_period_secs));
    thread::Builder::new()
        .name("tick".into())
        .spawn(move || {
            let queue = WORK_QUEUE.handle();
            loop {
                thread::sleep(tick_period);
                // The queue counts and reports its own overflow
                let _ = queue.submit(Work::Tick);
            }
        })
        .context("spawning tick timer")?;

    let listener = TcpListener::bind(&config.listen)
        .with_context(|| format!("binding {}", config.listen))?;
    listener
        .set_nonblocking(true)
        .context("making listener non-blocking")?;
    info!("Listening on http://{}", config.listen);

    loop {
        let now = || clock.now_ms(boot.elapsed().as_millis() as u64);

        meter.service(&WORK_QUEUE, now());

        match listener.accept() {
            Ok((stream, peer)) => {
                // Catch up before answering so the response reflects every pulse so far
                meter.service(&WORK_QUEUE, now());
                if let Err(e) = serve(&mut meter, stream, now()) {
                    warn!("Request from {} failed: {:#}", peer, e);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(IDLE_POLL),
            Err(e) => error!("Accept failed: {}", e),
        }
    }
}

/// Read one request, answer it and close the connection.
fn serve<S: KeyValueStore>(
    meter: &mut PowerMeter<S>,
    mut stream: TcpStream,
    now_ms: u64,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;
    stream.set_write_timeout(Some(CLIENT_TIMEOUT))?;

    let mut raw = Vec::with_capacity(1024);
    let mut chunk = [0u8; 512];
    while !request_complete(&raw) {
        let n = stream.read(&mut chunk).context("reading request")?;
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..n]);
        if raw.len() > MAX_REQUEST_BYTES {
            anyhow::bail!("request larger than {} bytes", MAX_REQUEST_BYTES);
        }
    }

    let response = respond(meter, Request::parse(&raw), now_ms);
    stream.write_all(response.head().as_bytes())?;
    stream.write_all(response.body.as_bytes())?;
    stream.flush()?;
    Ok(())
}
