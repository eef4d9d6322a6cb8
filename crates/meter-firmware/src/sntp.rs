//! Periodic SNTP query feeding the wall clock.

use embassy_net::udp::{PacketMetadata, RecvError, SendError, UdpSocket};
use embassy_net::{Ipv4Address, Stack};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer, with_timeout};
use log::{info, warn};
use meter_core::clock::{SNTP_PACKET_LEN, SNTP_PORT, parse_sntp_response, sntp_request};
use thiserror_no_std::Error;

use crate::config::NTP_SERVER;

const RESYNC_PERIOD: Duration = Duration::from_secs(60 * 60);
const RETRY_PERIOD: Duration = Duration::from_secs(30);
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// A time reading: Unix ms, and the monotonic ms at which it was taken.
#[derive(Debug, Clone, Copy)]
pub struct TimeSync {
    pub unix_ms: u64,
    pub monotonic_ms: u64,
}

/// Latest reading for the accounting loop; older unread readings are replaced.
pub static TIME_SYNC: Signal<CriticalSectionRawMutex, TimeSync> = Signal::new();

#[derive(Error, Debug)]
enum SntpError {
    #[error("bind failed")]
    Bind,
    #[error("send failed: {0:?}")]
    Send(SendError),
    #[error("receive failed: {0:?}")]
    Recv(RecvError),
    #[error("no reply from server")]
    Timeout,
    #[error("reply is not a usable server response")]
    BadReply,
}

#[embassy_executor::task]
pub async fn sntp_task(stack: Stack<'static>) {
    let mut rx_meta = [PacketMetadata::EMPTY; 2];
    let mut tx_meta = [PacketMetadata::EMPTY; 2];
    let mut rx_buf = [0u8; 128];
    let mut tx_buf = [0u8; 128];

    loop {
        stack.wait_config_up().await;

        let mut socket = UdpSocket::new(stack, &mut rx_meta, &mut rx_buf, &mut tx_meta, &mut tx_buf);
        let wait = match query(&mut socket).await {
            Ok(sync) => {
                info!("SNTP time {} ms", sync.unix_ms);
                TIME_SYNC.signal(sync);
                RESYNC_PERIOD
            }
            Err(e) => {
                warn!("SNTP query failed: {}", e);
                RETRY_PERIOD
            }
        };
        drop(socket);

        Timer::after(wait).await;
    }
}

async fn query(socket: &mut UdpSocket<'_>) -> Result<TimeSync, SntpError> {
    socket.bind(0).map_err(|_| SntpError::Bind)?;
    let server = (Ipv4Address::from(NTP_SERVER), SNTP_PORT);
    socket
        .send_to(&sntp_request(), server)
        .await
        .map_err(SntpError::Send)?;

    let mut reply = [0u8; SNTP_PACKET_LEN];
    let (len, _) = with_timeout(REPLY_TIMEOUT, socket.recv_from(&mut reply))
        .await
        .map_err(|_| SntpError::Timeout)?
        .map_err(SntpError::Recv)?;
    let monotonic_ms = Instant::now().as_millis();

    let unix_ms = parse_sntp_response(&reply[..len]).ok_or(SntpError::BadReply)?;
    Ok(TimeSync {
        unix_ms,
        monotonic_ms,
    })
}
