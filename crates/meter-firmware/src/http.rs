//! Serving one HTTP connection against the meter.

use embassy_net::tcp::{Error, TcpSocket};
use embedded_io_async::Write;
use meter_core::http::{Request, request_complete, respond};
use meter_core::{KeyValueStore, PowerMeter};

const MAX_REQUEST_SIZE: usize = 1024;

/// Read one request, answer it and flush the reply.
///
/// The caller owns accept and close so one socket can be reused forever.
pub async fn serve<S: KeyValueStore>(
    meter: &mut PowerMeter<S>,
    socket: &mut TcpSocket<'_>,
    now_ms: u64,
) -> Result<(), Error> {
    let mut buf = [0u8; MAX_REQUEST_SIZE];
    let mut total = 0usize;

    // Oversized requests are answered from whatever fit
    while total < buf.len() && !request_complete(&buf[..total]) {
        let n = socket.read(&mut buf[total..]).await?;
        if n == 0 {
            if total == 0 {
                return Ok(());
            }
            break;
        }
        total += n;
    }

    let response = respond(meter, Request::parse(&buf[..total]), now_ms);
    socket.write_all(response.head().as_bytes()).await?;
    socket.write_all(response.body.as_bytes()).await?;
    socket.flush().await
}
