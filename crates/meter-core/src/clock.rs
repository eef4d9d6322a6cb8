//! Wall-clock time derived from a monotonic tick counter, and the SNTP
//! packet format used to learn the epoch.

/// Seconds from the NTP era start (1900) to the Unix epoch.
pub const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;

/// Size of an SNTP request and of the fixed part of a response.
pub const SNTP_PACKET_LEN: usize = 48;

pub const SNTP_PORT: u16 = 123;

/// Maps a monotonic millisecond counter onto Unix-epoch milliseconds.
///
/// The device has no battery-backed clock. Until an external time source
/// calls [`sync`](Self::sync), timestamps are milliseconds since boot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WallClock {
    /// Unix ms at monotonic zero
    epoch_offset_ms: Option<u64>,
}

impl WallClock {
    pub const fn new() -> Self {
        Self {
            epoch_offset_ms: None,
        }
    }

    /// Record that monotonic time `monotonic_ms` corresponds to `unix_ms`.
    pub fn sync(&mut self, unix_ms: u64, monotonic_ms: u64) {
        self.epoch_offset_ms = Some(unix_ms.saturating_sub(monotonic_ms));
    }

    pub const fn is_synced(&self) -> bool {
        self.epoch_offset_ms.is_some()
    }

    pub fn now_ms(&self, monotonic_ms: u64) -> u64 {
        match self.epoch_offset_ms {
            Some(offset) => offset.saturating_add(monotonic_ms),
            None => monotonic_ms,
        }
    }
}

/// An SNTP v4 client request (LI 0, VN 4, mode 3). Every other field is zero.
pub const fn sntp_request() -> [u8; SNTP_PACKET_LEN] {
    let mut packet = [0u8; SNTP_PACKET_LEN];
    packet[0] = (4 << 3) | 3;
    packet
}

/// Unix milliseconds from a server's transmit timestamp.
///
/// Returns `None` for short packets, anything that is not a server reply,
/// the kiss-o'-death stratum 0, and an unset transmit timestamp.
pub fn parse_sntp_response(packet: &[u8]) -> Option<u64> {
    if packet.len() < SNTP_PACKET_LEN {
        return None;
    }
    let mode = packet[0] & 0x07;
    let stratum = packet[1];
    if mode != 4 || stratum == 0 {
        return None;
    }

    let secs = u64::from(u32::from_be_bytes([packet[40], packet[41], packet[42], packet[43]]));
    let frac = u64::from(u32::from_be_bytes([packet[44], packet[45], packet[46], packet[47]]));
    if secs == 0 {
        return None;
    }
    let unix_secs = secs.checked_sub(NTP_UNIX_OFFSET_SECS)?;
    Some(unix_secs * 1000 + ((frac * 1000) >> 32))
}
