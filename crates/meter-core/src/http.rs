//! Minimal request routing for the meter's HTTP endpoints
//!
//! | Request          | Action                                 |
//! |------------------|----------------------------------------|
//! | `GET /`          | Status page                            |
//! | `POST /`         | Calibrate from form body `kwh=<value>` |
//! | `GET /metrics`   | Metrics exposition                     |
//!
//! One connection is handled at a time from the main loop, so routing runs
//! in the same single-writer context as the drain point.

use core::fmt::Write;

extern crate alloc;
use alloc::format;
use alloc::string::{String, ToString};

use log::{info, warn};
use thiserror_no_std::Error;

use crate::meter::PowerMeter;
use crate::storage::KeyValueStore;

const HEADER_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    Index,
    /// Calibration form submission, with the raw body
    Calibrate(&'a [u8]),
    Metrics,
    NotFound,
}

impl<'a> Request<'a> {
    /// Route a raw request from its request line.
    pub fn parse(raw: &'a [u8]) -> Self {
        let line_end = raw
            .iter()
            .position(|&b| b == b'\r' || b == b'\n')
            .unwrap_or(raw.len());
        let mut parts = raw[..line_end].split(|&b| b == b' ');
        let method = parts.next().unwrap_or_default();
        let path = parts.next().unwrap_or_default();

        match (method, path) {
            (b"GET", b"/") => Self::Index,
            (b"GET", b"/metrics") => Self::Metrics,
            (b"POST", b"/") => Self::Calibrate(body(raw)),
            _ => Self::NotFound,
        }
    }
}

/// Everything after the blank line that ends the headers.
fn body(raw: &[u8]) -> &[u8] {
    find(raw, HEADER_END)
        .map(|pos| &raw[pos + HEADER_END.len()..])
        .unwrap_or_default()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Whether `raw` holds the full headers and as much body as `Content-Length`
/// announces. Browsers often send the body in a second segment.
pub fn request_complete(raw: &[u8]) -> bool {
    let Some(header_end) = find(raw, HEADER_END) else {
        return false;
    };
    let headers = core::str::from_utf8(&raw[..header_end]).unwrap_or_default();
    let content_length = headers
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    raw.len() - (header_end + HEADER_END.len()) >= content_length
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationError {
    #[error("form field kwh is missing")]
    Missing,
    #[error("kwh is not valid UTF-8")]
    NotUtf8,
    #[error("kwh is not a number")]
    NotANumber,
    #[error("kwh must be finite")]
    NotFinite,
}

/// Extract the new total from a `application/x-www-form-urlencoded` body.
pub fn parse_calibration(body: &[u8]) -> Result<f64, CalibrationError> {
    let field = body
        .split(|&b| b == b'&')
        .find_map(|pair| pair.strip_prefix(b"kwh="))
        .ok_or(CalibrationError::Missing)?;
    let text = core::str::from_utf8(field).map_err(|_| CalibrationError::NotUtf8)?;
    let kwh: f64 = text
        .trim()
        .parse()
        .map_err(|_| CalibrationError::NotANumber)?;
    if !kwh.is_finite() {
        return Err(CalibrationError::NotFinite);
    }
    Ok(kwh)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpStatus {
    Ok,
    SeeOther,
    BadRequest,
    InternalServerError,
    NotFound,
}

impl HttpStatus {
    pub const fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::SeeOther => 303,
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::InternalServerError => 500,
        }
    }

    pub const fn reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::SeeOther => "See Other",
            Self::BadRequest => "Bad Request",
            Self::NotFound => "Not Found",
            Self::InternalServerError => "Internal Server Error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: HttpStatus,
    pub location: Option<&'static str>,
    pub body: String,
}

impl Response {
    fn text(status: HttpStatus, body: String) -> Self {
        Self {
            status,
            location: None,
            body,
        }
    }

    fn redirect(location: &'static str) -> Self {
        Self {
            status: HttpStatus::SeeOther,
            location: Some(location),
            body: String::new(),
        }
    }

    /// Status line and headers, ready to be written before the body.
    pub fn head(&self) -> heapless::String<192> {
        let mut head = heapless::String::new();
        // Longest possible head is well under capacity
        let _ = write!(
            head,
            "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n",
            self.status.code(),
            self.status.reason(),
            self.body.len()
        );
        if let Some(location) = self.location {
            let _ = write!(head, "Location: {}\r\n", location);
        }
        let _ = write!(head, "Connection: close\r\n\r\n");
        head
    }
}

/// Answer one request against the meter.
pub fn respond<S: KeyValueStore>(
    meter: &mut PowerMeter<S>,
    request: Request<'_>,
    now_ms: u64,
) -> Response {
    match request {
        Request::Index => Response::text(HttpStatus::Ok, meter.status(now_ms).to_string()),
        Request::Metrics => Response::text(HttpStatus::Ok, meter.metrics_text(now_ms)),
        Request::Calibrate(body) => match parse_calibration(body) {
            Ok(kwh) => match meter.calibrate(kwh) {
                Ok(()) => {
                    info!("kWh calibrated via HTTP to {}", meter.kwh());
                    Response::redirect("/")
                }
                Err(e) => Response::text(
                    HttpStatus::InternalServerError,
                    format!("Calibration applied but not persisted: {}\n", e),
                ),
            },
            Err(e) => {
                warn!("Rejected calibration: {}", e);
                Response::text(HttpStatus::BadRequest, format!("{}\n", e))
            }
        },
        Request::NotFound => Response::text(HttpStatus::NotFound, String::from("Not Found\n")),
    }
}
