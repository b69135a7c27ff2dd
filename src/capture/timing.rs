//! Devtools resource timing to HAR timing phases

use serde::{Deserialize, Serialize};

use crate::har::Timings;

/// Raw per-request timing sample as reported by the source
///
/// Offsets are milliseconds relative to `request_time`. A phase that does
/// not apply (reused connection, cached DNS) is `None`; sources speaking
/// the devtools protocol convert its `-1` sentinel with [`phase`] on entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceTiming {
    /// Absolute request start in seconds
    pub request_time: f64,
    /// DNS lookup start
    pub dns_start: Option<f64>,
    /// DNS lookup end
    pub dns_end: Option<f64>,
    /// Connection start
    pub connect_start: Option<f64>,
    /// Connection end
    pub connect_end: Option<f64>,
    /// TLS handshake start
    pub ssl_start: Option<f64>,
    /// TLS handshake end
    pub ssl_end: Option<f64>,
    /// Request send start
    pub send_start: Option<f64>,
    /// Request send end
    pub send_end: Option<f64>,
    /// Response headers fully received
    pub receive_headers_end: Option<f64>,
}

/// Convert a sentinel-encoded offset: negative means not applicable
#[must_use]
pub fn phase(raw: f64) -> Option<f64> {
    (raw >= 0.0).then_some(raw)
}

fn span(start: Option<f64>, end: Option<f64>) -> Option<f64> {
    Some(end? - start?)
}

/// Map a timing sample to HAR phases
///
/// `response_received_time` is the absolute time (seconds) at which the
/// response event fired. `ssl` is reported for information only; it is
/// already contained in `connect`.
#[must_use]
pub fn map_timings(timing: &ResourceTiming, response_received_time: f64) -> Timings {
    let blocked = timing
        .dns_start
        .or(timing.connect_start)
        .or(timing.send_start);

    let receive = match timing.receive_headers_end {
        Some(headers_end) if response_received_time > timing.request_time => {
            let total_ms = (response_received_time - timing.request_time) * 1000.0;
            (total_ms - headers_end).max(0.0)
        }
        _ => 0.0,
    };

    Timings {
        blocked,
        dns: span(timing.dns_start, timing.dns_end),
        connect: span(timing.connect_start, timing.connect_end),
        ssl: span(timing.ssl_start, timing.ssl_end),
        send: span(timing.send_start, timing.send_end).unwrap_or(0.0),
        wait: span(timing.send_end, timing.receive_headers_end).unwrap_or(0.0),
        receive,
    }
}
