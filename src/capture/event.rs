//! Network lifecycle events delivered by an instrumentation source

use std::fmt;

use chrono::{DateTime, FixedOffset};

use crate::har::Header;

use super::timing::ResourceTiming;

/// Correlation id assigned by the source to one logical request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(String);

impl RequestId {
    /// Wrap a source-assigned id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Response headers as seen by the source
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseInfo {
    /// Status code
    pub status: u16,
    /// Status text
    pub status_text: String,
    /// Headers in arrival order
    pub headers: Vec<Header>,
    /// MIME type reported for the body
    pub mime_type: Option<String>,
    /// Negotiated protocol (`http/1.1`, `h2`, ...)
    pub protocol: Option<String>,
    /// Remote IP address
    pub remote_address: Option<String>,
    /// Timing sample, if the source measures one
    pub timing: Option<ResourceTiming>,
}

/// A request is about to be sent
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSent {
    /// Correlation id
    pub id: RequestId,
    /// Method
    pub method: String,
    /// Absolute URL
    pub url: String,
    /// Headers in send order
    pub headers: Vec<Header>,
    /// Posted body text
    pub post_data: Option<String>,
    /// Monotonic timestamp in seconds
    pub timestamp: f64,
    /// Wall-clock start with the local offset
    pub wall_time: DateTime<FixedOffset>,
    /// Response of the previous hop when this request is a redirect
    pub redirect_response: Option<ResponseInfo>,
}

/// Which page load mark a metric reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMetric {
    /// DOMContentLoaded fired
    ContentLoad,
    /// load fired
    Load,
}

/// One lifecycle event
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    /// Request about to be sent
    RequestWillBeSent(RequestSent),
    /// Response headers arrived
    ResponseReceived {
        /// Correlation id
        id: RequestId,
        /// Response headers and timing sample
        response: ResponseInfo,
        /// Monotonic timestamp in seconds
        timestamp: f64,
    },
    /// A body chunk arrived
    DataReceived {
        /// Correlation id
        id: RequestId,
        /// Decoded bytes in this chunk
        data_length: u64,
    },
    /// The response finished loading
    LoadingFinished {
        /// Correlation id
        id: RequestId,
        /// Total bytes on the wire, if known
        encoded_data_length: Option<i64>,
        /// Monotonic timestamp in seconds
        timestamp: f64,
    },
    /// The request failed
    LoadingFailed {
        /// Correlation id
        id: RequestId,
        /// Source-provided reason
        error_text: String,
        /// Whether the page canceled the request
        canceled: bool,
    },
    /// A top-level navigation started
    NavigationStarted {
        /// Page id, unique within the capture
        page_id: String,
        /// Document URL
        url: String,
        /// Document title, if already known
        title: Option<String>,
        /// Navigation start
        timestamp: DateTime<FixedOffset>,
    },
    /// A page load mark
    NavigationLoadMetric {
        /// Page id
        page_id: String,
        /// Which mark
        metric: LoadMetric,
        /// ms since navigation start
        time_ms: f64,
    },
}

impl NetworkEvent {
    /// Correlation id for request-scoped events
    #[must_use]
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Self::RequestWillBeSent(sent) => Some(&sent.id),
            Self::ResponseReceived { id, .. }
            | Self::DataReceived { id, .. }
            | Self::LoadingFinished { id, .. }
            | Self::LoadingFailed { id, .. } => Some(id),
            Self::NavigationStarted { .. } | Self::NavigationLoadMetric { .. } => None,
        }
    }

    /// Short name for logging
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestWillBeSent(_) => "requestWillBeSent",
            Self::ResponseReceived { .. } => "responseReceived",
            Self::DataReceived { .. } => "dataReceived",
            Self::LoadingFinished { .. } => "loadingFinished",
            Self::LoadingFailed { .. } => "loadingFailed",
            Self::NavigationStarted { .. } => "navigationStarted",
            Self::NavigationLoadMetric { .. } => "navigationLoadMetric",
        }
    }
}

/// HAR `httpVersion` label for a negotiated protocol
#[must_use]
pub fn http_version_label(protocol: Option<&str>) -> String {
    match protocol.map(str::to_ascii_lowercase).as_deref() {
        None | Some("") => "HTTP/1.1".to_string(),
        Some("h2") | Some("http/2") | Some("http/2.0") => "HTTP/2".to_string(),
        Some("h3") | Some("http/3") => "HTTP/3".to_string(),
        Some(other) => other.to_ascii_uppercase(),
    }
}
