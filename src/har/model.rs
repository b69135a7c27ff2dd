//! HAR 1.2 entity graph

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{HarError, Result};

use super::HAR_VERSION;

/// Root archive object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Har {
    /// The archive log
    pub log: Log,
}

impl Har {
    /// Create an empty archive for `creator`
    #[must_use]
    pub fn new(creator: Creator) -> Self {
        Self {
            log: Log {
                version: HAR_VERSION.to_string(),
                creator,
                browser: None,
                pages: Vec::new(),
                entries: Vec::new(),
                comment: None,
            },
        }
    }

    /// Check that every entry's page reference names a page in the archive
    ///
    /// # Errors
    ///
    /// Returns error naming the first dangling page reference
    pub fn validate(&self) -> Result<()> {
        for (i, entry) in self.log.entries.iter().enumerate() {
            if let Some(page_ref) = &entry.page_ref {
                if !self.log.pages.iter().any(|p| &p.id == page_ref) {
                    return Err(HarError::Other(format!(
                        "Entry {i} references unknown page '{page_ref}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Archive log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Log {
    /// Format version, always "1.2" for archives produced here
    pub version: String,
    /// Producing tool
    pub creator: Creator,
    /// Browser that issued the requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<Creator>,
    /// Pages in navigation order
    #[serde(default)]
    pub pages: Vec<Page>,
    /// Entries in completion order
    pub entries: Vec<Entry>,
    /// Free-form comment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Log {
    /// Entries ordered by `startedDateTime`; completion order breaks ties
    #[must_use]
    pub fn entries_sorted_by_start(&self) -> Vec<&Entry> {
        let mut sorted: Vec<&Entry> = self.entries.iter().collect();
        sorted.sort_by_key(|e| e.started_date_time);
        sorted
    }
}

/// Creator or browser descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Creator {
    /// Name
    pub name: String,
    /// Version
    pub version: String,
    /// Free-form comment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Creator {
    /// Build a descriptor without a comment
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            comment: None,
        }
    }
}

/// One navigated document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    /// Navigation start
    pub started_date_time: DateTime<FixedOffset>,
    /// Unique id within the archive
    pub id: String,
    /// Page title (the URL until a title is known)
    pub title: String,
    /// Load marks
    pub page_timings: PageTimings,
}

/// Page load marks in ms since navigation start
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageTimings {
    /// DOMContentLoaded
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "optional_phase"
    )]
    pub on_content_load: Option<f64>,
    /// load
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "optional_phase"
    )]
    pub on_load: Option<f64>,
}

/// One archived request/response exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// Owning page id
    #[serde(rename = "pageref", default, skip_serializing_if = "Option::is_none")]
    pub page_ref: Option<String>,
    /// Request start, offset preserved
    pub started_date_time: DateTime<FixedOffset>,
    /// Total elapsed ms, the sum of the applicable timing phases
    pub time: f64,
    /// Request record
    pub request: Request,
    /// Response record
    pub response: Response,
    /// Always empty; no cache introspection is performed
    #[serde(default)]
    pub cache: Cache,
    /// Phase breakdown
    pub timings: Timings,
    /// Remote address reported by the source
    #[serde(
        rename = "serverIPAddress",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub server_ip_address: Option<String>,
    /// Failure or incompleteness annotation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Empty cache placeholder
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cache {}

/// Request record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Method
    pub method: String,
    /// Absolute URL
    pub url: String,
    /// Protocol version, e.g. `HTTP/1.1`
    pub http_version: String,
    /// Cookies parsed from the `Cookie` header
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    /// Headers in arrival order
    #[serde(default)]
    pub headers: Vec<Header>,
    /// Query parameters parsed from the URL
    #[serde(default)]
    pub query_string: Vec<QueryParam>,
    /// Posted body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_data: Option<PostData>,
    /// Size of the header block, -1 if unknown
    pub headers_size: i64,
    /// Size of the body, -1 if unknown
    pub body_size: i64,
}

/// Response record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// Status code, 0 when the request failed
    pub status: u16,
    /// Status text (the error text for failed requests)
    pub status_text: String,
    /// Protocol version
    pub http_version: String,
    /// Cookies parsed from `Set-Cookie` headers
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    /// Headers in arrival order
    #[serde(default)]
    pub headers: Vec<Header>,
    /// Body description
    pub content: Content,
    /// Redirect target
    #[serde(rename = "redirectURL", default)]
    pub redirect_url: String,
    /// Size of the header block, -1 if unknown
    pub headers_size: i64,
    /// Transferred body size, -1 if unknown
    pub body_size: i64,
}

impl Response {
    /// Response placeholder used before headers arrive or after a failure
    #[must_use]
    pub fn empty() -> Self {
        Self {
            status: 0,
            status_text: String::new(),
            http_version: String::new(),
            cookies: Vec::new(),
            headers: Vec::new(),
            content: Content::default(),
            redirect_url: String::new(),
            headers_size: -1,
            body_size: -1,
        }
    }
}

/// Response body description
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    /// Decoded size in bytes (the original size when `text` is truncated)
    pub size: i64,
    /// Bytes saved by transfer compression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<i64>,
    /// MIME type as reported by the response
    pub mime_type: String,
    /// Body text, base64 when `encoding` says so
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// `base64` for binary bodies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

/// Name/value header pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Header name as sent
    pub name: String,
    /// Header value
    pub value: String,
}

impl Header {
    /// Build a header
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Query-string parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParam {
    /// Decoded name
    pub name: String,
    /// Decoded value
    pub value: String,
}

/// Cookie
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    /// Name
    pub name: String,
    /// Value
    pub value: String,
    /// Path attribute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Domain attribute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Expires attribute, verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    /// `HttpOnly` flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_only: Option<bool>,
    /// `Secure` flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
}

impl Cookie {
    /// A cookie with only name and value
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: None,
            domain: None,
            expires: None,
            http_only: None,
            secure: None,
        }
    }
}

/// Posted request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostData {
    /// MIME type from the request's `Content-Type`
    pub mime_type: String,
    /// Body text
    pub text: String,
}

/// Timing breakdown in ms
///
/// `blocked`, `dns`, `connect` and `ssl` are `None` when the phase does not
/// apply (e.g. a reused connection) and are omitted from the output. `ssl`
/// is already contained in `connect` and never counts towards the total.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    /// Queueing time
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "optional_phase"
    )]
    pub blocked: Option<f64>,
    /// DNS resolution
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "optional_phase"
    )]
    pub dns: Option<f64>,
    /// TCP connect, including TLS
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "optional_phase"
    )]
    pub connect: Option<f64>,
    /// TLS handshake
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "optional_phase"
    )]
    pub ssl: Option<f64>,
    /// Sending the request
    pub send: f64,
    /// Waiting for the first response byte
    pub wait: f64,
    /// Reading the response
    pub receive: f64,
}

impl Timings {
    /// Sum of the applicable phases, excluding `ssl`
    #[must_use]
    pub fn total(&self) -> f64 {
        [self.blocked, self.dns, self.connect]
            .into_iter()
            .flatten()
            .chain([self.send, self.wait, self.receive])
            .filter(|v| *v >= 0.0)
            .sum()
    }
}

/// Reads a HAR phase where -1 (or any negative) means "not applicable"
fn optional_phase<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value.filter(|v| *v >= 0.0))
}
