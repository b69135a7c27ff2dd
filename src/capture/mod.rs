//! Capture pipeline: event correlation, timing, filtering and redaction

mod correlator;
mod event;
mod glob;
mod mime;
mod redact;
mod session;
mod timing;
mod url_filter;

pub use correlator::{CorrelatorStats, EntryCorrelator, EntryState};
pub use event::{
    http_version_label, LoadMetric, NetworkEvent, RequestId, RequestSent, ResponseInfo,
};
pub use glob::{compile_set, glob_to_regex};
pub use mime::{is_text_mime, BodyScopeMatcher};
pub use redact::{Redactor, REDACTION_MARKER};
pub use session::{CaptureSession, SessionState};
pub use timing::{map_timings, phase, ResourceTiming};
pub use url_filter::UrlFilter;
