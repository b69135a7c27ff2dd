//! Instrumentation sources that feed network events into a capture

mod devtools;
mod listener;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::capture::{NetworkEvent, RequestId};
use crate::config::CaptureOptions;
use crate::har::Creator;
use crate::{HarError, Result};

pub use devtools::{DevtoolsSource, SUPPORTED_PROTOCOL_VERSIONS};
pub use listener::{ListenerHandle, ListenerSource};

/// A response body as returned by the source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseBody {
    /// Body text, base64 when `base64_encoded` is set
    pub body: String,
    /// Whether `body` is base64
    pub base64_encoded: bool,
}

impl ResponseBody {
    /// A plain text body
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            base64_encoded: false,
        }
    }

    /// A base64-encoded binary body
    pub fn base64(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            base64_encoded: true,
        }
    }
}

/// Delivers network events and serves response bodies on demand
#[async_trait]
pub trait InstrumentationSource: Send + Sync {
    /// Short adapter name for logs and diagnostics
    fn name(&self) -> &'static str;

    /// Browser name and version, when the source can tell
    fn browser(&self) -> Option<Creator> {
        None
    }

    /// Attach and start delivering events into a bounded channel
    ///
    /// # Errors
    ///
    /// Returns error if the source cannot attach
    async fn subscribe(&self, buffer: usize) -> Result<mpsc::Receiver<NetworkEvent>>;

    /// Fetch the body of a finished response
    ///
    /// # Errors
    ///
    /// Returns error if the body is unavailable or the source is gone
    async fn fetch_body(&self, id: &RequestId) -> Result<ResponseBody>;

    /// Stop delivering events; idempotent
    ///
    /// # Errors
    ///
    /// Returns error if the source fails to detach cleanly
    async fn detach(&self) -> Result<()>;
}

/// Adapter families, in preference order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    /// Devtools protocol over a websocket
    Devtools,
    /// Events pushed in-process through a [`ListenerHandle`]
    Listener,
}

/// Adapter families tried by [`select_source`], best first
pub const PREFERENCE: &[AdapterKind] = &[AdapterKind::Devtools, AdapterKind::Listener];

/// A selected source plus the handle for in-process event injection
pub struct SelectedSource {
    /// The source to subscribe to
    pub source: Arc<dyn InstrumentationSource>,
    /// Present when the listener adapter was chosen
    pub handle: Option<ListenerHandle>,
}

impl std::fmt::Debug for SelectedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectedSource")
            .field("source", &self.source.name())
            .field("handle", &self.handle.is_some())
            .finish()
    }
}

/// Pick the best available adapter for `options`
///
/// Devtools is chosen when an endpoint is configured and the listener is
/// not forced. If attaching to the endpoint fails the listener is used and
/// a warning is logged.
///
/// # Errors
///
/// Returns [`HarError::NoSource`] if no adapter could be prepared
pub async fn select_source(options: &CaptureOptions) -> Result<SelectedSource> {
    let mut failures = Vec::new();

    for kind in PREFERENCE {
        match kind {
            AdapterKind::Devtools => {
                if options.force_listener {
                    continue;
                }
                let Some(url) = options.devtools_url.as_deref() else {
                    continue;
                };
                match DevtoolsSource::connect(url).await {
                    Ok(source) => {
                        info!("Using devtools source at {}", url);
                        return Ok(SelectedSource {
                            source: Arc::new(source),
                            handle: None,
                        });
                    }
                    Err(e) => {
                        warn!("Devtools source unavailable, falling back: {}", e);
                        failures.push(format!("devtools: {e}"));
                    }
                }
            }
            AdapterKind::Listener => {
                let (source, handle) = ListenerSource::new();
                info!("Using in-process listener source");
                return Ok(SelectedSource {
                    source: Arc::new(source),
                    handle: Some(handle),
                });
            }
        }
    }

    Err(HarError::NoSource(failures.join("; ")))
}
