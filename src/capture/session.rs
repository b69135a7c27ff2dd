//! Capture session lifecycle

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CaptureOptions, PendingBodyPolicy};
use crate::har::{Creator, Har};
use crate::source::{select_source, InstrumentationSource, ListenerHandle};
use crate::{HarError, Result};

use super::correlator::{CorrelatorStats, EntryCorrelator};

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Configured, not yet attached
    Created,
    /// Attached and routing events
    Started,
    /// Stopped; the archive has been handed out or discarded
    Stopped,
}

struct Running {
    source: Arc<dyn InstrumentationSource>,
    correlator: EntryCorrelator,
    pump: JoinHandle<()>,
    listener: Option<ListenerHandle>,
}

impl Running {
    async fn abandon(self) {
        self.pump.abort();
        if let Err(e) = self.source.detach().await {
            debug!("Detach after cancellation: {}", e);
        }
        self.correlator.close();
        self.correlator
            .settle(PendingBodyPolicy::Abandon, Duration::ZERO)
            .await;
    }
}

/// One capture from start to stop
///
/// ```no_run
/// use harcap::capture::CaptureSession;
/// use harcap::config::CaptureOptions;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn run() -> harcap::Result<()> {
/// let mut session = CaptureSession::new(CaptureOptions::default())?;
/// session.start().await?;
/// // ... browse ...
/// let har = session.stop(&CancellationToken::new()).await?;
/// println!("{} entries", har.log.entries.len());
/// # Ok(())
/// # }
/// ```
pub struct CaptureSession {
    options: CaptureOptions,
    state: SessionState,
    custom_source: Option<Arc<dyn InstrumentationSource>>,
    source_name: Option<&'static str>,
    running: Option<Running>,
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("state", &self.state)
            .field("source", &self.source_name)
            .finish_non_exhaustive()
    }
}

impl CaptureSession {
    /// Create a session that picks its source from the preference list
    ///
    /// # Errors
    ///
    /// Returns error if the options are invalid
    pub fn new(options: CaptureOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            state: SessionState::Created,
            custom_source: None,
            source_name: None,
            running: None,
        })
    }

    /// Create a session bound to a caller-provided source
    ///
    /// # Errors
    ///
    /// Returns error if the options are invalid
    pub fn with_source(
        options: CaptureOptions,
        source: Arc<dyn InstrumentationSource>,
    ) -> Result<Self> {
        let mut session = Self::new(options)?;
        session.custom_source = Some(source);
        Ok(session)
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Name of the attached source adapter
    #[must_use]
    pub fn source_name(&self) -> Option<&'static str> {
        self.source_name
    }

    /// Producer handle when the in-process listener adapter is attached
    #[must_use]
    pub fn listener(&self) -> Option<ListenerHandle> {
        self.running.as_ref().and_then(|r| r.listener.clone())
    }

    /// Correlator counters while running
    #[must_use]
    pub fn stats(&self) -> Option<CorrelatorStats> {
        self.running.as_ref().map(|r| r.correlator.stats())
    }

    /// Attach to a source and begin routing events
    ///
    /// # Errors
    ///
    /// Returns [`HarError::InvalidState`] unless the session is freshly
    /// created, or the source error if attaching fails
    pub async fn start(&mut self) -> Result<()> {
        match self.state {
            SessionState::Created => {}
            SessionState::Started => {
                return Err(HarError::InvalidState(
                    "capture already started".to_string(),
                ))
            }
            SessionState::Stopped => {
                return Err(HarError::InvalidState("capture was stopped".to_string()))
            }
        }

        let (source, listener) = match &self.custom_source {
            Some(source) => (Arc::clone(source), None),
            None => {
                let selected = select_source(&self.options).await?;
                (selected.source, selected.handle)
            }
        };

        let correlator = EntryCorrelator::new(&self.options, Arc::clone(&source))?;
        let mut events = source.subscribe(self.options.event_buffer).await?;

        let pump_correlator = correlator.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                pump_correlator.handle(event).await;
            }
            debug!("Event stream ended");
        });

        info!("Capture started with {} source", source.name());
        self.source_name = Some(source.name());
        self.running = Some(Running {
            source,
            correlator,
            pump,
            listener,
        });
        self.state = SessionState::Started;
        Ok(())
    }

    /// Detach, settle outstanding work and hand out the archive
    ///
    /// Already-delivered events are drained, body fetches are awaited or
    /// abandoned per [`PendingBodyPolicy`], and whatever is still in flight
    /// is finalized with an incompleteness note.
    ///
    /// # Errors
    ///
    /// Returns [`HarError::InvalidState`] unless the session is started, and
    /// [`HarError::Cancelled`] if `cancel` fires before the archive is
    /// complete. The session is stopped either way.
    pub async fn stop(&mut self, cancel: &CancellationToken) -> Result<Har> {
        match self.state {
            SessionState::Started => {}
            SessionState::Created => {
                return Err(HarError::InvalidState("capture not started".to_string()))
            }
            SessionState::Stopped => {
                return Err(HarError::InvalidState(
                    "capture already stopped".to_string(),
                ))
            }
        }
        self.state = SessionState::Stopped;

        let mut running = self
            .running
            .take()
            .ok_or_else(|| HarError::InvalidState("capture has no source".to_string()))?;

        if cancel.is_cancelled() {
            running.abandon().await;
            return Err(HarError::Cancelled);
        }

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            har = finish(&self.options, &mut running) => Some(har),
        };

        match outcome {
            Some(har) => har,
            None => {
                warn!("Capture stop cancelled, discarding archive");
                running.abandon().await;
                Err(HarError::Cancelled)
            }
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.pump.abort();
        }
    }
}

async fn finish(options: &CaptureOptions, running: &mut Running) -> Result<Har> {
    if let Err(e) = running.source.detach().await {
        warn!("Source detach failed: {}", e);
    }

    if let Err(e) = (&mut running.pump).await {
        if !e.is_cancelled() {
            warn!("Event pump failed: {}", e);
        }
    }

    let correlator = &running.correlator;
    correlator.close();
    let abandoned = correlator
        .settle(options.pending_bodies, options.body_wait_timeout())
        .await;
    if abandoned > 0 {
        warn!("Abandoned {} outstanding body fetch(es)", abandoned);
    }
    let forced = correlator.force_finalize_all().await;

    let (pages, entries) = correlator.take_archive().await;
    let mut har = Har::new(Creator::new(
        options.creator_name.clone(),
        env!("CARGO_PKG_VERSION"),
    ));
    har.log.browser = options
        .browser
        .as_ref()
        .map(|b| Creator::new(b.name.clone(), b.version.clone()))
        .or_else(|| running.source.browser());
    har.log.pages = pages;
    har.log.entries = entries;

    let stats = correlator.stats();
    info!(
        "Capture stopped: {} entries, {} pages, {} excluded, {} forced, {} anomalies",
        har.log.entries.len(),
        har.log.pages.len(),
        stats.excluded,
        forced,
        stats.anomalies
    );
    Ok(har)
}
