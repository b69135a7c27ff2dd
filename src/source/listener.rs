//! In-process source fed through a handle

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::capture::{NetworkEvent, RequestId};
use crate::{HarError, Result};

use super::{InstrumentationSource, ResponseBody};

struct Shared {
    sender: Mutex<Option<mpsc::Sender<NetworkEvent>>>,
    bodies: DashMap<RequestId, ResponseBody>,
    detached: AtomicBool,
}

/// Source whose events are pushed by the embedding application
///
/// Useful when the host already observes traffic itself (a proxy, a test
/// harness, a browser extension bridge) and only needs the archive built.
pub struct ListenerSource {
    shared: Arc<Shared>,
}

/// Producer side of a [`ListenerSource`]
#[derive(Clone)]
pub struct ListenerHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("detached", &self.shared.detached.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ListenerSource {
    /// Create a source and its producer handle
    #[must_use]
    pub fn new() -> (Self, ListenerHandle) {
        let shared = Arc::new(Shared {
            sender: Mutex::new(None),
            bodies: DashMap::new(),
            detached: AtomicBool::new(false),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            ListenerHandle { shared },
        )
    }
}

impl ListenerHandle {
    /// Deliver one event, waiting for channel capacity
    ///
    /// # Errors
    ///
    /// Returns error if the source is not subscribed or has been detached
    pub async fn emit(&self, event: NetworkEvent) -> Result<()> {
        if self.shared.detached.load(Ordering::Acquire) {
            return Err(HarError::Source("listener detached".to_string()));
        }
        let sender = self
            .shared
            .sender
            .lock()
            .await
            .clone()
            .ok_or_else(|| HarError::InvalidState("listener not subscribed".to_string()))?;

        sender
            .send(event)
            .await
            .map_err(|_| HarError::Source("capture no longer receiving events".to_string()))
    }

    /// Make a body available for a later fetch of `id`
    pub fn register_body(&self, id: RequestId, body: ResponseBody) {
        self.shared.bodies.insert(id, body);
    }

    /// Whether the source has been detached
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.shared.detached.load(Ordering::Acquire)
    }
}

#[async_trait]
impl InstrumentationSource for ListenerSource {
    fn name(&self) -> &'static str {
        "listener"
    }

    async fn subscribe(&self, buffer: usize) -> Result<mpsc::Receiver<NetworkEvent>> {
        if self.shared.detached.load(Ordering::Acquire) {
            return Err(HarError::InvalidState("listener detached".to_string()));
        }
        let mut sender = self.shared.sender.lock().await;
        if sender.is_some() {
            return Err(HarError::InvalidState(
                "listener already subscribed".to_string(),
            ));
        }
        let (tx, rx) = mpsc::channel(buffer);
        *sender = Some(tx);
        Ok(rx)
    }

    async fn fetch_body(&self, id: &RequestId) -> Result<ResponseBody> {
        self.shared
            .bodies
            .remove(id)
            .map(|(_, body)| body)
            .ok_or_else(|| HarError::BodyUnavailable(id.to_string()))
    }

    async fn detach(&self) -> Result<()> {
        if self.shared.detached.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.sender.lock().await.take();
        debug!(
            "Listener detached with {} unclaimed bodies",
            self.shared.bodies.len()
        );
        Ok(())
    }
}
