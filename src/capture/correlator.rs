//! Correlation of lifecycle events into archive entries

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, FixedOffset};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{CaptureOptions, CaptureType, CaptureTypes, PendingBodyPolicy};
use crate::har::parse::{
    header_value, parse_query_string, request_cookies, request_headers_size, response_cookies,
    response_headers_size,
};
use crate::har::{Cache, Content, Entry, Header, Page, PageTimings, PostData, Request, Response, Timings};
use crate::source::{InstrumentationSource, ResponseBody};
use crate::Result;

use super::event::{http_version_label, LoadMetric, NetworkEvent, RequestId, RequestSent, ResponseInfo};
use super::mime::{is_text_mime, BodyScopeMatcher};
use super::redact::Redactor;
use super::timing::map_timings;
use super::url_filter::UrlFilter;

/// Lifecycle position of an in-flight request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Request sent, no response yet
    Pending,
    /// Response headers received
    HeadersReceived,
    /// Finished loading, waiting on the body fetch
    BodyPending,
}

/// Counters describing what the correlator has seen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelatorStats {
    /// Entries appended to the archive
    pub finalized: usize,
    /// Requests dropped by the URL filter
    pub excluded: usize,
    /// Requests that failed at the source
    pub failed: usize,
    /// Events that did not fit the lifecycle and were ignored
    pub anomalies: usize,
    /// Bodies fetched successfully
    pub bodies_fetched: usize,
    /// Body fetches that returned an error
    pub bodies_missing: usize,
    /// Requests still being tracked
    pub in_flight: usize,
}

#[derive(Default)]
struct Counters {
    finalized: AtomicUsize,
    excluded: AtomicUsize,
    failed: AtomicUsize,
    anomalies: AtomicUsize,
    bodies_fetched: AtomicUsize,
    bodies_missing: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Accumulator {
    state: EntryState,
    excluded: bool,
    page_ref: Option<String>,
    started: DateTime<FixedOffset>,
    method: String,
    url: String,
    request_headers: Vec<Header>,
    post_data: Option<String>,
    response: Option<ResponseInfo>,
    response_timestamp: f64,
    finished_timestamp: Option<f64>,
    received_bytes: u64,
    encoded_length: Option<i64>,
    body: Option<ResponseBody>,
    redirect_url: Option<String>,
    failure: Option<String>,
    note: Option<String>,
}

impl Accumulator {
    fn new(sent: RequestSent, excluded: bool, page_ref: Option<String>) -> Self {
        Self {
            state: EntryState::Pending,
            excluded,
            page_ref,
            started: sent.wall_time,
            method: sent.method,
            url: sent.url,
            request_headers: sent.headers,
            post_data: sent.post_data,
            response: None,
            response_timestamp: sent.timestamp,
            finished_timestamp: None,
            received_bytes: 0,
            encoded_length: None,
            body: None,
            redirect_url: None,
            failure: None,
            note: None,
        }
    }

    fn mime_type(&self) -> Option<&str> {
        self.response.as_ref().and_then(|r| r.mime_type.as_deref())
    }
}

struct Inner {
    source: Arc<dyn InstrumentationSource>,
    filter: UrlFilter,
    scope: BodyScopeMatcher,
    redactor: Redactor,
    capture_types: CaptureTypes,
    max_body: Option<usize>,
    inflight: DashMap<RequestId, Accumulator>,
    entries: Mutex<Vec<Entry>>,
    pages: Mutex<Vec<Page>>,
    current_page: Mutex<Option<String>>,
    fetches: Mutex<JoinSet<()>>,
    closed: AtomicBool,
    counters: Counters,
}

/// Turns the interleaved event stream into one entry per logical request
///
/// Events may arrive from several tasks at once; per-request state lives in
/// a sharded map so unrelated requests never contend. Entries are appended
/// in completion order.
#[derive(Clone)]
pub struct EntryCorrelator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EntryCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryCorrelator")
            .field("source", &self.inner.source.name())
            .field("in_flight", &self.inner.inflight.len())
            .finish_non_exhaustive()
    }
}

impl EntryCorrelator {
    /// Create a correlator that fetches bodies from `source`
    ///
    /// # Errors
    ///
    /// Returns error if a URL or redaction pattern is invalid
    pub fn new(options: &CaptureOptions, source: Arc<dyn InstrumentationSource>) -> Result<Self> {
        let filter = UrlFilter::new(
            options.url_include_patterns.as_deref(),
            options.url_exclude_patterns.as_deref(),
        )?;
        let scope = BodyScopeMatcher::new(
            options.response_body_scope,
            options.response_body_mime_filter.as_deref(),
        );
        let redactor = Redactor::new(&options.redaction)?;
        let max_body = (options.max_response_body_size > 0)
            .then(|| usize::try_from(options.max_response_body_size).unwrap_or(usize::MAX));

        Ok(Self {
            inner: Arc::new(Inner {
                source,
                filter,
                scope,
                redactor,
                capture_types: options.capture_types.clone(),
                max_body,
                inflight: DashMap::new(),
                entries: Mutex::new(Vec::new()),
                pages: Mutex::new(Vec::new()),
                current_page: Mutex::new(None),
                fetches: Mutex::new(JoinSet::new()),
                closed: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        })
    }

    /// Feed one event
    pub async fn handle(&self, event: NetworkEvent) {
        if self.inner.closed.load(Ordering::Acquire) {
            debug!("Ignoring {} after close", event.kind());
            return;
        }
        Inner::handle(&self.inner, event).await;
    }

    /// Lifecycle state of a tracked request
    #[must_use]
    pub fn state_of(&self, id: &RequestId) -> Option<EntryState> {
        self.inner.inflight.get(id).map(|acc| acc.state)
    }

    /// Snapshot of the counters
    #[must_use]
    pub fn stats(&self) -> CorrelatorStats {
        let c = &self.inner.counters;
        CorrelatorStats {
            finalized: c.finalized.load(Ordering::Relaxed),
            excluded: c.excluded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            anomalies: c.anomalies.load(Ordering::Relaxed),
            bodies_fetched: c.bodies_fetched.load(Ordering::Relaxed),
            bodies_missing: c.bodies_missing.load(Ordering::Relaxed),
            in_flight: self.inner.inflight.len(),
        }
    }

    /// Stop accepting events and starting body fetches
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    /// Wait for or abandon outstanding body fetches
    ///
    /// Under [`PendingBodyPolicy::Await`] fetches get up to `bound` to
    /// complete; whatever is left is aborted. Returns the number of fetches
    /// abandoned.
    pub async fn settle(&self, policy: PendingBodyPolicy, bound: Duration) -> usize {
        let mut fetches = std::mem::take(&mut *self.inner.fetches.lock().await);

        if policy == PendingBodyPolicy::Await && !fetches.is_empty() {
            let drained = tokio::time::timeout(bound, async {
                while let Some(result) = fetches.join_next().await {
                    if let Err(e) = result {
                        warn!("Body fetch task failed: {}", e);
                    }
                }
            })
            .await;
            if drained.is_err() {
                warn!(
                    "Body wait bound of {:?} elapsed with {} fetch(es) outstanding",
                    bound,
                    fetches.len()
                );
            }
        }

        let abandoned = fetches.len();
        fetches.abort_all();
        while fetches.join_next().await.is_some() {}
        abandoned
    }

    /// Finalize every request still in flight with an incompleteness note
    ///
    /// Returns the number of entries forced out.
    pub async fn force_finalize_all(&self) -> usize {
        let ids: Vec<RequestId> = self
            .inner
            .inflight
            .iter()
            .map(|acc| acc.key().clone())
            .collect();

        let mut pending: Vec<(RequestId, Accumulator)> = ids
            .into_iter()
            .filter_map(|id| self.inner.inflight.remove(&id))
            .collect();
        pending.sort_by(|a, b| a.1.started.cmp(&b.1.started).then_with(|| a.0.cmp(&b.0)));

        let count = pending.len();
        for (id, mut acc) in pending {
            let note = match acc.state {
                EntryState::Pending => "Incomplete: no response before capture stopped",
                EntryState::HeadersReceived => {
                    "Incomplete: response did not finish before capture stopped"
                }
                EntryState::BodyPending => {
                    "Incomplete: response body not retrieved before capture stopped"
                }
            };
            debug!("Forcing out request {} ({:?})", id, acc.state);
            acc.note = Some(note.to_string());
            self.inner.finalize(acc).await;
        }
        count
    }

    /// Number of entries finalized so far
    pub async fn entry_count(&self) -> usize {
        self.inner.entries.lock().await.len()
    }

    /// Take the pages and entries collected so far
    pub async fn take_archive(&self) -> (Vec<Page>, Vec<Entry>) {
        let pages = std::mem::take(&mut *self.inner.pages.lock().await);
        let entries = std::mem::take(&mut *self.inner.entries.lock().await);
        (pages, entries)
    }
}

impl Inner {
    async fn handle(this: &Arc<Self>, event: NetworkEvent) {
        match event {
            NetworkEvent::RequestWillBeSent(sent) => this.on_request(sent).await,
            NetworkEvent::ResponseReceived {
                id,
                response,
                timestamp,
            } => this.on_response(&id, response, timestamp),
            NetworkEvent::DataReceived { id, data_length } => this.on_data(&id, data_length),
            NetworkEvent::LoadingFinished {
                id,
                encoded_data_length,
                timestamp,
            } => Self::on_finished(this, id, encoded_data_length, timestamp).await,
            NetworkEvent::LoadingFailed {
                id,
                error_text,
                canceled,
            } => this.on_failed(&id, &error_text, canceled).await,
            NetworkEvent::NavigationStarted {
                page_id,
                url,
                title,
                timestamp,
            } => this.on_navigation(page_id, &url, title, timestamp).await,
            NetworkEvent::NavigationLoadMetric {
                page_id,
                metric,
                time_ms,
            } => this.on_load_metric(&page_id, metric, time_ms).await,
        }
    }

    fn anomaly(&self, id: &RequestId, message: &str) {
        Counters::bump(&self.counters.anomalies);
        warn!("Request {}: {}", id, message);
    }

    fn unknown(&self, id: &RequestId, kind: &str) {
        Counters::bump(&self.counters.anomalies);
        debug!("Ignoring {} for untracked request {}", kind, id);
    }

    async fn on_request(&self, sent: RequestSent) {
        if let Some((_, mut prior)) = self.inflight.remove(&sent.id) {
            match sent.redirect_response.clone() {
                Some(hop) => {
                    prior.response = Some(hop);
                    prior.response_timestamp = sent.timestamp;
                    prior.finished_timestamp = Some(sent.timestamp);
                    prior.redirect_url = Some(sent.url.clone());
                }
                None => {
                    self.anomaly(&sent.id, "id reused without a redirect response");
                    prior.note = Some("Superseded by a new request with the same id".to_string());
                }
            }
            self.finalize(prior).await;
        } else if sent.redirect_response.is_some() {
            debug!("Redirect hop for untracked request {}", sent.id);
        }

        let excluded = !self.filter.is_included(&sent.url);
        let page_ref = self.current_page.lock().await.clone();
        let id = sent.id.clone();
        self.inflight
            .insert(id, Accumulator::new(sent, excluded, page_ref));
    }

    fn on_response(&self, id: &RequestId, response: ResponseInfo, timestamp: f64) {
        let Some(mut acc) = self.inflight.get_mut(id) else {
            self.unknown(id, "responseReceived");
            return;
        };
        if acc.state != EntryState::Pending {
            drop(acc);
            self.anomaly(id, "duplicate response headers");
            return;
        }
        acc.state = EntryState::HeadersReceived;
        acc.response = Some(response);
        acc.response_timestamp = timestamp;
    }

    fn on_data(&self, id: &RequestId, data_length: u64) {
        let Some(mut acc) = self.inflight.get_mut(id) else {
            self.unknown(id, "dataReceived");
            return;
        };
        if acc.state == EntryState::Pending {
            drop(acc);
            self.anomaly(id, "body data before response headers");
            return;
        }
        acc.received_bytes = acc.received_bytes.saturating_add(data_length);
    }

    async fn on_finished(
        this: &Arc<Self>,
        id: RequestId,
        encoded_data_length: Option<i64>,
        timestamp: f64,
    ) {
        let fetch_body = {
            let Some(mut acc) = this.inflight.get_mut(&id) else {
                this.unknown(&id, "loadingFinished");
                return;
            };
            if acc.state != EntryState::HeadersReceived {
                let state = acc.state;
                drop(acc);
                this.anomaly(&id, &format!("loadingFinished in state {state:?}"));
                return;
            }
            acc.encoded_length = encoded_data_length;
            acc.finished_timestamp = Some(timestamp);

            let wants_content = this.capture_types.contains(CaptureType::ResponseContent)
                || this.capture_types.contains(CaptureType::ResponseBinaryContent);
            let fetch = !acc.excluded
                && wants_content
                && !this.closed.load(Ordering::Acquire)
                && this.scope.should_retrieve(acc.mime_type());
            if fetch {
                acc.state = EntryState::BodyPending;
            }
            fetch
        };

        if fetch_body {
            let inner = Arc::clone(this);
            let mut fetches = this.fetches.lock().await;
            while let Some(done) = fetches.try_join_next() {
                if let Err(e) = done {
                    warn!("Body fetch task failed: {}", e);
                }
            }
            fetches.spawn(async move { inner.complete_body(id).await });
        } else if let Some((_, acc)) = this.inflight.remove(&id) {
            this.finalize(acc).await;
        }
    }

    async fn complete_body(&self, id: RequestId) {
        let result = self.source.fetch_body(&id).await;

        let Some((_, mut acc)) = self
            .inflight
            .remove_if(&id, |_, acc| acc.state == EntryState::BodyPending)
        else {
            debug!("Body for {} arrived after the request was finalized", id);
            return;
        };

        match result {
            Ok(body) => {
                Counters::bump(&self.counters.bodies_fetched);
                acc.body = Some(body);
            }
            Err(e) => {
                Counters::bump(&self.counters.bodies_missing);
                debug!("No body for {}: {}", id, e);
                acc.note = Some(e.to_string());
            }
        }
        self.finalize(acc).await;
    }

    async fn on_failed(&self, id: &RequestId, error_text: &str, canceled: bool) {
        let Some((_, mut acc)) = self.inflight.remove(id) else {
            self.unknown(id, "loadingFailed");
            return;
        };
        Counters::bump(&self.counters.failed);
        acc.failure = Some(if canceled {
            format!("{error_text} (canceled)")
        } else {
            error_text.to_string()
        });
        self.finalize(acc).await;
    }

    async fn on_navigation(
        &self,
        page_id: String,
        url: &str,
        title: Option<String>,
        started: DateTime<FixedOffset>,
    ) {
        let mut pages = self.pages.lock().await;
        if pages.iter().any(|p| p.id == page_id) {
            Counters::bump(&self.counters.anomalies);
            warn!("Duplicate navigation for page {}", page_id);
            return;
        }
        info!("Page {} started: {}", page_id, self.redactor.redact_url(url));
        pages.push(Page {
            started_date_time: started,
            id: page_id.clone(),
            title: title.unwrap_or_else(|| self.redactor.redact_url(url)),
            page_timings: PageTimings::default(),
        });
        drop(pages);

        *self.current_page.lock().await = Some(page_id);
    }

    async fn on_load_metric(&self, page_id: &str, metric: LoadMetric, time_ms: f64) {
        let mut pages = self.pages.lock().await;
        let Some(page) = pages.iter_mut().find(|p| p.id == page_id) else {
            Counters::bump(&self.counters.anomalies);
            debug!("Load metric for unknown page {}", page_id);
            return;
        };
        let value = (time_ms >= 0.0).then_some(time_ms);
        match metric {
            LoadMetric::ContentLoad => page.page_timings.on_content_load = value,
            LoadMetric::Load => page.page_timings.on_load = value,
        }
    }

    async fn finalize(&self, acc: Accumulator) {
        if acc.excluded {
            Counters::bump(&self.counters.excluded);
            debug!("Dropping excluded request {}", acc.url);
            return;
        }

        let entry = self.redactor.redact_entry(self.build_entry(acc));
        self.entries.lock().await.push(entry);
        Counters::bump(&self.counters.finalized);
    }

    fn build_entry(&self, acc: Accumulator) -> Entry {
        let types = &self.capture_types;
        let http_version =
            http_version_label(acc.response.as_ref().and_then(|r| r.protocol.as_deref()));

        let request = self.build_request(&acc, &http_version);
        let mut response = Response::empty();
        let mut timings = Timings::default();
        let mut server_ip_address = None;

        if let Some(info) = &acc.response {
            response.status = info.status;
            response.status_text = info.status_text.clone();
            response.http_version = http_version.clone();
            response.headers_size = response_headers_size(
                &http_version,
                info.status,
                &info.status_text,
                &info.headers,
            );
            if types.contains(CaptureType::ResponseCookies) {
                response.cookies = response_cookies(&info.headers);
            }
            if types.contains(CaptureType::ResponseHeaders) {
                response.headers = info.headers.clone();
            }
            response.body_size = acc
                .encoded_length
                .unwrap_or_else(|| i64::try_from(acc.received_bytes).unwrap_or(i64::MAX));
            response.content = self.build_content(
                info.mime_type.as_deref().unwrap_or_default(),
                acc.body.clone(),
                acc.received_bytes,
            );
            server_ip_address = info.remote_address.clone().filter(|a| !a.is_empty());

            if types.contains(CaptureType::Timings) {
                if let Some(sample) = &info.timing {
                    // `receive` runs until loadingFinished; headers-only
                    // entries fall back to the responseReceived time
                    let end = acc.finished_timestamp.unwrap_or(acc.response_timestamp);
                    timings = map_timings(sample, end);
                }
            }
        }

        if let Some(target) = &acc.redirect_url {
            response.redirect_url.clone_from(target);
        }

        let comment = match &acc.failure {
            Some(error) => {
                response.status = 0;
                response.status_text.clone_from(error);
                Some(format!("Request failed: {error}"))
            }
            None => acc.note.clone(),
        };

        Entry {
            page_ref: acc.page_ref,
            started_date_time: acc.started,
            time: timings.total(),
            request,
            response,
            cache: Cache::default(),
            timings,
            server_ip_address,
            comment,
        }
    }

    fn build_request(&self, acc: &Accumulator, http_version: &str) -> Request {
        let types = &self.capture_types;
        let content_type = header_value(&acc.request_headers, "content-type").unwrap_or_default();

        let post_data = acc.post_data.as_ref().and_then(|text| {
            let flag = if content_type.is_empty() || is_text_mime(content_type) {
                CaptureType::RequestContent
            } else {
                CaptureType::RequestBinaryContent
            };
            types.contains(flag).then(|| PostData {
                mime_type: content_type.to_string(),
                text: text.clone(),
            })
        });

        Request {
            method: acc.method.clone(),
            url: acc.url.clone(),
            http_version: http_version.to_string(),
            cookies: if types.contains(CaptureType::RequestCookies) {
                request_cookies(&acc.request_headers)
            } else {
                Vec::new()
            },
            headers: if types.contains(CaptureType::RequestHeaders) {
                acc.request_headers.clone()
            } else {
                Vec::new()
            },
            query_string: parse_query_string(&acc.url),
            post_data,
            headers_size: request_headers_size(
                &acc.method,
                &acc.url,
                http_version,
                &acc.request_headers,
            ),
            body_size: acc.post_data.as_ref().map_or(0, |t| len_i64(t.len())),
        }
    }

    fn build_content(&self, mime_type: &str, body: Option<ResponseBody>, received: u64) -> Content {
        let mut content = Content {
            size: i64::try_from(received).unwrap_or(i64::MAX),
            compression: None,
            mime_type: mime_type.to_string(),
            text: None,
            encoding: None,
        };
        let Some(body) = body else {
            return content;
        };

        let is_text = !body.base64_encoded || is_text_mime(mime_type);
        let mut bytes = if body.base64_encoded {
            match BASE64.decode(body.body.as_bytes()) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Discarding undecodable base64 body: {}", e);
                    return content;
                }
            }
        } else {
            body.body.into_bytes()
        };
        content.size = len_i64(bytes.len());

        if is_text {
            match String::from_utf8(bytes) {
                Ok(mut text) => {
                    if self.capture_types.contains(CaptureType::ResponseContent) {
                        if let Some(max) = self.max_body {
                            truncate_at_char_boundary(&mut text, max);
                        }
                        content.text = Some(text);
                    }
                    return content;
                }
                Err(e) => bytes = e.into_bytes(),
            }
        }

        if self.capture_types.contains(CaptureType::ResponseBinaryContent) {
            if let Some(max) = self.max_body {
                bytes.truncate(max);
            }
            content.text = Some(BASE64.encode(&bytes));
            content.encoding = Some("base64".to_string());
        }
        content
    }
}

fn len_i64(len: usize) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX)
}

/// Cut `text` to at most `max` bytes without splitting a character
fn truncate_at_char_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}
