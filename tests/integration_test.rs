//! Integration tests for full capture sessions

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use harcap::capture::{
    CaptureSession, LoadMetric, NetworkEvent, RequestId, RequestSent, ResourceTiming,
    ResponseInfo,
};
use harcap::config::{CaptureOptions, PendingBodyPolicy, ResponseBodyScope};
use harcap::har::{codec, Header};
use harcap::source::{InstrumentationSource, ListenerHandle, ListenerSource, ResponseBody};
use harcap::{HarError, Result};

fn wall(offset_ms: i64) -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339("2024-03-01T09:30:00.000-05:00").unwrap()
        + chrono::Duration::milliseconds(offset_ms)
}

fn request(id: &str, url: &str, offset_ms: i64) -> NetworkEvent {
    NetworkEvent::RequestWillBeSent(RequestSent {
        id: RequestId::from(id),
        method: "GET".to_string(),
        url: url.to_string(),
        headers: vec![
            Header::new("Accept", "*/*"),
            Header::new("Authorization", "Bearer abc"),
        ],
        post_data: None,
        timestamp: 1000.0 + offset_ms as f64 / 1000.0,
        wall_time: wall(offset_ms),
        redirect_response: None,
    })
}

fn response_info(status: u16, mime: &str) -> ResponseInfo {
    ResponseInfo {
        status,
        status_text: if status == 200 { "OK" } else { "Found" }.to_string(),
        headers: vec![Header::new("Content-Type", mime)],
        mime_type: Some(mime.to_string()),
        protocol: Some("http/1.1".to_string()),
        remote_address: None,
        timing: Some(ResourceTiming {
            request_time: 1000.0,
            dns_start: Some(10.0),
            dns_end: Some(15.0),
            connect_start: Some(15.0),
            connect_end: Some(40.0),
            ssl_start: Some(20.0),
            ssl_end: Some(35.0),
            send_start: Some(40.0),
            send_end: Some(42.0),
            receive_headers_end: Some(100.0),
        }),
    }
}

fn response(id: &str, status: u16, mime: &str) -> NetworkEvent {
    NetworkEvent::ResponseReceived {
        id: RequestId::from(id),
        response: response_info(status, mime),
        timestamp: 1000.1,
    }
}

fn finished(id: &str) -> NetworkEvent {
    NetworkEvent::LoadingFinished {
        id: RequestId::from(id),
        encoded_data_length: Some(300),
        timestamp: 1000.150,
    }
}

async fn started(options: CaptureOptions) -> (CaptureSession, ListenerHandle) {
    let mut session = CaptureSession::new(options.force_listener()).unwrap();
    session.start().await.unwrap();
    let handle = session.listener().unwrap();
    (session, handle)
}

async fn complete(handle: &ListenerHandle, id: &str, url: &str, mime: &str, offset_ms: i64) {
    handle.emit(request(id, url, offset_ms)).await.unwrap();
    handle.emit(response(id, 200, mime)).await.unwrap();
    handle.emit(finished(id)).await.unwrap();
}

/// Listener wrapper whose body fetches take a while
struct SlowBodies {
    inner: ListenerSource,
    delay: Duration,
}

#[async_trait]
impl InstrumentationSource for SlowBodies {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn subscribe(&self, buffer: usize) -> Result<mpsc::Receiver<NetworkEvent>> {
        self.inner.subscribe(buffer).await
    }

    async fn fetch_body(&self, id: &RequestId) -> Result<ResponseBody> {
        tokio::time::sleep(self.delay).await;
        self.inner.fetch_body(id).await
    }

    async fn detach(&self) -> Result<()> {
        self.inner.detach().await
    }
}

fn slow_session(options: CaptureOptions, delay: Duration) -> (CaptureSession, ListenerHandle) {
    let (inner, handle) = ListenerSource::new();
    let source = Arc::new(SlowBodies { inner, delay });
    (CaptureSession::with_source(options, source).unwrap(), handle)
}

#[tokio::test]
async fn test_one_entry_per_request() {
    let (mut session, handle) = started(CaptureOptions::default()).await;
    assert_eq!(session.source_name(), Some("listener"));

    handle.register_body(RequestId::from("1"), ResponseBody::text("<html></html>"));
    complete(&handle, "1", "https://site.com/", "text/html", 0).await;
    complete(&handle, "2", "https://site.com/app.js", "application/javascript", 5).await;
    handle.emit(request("3", "https://site.com/never", 6)).await.unwrap();

    let har = session.stop(&CancellationToken::new()).await.unwrap();
    assert_eq!(har.log.entries.len(), 3);

    let page = har
        .log
        .entries
        .iter()
        .find(|e| e.request.url == "https://site.com/")
        .unwrap();
    assert_eq!(page.response.content.text.as_deref(), Some("<html></html>"));
    assert_eq!(page.timings.blocked, Some(10.0));
    assert_eq!(page.timings.dns, Some(5.0));
    assert_eq!(page.timings.connect, Some(25.0));
    assert_eq!(page.timings.ssl, Some(15.0));
    assert!((page.timings.send - 2.0).abs() < 1e-9);
    assert!((page.timings.wait - 58.0).abs() < 1e-9);
    assert!((page.timings.receive - 50.0).abs() < 1e-6);
    assert!((page.time - 150.0).abs() < 1e-6);

    let pending = har
        .log
        .entries
        .iter()
        .find(|e| e.request.url.ends_with("/never"))
        .unwrap();
    assert_eq!(pending.response.status, 0);
    assert!(pending.comment.is_some());
}

#[tokio::test]
async fn test_url_filter_and_excluded_redirect_hop() {
    let options = CaptureOptions::default()
        .with_url_include_patterns(["https://api.example.com/**", "https://site.com/**"])
        .with_url_exclude_patterns(["**/*.png", "**/tracker/**"]);
    let (mut session, handle) = started(options).await;

    complete(&handle, "1", "https://api.example.com/x.png", "image/png", 0).await;
    complete(&handle, "2", "https://api.example.com/data", "application/json", 1).await;
    complete(&handle, "3", "https://other.com/data", "application/json", 2).await;

    handle.emit(request("4", "https://site.com/go", 3)).await.unwrap();
    let NetworkEvent::RequestWillBeSent(mut hop) = request("4", "https://site.com/tracker/pixel", 4)
    else {
        unreachable!()
    };
    hop.redirect_response = Some(response_info(302, "text/html"));
    handle.emit(NetworkEvent::RequestWillBeSent(hop)).await.unwrap();
    handle.emit(response("4", 200, "image/gif")).await.unwrap();
    handle.emit(finished("4")).await.unwrap();

    let har = session.stop(&CancellationToken::new()).await.unwrap();
    let mut urls: Vec<&str> = har.log.entries.iter().map(|e| e.request.url.as_str()).collect();
    urls.sort_unstable();
    assert_eq!(urls, vec!["https://api.example.com/data", "https://site.com/go"]);

    let first_hop = har
        .log
        .entries
        .iter()
        .find(|e| e.request.url == "https://site.com/go")
        .unwrap();
    assert_eq!(first_hop.response.status, 302);
    assert_eq!(
        first_hop.response.redirect_url,
        "https://site.com/tracker/pixel"
    );
}

#[tokio::test]
async fn test_redaction_end_to_end() {
    let options = CaptureOptions::default()
        .with_sensitive_headers(["authorization"])
        .with_sensitive_query_params(["api_*"]);
    let (mut session, handle) = started(options).await;

    complete(
        &handle,
        "1",
        "https://api.example.com/v1?api_key=sk-1&page=2",
        "application/json",
        0,
    )
    .await;

    let har = session.stop(&CancellationToken::new()).await.unwrap();
    let entry = &har.log.entries[0];
    assert_eq!(
        entry.request.url,
        "https://api.example.com/v1?api_key=[REDACTED]&page=2"
    );
    assert_eq!(entry.request.query_string[0].value, "[REDACTED]");
    assert_eq!(entry.request.query_string[1].value, "2");
    assert_eq!(entry.request.headers[0].value, "*/*");
    assert_eq!(entry.request.headers[1].value, "[REDACTED]");

    let json = codec::to_string(&har, false).unwrap();
    assert!(!json.contains("sk-1"));
    assert!(!json.contains("Bearer abc"));
}

#[tokio::test]
async fn test_body_scope_and_truncation() {
    let options = CaptureOptions::default()
        .with_response_body_scope(ResponseBodyScope::PagesAndApi)
        .with_max_response_body_size(8);
    let (mut session, handle) = started(options).await;

    handle.register_body(RequestId::from("css"), ResponseBody::text("body { color: red }"));
    handle.register_body(RequestId::from("api"), ResponseBody::text("{\"items\":[1,2,3]}"));
    complete(&handle, "css", "https://site.com/a.css", "text/css", 0).await;
    complete(&handle, "api", "https://site.com/api", "application/json; charset=utf-8", 1).await;

    let har = session.stop(&CancellationToken::new()).await.unwrap();
    let css = har.log.entries.iter().find(|e| e.request.url.ends_with(".css")).unwrap();
    let api = har.log.entries.iter().find(|e| e.request.url.ends_with("/api")).unwrap();

    assert!(css.response.content.text.is_none());
    assert_eq!(api.response.content.text.as_deref(), Some("{\"items\""));
    assert_eq!(api.response.content.size, 17);
}

#[tokio::test]
async fn test_failed_request_is_kept() {
    let (mut session, handle) = started(CaptureOptions::default()).await;

    handle.emit(request("1", "https://down.example/", 0)).await.unwrap();
    handle
        .emit(NetworkEvent::LoadingFailed {
            id: RequestId::from("1"),
            error_text: "net::ERR_NAME_NOT_RESOLVED".to_string(),
            canceled: false,
        })
        .await
        .unwrap();

    let har = session.stop(&CancellationToken::new()).await.unwrap();
    assert_eq!(har.log.entries.len(), 1);
    assert_eq!(har.log.entries[0].response.status, 0);
    assert_eq!(
        har.log.entries[0].response.status_text,
        "net::ERR_NAME_NOT_RESOLVED"
    );
}

#[tokio::test]
async fn test_pages_and_start_order() {
    let (mut session, handle) = started(CaptureOptions::default()).await;

    handle
        .emit(NetworkEvent::NavigationStarted {
            page_id: "page_1".to_string(),
            url: "https://site.com/".to_string(),
            title: Some("Home".to_string()),
            timestamp: wall(0),
        })
        .await
        .unwrap();
    handle.emit(request("late", "https://site.com/b", 20)).await.unwrap();
    handle.emit(request("early", "https://site.com/a", 10)).await.unwrap();
    handle.emit(response("late", 200, "text/plain")).await.unwrap();
    handle.emit(finished("late")).await.unwrap();
    handle.emit(response("early", 200, "text/plain")).await.unwrap();
    handle.emit(finished("early")).await.unwrap();
    handle
        .emit(NetworkEvent::NavigationLoadMetric {
            page_id: "page_1".to_string(),
            metric: LoadMetric::ContentLoad,
            time_ms: 42.0,
        })
        .await
        .unwrap();

    let har = session.stop(&CancellationToken::new()).await.unwrap();
    assert!(har.validate().is_ok());
    assert_eq!(har.log.pages[0].title, "Home");
    assert_eq!(har.log.pages[0].page_timings.on_content_load, Some(42.0));
    assert!(har
        .log
        .entries
        .iter()
        .all(|e| e.page_ref.as_deref() == Some("page_1")));

    let sorted = har.log.entries_sorted_by_start();
    assert_eq!(sorted[0].request.url, "https://site.com/a");
    assert_eq!(sorted[1].request.url, "https://site.com/b");
}

#[tokio::test]
async fn test_abandon_policy_returns_without_bodies() {
    let options = CaptureOptions::default()
        .with_pending_bodies(PendingBodyPolicy::Abandon, Duration::from_secs(30));
    let (mut session, handle) = slow_session(options, Duration::from_secs(30));
    session.start().await.unwrap();
    assert_eq!(session.source_name(), Some("slow"));

    handle.register_body(RequestId::from("1"), ResponseBody::text("late"));
    complete(&handle, "1", "https://site.com/", "text/html", 0).await;

    let har = tokio::time::timeout(
        Duration::from_secs(5),
        session.stop(&CancellationToken::new()),
    )
    .await
    .expect("stop should not wait for bodies")
    .unwrap();

    let entry = &har.log.entries[0];
    assert!(entry.response.content.text.is_none());
    assert!(entry.comment.as_deref().unwrap().contains("body not retrieved"));
}

#[tokio::test]
async fn test_await_policy_collects_bodies_within_bound() {
    let options = CaptureOptions::default()
        .with_pending_bodies(PendingBodyPolicy::Await, Duration::from_secs(5));
    let (mut session, handle) = slow_session(options, Duration::from_millis(20));
    session.start().await.unwrap();

    handle.register_body(RequestId::from("1"), ResponseBody::text("done"));
    complete(&handle, "1", "https://site.com/", "text/html", 0).await;

    let har = session.stop(&CancellationToken::new()).await.unwrap();
    assert_eq!(har.log.entries[0].response.content.text.as_deref(), Some("done"));
}

#[tokio::test]
async fn test_cancel_during_stop_discards_archive() {
    let options = CaptureOptions::default()
        .with_pending_bodies(PendingBodyPolicy::Await, Duration::from_secs(30));
    let (mut session, handle) = slow_session(options, Duration::from_secs(30));
    session.start().await.unwrap();
    complete(&handle, "1", "https://site.com/", "text/html", 0).await;

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(5), session.stop(&token))
        .await
        .expect("cancellation should end stop promptly");
    assert!(matches!(result, Err(HarError::Cancelled)));
}

#[tokio::test]
async fn test_stop_with_cancelled_token() {
    let (mut session, handle) = started(CaptureOptions::default()).await;
    complete(&handle, "1", "https://site.com/", "text/html", 0).await;

    let token = CancellationToken::new();
    token.cancel();
    assert!(matches!(session.stop(&token).await, Err(HarError::Cancelled)));
    assert!(matches!(
        session.stop(&CancellationToken::new()).await,
        Err(HarError::InvalidState(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers() {
    let (mut session, handle) = started(CaptureOptions::default()).await;

    let mut tasks = Vec::new();
    for worker in 0..4 {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..25 {
                let id = format!("w{worker}-{i}");
                let url = format!("https://site.com/{worker}/{i}");
                complete(&handle, &id, &url, "text/plain", i).await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let har = session.stop(&CancellationToken::new()).await.unwrap();
    assert_eq!(har.log.entries.len(), 100);
}

#[tokio::test]
async fn test_persist_plain_and_gzip() {
    let temp_dir = TempDir::new().unwrap();
    let options = CaptureOptions::default().with_browser("HeadlessChrome", "120.0");
    let (mut session, handle) = started(options).await;

    handle.register_body(RequestId::from("1"), ResponseBody::text("hello"));
    complete(&handle, "1", "https://site.com/?q=a+b", "text/plain", 0).await;
    complete(&handle, "2", "https://site.com/2", "text/plain", 1).await;
    let har = session.stop(&CancellationToken::new()).await.unwrap();

    for name in ["capture.har", "capture.HAR.GZ"] {
        let path = temp_dir.path().join(name);
        codec::save_async(har.clone(), path.clone(), false)
            .await
            .unwrap();
        let loaded = codec::load_async(path).await.unwrap();

        assert_eq!(loaded, har);
        assert_eq!(loaded.log.entries.len(), 2);
        let first = loaded
            .log
            .entries
            .iter()
            .find(|e| e.request.url.contains("?q="))
            .unwrap();
        assert_eq!(first.request.query_string[0].value, "a b");
        assert_eq!(first.response.content.text.as_deref(), Some("hello"));
        assert_eq!(first.started_date_time.offset().local_minus_utc(), -5 * 3600);
    }
}
