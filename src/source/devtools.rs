//! Devtools protocol source over a websocket

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Local, TimeZone};
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::capture::{
    phase, LoadMetric, NetworkEvent, RequestId, RequestSent, ResourceTiming, ResponseInfo,
};
use crate::har::{Creator, Header};
use crate::{HarError, Result};

use super::{InstrumentationSource, ResponseBody};

/// Devtools protocol versions whose network domain this adapter understands
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["1.2", "1.3"];

const COMMAND_TIMEOUT_MS: u64 = 10_000;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type CommandReply = std::result::Result<Value, String>;

struct Connection {
    writer: Mutex<SplitSink<WsStream, Message>>,
    pending: DashMap<u64, oneshot::Sender<CommandReply>>,
    events: Mutex<Option<mpsc::Sender<NetworkEvent>>>,
    next_id: AtomicU64,
}

impl Connection {
    async fn command(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let frame = json!({ "id": id, "method": method, "params": params }).to_string();
        if let Err(e) = self.writer.lock().await.send(Message::Text(frame)).await {
            self.pending.remove(&id);
            return Err(HarError::Source(format!("Failed to send {method}: {e}")));
        }

        match tokio::time::timeout(Duration::from_millis(COMMAND_TIMEOUT_MS), rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(message))) => Err(HarError::Source(format!("{method} failed: {message}"))),
            Ok(Err(_)) => Err(HarError::Source(format!(
                "Connection closed while waiting for {method}"
            ))),
            Err(_) => {
                self.pending.remove(&id);
                Err(HarError::Source(format!("{method} timed out")))
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut reader: SplitStream<WsStream>) {
        let mut translator = Translator::default();

        while let Some(message) = reader.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => {
                    debug!("Devtools endpoint closed the connection");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    error!("Devtools connection error: {}", e);
                    break;
                }
            };

            let frame: Value = match serde_json::from_str(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Dropping malformed devtools frame: {}", e);
                    continue;
                }
            };

            if let Some(id) = frame.get("id").and_then(Value::as_u64) {
                if let Some((_, reply)) = self.pending.remove(&id) {
                    let outcome = match frame.get("error") {
                        Some(err) => Err(err
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown error")
                            .to_string()),
                        None => Ok(frame.get("result").cloned().unwrap_or(Value::Null)),
                    };
                    reply.send(outcome).ok();
                }
                continue;
            }

            let Some(method) = frame.get("method").and_then(Value::as_str) else {
                continue;
            };
            let params = frame.get("params").cloned().unwrap_or(Value::Null);
            let events = translator.translate(method, &params);
            if events.is_empty() {
                continue;
            }

            let Some(sender) = self.events.lock().await.clone() else {
                continue;
            };
            for event in events {
                if sender.send(event).await.is_err() {
                    debug!("Event receiver dropped");
                    break;
                }
            }
        }

        // Fail outstanding commands instead of leaving them to time out
        self.pending.clear();
        self.events.lock().await.take();
    }
}

/// Attaches to a browser page through its devtools websocket endpoint
pub struct DevtoolsSource {
    connection: Arc<Connection>,
    reader: Mutex<Option<JoinHandle<()>>>,
    product: String,
    detached: AtomicBool,
}

impl DevtoolsSource {
    /// Connect and verify the browser is supported
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint is unreachable or advertises a protocol
    /// version outside [`SUPPORTED_PROTOCOL_VERSIONS`]
    pub async fn connect(url: &str) -> Result<Self> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| HarError::Source(format!("WebSocket connect failed: {e}")))?;
        let (writer, reader) = stream.split();

        let connection = Arc::new(Connection {
            writer: Mutex::new(writer),
            pending: DashMap::new(),
            events: Mutex::new(None),
            next_id: AtomicU64::new(1),
        });
        let reader = tokio::spawn(Arc::clone(&connection).read_loop(reader));

        let mut source = Self {
            connection,
            reader: Mutex::new(Some(reader)),
            product: String::new(),
            detached: AtomicBool::new(false),
        };

        let version = match source
            .connection
            .command("Browser.getVersion", json!({}))
            .await
        {
            Ok(version) => version,
            Err(e) => {
                source.shutdown().await;
                return Err(e);
            }
        };
        let protocol = str_field(&version, "protocolVersion");
        let product = str_field(&version, "product");

        if !is_supported(&protocol) {
            source.shutdown().await;
            return Err(HarError::Source(format!(
                "Unsupported devtools protocol '{protocol}' from {product}, expected one of {SUPPORTED_PROTOCOL_VERSIONS:?}"
            )));
        }

        info!("Attached to {} (protocol {})", product, protocol);
        source.product = product;
        Ok(source)
    }

    /// Browser product string, e.g. `HeadlessChrome/120.0.6099.71`
    #[must_use]
    pub fn product(&self) -> &str {
        &self.product
    }

    async fn shutdown(&self) {
        self.connection.events.lock().await.take();
        if let Err(e) = self.connection.writer.lock().await.close().await {
            debug!("Websocket close: {}", e);
        }
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
    }
}

fn is_supported(protocol_version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&protocol_version.trim())
}

#[async_trait]
impl InstrumentationSource for DevtoolsSource {
    fn name(&self) -> &'static str {
        "devtools"
    }

    fn browser(&self) -> Option<Creator> {
        let (name, version) = self.product.split_once('/')?;
        Some(Creator::new(name, version))
    }

    async fn subscribe(&self, buffer: usize) -> Result<mpsc::Receiver<NetworkEvent>> {
        if self.detached.load(Ordering::Acquire) {
            return Err(HarError::InvalidState("devtools source detached".to_string()));
        }
        let (tx, rx) = mpsc::channel(buffer);
        *self.connection.events.lock().await = Some(tx);

        self.connection.command("Network.enable", json!({})).await?;
        self.connection.command("Page.enable", json!({})).await?;
        Ok(rx)
    }

    async fn fetch_body(&self, id: &RequestId) -> Result<ResponseBody> {
        let result = self
            .connection
            .command(
                "Network.getResponseBody",
                json!({ "requestId": id.as_str() }),
            )
            .await
            .map_err(|e| HarError::BodyUnavailable(format!("{id}: {e}")))?;

        Ok(ResponseBody {
            body: result
                .get("body")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            base64_encoded: result
                .get("base64Encoded")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    async fn detach(&self) -> Result<()> {
        if self.detached.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Stop event delivery first; in-flight body fetches still get answers
        self.connection.events.lock().await.take();
        if let Err(e) = self.connection.command("Network.disable", json!({})).await {
            debug!("Network.disable: {}", e);
        }
        Ok(())
    }
}

impl Drop for DevtoolsSource {
    fn drop(&mut self) {
        if let Ok(mut reader) = self.reader.try_lock() {
            if let Some(reader) = reader.take() {
                reader.abort();
            }
        }
    }
}

/// Maps devtools notifications to [`NetworkEvent`]s
#[derive(Default)]
struct Translator {
    main_frame: Option<String>,
    page_count: usize,
    current_page: Option<PageMark>,
    clock: Option<(f64, f64)>,
    last_timestamp: f64,
}

struct PageMark {
    id: String,
    loader: String,
    started: f64,
}

impl Translator {
    fn translate(&mut self, method: &str, params: &Value) -> Vec<NetworkEvent> {
        let id = || RequestId::new(str_field(params, "requestId"));

        match method {
            "Network.requestWillBeSent" => self.request_will_be_sent(params),
            "Network.responseReceived" => vec![NetworkEvent::ResponseReceived {
                id: id(),
                response: response_info(params.get("response").unwrap_or(&Value::Null)),
                timestamp: f64_field(params, "timestamp"),
            }],
            "Network.dataReceived" => vec![NetworkEvent::DataReceived {
                id: id(),
                data_length: params
                    .get("dataLength")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            }],
            "Network.loadingFinished" => vec![NetworkEvent::LoadingFinished {
                id: id(),
                encoded_data_length: params
                    .get("encodedDataLength")
                    .and_then(Value::as_f64)
                    .map(|len| len as i64),
                timestamp: f64_field(params, "timestamp"),
            }],
            "Network.loadingFailed" => vec![NetworkEvent::LoadingFailed {
                id: id(),
                error_text: str_field(params, "errorText"),
                canceled: params
                    .get("canceled")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }],
            "Page.frameNavigated" => self.frame_navigated(params),
            "Page.domContentEventFired" => self.load_metric(LoadMetric::ContentLoad, params),
            "Page.loadEventFired" => self.load_metric(LoadMetric::Load, params),
            _ => Vec::new(),
        }
    }

    fn wall_clock(&self, timestamp: f64) -> DateTime<FixedOffset> {
        let seconds = match self.clock {
            Some((mono, wall)) => wall + (timestamp - mono),
            None => timestamp,
        };
        let millis = (seconds * 1000.0).round() as i64;
        Local
            .timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Local::now)
            .fixed_offset()
    }

    fn open_page(&mut self, loader: String, url: &str, timestamp: f64) -> NetworkEvent {
        self.page_count += 1;
        let id = format!("page_{}", self.page_count);
        self.current_page = Some(PageMark {
            id: id.clone(),
            loader,
            started: timestamp,
        });
        NetworkEvent::NavigationStarted {
            page_id: id,
            url: url.to_string(),
            title: None,
            timestamp: self.wall_clock(timestamp),
        }
    }

    fn request_will_be_sent(&mut self, params: &Value) -> Vec<NetworkEvent> {
        let timestamp = f64_field(params, "timestamp");
        self.last_timestamp = timestamp;
        if let Some(wall) = params.get("wallTime").and_then(Value::as_f64) {
            self.clock = Some((timestamp, wall));
        }
        let wall_time = self.wall_clock(timestamp);

        let request = params.get("request").unwrap_or(&Value::Null);
        let request_id = str_field(params, "requestId");
        let url = str_field(request, "url");

        let mut events = Vec::with_capacity(2);
        let is_document = params.get("type").and_then(Value::as_str) == Some("Document")
            && params.get("loaderId").and_then(Value::as_str) == Some(request_id.as_str())
            && params.get("redirectResponse").is_none();
        if is_document {
            let frame = str_field(params, "frameId");
            let main = self.main_frame.get_or_insert_with(|| frame.clone());
            if *main == frame {
                events.push(self.open_page(request_id.clone(), &url, timestamp));
            }
        }

        events.push(NetworkEvent::RequestWillBeSent(RequestSent {
            id: RequestId::new(request_id),
            method: str_field(request, "method"),
            url,
            headers: headers(request.get("headers")),
            post_data: request
                .get("postData")
                .and_then(Value::as_str)
                .map(str::to_string),
            timestamp,
            wall_time,
            redirect_response: params.get("redirectResponse").map(response_info),
        }));
        events
    }

    /// Top-frame commits without a document request of their own (history
    /// navigation, back/forward cache) still open a page
    fn frame_navigated(&mut self, params: &Value) -> Vec<NetworkEvent> {
        let frame = params.get("frame").unwrap_or(&Value::Null);
        if frame.get("parentId").is_some() {
            return Vec::new();
        }
        self.main_frame = Some(str_field(frame, "id"));

        let loader = str_field(frame, "loaderId");
        if self
            .current_page
            .as_ref()
            .is_some_and(|page| page.loader == loader)
        {
            return Vec::new();
        }
        let url = str_field(frame, "url");
        vec![self.open_page(loader, &url, self.last_timestamp)]
    }

    fn load_metric(&self, metric: LoadMetric, params: &Value) -> Vec<NetworkEvent> {
        let Some(page) = &self.current_page else {
            return Vec::new();
        };
        let time_ms = (f64_field(params, "timestamp") - page.started) * 1000.0;
        vec![NetworkEvent::NavigationLoadMetric {
            page_id: page.id.clone(),
            metric,
            time_ms,
        }]
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn f64_field(value: &Value, key: &str) -> f64 {
    value.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

fn headers(value: Option<&Value>) -> Vec<Header> {
    let Some(Value::Object(map)) = value else {
        return Vec::new();
    };
    map.iter()
        .map(|(name, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Header::new(name.clone(), value)
        })
        .collect()
}

fn response_info(response: &Value) -> ResponseInfo {
    ResponseInfo {
        status: response
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
            .unwrap_or(0),
        status_text: str_field(response, "statusText"),
        headers: headers(response.get("headers")),
        mime_type: response
            .get("mimeType")
            .and_then(Value::as_str)
            .map(str::to_string),
        protocol: response
            .get("protocol")
            .and_then(Value::as_str)
            .map(str::to_string),
        remote_address: response
            .get("remoteIPAddress")
            .and_then(Value::as_str)
            .map(str::to_string),
        timing: response.get("timing").map(resource_timing),
    }
}

fn resource_timing(timing: &Value) -> ResourceTiming {
    let offset = |key: &str| timing.get(key).and_then(Value::as_f64).and_then(phase);
    ResourceTiming {
        request_time: f64_field(timing, "requestTime"),
        dns_start: offset("dnsStart"),
        dns_end: offset("dnsEnd"),
        connect_start: offset("connectStart"),
        connect_end: offset("connectEnd"),
        ssl_start: offset("sslStart"),
        ssl_end: offset("sslEnd"),
        send_start: offset("sendStart"),
        send_end: offset("sendEnd"),
        receive_headers_end: offset("receiveHeadersEnd"),
    }
}
