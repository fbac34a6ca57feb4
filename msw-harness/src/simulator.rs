//! Control-plane simulator.
//!
//! A minimal HTTP stand-in for the binary's webhook control plane. It does not
//! model failover state; it validates the request shape, acknowledges, and
//! records every inbound request in arrival order before answering.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, HarnessResult};

/// Upper bound on buffered request bodies.
const MAX_BODY_BYTES: usize = 1024 * 1024;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// One inbound request as seen by the simulator. Never mutated after append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookRequestRecord {
    /// Zero-based arrival index.
    pub seq: u64,
    pub method: String,
    pub path: String,
    /// Query parameters in request order; keys may repeat.
    pub query: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
    pub received_at: DateTime<Utc>,
}

impl WebhookRequestRecord {
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Default)]
struct LogInner {
    records: Vec<WebhookRequestRecord>,
    frozen: bool,
}

/// Append-only, lock-guarded request log. Scenarios only get snapshots.
#[derive(Debug, Clone, Default)]
pub struct RequestLog {
    inner: Arc<Mutex<LogInner>>,
}

impl RequestLog {
    fn lock(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the assigned sequence number, or `None` once frozen.
    fn append(&self, pending: PendingRecord) -> Option<u64> {
        let mut inner = self.lock();
        if inner.frozen {
            return None;
        }
        let seq = inner.records.len() as u64;
        inner.records.push(WebhookRequestRecord {
            seq,
            method: pending.method,
            path: pending.path,
            query: pending.query,
            body: pending.body,
            headers: pending.headers,
            received_at: Utc::now(),
        });
        Some(seq)
    }

    fn freeze(&self) {
        self.lock().frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.lock().frozen
    }

    pub fn snapshot(&self) -> Vec<WebhookRequestRecord> {
        self.lock().records.clone()
    }

    /// Records appended after the first `from` entries.
    pub fn since(&self, from: usize) -> Vec<WebhookRequestRecord> {
        self.lock().records.iter().skip(from).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct PendingRecord {
    method: String,
    path: String,
    query: Vec<(String, String)>,
    body: Vec<u8>,
    headers: Vec<(String, String)>,
}

/// Everything request handlers may touch.
#[derive(Debug, Clone)]
pub struct SimulatorContext {
    pub log: RequestLog,
    /// Reported by `/status`.
    pub source_count: usize,
}

impl SimulatorContext {
    pub fn new(log: RequestLog) -> Self {
        Self {
            log,
            source_count: msw_common::MSW_MAX_SOURCES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub sources: usize,
    pub active_source: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchResponse {
    pub status: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverResponse {
    pub status: String,
    pub action: String,
}

/// Optional JSON body accepted by `/switch` and `/failover`.
#[derive(Debug, Default, Deserialize)]
struct ControlBody {
    source: Option<serde_json::Value>,
    action: Option<String>,
}

impl ControlBody {
    fn parse(body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or_default()
    }

    fn source(&self) -> Option<String> {
        match self.source.as_ref()? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

fn first_param(params: &[(String, String)], key: &str) -> Option<String> {
    params.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
}

pub fn create_router(context: SimulatorContext) -> Router {
    let state = Arc::new(context);
    Router::new()
        .route("/status", get(status_handler).fallback(not_found))
        .route("/switch", post(switch_handler).fallback(not_found))
        .route("/failover", post(failover_handler).fallback(not_found))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), record_request))
        .with_state(state)
}

/// Buffers the body, appends the record, then hands the request on.
async fn record_request(
    State(context): State<Arc<SimulatorContext>>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let (bytes, oversized) = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => (bytes, false),
        Err(e) => {
            warn!("request body rejected: {e}");
            (Bytes::new(), true)
        }
    };

    let query = Query::<Vec<(String, String)>>::try_from_uri(&parts.uri)
        .map(|Query(pairs)| pairs)
        .unwrap_or_default();
    let headers = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    let seq = context.log.append(PendingRecord {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query,
        body: bytes.to_vec(),
        headers,
    });
    debug!(?seq, method = %parts.method, path = parts.uri.path(), "control-plane request recorded");

    if oversized {
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }
    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

async fn status_handler(State(context): State<Arc<SimulatorContext>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "active".to_string(),
        sources: context.source_count,
        active_source: 0,
    })
}

async fn switch_handler(
    Query(params): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Json<SwitchResponse> {
    let source = first_param(&params, "source")
        .or_else(|| ControlBody::parse(&body).source())
        .unwrap_or_else(|| "0".to_string());
    Json(SwitchResponse {
        status: "switched".to_string(),
        source,
    })
}

async fn failover_handler(
    Query(params): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Response {
    let action = first_param(&params, "action")
        .or_else(|| ControlBody::parse(&body).action)
        .unwrap_or_else(|| "enable".to_string());
    match action.as_str() {
        "enable" | "disable" => Json(FailoverResponse {
            status: "failover".to_string(),
            action,
        })
        .into_response(),
        _ => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": format!("unknown failover action '{action}'"),
            })),
        )
            .into_response(),
    }
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// A running simulator bound to its own listener.
pub struct ControlPlaneSimulator {
    addr: SocketAddr,
    log: RequestLog,
    runtime: Handle,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<std::io::Result<()>>>,
}

impl std::fmt::Debug for ControlPlaneSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlaneSimulator")
            .field("addr", &self.addr)
            .field("requests", &self.log.len())
            .field("running", &self.shutdown.is_some())
            .finish()
    }
}

impl ControlPlaneSimulator {
    /// Bind `127.0.0.1:port` (0 picks a free port) and serve on `runtime`.
    pub fn start(runtime: &Handle, port: u16) -> HarnessResult<Self> {
        let listener = std::net::TcpListener::bind(("127.0.0.1", port))
            .map_err(|e| HarnessError::Simulator(format!("cannot bind port {port}: {e}")))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let log = RequestLog::default();
        let router = create_router(SimulatorContext::new(log.clone()));
        let (shutdown, signal) = oneshot::channel::<()>();

        let task = runtime.spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener)?;
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = signal.await;
                })
                .await
        });

        info!(%addr, "Control-plane simulator listening");
        Ok(Self {
            addr,
            log,
            runtime: runtime.clone(),
            shutdown: Some(shutdown),
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn log(&self) -> &RequestLog {
        &self.log
    }

    pub fn requests(&self) -> Vec<WebhookRequestRecord> {
        self.log.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Graceful listener shutdown; the log is frozen afterwards.
    ///
    /// Must not be called from inside the runtime. Calling it twice is a no-op.
    pub fn stop(&mut self) -> HarnessResult<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }

        let abort = task.abort_handle();
        let joined = self
            .runtime
            .block_on(async { tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await });
        self.log.freeze();

        match joined {
            Ok(Ok(Ok(()))) => {
                info!(addr = %self.addr, requests = self.log.len(), "Control-plane simulator stopped");
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(HarnessError::Simulator(format!("server error: {e}"))),
            Ok(Err(e)) => Err(HarnessError::Simulator(format!("server task failed: {e}"))),
            Err(_) => {
                abort.abort();
                Err(HarnessError::Simulator(format!(
                    "graceful shutdown exceeded {SHUTDOWN_TIMEOUT:?}"
                )))
            }
        }
    }
}

impl Drop for ControlPlaneSimulator {
    fn drop(&mut self) {
        if self.task.is_some() && Handle::try_current().is_err() {
            if let Err(e) = self.stop() {
                warn!("simulator shutdown on drop failed: {e}");
            }
        }
    }
}
