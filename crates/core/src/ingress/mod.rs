//! HTTP and local-socket ingress: log intake, health/metrics surfaces,
//! an ad-hoc chat endpoint, and the bounded recent-log ring they share.
//!
//! Everything here is transport plumbing; the moment a log is accepted
//! it is handed to the [`crate::triage::TriagePool`] and this module
//! forgets about it.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;
use tokio::net::{UnixListener, UnixStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::SentinelConfig;
use crate::metrics::MetricsRegistry;
use crate::model::Model;
use crate::sanitize::redact;
use crate::triage::TriagePool;
use crate::types::{IngressError, LogRecord};

const MAX_LOG_BODY_BYTES: usize = 1024 * 1024;
const MAX_CHAT_BODY_BYTES: usize = 10 * 1024;
const MAX_CHAT_MESSAGE_CHARS: usize = 1000;
const RECENT_LOG_RING_COUNT_CAP: usize = 2000;
const CORRELATION_HEADER: &str = "x-correlation-id";

/// Bounded ring of the most recently ingested logs, capped by both
/// count and total byte size, consulted by `/chat` enrichment and the
/// local socket's `get_logs` command.
pub struct RecentLogRing {
    inner: Mutex<VecDeque<LogRecord>>,
    max_count: usize,
    max_bytes: u64,
    current_bytes: Mutex<u64>,
}

impl RecentLogRing {
    pub fn new(max_bytes_mb: u64) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            max_count: RECENT_LOG_RING_COUNT_CAP,
            max_bytes: max_bytes_mb * 1024 * 1024,
            current_bytes: Mutex::new(0),
        }
    }

    pub fn push(&self, log: LogRecord) {
        let size = log.text.len() as u64;
        let mut ring = self.inner.lock();
        let mut bytes = self.current_bytes.lock();
        ring.push_back(log);
        *bytes += size;
        while (ring.len() > self.max_count || *bytes > self.max_bytes) && !ring.is_empty() {
            if let Some(evicted) = ring.pop_front() {
                *bytes = bytes.saturating_sub(evicted.text.len() as u64);
            }
        }
    }

    pub fn snapshot(&self, limit: usize) -> Vec<LogRecord> {
        let ring = self.inner.lock();
        ring.iter().rev().take(limit).cloned().collect()
    }
}

/// Per-client sliding window rate limiter, keyed by bearer token (or
/// remote address when auth is disabled).
struct SlidingWindowLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    max_requests: u32,
    window: Duration,
}

impl SlidingWindowLimiter {
    fn new(max_requests: u32, window: Duration) -> Self {
        Self { windows: Mutex::new(HashMap::new()), max_requests, window }
    }

    fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let entry = windows.entry(key.to_string()).or_default();
        while entry.front().is_some_and(|t| now.duration_since(*t) > self.window) {
            entry.pop_front();
        }
        if entry.len() as u32 >= self.max_requests {
            return false;
        }
        entry.push_back(now);
        true
    }
}

#[derive(Clone)]
pub struct AppState {
    pub api_key: Option<Arc<String>>,
    pub triage: Arc<TriagePool>,
    pub model: Arc<dyn Model>,
    pub recent_logs: Arc<RecentLogRing>,
    pub metrics: Arc<MetricsRegistry>,
    pub rate_limiter: Arc<SlidingWindowLimiter>,
    pub started_at: SystemTime,
    pub version: &'static str,
}

/// Build the full axum router: `/logs`, `/status`, `/metrics`, `/chat`,
/// wrapped in correlation-id, security-header and auth middleware.
pub fn build_router(state: AppState) -> Router {
    // Rate limiting needs the per-request client key, which auth_middleware
    // already resolves, so both live in one middleware rather than two
    // layers reaching for the same header.
    let protected = Router::new()
        .route("/logs", post(handle_logs))
        .route("/status", get(handle_status))
        .route("/chat", post(handle_chat))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .merge(protected)
        .route("/metrics", get(handle_metrics))
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(middleware::from_fn(correlation_id_middleware))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn correlation_id_middleware(mut req: axum::extract::Request, next: Next) -> Response {
    let correlation_id = req
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    req.headers_mut().insert(
        CORRELATION_HEADER,
        HeaderValue::from_str(&correlation_id).unwrap_or_else(|_| HeaderValue::from_static("invalid")),
    );
    let span = tracing::info_span!("request", correlation_id = %correlation_id);
    let _enter = span.enter();
    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

async fn security_headers_middleware(req: axum::extract::Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    headers.insert("cache-control", HeaderValue::from_static("no-store"));
    response
}

fn client_key(headers: &HeaderMap, addr: Option<SocketAddr>) -> String {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| addr.map(|a| a.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

async fn auth_middleware(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    let headers = req.headers().clone();

    if let Some(expected) = &state.api_key {
        match headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            None => return ingress_error_response(IngressError::Unauthorized),
            Some(value) => {
                let Some(token) = value.strip_prefix("Bearer ") else {
                    return ingress_error_response(IngressError::Unauthorized);
                };
                let matches: bool = token.as_bytes().ct_eq(expected.as_bytes()).into();
                if !matches {
                    return ingress_error_response(IngressError::Forbidden);
                }
            }
        }
    }

    let key = client_key(&headers, Some(addr));
    if !state.rate_limiter.check(&key) {
        state.metrics.rate_limited_requests_total.inc();
        return ingress_error_response(IngressError::RateLimited);
    }

    next.run(req).await
}

fn ingress_error_response(err: IngressError) -> Response {
    let status = match err {
        IngressError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        IngressError::EmptyBody | IngressError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        IngressError::Unauthorized => StatusCode::UNAUTHORIZED,
        IngressError::Forbidden => StatusCode::FORBIDDEN,
        IngressError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
    };
    (status, Json(json!({ "error": redact(&err.to_string()) }))).into_response()
}

/// Split a Fluent-Bit-style batch of concatenated JSON objects
/// (`{...}{...}{...}`, no separators) into individual fragments.
fn split_fluent_bit_batch(raw: &str) -> Vec<String> {
    let mut fragments = Vec::new();
    let mut depth = 0i32;
    let mut start = None;
    for (idx, ch) in raw.char_indices() {
        match ch {
            '{' => {
                if depth == 0 {
                    start = Some(idx);
                }
                depth += 1;
            }
            '}' => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start {
                        fragments.push(raw[s..=idx].to_string());
                        start = None;
                    }
                }
            }
            _ => {}
        }
    }
    if fragments.is_empty() {
        vec![raw.to_string()]
    } else {
        fragments
    }
}

/// A single fragment is either plain raw text or one JSON object, both of
/// which are accepted unconditionally. More than one fragment means
/// `split_fluent_bit_batch` actually detected Fluent-Bit-style
/// concatenation, in which case each piece must parse as JSON on its own
/// — a batch where nothing survives that filter is a malformed request,
/// not an empty one. Returns `None` in that case.
fn filter_batch_fragments(split: Vec<String>) -> Option<Vec<String>> {
    if split.len() <= 1 {
        return Some(split);
    }
    let valid: Vec<String> = split
        .into_iter()
        .filter(|f| serde_json::from_str::<serde_json::Value>(f).is_ok())
        .collect();
    if valid.is_empty() {
        None
    } else {
        Some(valid)
    }
}

async fn handle_logs(State(state): State<AppState>, body: Bytes) -> Response {
    if body.len() > MAX_LOG_BODY_BYTES {
        return ingress_error_response(IngressError::BodyTooLarge { size: body.len(), max: MAX_LOG_BODY_BYTES });
    }
    if body.is_empty() {
        return ingress_error_response(IngressError::EmptyBody);
    }

    let text = String::from_utf8_lossy(&body).to_string();
    let split: Vec<String> = split_fluent_bit_batch(&text)
        .into_iter()
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect();

    if split.is_empty() {
        return ingress_error_response(IngressError::InvalidRequest("no valid log fragments in body".to_string()));
    }

    let Some(fragments) = filter_batch_fragments(split) else {
        return ingress_error_response(IngressError::InvalidRequest(
            "no fragment in the batch parsed as valid JSON".to_string(),
        ));
    };

    for fragment in fragments {
        let log = LogRecord::new(fragment);
        state.metrics.logs_ingested_total.inc();
        state.recent_logs.push(log.clone());
        state.triage.dispatch(log);
    }

    (StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))).into_response()
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
    memory_rss_kb: u64,
    queue_depth: u64,
    running_investigations: u64,
    triage_workers_alive: u64,
    investigation_workers_alive: u64,
}

fn read_rss_kb() -> u64 {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0;
    };
    let pages: u64 = statm.split_whitespace().nth(1).and_then(|s| s.parse().ok()).unwrap_or(0);
    pages * 4
}

async fn handle_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let uptime = SystemTime::now().duration_since(state.started_at).unwrap_or_default();
    Json(StatusResponse {
        status: "ok",
        version: state.version,
        uptime_secs: uptime.as_secs(),
        memory_rss_kb: read_rss_kb(),
        queue_depth: state.metrics.queue_depth.get() as u64,
        running_investigations: state.metrics.running_investigations.get() as u64,
        triage_workers_alive: state.metrics.triage_workers_alive.get() as u64,
        investigation_workers_alive: state.metrics.investigation_workers_alive.get() as u64,
    })
}

async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
}

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
}

#[derive(Serialize)]
struct ChatResponse {
    reply: String,
}

async fn handle_chat(State(state): State<AppState>, body: Bytes) -> Response {
    if body.len() > MAX_CHAT_BODY_BYTES {
        return ingress_error_response(IngressError::BodyTooLarge { size: body.len(), max: MAX_CHAT_BODY_BYTES });
    }
    let request: ChatRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return ingress_error_response(IngressError::InvalidRequest(e.to_string())),
    };
    if request.message.is_empty() || request.message.chars().count() > MAX_CHAT_MESSAGE_CHARS {
        return ingress_error_response(IngressError::InvalidRequest("message must be 1..=1000 chars".to_string()));
    }

    let recent = state.recent_logs.snapshot(20);
    let context: String = recent.iter().map(|l| l.text.as_str()).collect::<Vec<_>>().join("\n");
    let prompt = format!("Recent logs:\n{context}\n\nOperator question: {}", request.message);

    match state.model.generate(&prompt, &[]).await {
        Ok(response) => {
            let reply = response.text.unwrap_or_else(|| "no response".to_string());
            Json(ChatResponse { reply }).into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, "chat model call failed");
            (StatusCode::BAD_GATEWAY, Json(json!({ "error": "upstream model unavailable" }))).into_response()
        }
    }
}

/// Bind the local Unix stream socket, serving a single `get_logs`
/// command that replies with the JSON-encoded recent-log snapshot.
/// The socket is created with mode 0600 and removed on shutdown.
pub async fn spawn_local_socket(path: PathBuf, recent_logs: Arc<RecentLogRing>) -> anyhow::Result<UnixSocketHandle> {
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }

    let path_for_task = path.clone();
    let task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let logs = recent_logs.clone();
                    tokio::spawn(handle_socket_conn(stream, logs));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "local socket accept failed");
                    break;
                }
            }
        }
    });

    Ok(UnixSocketHandle { path: path_for_task, task })
}

pub struct UnixSocketHandle {
    path: PathBuf,
    task: tokio::task::JoinHandle<()>,
}

impl UnixSocketHandle {
    pub async fn shutdown(self) {
        self.task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn handle_socket_conn(mut stream: UnixStream, recent_logs: Arc<RecentLogRing>) {
    let mut buf = [0u8; 256];
    let Ok(n) = stream.read(&mut buf).await else { return };
    let command = String::from_utf8_lossy(&buf[..n]);
    if command.trim() == "get_logs" {
        let logs = recent_logs.snapshot(200);
        if let Ok(payload) = serde_json::to_vec(&logs) {
            let _ = stream.write_all(&payload).await;
        }
    }
}

/// Assemble the shared ingress state from validated configuration.
pub fn build_app_state(
    config: &SentinelConfig,
    triage: Arc<TriagePool>,
    model: Arc<dyn Model>,
    metrics: Arc<MetricsRegistry>,
) -> AppState {
    AppState {
        api_key: config.api_key.clone().map(Arc::new),
        triage,
        model,
        recent_logs: Arc::new(RecentLogRing::new(config.recent_logs_max_size_mb)),
        metrics,
        rate_limiter: Arc::new(SlidingWindowLimiter::new(
            config.rate_limit.max_requests,
            Duration::from_secs(config.rate_limit.window_secs),
        )),
        started_at: SystemTime::now(),
        version: env!("CARGO_PKG_VERSION"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_concatenated_json_objects() {
        let raw = r#"{"a":1}{"b":2}{"c":3}"#;
        let fragments = split_fluent_bit_batch(raw);
        assert_eq!(fragments, vec![r#"{"a":1}"#, r#"{"b":2}"#, r#"{"c":3}"#]);
    }

    #[test]
    fn single_object_passes_through_unsplit() {
        let raw = r#"{"a":1}"#;
        assert_eq!(split_fluent_bit_batch(raw), vec![raw.to_string()]);
    }

    #[test]
    fn non_json_text_passes_through_as_one_fragment() {
        let raw = "plain text line with no braces";
        assert_eq!(split_fluent_bit_batch(raw), vec![raw.to_string()]);
    }

    #[test]
    fn single_fragment_passes_even_if_not_json() {
        let split = vec!["plain text line".to_string()];
        assert_eq!(filter_batch_fragments(split.clone()).unwrap(), split);
    }

    #[test]
    fn multi_fragment_batch_drops_invalid_json_pieces() {
        let split = vec![r#"{"a":1}"#.to_string(), "not json".to_string(), r#"{"b":2}"#.to_string()];
        let filtered = filter_batch_fragments(split).unwrap();
        assert_eq!(filtered, vec![r#"{"a":1}"#.to_string(), r#"{"b":2}"#.to_string()]);
    }

    #[test]
    fn multi_fragment_batch_with_no_valid_json_is_rejected() {
        let split = vec!["not json".to_string(), "also not json".to_string()];
        assert!(filter_batch_fragments(split).is_none());
    }

    #[test]
    fn sliding_window_limiter_blocks_after_max_requests() {
        let limiter = SlidingWindowLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.check("client-a"));
        assert!(limiter.check("client-a"));
        assert!(limiter.check("client-a"));
        assert!(!limiter.check("client-a"));
        assert!(limiter.check("client-b"));
    }

    #[test]
    fn recent_log_ring_evicts_oldest_past_count_cap() {
        let ring = RecentLogRing { inner: Mutex::new(VecDeque::new()), max_count: 2, max_bytes: u64::MAX, current_bytes: Mutex::new(0) };
        ring.push(LogRecord::new("one"));
        ring.push(LogRecord::new("two"));
        ring.push(LogRecord::new("three"));
        let snap = ring.snapshot(10);
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].text, "three");
        assert_eq!(snap[1].text, "two");
    }
}
