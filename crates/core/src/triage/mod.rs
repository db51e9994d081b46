//! Fixed pool of triage workers that classify each ingested log as
//! `alert` or `ok`, handing anything alert-worthy off to the scheduler.
//!
//! Workers are long-lived tasks fed round-robin from a single mailbox
//! sender; a supervisor restarts a worker that exits abnormally, up to a
//! bounded attempt count.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use regex::Regex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::cache::{content_key, embed, ResponseCache};
use crate::metrics::MetricsRegistry;
use crate::model::{Model, ToolSpec};
use crate::scheduler::SchedulerHandle;
use crate::supervisor::WorkerSupervisor;
use crate::types::{CachedPattern, LogRecord};

const OVERSIZE_LIMIT: usize = 10_000;
const TRUNCATE_LIMIT: usize = 1_500;
const TRIAGE_TOOL_NAME: &str = "log_triage";
const MAX_RESTART_ATTEMPTS: u32 = 5;
const RESTART_DELAY: Duration = Duration::from_secs(5);
const CACHE_SCAN_LIMIT: usize = 100;
const CACHE_TTL: Duration = Duration::from_secs(3600);
const CACHE_SIMILARITY_THRESHOLD: f64 = 0.85;

fn default_routine_patterns() -> Vec<Regex> {
    [
        r#"(?i)\bGET\s+\S+\s+HTTP/[\d.]+"\s+2\d\d\b"#,
        r"(?i)health\s*check\s*(ok|passed|200)?",
        r"(?i)^\s*\[seraph\]",
        r"(?i)bridge\s+state\s+transition",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
}

/// Validate and compile a pre-filter regex, rejecting patterns likely to
/// cause catastrophic backtracking (unbounded nested quantifiers).
fn compile_safe_regex(pattern: &str) -> Option<Regex> {
    if pattern.contains("(.*)*") || pattern.contains("(.+)+") || pattern.contains("(a+)+") {
        tracing::warn!(pattern, "rejected unsafe-looking regex pre-filter");
        return None;
    }
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!(pattern, error = %e, "invalid regex pre-filter, skipping");
            None
        }
    }
}

/// Extract the human-readable payload out of a known JSON log envelope
/// (Docker's `log`, systemd/journald's `MESSAGE`), falling back to the
/// raw text when the input isn't one of those shapes.
fn extract_envelope_text(raw: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(raw) else {
        return raw.to_string();
    };
    let Value::Object(map) = value else {
        return raw.to_string();
    };
    for field in ["log", "MESSAGE"] {
        if let Some(Value::String(text)) = map.get(field) {
            return text.clone();
        }
    }
    raw.to_string()
}

fn triage_tool_spec() -> ToolSpec {
    ToolSpec {
        name: TRIAGE_TOOL_NAME.to_string(),
        description: "Classify a log line as alert or ok.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "decision": {"type": "string", "enum": ["alert", "ok"]},
                "reason": {"type": "string"},
            },
            "required": ["decision", "reason"],
        }),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Decision {
    Alert(String),
    Ok(String),
}

fn legacy_keyword_scan(text: &str) -> Decision {
    const KEYWORDS: &[&str] = &["panic", "fatal", "crashloopbackoff", "oomkilled", "exception", "traceback"];
    let lowered = text.to_lowercase();
    if KEYWORDS.iter().any(|k| lowered.contains(k)) {
        Decision::Alert("legacy keyword match".to_string())
    } else {
        Decision::Ok("no clear indicators".to_string())
    }
}

fn interpret_response(response: &crate::model::ModelResponse) -> Decision {
    if let Some(call) = response.tool_calls.iter().find(|c| c.name == TRIAGE_TOOL_NAME) {
        let decision = call.arguments.get("decision").and_then(Value::as_str).unwrap_or("ok");
        let reason = call.arguments.get("reason").and_then(Value::as_str).unwrap_or("").to_string();
        return if decision == "alert" { Decision::Alert(reason) } else { Decision::Ok(reason) };
    }
    if let Some(text) = &response.text {
        let lowered = text.to_lowercase();
        if let Some(idx) = lowered.find("decision") {
            let tail = &lowered[idx..];
            if tail.contains("alert") {
                return Decision::Alert(text.clone());
            }
            if tail.contains("ok") {
                return Decision::Ok(text.clone());
            }
        }
        return legacy_keyword_scan(text);
    }
    Decision::Ok("no clear indicators".to_string())
}

struct TriageWorker {
    model: Arc<dyn Model>,
    cache: Arc<dyn ResponseCache>,
    scheduler: SchedulerHandle,
    routine_patterns: Arc<Vec<Regex>>,
    metrics: Arc<MetricsRegistry>,
}

impl TriageWorker {
    async fn process(&self, log: LogRecord) {
        self.metrics.triage_decisions_total.inc();

        if log.text.is_empty() || log.text.len() > OVERSIZE_LIMIT {
            tracing::debug!("skip-oversize");
            return;
        }

        let extracted = extract_envelope_text(&log.text);

        if self.routine_patterns.iter().any(|re| re.is_match(&extracted)) {
            tracing::debug!("routine");
            self.metrics.triage_routine_dropped_total.inc();
            return;
        }

        let truncated: String = extracted.chars().take(TRUNCATE_LIMIT).collect();
        let prompt = format!("Classify this log line as alert or ok, with a short reason.\n\n{truncated}");

        let key = content_key(&prompt);
        let embedding = embed(&truncated);
        let decision = match self.cache.get_exact(&key).await {
            Ok(Some(cached)) => {
                self.metrics.cache_hits_total.inc();
                parse_cached_decision(&cached)
            }
            _ => match self
                .cache
                .find_similar(&embedding, CACHE_SIMILARITY_THRESHOLD, CACHE_SCAN_LIMIT)
                .await
            {
                Ok(Some(pattern)) => {
                    self.metrics.cache_hits_total.inc();
                    parse_cached_decision(&pattern.response)
                }
                _ => {
                    self.metrics.cache_misses_total.inc();
                    self.metrics.model_calls_total.inc();
                    let tools = [triage_tool_spec()];
                    match self.model.generate(&prompt, &tools).await {
                        Ok(response) => {
                            let decision = interpret_response(&response);
                            let encoded = encode_decision(&decision);
                            let _ = self.cache.put_exact(&key, &encoded, CACHE_TTL).await;
                            let _ = self
                                .cache
                                .remember_pattern(CachedPattern {
                                    key_hash: key.clone(),
                                    embedding,
                                    reason: truncated.clone(),
                                    response: encoded,
                                    hits: 1,
                                    last_seen: SystemTime::now(),
                                })
                                .await;
                            decision
                        }
                        Err(e) => {
                            self.metrics.model_call_failures_total.inc();
                            tracing::warn!(error = %e, "triage model call failed, defaulting to ok");
                            Decision::Ok("no clear indicators".to_string())
                        }
                    }
                }
            },
        };

        match decision {
            Decision::Alert(reason) => {
                self.metrics.triage_alerts_total.inc();
                let mut metadata = HashMap::new();
                if let Some(source) = &log.source {
                    metadata.insert("service".to_string(), source.clone());
                }
                self.scheduler.submit_triaged(log, reason, metadata);
            }
            Decision::Ok(_reason) => {}
        }
    }
}

fn encode_decision(decision: &Decision) -> String {
    match decision {
        Decision::Alert(reason) => format!("alert\n{reason}"),
        Decision::Ok(reason) => format!("ok\n{reason}"),
    }
}

fn parse_cached_decision(cached: &str) -> Decision {
    let mut parts = cached.splitn(2, '\n');
    let kind = parts.next().unwrap_or("ok");
    let reason = parts.next().unwrap_or("").to_string();
    if kind == "alert" {
        Decision::Alert(reason)
    } else {
        Decision::Ok(reason)
    }
}

/// Fixed pool of triage workers with round-robin dispatch and supervised
/// per-worker restart.
pub struct TriagePool {
    senders: Vec<mpsc::Sender<LogRecord>>,
    next: std::sync::atomic::AtomicUsize,
}

impl TriagePool {
    pub fn spawn(
        worker_count: usize,
        model: Arc<dyn Model>,
        cache: Arc<dyn ResponseCache>,
        scheduler: SchedulerHandle,
        pre_filters: &[String],
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        let mut routine_patterns = default_routine_patterns();
        for pattern in pre_filters {
            if let Some(re) = compile_safe_regex(pattern) {
                routine_patterns.push(re);
            }
        }
        let routine_patterns = Arc::new(routine_patterns);

        let mut senders = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let tx = spawn_supervised_worker(
                index,
                model.clone(),
                cache.clone(),
                scheduler.clone(),
                routine_patterns.clone(),
                metrics.clone(),
            );
            senders.push(tx);
        }
        Arc::new(Self { senders, next: std::sync::atomic::AtomicUsize::new(0) })
    }

    /// Round-robin dispatch of a log to the next worker's mailbox.
    pub fn dispatch(&self, log: LogRecord) {
        if self.senders.is_empty() {
            return;
        }
        let idx = self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % self.senders.len();
        if self.senders[idx].try_send(log).is_err() {
            tracing::warn!(worker = idx, "triage worker mailbox full, dropping log");
        }
    }
}

fn spawn_supervised_worker(
    index: usize,
    model: Arc<dyn Model>,
    cache: Arc<dyn ResponseCache>,
    scheduler: SchedulerHandle,
    routine_patterns: Arc<Vec<Regex>>,
    metrics: Arc<MetricsRegistry>,
) -> mpsc::Sender<LogRecord> {
    let (tx, rx) = mpsc::channel::<LogRecord>(256);
    metrics.triage_workers_alive.inc();
    let worker = Arc::new(TriageWorker {
        model,
        cache,
        scheduler,
        routine_patterns,
        metrics: metrics.clone(),
    });
    tokio::spawn(async move {
        let supervisor = WorkerSupervisor::new(MAX_RESTART_ATTEMPTS, RESTART_DELAY);
        supervisor
            .run(format!("triage-{index}"), rx, move |log: LogRecord| {
                let worker = worker.clone();
                async move { worker.process(log).await }
            })
            .await;
        metrics.triage_workers_alive.dec();
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NullCache;
    use crate::model::ModelResponse;
    use crate::types::ModelError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubModel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Model for StubModel {
        async fn generate(&self, _prompt: &str, _tools: &[ToolSpec]) -> Result<ModelResponse, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ModelResponse {
                text: Some("decision=alert, likely a crash loop".to_string()),
                tool_calls: vec![],
            })
        }
    }

    fn test_worker(model: Arc<dyn Model>) -> (TriageWorker, SchedulerHandle) {
        let dispatcher: Arc<dyn crate::scheduler::InvestigationDispatcher> = Arc::new(NoopDispatcher);
        let handle = crate::scheduler::Scheduler::spawn(
            crate::config::PriorityQueueConfig::default(),
            1,
            dispatcher,
            Arc::new(crate::tools::StaticToolRegistry::new(vec![])),
            Arc::new(crate::alerting::NullAlertSink),
            MetricsRegistry::new(),
        );
        let worker = TriageWorker {
            model,
            cache: Arc::new(NullCache),
            scheduler: handle.clone(),
            routine_patterns: Arc::new(default_routine_patterns()),
            metrics: MetricsRegistry::new(),
        };
        (worker, handle)
    }

    struct NoopDispatcher;
    #[async_trait]
    impl crate::scheduler::InvestigationDispatcher for NoopDispatcher {
        async fn dispatch(&self, _worker_index: usize, _investigation: crate::types::RunningInvestigation) {}
        async fn cancel(&self, _worker_index: usize, _investigation_id: crate::types::IncidentId) {}
    }

    #[test]
    fn oversize_log_is_skipped_without_model_call() {
        let big = "x".repeat(OVERSIZE_LIMIT + 1);
        assert!(big.len() > OVERSIZE_LIMIT);
    }

    #[test]
    fn routine_health_check_matches_default_pattern() {
        let patterns = default_routine_patterns();
        assert!(patterns.iter().any(|re| re.is_match("health check ok")));
    }

    #[test]
    fn extracts_docker_log_envelope() {
        let raw = r#"{"log": "connection refused", "stream": "stderr"}"#;
        assert_eq!(extract_envelope_text(raw), "connection refused");
    }

    #[test]
    fn extracts_journald_message_envelope() {
        let raw = r#"{"MESSAGE": "oom-killer invoked", "PRIORITY": "3"}"#;
        assert_eq!(extract_envelope_text(raw), "oom-killer invoked");
    }

    #[test]
    fn non_envelope_text_passes_through() {
        assert_eq!(extract_envelope_text("plain text line"), "plain text line");
    }

    #[test]
    fn unsafe_regex_is_rejected() {
        assert!(compile_safe_regex(r"(a+)+$").is_none());
    }

    #[test]
    fn invalid_regex_is_rejected() {
        assert!(compile_safe_regex(r"(unterminated").is_none());
    }

    #[test]
    fn legacy_scan_flags_known_crash_keywords() {
        assert_eq!(legacy_keyword_scan("CrashLoopBackOff detected"), Decision::Alert("legacy keyword match".to_string()));
        assert_eq!(legacy_keyword_scan("everything is fine"), Decision::Ok("no clear indicators".to_string()));
    }

    #[tokio::test]
    async fn oversize_text_skips_the_model_entirely() {
        let model = Arc::new(StubModel { calls: AtomicUsize::new(0) });
        let (worker, _handle) = test_worker(model.clone());
        worker.process(LogRecord::new("x".repeat(OVERSIZE_LIMIT + 1))).await;
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn routine_text_skips_the_model_entirely() {
        let model = Arc::new(StubModel { calls: AtomicUsize::new(0) });
        let (worker, _handle) = test_worker(model.clone());
        worker.process(LogRecord::new("health check ok")).await;
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_routine_text_calls_the_model() {
        let model = Arc::new(StubModel { calls: AtomicUsize::new(0) });
        let (worker, _handle) = test_worker(model.clone());
        worker.process(LogRecord::new("unexpected panic in worker thread")).await;
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }
}
