//! Bounded ReAct investigation workers.
//!
//! Each worker runs at most one investigation at a time, driven entirely
//! by messages from the `Scheduler`: `dispatch` hands it a fresh
//! `RunningInvestigation`, `cancel` interrupts whatever it is doing for a
//! preemption or timeout. Tool calls are brokered back through the
//! scheduler's `SchedulerHandle` rather than hitting the `ToolRegistry`
//! directly, so the scheduler's timeout tracking always sees forward
//! progress.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::{mpsc, Notify};

use crate::alerting::AlertSink;
use crate::cache::{content_key, embed, ResponseCache};
use crate::model::{Model, ModelResponse, ToolSpec};
use crate::reports::ReportStore;
use crate::scheduler::{InvestigationDispatcher, InvestigationOutcome, SchedulerHandle, ToolBroker};
use crate::supervisor::WorkerSupervisor;
use crate::tools::ToolRegistry;
use crate::types::{CachedPattern, IncidentId, Report, ReportStatus, RunningInvestigation, TraceStep};

const MAX_TURNS: u32 = 5;
const FINISH_TOOL_NAME: &str = "finish";
const MAX_RESTART_ATTEMPTS: u32 = 5;
const RESTART_DELAY: Duration = Duration::from_secs(5);
const MODEL_CACHE_TTL: Duration = Duration::from_secs(3600);
const MODEL_CACHE_SIMILARITY_THRESHOLD: f64 = 0.85;
const MODEL_CACHE_SCAN_LIMIT: usize = 100;
const SESSION_QUERY_LIMIT: usize = 5;
const RECENT_INCIDENT_LIMIT: usize = 3;
const PATTERN_CONFIDENCE_FLOOR: u64 = 2;

#[derive(Debug, Deserialize)]
struct SynthesisResult {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    root_cause: String,
    #[serde(default)]
    recommendation: String,
    #[serde(default = "default_status")]
    status: String,
}

fn default_status() -> String {
    "open".to_string()
}

/// Structured findings a model supplies when it calls `finish`. All
/// fields are optional on the wire since a model may omit one; missing
/// fields render as empty in the formatted analysis rather than
/// rejecting the call.
#[derive(Debug, Clone, Default, Deserialize)]
struct FinishArguments {
    #[serde(rename = "rootCauseAnalysis", default)]
    root_cause_analysis: String,
    #[serde(rename = "impactAssessment", default)]
    impact_assessment: String,
    #[serde(rename = "suggestedRemediation", default)]
    suggested_remediation: Vec<String>,
    #[serde(rename = "lessonsLearned", default)]
    lessons_learned: Vec<String>,
    #[serde(default = "default_status")]
    status: String,
}

fn parse_finish_arguments(arguments: &serde_json::Value) -> FinalAnalysis {
    let parsed: FinishArguments = serde_json::from_value(arguments.clone()).unwrap_or_default();
    let mut summary = format!(
        "root cause: {}\n\nimpact: {}",
        parsed.root_cause_analysis, parsed.impact_assessment
    );
    if !parsed.suggested_remediation.is_empty() {
        summary.push_str(&format!("\n\nsuggested remediation:\n{}", bullet_list(&parsed.suggested_remediation)));
    }
    if !parsed.lessons_learned.is_empty() {
        summary.push_str(&format!("\n\nlessons learned:\n{}", bullet_list(&parsed.lessons_learned)));
    }
    FinalAnalysis { summary, status: status_from_str(&parsed.status) }
}

fn bullet_list(items: &[String]) -> String {
    items.iter().map(|item| format!("- {item}")).collect::<Vec<_>>().join("\n")
}

/// Try the three JSON extraction shapes a model is tolerated to answer
/// the synthesis prompt with: bare JSON, a fenced ```json block, or JSON
/// embedded in surrounding prose.
fn extract_synthesis(text: &str) -> Option<SynthesisResult> {
    let trimmed = text.trim();
    if let Ok(parsed) = serde_json::from_str(trimmed) {
        return Some(parsed);
    }
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            if let Ok(parsed) = serde_json::from_str(after[..end].trim()) {
                return Some(parsed);
            }
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            if let Ok(parsed) = serde_json::from_str(&trimmed[start..=end]) {
                return Some(parsed);
            }
        }
    }
    None
}

fn status_from_str(s: &str) -> ReportStatus {
    match s.to_lowercase().as_str() {
        "resolved" => ReportStatus::Resolved,
        "acknowledged" => ReportStatus::Acknowledged,
        _ => ReportStatus::Open,
    }
}

fn build_prompt(investigation: &RunningInvestigation, initial_context: &str, trace: &[TraceStep]) -> String {
    let mut prompt = String::new();
    if !initial_context.is_empty() {
        prompt.push_str(initial_context);
        prompt.push_str("\n\n");
    }
    prompt.push_str(&format!(
        "Investigate this incident.\nreason: {}\nlog: {}\n",
        investigation.alert.reason, investigation.alert.log.text
    ));
    for step in trace {
        if let Some(thought) = &step.thought {
            prompt.push_str(&format!("thought: {thought}\n"));
        }
        if let (Some(name), Some(result)) = (&step.tool_name, &step.tool_result) {
            prompt.push_str(&format!("tool({name}) -> {result}\n"));
        }
    }
    prompt.push_str(&format!(
        "You have used {}/{} turns. Call '{FINISH_TOOL_NAME}' with your findings when done.\n",
        trace.len(),
        MAX_TURNS
    ));
    prompt
}

fn synthesis_prompt(investigation: &RunningInvestigation, trace: &[TraceStep]) -> String {
    let mut prompt = format!(
        "Summarize this investigation as JSON with keys summary, root_cause, recommendation, status \
         (status one of open/acknowledged/resolved).\nreason: {}\n",
        investigation.alert.reason
    );
    for step in trace {
        if let (Some(name), Some(result)) = (&step.tool_name, &step.tool_result) {
            prompt.push_str(&format!("tool({name}) -> {result}\n"));
        }
    }
    prompt
}

struct Worker {
    model: Arc<dyn Model>,
    tools: Arc<dyn ToolRegistry>,
    broker: SchedulerHandle,
    report_store: Arc<dyn ReportStore>,
    alert_sink: Arc<dyn AlertSink>,
    cache: Arc<dyn ResponseCache>,
    max_timeline_incidents: usize,
    session_ttl: Duration,
    metrics: Arc<crate::metrics::MetricsRegistry>,
}

impl Worker {
    fn tool_specs(&self) -> Vec<ToolSpec> {
        let mut specs = self.tools.list();
        specs.push(ToolSpec {
            name: FINISH_TOOL_NAME.to_string(),
            description: "Conclude the investigation with your findings.".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "rootCauseAnalysis": {"type": "string"},
                    "impactAssessment": {"type": "string"},
                    "suggestedRemediation": {"type": "array", "items": {"type": "string"}},
                    "lessonsLearned": {"type": "array", "items": {"type": "string"}},
                    "status": {"type": "string", "enum": ["open", "acknowledged", "resolved"]},
                },
                "required": ["rootCauseAnalysis", "impactAssessment"],
            }),
        });
        specs
    }

    async fn run(&self, investigation: RunningInvestigation, cancel: Arc<Notify>) {
        let incident_id = investigation.alert.id;
        let mut trace = Vec::new();
        let tool_specs = self.tool_specs();
        let initial_context = self.build_initial_context(&investigation).await;

        let finish_result = tokio::select! {
            result = self.react_loop(&investigation, &initial_context, &mut trace, &tool_specs) => result,
            _ = cancel.notified() => None,
        };

        let analysis = match finish_result {
            Some(analysis) => analysis,
            None if trace.is_empty() => {
                // Cancelled before any progress; nothing to report.
                return;
            }
            None => self.synthesize(&investigation, &trace).await,
        };

        if let Some(session_id) = &investigation.alert.session_id {
            let _ = self
                .cache
                .record_session_query(&session_id.to_string(), &investigation.alert.reason, self.session_ttl)
                .await;
        }
        let _ = self
            .cache
            .record_timeline_incident(
                crate::types::TimelineEntry {
                    incident_id,
                    summary: analysis.summary.clone(),
                    timestamp: SystemTime::now(),
                },
                self.max_timeline_incidents,
            )
            .await;

        let signature = crate::types::PatternSignature {
            service: investigation.alert.metadata.get("service").cloned().unwrap_or_else(|| "unknown".to_string()),
            error_class: investigation.alert.normalized_reason(),
            severity: investigation.alert.priority.to_string(),
        };
        let resolution = matches!(analysis.status, ReportStatus::Resolved).then(|| analysis.summary.clone());
        let _ = self
            .cache
            .record_pattern_resolution(&signature, resolution.as_deref(), SystemTime::now())
            .await;

        let report = Report {
            incident_id,
            timestamp: SystemTime::now(),
            initial_log: investigation.alert.log.text.clone(),
            triage_reason: investigation.alert.reason.clone(),
            investigation_trace: serde_json::to_string(&trace).unwrap_or_default(),
            final_analysis: analysis.summary.clone(),
            status: analysis.status,
        };

        if let Err(e) = self.report_store.save(report).await {
            tracing::warn!(incident = %incident_id, error = %e, "failed to persist investigation report");
        }
        if let Err(e) = self
            .alert_sink
            .send_enriched_analysis(incident_id, &analysis.summary, &format!("{:?}", analysis.status))
            .await
        {
            tracing::warn!(incident = %incident_id, error = %e, "failed to deliver enriched analysis");
        }

        self.broker.notify_complete(
            incident_id,
            InvestigationOutcome {
                normalized_reason: investigation.alert.normalized_reason(),
            },
        );
    }

    /// Runs up to `MAX_TURNS` think/act steps. Returns `Some(analysis)` if
    /// the model explicitly called `finish` (parsed straight from its
    /// structured arguments), `None` if the loop was exhausted or a model
    /// call failed without one — the caller then falls back to
    /// `synthesize` over whatever trace exists.
    async fn react_loop(
        &self,
        investigation: &RunningInvestigation,
        initial_context: &str,
        trace: &mut Vec<TraceStep>,
        tool_specs: &[ToolSpec],
    ) -> Option<FinalAnalysis> {
        for turn in 0..MAX_TURNS {
            let prompt = build_prompt(investigation, initial_context, trace);
            let response = match self.cached_generate(&prompt, tool_specs).await {
                Ok(resp) => resp,
                Err(e) => {
                    trace.push(TraceStep {
                        turn,
                        thought: Some(format!("model call failed: {e}")),
                        tool_name: None,
                        tool_args: None,
                        tool_result: None,
                    });
                    return None;
                }
            };

            let Some(call) = response.tool_calls.first() else {
                trace.push(TraceStep {
                    turn,
                    thought: response.text.clone(),
                    tool_name: None,
                    tool_args: None,
                    tool_result: None,
                });
                continue;
            };

            if call.name == FINISH_TOOL_NAME {
                let analysis = parse_finish_arguments(&call.arguments);
                trace.push(TraceStep {
                    turn,
                    thought: response.text,
                    tool_name: Some(call.name.clone()),
                    tool_args: Some(call.arguments.clone()),
                    tool_result: None,
                });
                return Some(analysis);
            }

            let result = self
                .broker
                .execute_tool(investigation.alert.id, &call.name, call.arguments.clone())
                .await;
            let rendered = match &result {
                Ok(output) => output.clone(),
                Err(e) => format!("error: {e}"),
            };
            self.broker.notify_tool_result(investigation.alert.id);

            trace.push(TraceStep {
                turn,
                thought: response.text,
                tool_name: Some(call.name.clone()),
                tool_args: Some(call.arguments.clone()),
                tool_result: Some(rendered),
            });
        }
        None
    }

    /// Builds the context a fresh investigation starts with from the
    /// response cache's memory extension: the most recent timeline
    /// entries, this session's recent queries, and any pattern that has
    /// been seen at least `PATTERN_CONFIDENCE_FLOOR` times.
    async fn build_initial_context(&self, investigation: &RunningInvestigation) -> String {
        let mut parts = Vec::new();

        if let Ok(timeline) = self.cache.recent_timeline(RECENT_INCIDENT_LIMIT).await {
            if !timeline.is_empty() {
                let lines: Vec<String> = timeline.iter().map(|t| format!("- {}", t.summary)).collect();
                parts.push(format!("Recent similar incidents:\n{}", lines.join("\n")));
            }
        }

        if let Some(session_id) = &investigation.alert.session_id {
            if let Ok(queries) = self.cache.recent_session_queries(&session_id.to_string(), SESSION_QUERY_LIMIT).await {
                if !queries.is_empty() {
                    parts.push(format!("Session recent queries:\n{}", queries.join("\n")));
                }
            }
        }

        if let Ok(patterns) = self.cache.patterns_above_confidence(PATTERN_CONFIDENCE_FLOOR).await {
            if !patterns.is_empty() {
                let lines: Vec<String> = patterns
                    .iter()
                    .map(|p| {
                        format!(
                            "- {} seen {} times, last resolution: {}",
                            p.signature.key(),
                            p.frequency,
                            p.resolutions.last().cloned().unwrap_or_else(|| "none".into())
                        )
                    })
                    .collect();
                parts.push(format!("Relevant patterns:\n{}", lines.join("\n")));
            }
        }

        parts.join("\n\n")
    }

    /// Routes a model call through the response cache: an exact hash hit,
    /// then a similarity fallback, then a real call on miss. Mirrors
    /// `TriageWorker::process`'s cache-then-model pattern, except the
    /// whole `ModelResponse` is cached rather than a simple decision.
    async fn cached_generate(&self, prompt: &str, tools: &[ToolSpec]) -> Result<ModelResponse, crate::types::ModelError> {
        let key = content_key(prompt);
        if let Ok(Some(cached)) = self.cache.get_exact(&key).await {
            if let Ok(response) = serde_json::from_str::<ModelResponse>(&cached) {
                self.metrics.cache_hits_total.inc();
                return Ok(response);
            }
        }

        let embedding = embed(prompt);
        if let Ok(Some(pattern)) = self
            .cache
            .find_similar(&embedding, MODEL_CACHE_SIMILARITY_THRESHOLD, MODEL_CACHE_SCAN_LIMIT)
            .await
        {
            if let Ok(response) = serde_json::from_str::<ModelResponse>(&pattern.response) {
                self.metrics.cache_hits_total.inc();
                return Ok(response);
            }
        }

        self.metrics.cache_misses_total.inc();
        self.metrics.model_calls_total.inc();
        let response = match self.model.generate(prompt, tools).await {
            Ok(resp) => resp,
            Err(e) => {
                self.metrics.model_call_failures_total.inc();
                return Err(e);
            }
        };

        if let Ok(encoded) = serde_json::to_string(&response) {
            let _ = self.cache.put_exact(&key, &encoded, MODEL_CACHE_TTL).await;
            let _ = self
                .cache
                .remember_pattern(CachedPattern {
                    key_hash: key.clone(),
                    embedding,
                    reason: prompt.chars().take(200).collect(),
                    response: encoded,
                    hits: 1,
                    last_seen: SystemTime::now(),
                })
                .await;
        }
        Ok(response)
    }

    async fn synthesize(&self, investigation: &RunningInvestigation, trace: &[TraceStep]) -> FinalAnalysis {
        let prompt = synthesis_prompt(investigation, trace);
        self.metrics.model_calls_total.inc();
        let response = match self.model.generate(&prompt, &[]).await {
            Ok(resp) => resp,
            Err(e) => {
                self.metrics.model_call_failures_total.inc();
                return FinalAnalysis {
                    summary: format!("synthesis unavailable: {e}"),
                    status: ReportStatus::Open,
                }
            }
        };

        let Some(text) = response.text else {
            return FinalAnalysis { summary: "model returned no synthesis text".to_string(), status: ReportStatus::Open };
        };

        match extract_synthesis(&text) {
            Some(parsed) => FinalAnalysis {
                summary: format!("{}\n\nroot cause: {}\n\nrecommendation: {}", parsed.summary, parsed.root_cause, parsed.recommendation),
                status: status_from_str(&parsed.status),
            },
            None => FinalAnalysis { summary: text, status: ReportStatus::Open },
        }
    }
}

struct FinalAnalysis {
    summary: String,
    status: ReportStatus,
}

struct WorkerSlot {
    tx: mpsc::Sender<(RunningInvestigation, Arc<Notify>)>,
    /// Cancel handle for whichever investigation this slot is currently
    /// running, if any. Reissued per-dispatch so a cancel that arrives
    /// after the worker has already moved on can never bleed into the
    /// next investigation (a single shared `Notify` would keep a stale
    /// permit around for that case).
    current_cancel: Mutex<Option<Arc<Notify>>>,
}

/// Pool of investigation workers, one task per slot, dispatched to by
/// the scheduler through the `InvestigationDispatcher` trait.
pub struct InvestigationPool {
    slots: Vec<WorkerSlot>,
}

impl InvestigationPool {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        worker_count: usize,
        model: Arc<dyn Model>,
        tools: Arc<dyn ToolRegistry>,
        broker: SchedulerHandle,
        report_store: Arc<dyn ReportStore>,
        alert_sink: Arc<dyn AlertSink>,
        cache: Arc<dyn ResponseCache>,
        cache_config: &crate::config::LlmCacheConfig,
        metrics: Arc<crate::metrics::MetricsRegistry>,
    ) -> Arc<Self> {
        let max_timeline_incidents = cache_config.max_incidents;
        let session_ttl = Duration::from_secs(cache_config.session_ttl_secs);
        let mut slots = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let (tx, rx) = mpsc::channel::<(RunningInvestigation, Arc<Notify>)>(1);
            let worker = Arc::new(Worker {
                model: model.clone(),
                tools: tools.clone(),
                broker: broker.clone(),
                report_store: report_store.clone(),
                alert_sink: alert_sink.clone(),
                cache: cache.clone(),
                max_timeline_incidents,
                session_ttl,
                metrics: metrics.clone(),
            });
            metrics.investigation_workers_alive.inc();
            let pool_metrics = metrics.clone();
            tokio::spawn(async move {
                let supervisor = WorkerSupervisor::new(MAX_RESTART_ATTEMPTS, RESTART_DELAY);
                supervisor
                    .run(format!("investigation-{index}"), rx, move |(investigation, cancel): (RunningInvestigation, Arc<Notify>)| {
                        let worker = worker.clone();
                        async move {
                            tracing::debug!(worker = index, incident = %investigation.alert.id, "investigation worker picked up incident");
                            worker.run(investigation, cancel).await;
                        }
                    })
                    .await;
                pool_metrics.investigation_workers_alive.dec();
            });
            slots.push(WorkerSlot { tx, current_cancel: Mutex::new(None) });
        }
        Arc::new(Self { slots })
    }
}

#[async_trait]
impl InvestigationDispatcher for InvestigationPool {
    async fn dispatch(&self, worker_index: usize, investigation: RunningInvestigation) {
        if let Some(slot) = self.slots.get(worker_index) {
            let cancel = Arc::new(Notify::new());
            *slot.current_cancel.lock() = Some(cancel.clone());
            if slot.tx.try_send((investigation, cancel)).is_err() {
                tracing::warn!(worker = worker_index, "investigation worker busy, dropping dispatch");
            }
        }
    }

    async fn cancel(&self, worker_index: usize, _investigation_id: IncidentId) {
        if let Some(slot) = self.slots.get(worker_index) {
            if let Some(cancel) = slot.current_cancel.lock().take() {
                cancel.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::NullAlertSink;
    use crate::model::ModelResponse;
    use crate::reports::SqliteReportStore;
    use crate::scheduler::Scheduler;
    use crate::tools::StaticToolRegistry;
    use crate::types::{Alert, LogRecord, Priority, PriorityBreakdown};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::model::ToolCall;

    struct ScriptedModel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Model for ScriptedModel {
        async fn generate(&self, _prompt: &str, _tools: &[ToolSpec]) -> Result<ModelResponse, crate::types::ModelError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Ok(ModelResponse {
                    text: Some("checking logs".into()),
                    tool_calls: vec![ToolCall {
                        name: FINISH_TOOL_NAME.to_string(),
                        arguments: serde_json::json!({
                            "rootCauseAnalysis": "memory leak",
                            "impactAssessment": "payments pod restarted repeatedly",
                            "suggestedRemediation": ["raise memory limits"],
                            "lessonsLearned": ["add a memory alert earlier"],
                            "status": "resolved",
                        }),
                    }],
                })
            } else {
                Ok(ModelResponse {
                    text: Some(r#"{"summary": "pod was OOMKilled", "root_cause": "memory leak", "recommendation": "raise limits", "status": "resolved"}"#.to_string()),
                    tool_calls: vec![],
                })
            }
        }
        async fn circuit_breaker_metrics(&self) -> Option<HashMap<String, usize>> {
            None
        }
    }

    fn make_alert() -> Alert {
        Alert {
            id: IncidentId::new(),
            log: LogRecord::new("OOMKilled"),
            reason: "pod payments OOMKilled".into(),
            priority: Priority::Critical,
            score: 0.9,
            breakdown: PriorityBreakdown::default(),
            reasoning: String::new(),
            est_duration_ms: 1000,
            enqueued_at: SystemTime::now(),
            session_id: None,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn finish_tool_call_ends_the_loop_and_saves_a_resolved_report() {
        let model = Arc::new(ScriptedModel { calls: AtomicUsize::new(0) });
        let model_for_assertions = model.clone();
        let metrics = crate::metrics::MetricsRegistry::new();
        let report_store = Arc::new(SqliteReportStore::open_in_memory().unwrap());
        let dispatcher: Arc<dyn InvestigationDispatcher> = Arc::new(RecordingDispatcherForTest::default());
        let handle = Scheduler::spawn(
            crate::config::PriorityQueueConfig::default(),
            1,
            dispatcher,
            Arc::new(StaticToolRegistry::new(vec![])),
            Arc::new(NullAlertSink),
            metrics.clone(),
        );

        let pool = InvestigationPool::spawn(
            1,
            model,
            Arc::new(StaticToolRegistry::new(vec![])),
            handle,
            report_store.clone(),
            Arc::new(NullAlertSink),
            Arc::new(crate::cache::NullCache),
            &crate::config::LlmCacheConfig::default(),
            metrics,
        );

        let investigation = RunningInvestigation::new(make_alert(), 0, std::time::Duration::from_secs(60));
        pool.dispatch(0, investigation).await;
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;

        let reports = report_store.list().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].triage_reason, "pod payments OOMKilled");
        assert_eq!(reports[0].status, ReportStatus::Resolved);
        assert!(reports[0].final_analysis.contains("memory leak"));
        assert!(reports[0].final_analysis.contains("raise memory limits"));
        // Only one model call: FINISH short-circuits synthesis entirely.
        assert_eq!(model_for_assertions.calls.load(Ordering::SeqCst), 1);
    }

    #[derive(Default)]
    struct RecordingDispatcherForTest;

    #[async_trait]
    impl InvestigationDispatcher for RecordingDispatcherForTest {
        async fn dispatch(&self, _worker_index: usize, _investigation: RunningInvestigation) {}
        async fn cancel(&self, _worker_index: usize, _investigation_id: IncidentId) {}
    }

    #[test]
    fn extracts_bare_json() {
        let text = r#"{"summary": "ok", "root_cause": "x", "recommendation": "y", "status": "resolved"}"#;
        let parsed = extract_synthesis(text).unwrap();
        assert_eq!(parsed.summary, "ok");
    }

    #[test]
    fn extracts_fenced_json() {
        let text = "here you go:\n```json\n{\"summary\": \"ok\", \"root_cause\": \"x\", \"recommendation\": \"y\", \"status\": \"resolved\"}\n```";
        let parsed = extract_synthesis(text).unwrap();
        assert_eq!(parsed.status, "resolved");
    }

    #[test]
    fn extracts_json_embedded_in_prose() {
        let text = "Sure, the findings are {\"summary\": \"ok\", \"root_cause\": \"x\", \"recommendation\": \"y\", \"status\": \"open\"} hope that helps";
        let parsed = extract_synthesis(text).unwrap();
        assert_eq!(parsed.summary, "ok");
    }

    #[test]
    fn unparsable_text_returns_none() {
        assert!(extract_synthesis("no json here at all").is_none());
    }
}
