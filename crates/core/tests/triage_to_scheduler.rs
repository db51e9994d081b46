//! Exercises the triage pool wired to a real scheduler, the way
//! `agent_manager::start` connects them, using a stub model instead of a
//! live LLM provider.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use sentinel_core::alerting::NullAlertSink;
use sentinel_core::cache::NullCache;
use sentinel_core::config::PriorityQueueConfig;
use sentinel_core::metrics::MetricsRegistry;
use sentinel_core::model::{Model, ModelResponse, ToolSpec};
use sentinel_core::scheduler::{InvestigationDispatcher, Scheduler};
use sentinel_core::tools::StaticToolRegistry;
use sentinel_core::triage::TriagePool;
use sentinel_core::types::{IncidentId, LogRecord, ModelError, RunningInvestigation};

struct CountingModel {
    calls: AtomicUsize,
}

#[async_trait]
impl Model for CountingModel {
    async fn generate(&self, _prompt: &str, _tools: &[ToolSpec]) -> Result<ModelResponse, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ModelResponse { text: Some("decision=alert reason=crash loop detected".to_string()), tool_calls: vec![] })
    }
}

struct RecordingDispatcher {
    dispatched: Mutex<Vec<IncidentId>>,
    notify: Notify,
}

#[async_trait]
impl InvestigationDispatcher for RecordingDispatcher {
    async fn dispatch(&self, _worker_index: usize, investigation: RunningInvestigation) {
        self.dispatched.lock().push(investigation.alert.id);
        self.notify.notify_waiters();
    }

    async fn cancel(&self, _worker_index: usize, _investigation_id: IncidentId) {}
}

/// A routine health-check log never reaches the model and never produces
/// an investigation; a crash-keyword log does both.
#[tokio::test]
async fn routine_logs_skip_the_model_while_crash_logs_trigger_investigation() {
    let model = Arc::new(CountingModel { calls: AtomicUsize::new(0) });
    let cache = Arc::new(NullCache);
    let dispatcher = Arc::new(RecordingDispatcher { dispatched: Mutex::new(Vec::new()), notify: Notify::new() });
    let tools = Arc::new(StaticToolRegistry::new(vec![]));
    let alert_sink = Arc::new(NullAlertSink);
    let metrics = MetricsRegistry::new();

    let scheduler = Scheduler::spawn(
        PriorityQueueConfig::default(),
        2,
        dispatcher.clone(),
        tools,
        alert_sink,
        metrics.clone(),
    );

    let triage = TriagePool::spawn(2, model.clone(), cache, scheduler, &[], metrics.clone());

    triage.dispatch(LogRecord::new("GET /healthz 200 OK"));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(model.calls.load(Ordering::SeqCst), 0, "a routine log must never reach the model");
    assert!(dispatcher.dispatched.lock().is_empty());

    triage.dispatch(LogRecord::new("worker pod entered CrashLoopBackOff"));

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if !dispatcher.dispatched.lock().is_empty() {
                break;
            }
            tokio::select! {
                _ = dispatcher.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            }
        }
    })
    .await
    .expect("crash-keyword log should trigger an investigation");

    assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.triage_alerts_total.get(), 1);
}

/// An oversize log (beyond the truncation limit's headroom) is skipped
/// before ever reaching the model.
#[tokio::test]
async fn oversize_log_is_skipped_without_a_model_call() {
    let model = Arc::new(CountingModel { calls: AtomicUsize::new(0) });
    let cache = Arc::new(NullCache);
    let dispatcher = Arc::new(RecordingDispatcher { dispatched: Mutex::new(Vec::new()), notify: Notify::new() });
    let tools = Arc::new(StaticToolRegistry::new(vec![]));
    let alert_sink = Arc::new(NullAlertSink);
    let metrics = MetricsRegistry::new();

    let scheduler =
        Scheduler::spawn(PriorityQueueConfig::default(), 1, dispatcher, tools, alert_sink, metrics.clone());
    let triage = TriagePool::spawn(1, model.clone(), cache, scheduler, &[], metrics);

    let oversize = "x".repeat(20_000);
    triage.dispatch(LogRecord::new(oversize));
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
}

/// Extra routine patterns passed as pre-filters are honored alongside the
/// built-in defaults.
#[tokio::test]
async fn custom_pre_filter_pattern_drops_matching_logs() {
    let model = Arc::new(CountingModel { calls: AtomicUsize::new(0) });
    let cache = Arc::new(NullCache);
    let dispatcher = Arc::new(RecordingDispatcher { dispatched: Mutex::new(Vec::new()), notify: Notify::new() });
    let tools = Arc::new(StaticToolRegistry::new(vec![]));
    let alert_sink = Arc::new(NullAlertSink);
    let metrics = MetricsRegistry::new();

    let scheduler =
        Scheduler::spawn(PriorityQueueConfig::default(), 1, dispatcher, tools, alert_sink, metrics.clone());
    let pre_filters = vec![r"^noisy-cron:".to_string()];
    let triage = TriagePool::spawn(1, model.clone(), cache, scheduler, &pre_filters, metrics);

    triage.dispatch(LogRecord::new("noisy-cron: sweep completed, 0 rows affected"));
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
}
