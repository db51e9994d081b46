//! End-to-end properties of the scheduler actor, driven only through its
//! public `SchedulerHandle` API, matching the way a consumer outside this
//! crate would exercise it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use sentinel_core::alerting::NullAlertSink;
use sentinel_core::config::PriorityQueueConfig;
use sentinel_core::metrics::MetricsRegistry;
use sentinel_core::scheduler::{InvestigationDispatcher, Scheduler};
use sentinel_core::tools::StaticToolRegistry;
use sentinel_core::types::{IncidentId, LogRecord, RunningInvestigation};

#[derive(Debug, Clone)]
enum Event {
    Dispatch(IncidentId),
    Cancel(IncidentId),
}

struct RecordingDispatcher {
    events: Mutex<Vec<Event>>,
    notify: Notify,
}

impl RecordingDispatcher {
    fn new() -> Arc<Self> {
        Arc::new(Self { events: Mutex::new(Vec::new()), notify: Notify::new() })
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl InvestigationDispatcher for RecordingDispatcher {
    async fn dispatch(&self, _worker_index: usize, investigation: RunningInvestigation) {
        self.events.lock().push(Event::Dispatch(investigation.alert.id));
        self.notify.notify_waiters();
    }

    async fn cancel(&self, _worker_index: usize, investigation_id: IncidentId) {
        self.events.lock().push(Event::Cancel(investigation_id));
        self.notify.notify_waiters();
    }
}

async fn wait_for<F: Fn() -> bool>(dispatcher: &RecordingDispatcher, pred: F) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !pred() {
            let notified = dispatcher.notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            }
        }
    })
    .await
    .expect("condition never became true");
}

fn spawn_scheduler(
    config: PriorityQueueConfig,
    worker_count: usize,
) -> (sentinel_core::scheduler::SchedulerHandle, Arc<RecordingDispatcher>) {
    let dispatcher = RecordingDispatcher::new();
    let tools = Arc::new(StaticToolRegistry::new(vec![]));
    let alert_sink = Arc::new(NullAlertSink);
    let metrics = MetricsRegistry::new();
    let handle = Scheduler::spawn(config, worker_count, dispatcher.clone(), tools, alert_sink, metrics);
    (handle, dispatcher)
}

/// Three identical alerts within the dedup window collapse into one
/// dispatched investigation; the other two never reach a worker.
#[tokio::test]
async fn duplicate_alerts_collapse_into_a_single_investigation() {
    let (handle, dispatcher) = spawn_scheduler(PriorityQueueConfig::default(), 4);

    for _ in 0..3 {
        handle.submit_triaged(
            LogRecord::new("payments service outage detected"),
            "outage detected".to_string(),
            HashMap::new(),
        );
    }

    wait_for(&dispatcher, || !dispatcher.events().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let dispatches = dispatcher.events().iter().filter(|e| matches!(e, Event::Dispatch(_))).count();
    assert_eq!(dispatches, 1, "duplicate alerts within the dedup window must not re-dispatch");
}

/// A high-priority alert preempts a running low-priority investigation
/// once the priority gap clears `preemption_threshold`, and the
/// preempted investigation is re-enqueued rather than dropped.
#[tokio::test]
async fn high_priority_alert_preempts_a_running_low_priority_investigation() {
    let mut config = PriorityQueueConfig::default();
    config.dedup_window_secs = 0;
    config.services.push(sentinel_core::config::ServiceProfile { name: "payments".to_string(), impact: 1.0 });
    let (handle, dispatcher) = spawn_scheduler(config, 1);

    handle.submit_triaged(
        LogRecord::new("routine status update, nothing actionable"),
        "status update".to_string(),
        HashMap::new(),
    );
    wait_for(&dispatcher, || !dispatcher.events().is_empty()).await;
    let first_id = match dispatcher.events()[0] {
        Event::Dispatch(id) => id,
        _ => unreachable!(),
    };

    let mut metadata = HashMap::new();
    metadata.insert("service".to_string(), "payments".to_string());
    handle.submit_triaged(
        LogRecord::new("payments service outage detected"),
        "outage detected".to_string(),
        metadata,
    );

    wait_for(&dispatcher, || dispatcher.events().len() >= 3).await;

    let events = dispatcher.events();
    assert!(matches!(events[1], Event::Cancel(id) if id == first_id));
    assert!(matches!(events[2], Event::Dispatch(id) if id != first_id));
}

/// Submitting past `max_queue_size` never panics or blocks the scheduler
/// actor; excess alerts are rejected rather than admitted.
#[tokio::test]
async fn queue_overflow_does_not_stall_the_scheduler() {
    let mut config = PriorityQueueConfig::default();
    config.max_concurrent_investigations = 1;
    config.max_queue_size = 2;
    config.preemption_enabled = false;
    config.dedup_window_secs = 0;
    let (handle, dispatcher) = spawn_scheduler(config, 1);

    for i in 0..10 {
        handle.submit_triaged(
            LogRecord::new(format!("distinct failure number {i}")),
            format!("distinct failure number {i}"),
            HashMap::new(),
        );
    }

    wait_for(&dispatcher, || !dispatcher.events().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The scheduler actor is still alive and answering messages.
    handle.submit_triaged(LogRecord::new("still alive probe"), "still alive probe".to_string(), HashMap::new());
    tokio::time::sleep(Duration::from_millis(50)).await;
}
