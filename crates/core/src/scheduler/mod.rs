//! Central concurrency core: admission, deduplication, priority
//! scheduling and preemption for triaged alerts.
//!
//! Parallel workers, single-threaded cooperative scheduler: the
//! `Scheduler` owns every shared map itself and runs as one spawned task,
//! mutated only by messages it receives on its own mailbox. Callers never
//! touch its state directly; they hold a cheaply cloneable
//! `SchedulerHandle` instead.

pub mod priority_calculator;
pub mod priority_queue;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::alerting::AlertSink;
use crate::config::PriorityQueueConfig;
use crate::metrics::MetricsRegistry;
use crate::tools::ToolRegistry;
use crate::types::{
    Alert, IncidentId, IncidentMemory, InvestigationError, InvestigationState, LogRecord,
    RunningInvestigation, SchedulerError,
};
use priority_calculator::calculate_priority;
use priority_queue::PriorityQueue;

const BURST_MODE_MAX_DURATION: Duration = Duration::from_secs(10 * 60);
const TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(10);
const PREEMPTION_SCORE_BOOST: f64 = 0.1;

/// What a completed investigation reports back to the scheduler, used to
/// update pattern memory for the historical sub-score.
#[derive(Debug, Clone)]
pub struct InvestigationOutcome {
    pub normalized_reason: String,
}

/// Dispatches admitted alerts to free investigation-worker slots and
/// cancels a running one on preemption or timeout. Implemented by the
/// investigation pool; the scheduler never spawns workers itself.
#[async_trait]
pub trait InvestigationDispatcher: Send + Sync {
    async fn dispatch(&self, worker_index: usize, investigation: RunningInvestigation);
    async fn cancel(&self, worker_index: usize, investigation_id: IncidentId);
}

/// Brokers tool execution requests from investigation workers through to
/// the `ToolRegistry`, resetting that investigation's timeout on each
/// request as evidence of forward progress.
#[async_trait]
pub trait ToolBroker: Send + Sync {
    async fn execute_tool(
        &self,
        incident_id: IncidentId,
        name: &str,
        arguments: Value,
    ) -> Result<String, InvestigationError>;
}

enum SchedulerMessage {
    Triaged {
        log: LogRecord,
        reason: String,
        metadata: HashMap<String, String>,
    },
    ToolRequest {
        incident_id: IncidentId,
        name: String,
        arguments: Value,
        respond_to: oneshot::Sender<Result<String, InvestigationError>>,
    },
    ToolResult {
        incident_id: IncidentId,
    },
    InvestigationComplete {
        incident_id: IncidentId,
        outcome: InvestigationOutcome,
    },
    Tick,
}

/// Cheaply cloneable front for the scheduler actor.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerMessage>,
}

impl SchedulerHandle {
    pub fn submit_triaged(&self, log: LogRecord, reason: String, metadata: HashMap<String, String>) {
        let _ = self.tx.send(SchedulerMessage::Triaged { log, reason, metadata });
    }

    pub fn notify_complete(&self, incident_id: IncidentId, outcome: InvestigationOutcome) {
        let _ = self.tx.send(SchedulerMessage::InvestigationComplete { incident_id, outcome });
    }

    /// Called once a tool result has been delivered back to the
    /// investigation worker, moving it out of `AwaitingTool`.
    pub fn notify_tool_result(&self, incident_id: IncidentId) {
        let _ = self.tx.send(SchedulerMessage::ToolResult { incident_id });
    }

    pub fn tick(&self) {
        let _ = self.tx.send(SchedulerMessage::Tick);
    }
}

#[async_trait]
impl ToolBroker for SchedulerHandle {
    async fn execute_tool(
        &self,
        incident_id: IncidentId,
        name: &str,
        arguments: Value,
    ) -> Result<String, InvestigationError> {
        let (respond_to, rx) = oneshot::channel();
        if self
            .tx
            .send(SchedulerMessage::ToolRequest {
                incident_id,
                name: name.to_string(),
                arguments,
                respond_to,
            })
            .is_err()
        {
            return Err(InvestigationError::ToolFailed("scheduler is shutting down".into()));
        }
        rx.await.unwrap_or_else(|_| Err(InvestigationError::ToolFailed("scheduler dropped the request".into())))
    }
}

struct RunningSlot {
    investigation: RunningInvestigation,
    deadline: SystemTime,
}

/// Owns every shared map the admission pipeline touches. Runs as a single
/// spawned task; `run()` is its cooperative loop.
pub struct Scheduler {
    rx: mpsc::UnboundedReceiver<SchedulerMessage>,
    config: PriorityQueueConfig,
    investigation_timeout: Duration,

    dedup: HashMap<String, SystemTime>,
    pattern_memory: HashMap<String, IncidentMemory>,
    queue: PriorityQueue<Alert>,
    running: HashMap<IncidentId, RunningSlot>,
    free_slots: Vec<usize>,

    burst_mode: bool,
    burst_started_at: Option<SystemTime>,

    dispatcher: Arc<dyn InvestigationDispatcher>,
    tools: Arc<dyn ToolRegistry>,
    alert_sink: Arc<dyn AlertSink>,
    metrics: Arc<MetricsRegistry>,
}

impl Scheduler {
    /// Spawns the scheduler actor and returns a handle to it.
    pub fn spawn(
        config: PriorityQueueConfig,
        worker_count: usize,
        dispatcher: Arc<dyn InvestigationDispatcher>,
        tools: Arc<dyn ToolRegistry>,
        alert_sink: Arc<dyn AlertSink>,
        metrics: Arc<MetricsRegistry>,
    ) -> SchedulerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let investigation_timeout = Duration::from_millis(config.investigation_timeout_ms);
        let max_queue_size = config.max_queue_size;
        let scheduler = Scheduler {
            rx,
            config,
            investigation_timeout,
            dedup: HashMap::new(),
            pattern_memory: HashMap::new(),
            queue: PriorityQueue::new(max_queue_size),
            running: HashMap::new(),
            free_slots: (0..worker_count).collect(),
            burst_mode: false,
            burst_started_at: None,
            dispatcher,
            tools,
            alert_sink,
            metrics,
        };
        tokio::spawn(scheduler.run());
        SchedulerHandle { tx }
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(3));
        loop {
            tokio::select! {
                msg = self.rx.recv() => {
                    match msg {
                        Some(msg) => self.handle(msg).await,
                        None => break,
                    }
                }
                _ = ticker.tick() => self.on_tick().await,
            }
        }
    }

    async fn handle(&mut self, msg: SchedulerMessage) {
        match msg {
            SchedulerMessage::Triaged { log, reason, metadata } => self.admit(log, reason, metadata).await,
            SchedulerMessage::ToolRequest { incident_id, name, arguments, respond_to } => {
                self.on_tool_request(incident_id, name, arguments, respond_to).await;
            }
            SchedulerMessage::ToolResult { incident_id } => self.on_tool_result(incident_id),
            SchedulerMessage::InvestigationComplete { incident_id, outcome } => {
                self.on_investigation_complete(incident_id, outcome).await;
            }
            SchedulerMessage::Tick => self.on_tick().await,
        }
    }

    fn effective_max_concurrent(&self) -> usize {
        if self.burst_mode {
            self.config.burst_mode_concurrency
        } else {
            self.config.max_concurrent_investigations
        }
    }

    async fn admit(&mut self, log: LogRecord, reason: String, metadata: HashMap<String, String>) {
        let now = SystemTime::now();
        let normalized = crate::types::normalize_reason(&reason);

        // 1. Dedup.
        if let Some(last_seen) = self.dedup.get(&normalized) {
            if now.duration_since(*last_seen).unwrap_or_default() < Duration::from_secs(self.config.dedup_window_secs) {
                self.metrics.alerts_deduped_total.inc();
                tracing::debug!(reason = %normalized, "skipped-duplicate");
                return;
            }
        }
        self.dedup.insert(normalized.clone(), now);

        // 2. Prioritize.
        let history = self.pattern_memory.get(&normalized).cloned();
        let result = calculate_priority(&log, &reason, &metadata, now, &self.config, history.as_ref());

        let alert = Alert {
            id: IncidentId::new(),
            log,
            reason,
            priority: result.priority,
            score: result.score,
            breakdown: result.breakdown,
            reasoning: result.reasoning,
            est_duration_ms: self.investigation_timeout.as_millis() as u64,
            enqueued_at: now,
            session_id: None,
            metadata,
        };

        // 3. Open the incident: Phase 1 of the two-phase alert protocol.
        // The scheduler mints `alert.id` once, here, and it is this same
        // id that the investigation later passes to `send_enriched_analysis`.
        if let Err(e) = self
            .alert_sink
            .send_initial_alert(alert.id, &alert.reason, &alert.priority.to_string(), &alert.metadata)
            .await
        {
            tracing::warn!(incident = %alert.id, error = %e, "send_initial_alert failed");
        }

        // 4. Burst mode.
        self.update_burst_mode(now, alert.priority);

        // 5. Preemption.
        if self.config.preemption_enabled && alert.priority > crate::types::Priority::Medium {
            if let Some(victim_id) = self.find_preemption_victim(&alert) {
                self.preempt(victim_id, alert, now).await;
                return;
            }
        }

        // 6. Admission.
        if self.free_slots.len() > 0 && self.running.len() < self.effective_max_concurrent() {
            self.start_investigation(alert, now).await;
        } else {
            self.enqueue(alert, now);
        }
    }

    /// `incoming` has not been enqueued yet when this runs (admission
    /// happens later in `admit`), so the deactivation check below treats
    /// it as already urgent rather than reading a queue that doesn't
    /// know about it yet.
    fn update_burst_mode(&mut self, now: SystemTime, incoming_priority: crate::types::Priority) {
        use crate::types::Priority;
        if !self.config.burst_mode_enabled {
            return;
        }
        if !self.burst_mode && incoming_priority >= self.config.burst_mode_threshold {
            self.burst_mode = true;
            self.burst_started_at = Some(now);
            tracing::info!("burst mode activated");
        }
        if self.burst_mode {
            let too_long = self
                .burst_started_at
                .map(|start| now.duration_since(start).unwrap_or_default() > BURST_MODE_MAX_DURATION)
                .unwrap_or(false);
            let nothing_urgent = incoming_priority < Priority::High
                && !self.queue.to_vec().iter().any(|a| a.priority >= Priority::High);
            if too_long || nothing_urgent {
                self.burst_mode = false;
                self.burst_started_at = None;
                tracing::info!("burst mode deactivated");
            }
        }
    }

    /// Only attempted when the incoming alert's priority is above MEDIUM;
    /// candidates are running investigations whose priority the incoming
    /// alert exceeds by at least `preemption_threshold`.
    ///
    /// Tiebreak: the abstract rule picks the candidate maximizing
    /// `(runningScore − incomingScore)`, i.e. the strongest running
    /// investigation, under a priority comparison that preempts a
    /// stronger incumbent with a weaker incoming alert. We implement the
    /// inverse priority comparison instead (a stronger incoming alert
    /// preempts a weaker incumbent, matching the worked scenario — see
    /// DESIGN.md). Carrying the same inversion into the tiebreak means
    /// maximizing `(incomingScore − runningScore)`, which for a fixed
    /// `incomingScore` is equivalent to minimizing `runningScore` — so
    /// the weakest (lowest-score) candidate is the correct victim under
    /// our direction, not an unrelated alternative rule.
    fn find_preemption_victim(&self, incoming: &Alert) -> Option<IncidentId> {
        let threshold = self.config.preemption_threshold as i32;
        self.running
            .values()
            .filter(|slot| slot.investigation.can_preempt)
            .filter(|slot| {
                (incoming.priority as i32 - slot.investigation.alert.priority as i32) >= threshold
            })
            .min_by(|a, b| {
                let sa = a.investigation.alert.score;
                let sb = b.investigation.alert.score;
                sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|slot| slot.investigation.alert.id)
    }

    async fn preempt(&mut self, victim_id: IncidentId, incoming: Alert, now: SystemTime) {
        let Some(slot) = self.running.remove(&victim_id) else { return };
        let worker_index = slot.investigation.worker_index;
        self.dispatcher.cancel(worker_index, victim_id).await;
        self.metrics.investigations_preempted_total.inc();
        self.metrics.running_investigations.dec();

        let mut victim_alert = slot.investigation.alert;
        victim_alert.score = (victim_alert.score + PREEMPTION_SCORE_BOOST).min(1.0);
        self.enqueue(victim_alert, now);

        self.free_slots.push(worker_index);
        self.start_investigation(incoming, now).await;
    }

    fn enqueue(&mut self, alert: Alert, now: SystemTime) {
        match self.queue.push(alert, now) {
            Ok(Some(_evicted)) => self.metrics.queue_rejected_total.inc(),
            Ok(None) => {}
            Err(_rejected) => self.metrics.queue_rejected_total.inc(),
        }
        self.metrics.queue_depth.set(self.queue.len() as i64);
    }

    async fn start_investigation(&mut self, alert: Alert, now: SystemTime) {
        let Some(worker_index) = self.free_slots.pop() else {
            self.enqueue(alert, now);
            return;
        };
        let incident_id = alert.id;
        let investigation = RunningInvestigation::new(alert.clone(), worker_index, self.investigation_timeout);
        let deadline = now + self.investigation_timeout;
        self.running.insert(incident_id, RunningSlot { investigation: investigation.clone(), deadline });
        self.metrics.investigations_started_total.inc();
        self.metrics.running_investigations.inc();
        self.dispatcher.dispatch(worker_index, investigation).await;
    }

    async fn on_tool_request(
        &mut self,
        incident_id: IncidentId,
        name: String,
        arguments: Value,
        respond_to: oneshot::Sender<Result<String, InvestigationError>>,
    ) {
        let now = SystemTime::now();
        if let Some(slot) = self.running.get_mut(&incident_id) {
            slot.deadline = now + self.investigation_timeout;
            slot.investigation.state = InvestigationState::AwaitingTool;
        }

        let tools = self.tools.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(TOOL_CALL_TIMEOUT, tools.invoke(&name, arguments)).await {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(e)) => Err(InvestigationError::ToolFailed(e.to_string())),
                Err(_) => Err(InvestigationError::ToolTimeout(TOOL_CALL_TIMEOUT)),
            };
            let _ = respond_to.send(result);
        });
    }

    fn on_tool_result(&mut self, incident_id: IncidentId) {
        let now = SystemTime::now();
        if let Some(slot) = self.running.get_mut(&incident_id) {
            slot.deadline = now + self.investigation_timeout;
            slot.investigation.state = InvestigationState::Running;
        }
    }

    async fn on_investigation_complete(&mut self, incident_id: IncidentId, outcome: InvestigationOutcome) {
        let Some(slot) = self.running.remove(&incident_id) else { return };
        self.metrics.investigations_completed_total.inc();
        self.metrics.running_investigations.dec();

        let entry = self.pattern_memory.entry(outcome.normalized_reason.clone()).or_insert(IncidentMemory {
            normalized_reason: outcome.normalized_reason,
            occurrences: 0,
            last_seen: SystemTime::now(),
        });
        entry.occurrences += 1;
        entry.last_seen = SystemTime::now();

        self.free_slots.push(slot.investigation.worker_index);
        self.drain_queue().await;
    }

    async fn on_tick(&mut self) {
        let now = SystemTime::now();

        let timed_out: Vec<IncidentId> = self
            .running
            .iter()
            .filter(|(_, slot)| slot.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for incident_id in timed_out {
            if let Some(slot) = self.running.remove(&incident_id) {
                self.dispatcher.cancel(slot.investigation.worker_index, incident_id).await;
                self.metrics.investigations_timed_out_total.inc();
                self.metrics.running_investigations.dec();
                let _ = self
                    .alert_sink
                    .send_system_alert(&format!("investigation {incident_id} timed out"), "warning")
                    .await;
                self.free_slots.push(slot.investigation.worker_index);
            }
        }

        self.queue.age_tick(now);
        self.drain_queue().await;
        self.metrics.queue_depth.set(self.queue.len() as i64);
    }

    async fn drain_queue(&mut self) {
        let now = SystemTime::now();
        while !self.free_slots.is_empty() && self.running.len() < self.effective_max_concurrent() {
            let Some(alert) = self.queue.pop(now) else { break };
            self.start_investigation(alert, now).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::StaticToolRegistry;
    use parking_lot::Mutex;

    struct RecordingDispatcher {
        dispatched: Mutex<Vec<IncidentId>>,
        cancelled: Mutex<Vec<IncidentId>>,
    }

    #[async_trait]
    impl InvestigationDispatcher for RecordingDispatcher {
        async fn dispatch(&self, _worker_index: usize, investigation: RunningInvestigation) {
            self.dispatched.lock().push(investigation.alert.id);
        }

        async fn cancel(&self, _worker_index: usize, incident_id: IncidentId) {
            self.cancelled.lock().push(incident_id);
        }
    }

    fn test_setup(worker_count: usize) -> (SchedulerHandle, Arc<RecordingDispatcher>) {
        let dispatcher = Arc::new(RecordingDispatcher { dispatched: Mutex::new(vec![]), cancelled: Mutex::new(vec![]) });
        let handle = Scheduler::spawn(
            PriorityQueueConfig::default(),
            worker_count,
            dispatcher.clone(),
            Arc::new(StaticToolRegistry::new(vec![])),
            crate::alerting::build_alert_sink(&crate::config::AlertManagerConfig::default()),
            MetricsRegistry::new(),
        );
        (handle, dispatcher)
    }

    #[tokio::test]
    async fn duplicate_reason_within_window_is_deduped() {
        let (handle, dispatcher) = test_setup(4);
        handle.submit_triaged(LogRecord::new("oom"), "pod payments-1 OOMKilled".into(), HashMap::new());
        handle.submit_triaged(LogRecord::new("oom"), "pod payments-2 OOMKilled".into(), HashMap::new());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(dispatcher.dispatched.lock().len(), 1);
    }

    #[tokio::test]
    async fn distinct_reasons_both_start() {
        let (handle, dispatcher) = test_setup(4);
        handle.submit_triaged(LogRecord::new("oom"), "pod payments OOMKilled".into(), HashMap::new());
        handle.submit_triaged(LogRecord::new("timeout"), "connection to db timed out".into(), HashMap::new());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(dispatcher.dispatched.lock().len(), 2);
    }

    #[tokio::test]
    async fn exceeding_capacity_enqueues_instead_of_dispatching() {
        let (handle, dispatcher) = test_setup(1);
        handle.submit_triaged(LogRecord::new("a"), "service a outage".into(), HashMap::new());
        handle.submit_triaged(LogRecord::new("b"), "service b outage critical".into(), HashMap::new());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(dispatcher.dispatched.lock().len(), 1);
    }
}
