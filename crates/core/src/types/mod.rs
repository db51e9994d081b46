//! Core types and data structures shared across the triage, scheduling,
//! investigation and alerting subsystems.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

pub mod error;

pub use error::*;

/// Unique identifier for an alerting incident, shared by the triage alert
/// and every investigation/report/alert record derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IncidentId(pub Uuid);

impl IncidentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for IncidentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for IncidentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for IncidentId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Unique identifier for a running (or completed) investigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvestigationId(pub Uuid);

impl InvestigationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InvestigationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InvestigationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a `/chat` conversation session, threaded through the
/// response cache's session memory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Priority tiers used by both the priority calculator's thresholds and
/// the priority queue's heap ordering. Higher variants sort greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum Priority {
    #[default]
    Low = 0,
    Medium = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    /// Classify a continuous urgency score in `[0, 1]` into a tier, per
    /// the fixed thresholds: >=0.85 Critical, >=0.65 High, >=0.4 Medium,
    /// else Low.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.85 {
            Priority::Critical
        } else if score >= 0.65 {
            Priority::High
        } else if score >= 0.4 {
            Priority::Medium
        } else {
            Priority::Low
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        };
        write!(f, "{s}")
    }
}

/// An immutable log line as received by ingress. Raw bytes are kept
/// alongside a best-effort UTF-8 rendering so triage never has to worry
/// about lossy decoding twice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub text: String,
    pub received_at: SystemTime,
    pub source: Option<String>,
}

impl LogRecord {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            received_at: SystemTime::now(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Outcome of the triage pool's per-log decision. Never persisted — it
/// either turns into an `Alert` or is dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TriageDecision {
    Ok,
    Alert { reason: String, metadata: HashMap<String, String> },
}

/// A score breakdown produced by the priority calculator, kept for
/// reporting/explainability alongside the final `score`/`priority`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriorityBreakdown {
    pub keyword_score: f64,
    pub service_impact_score: f64,
    pub time_context_score: f64,
    pub historical_score: f64,
}

/// A triaged item admitted to, or waiting in, the scheduler. The
/// unit of work the priority queue orders and the scheduler admits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: IncidentId,
    pub log: LogRecord,
    pub reason: String,
    pub priority: Priority,
    pub score: f64,
    pub breakdown: PriorityBreakdown,
    pub reasoning: String,
    pub est_duration_ms: u64,
    pub enqueued_at: SystemTime,
    pub session_id: Option<SessionId>,
    pub metadata: HashMap<String, String>,
}

impl Alert {
    /// A normalized form of `reason` used as the dedup key: lowercased,
    /// whitespace-collapsed, with obvious identifiers (numbers, uuids)
    /// stripped so near-duplicate reasons collapse to the same bucket.
    pub fn normalized_reason(&self) -> String {
        normalize_reason(&self.reason)
    }

    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.enqueued_at).unwrap_or_default()
    }
}

/// Normalize a triage reason string for dedup-window comparison.
pub fn normalize_reason(reason: &str) -> String {
    let lowered = reason.to_lowercase();
    let mut collapsed = String::with_capacity(lowered.len());
    let mut last_was_space = false;
    for ch in lowered.chars() {
        if ch.is_ascii_digit() {
            if !last_was_space {
                collapsed.push('#');
                last_was_space = false;
            }
            continue;
        }
        if ch.is_whitespace() {
            if !last_was_space {
                collapsed.push(' ');
                last_was_space = true;
            }
        } else {
            collapsed.push(ch);
            last_was_space = false;
        }
    }
    collapsed.trim().to_string()
}

/// The canonical states of an investigation's lifecycle, tracked by the
/// scheduler's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvestigationState {
    Starting,
    Running,
    AwaitingTool,
    Completed,
    Preempted,
    TimedOut,
}

/// An investigation in flight, owned by the scheduler while its worker
/// runs. Every instance must terminate through `Completed`, `Preempted`
/// or `TimedOut` with its timeout handle cleared.
#[derive(Debug, Clone)]
pub struct RunningInvestigation {
    pub id: InvestigationId,
    pub alert: Alert,
    pub worker_index: usize,
    pub start_time: SystemTime,
    pub est_end: SystemTime,
    pub state: InvestigationState,
    pub can_preempt: bool,
}

impl RunningInvestigation {
    pub fn new(alert: Alert, worker_index: usize, estimated: Duration) -> Self {
        let start_time = SystemTime::now();
        Self {
            id: InvestigationId::new(),
            alert,
            worker_index,
            start_time,
            est_end: start_time + estimated,
            state: InvestigationState::Starting,
            can_preempt: true,
        }
    }
}

/// Lifecycle status of a persisted report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportStatus {
    Open,
    Acknowledged,
    Resolved,
}

/// A completed investigation report. `investigation_trace` and
/// `final_analysis` are stored gzip-compressed at rest; this struct
/// holds them decompressed once loaded by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub incident_id: IncidentId,
    pub timestamp: SystemTime,
    pub initial_log: String,
    pub triage_reason: String,
    pub investigation_trace: String,
    pub final_analysis: String,
    pub status: ReportStatus,
}

/// A single turn recorded in an investigation's ReAct trace, serialized
/// (then compressed) into `Report::investigation_trace`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    pub turn: u32,
    pub thought: Option<String>,
    pub tool_name: Option<String>,
    pub tool_args: Option<serde_json::Value>,
    pub tool_result: Option<String>,
}

/// Remembered pattern used by the response cache's similarity search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedPattern {
    pub key_hash: String,
    pub embedding: Vec<f32>,
    pub reason: String,
    pub response: String,
    pub hits: u64,
    pub last_seen: SystemTime,
}

/// A remembered incident summary, used to feed the priority calculator's
/// historical sub-score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentMemory {
    pub normalized_reason: String,
    pub occurrences: u64,
    pub last_seen: SystemTime,
}

/// Identifies a class of incident for the response cache's
/// memory-extension pattern table: `(service, errorClass, severity)`.
/// Distinct from the Scheduler's own per-normalized-reason
/// `pattern_memory`, which feeds the priority calculator directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatternSignature {
    pub service: String,
    pub error_class: String,
    pub severity: String,
}

impl PatternSignature {
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.service, self.error_class, self.severity)
    }
}

/// Accumulated history for one `PatternSignature`: how often it's been
/// seen, when last, and what resolutions past investigations recorded
/// for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternMemory {
    pub signature: PatternSignature,
    pub frequency: u64,
    pub last_seen: SystemTime,
    pub resolutions: Vec<String>,
}

/// One entry in the cache's incident timeline, ordered by `timestamp`
/// and capped at a configurable `maxIncidents`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub incident_id: IncidentId,
    pub summary: String,
    pub timestamp: SystemTime,
}

/// Tracks an alert's two-phase lifecycle in the alert sink: the
/// Alertmanager incident created by `sendInitialAlert`, kept alive by a
/// heartbeat until `sendEnrichedAnalysis` or a system event resolves it.
#[derive(Debug, Clone)]
pub struct ActiveIncident {
    pub incident_id: IncidentId,
    pub alertname: &'static str,
    pub started_at: SystemTime,
    pub fingerprint: String,
}
