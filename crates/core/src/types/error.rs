//! Error types and recovery strategies for the sentinel agent.

use std::time::Duration;
use thiserror::Error;

/// Top-level error type. Each variant wraps a subsystem-specific error
/// enum so call sites can match narrowly while still propagating through
/// one `?`-friendly type.
#[derive(Error, Debug)]
pub enum SentinelError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("ingress error: {0}")]
    Ingress(#[from] IngressError),

    #[error("triage error: {0}")]
    Triage(#[from] TriageError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("investigation error: {0}")]
    Investigation(#[from] InvestigationError),

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("alert sink error: {0}")]
    Alert(#[from] AlertError),

    #[error("report store error: {0}")]
    ReportStore(#[from] ReportStoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors. Any of these cause startup to refuse,
/// per the "config invalid -> refuse to start" rule.
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    #[error("failed to parse configuration: {0}")]
    ParseError(String),
}

/// Errors surfaced to HTTP/socket clients. Always mapped to a sanitized
/// 4xx response; never exposes internal detail.
#[derive(Error, Debug, Clone)]
pub enum IngressError {
    #[error("request body too large: {size} bytes, max allowed {max} bytes")]
    BodyTooLarge { size: usize, max: usize },

    #[error("request body was empty")]
    EmptyBody,

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Errors raised while triaging a single log line.
#[derive(Error, Debug, Clone)]
pub enum TriageError {
    #[error("model call failed: {0}")]
    ModelFailed(String),

    #[error("worker pool is shutting down")]
    ShuttingDown,
}

/// Scheduler admission/dispatch errors.
#[derive(Error, Debug, Clone)]
pub enum SchedulerError {
    #[error("queue is at capacity ({capacity})")]
    QueueFull { capacity: usize },

    #[error("investigation not found: {0}")]
    InvestigationNotFound(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("scheduler is shutting down")]
    ShuttingDown,
}

/// Errors raised from within the bounded ReAct investigation loop.
#[derive(Error, Debug, Clone)]
pub enum InvestigationError {
    #[error("model call failed: {0}")]
    ModelFailed(String),

    #[error("tool execution timed out after {0:?}")]
    ToolTimeout(Duration),

    #[error("tool execution failed: {0}")]
    ToolFailed(String),

    #[error("investigation timed out")]
    TimedOut,

    #[error("investigation preempted")]
    Preempted,

    #[error("final synthesis could not be parsed from model output")]
    SynthesisUnparsable,
}

/// Errors from the `Model` capability trait. `Transient` drives the
/// circuit breaker's retry/backoff path; `Permanent` is recorded as an
/// observation without retrying or crashing.
#[derive(Error, Debug, Clone)]
pub enum ModelError {
    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("permanent upstream failure: {0}")]
    Permanent(String),

    #[error("circuit breaker open for {0}")]
    CircuitOpen(String),
}

/// A breaker-tripped call, returned instead of invoking the wrapped
/// operation while the circuit is open.
#[derive(Error, Debug, Clone)]
#[error("circuit breaker '{key}' is open, retry after {retry_after:?}")]
pub struct CircuitOpenError {
    pub key: String,
    pub retry_after: Duration,
}

/// ResponseCache backend errors. Callers are expected to treat any of
/// these as a silent-degrade signal, never a hard failure.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache operation failed: {0}")]
    OperationFailed(String),
}

/// AlertSink delivery errors.
#[derive(Error, Debug, Clone)]
pub enum AlertError {
    #[error("alertmanager request failed: {0}")]
    DeliveryFailed(String),

    #[error("unknown incident: {0}")]
    UnknownIncident(String),
}

/// ReportStore persistence errors.
#[derive(Error, Debug, Clone)]
pub enum ReportStoreError {
    #[error("report not found: {0}")]
    NotFound(String),

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("compression error: {0}")]
    Compression(String),
}

/// Result type alias used throughout the crate.
pub type SentinelResult<T> = Result<T, SentinelError>;

/// Recovery strategy attached to a failure, mirroring the error-handling
/// policy in the design: retry transient upstream errors, restart
/// crashed workers, or give up without crashing the process.
#[derive(Debug, Clone)]
pub enum RecoveryStrategy {
    Retry { max_attempts: u32, base_backoff: Duration },
    Restart { max_attempts: u32, delay: Duration },
    Degrade,
    None,
}

impl Default for RecoveryStrategy {
    fn default() -> Self {
        RecoveryStrategy::Retry {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
        }
    }
}
