//! Configuration loading and validation.
//!
//! Configuration is read from `seraph.config.json` in the working
//! directory (overridable), merged with a handful of environment
//! variables, and validated once at startup. Invalid configuration
//! refuses to start rather than falling back to defaults silently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{ConfigError, Priority};

fn default_port() -> u16 {
    8080
}

fn default_workers() -> usize {
    4
}

fn default_rate_limit_window_secs() -> u64 {
    60
}

fn default_rate_limit_max_requests() -> u32 {
    100
}

fn default_recent_logs_max_size_mb() -> u64 {
    16
}

fn default_report_retention_days() -> u32 {
    30
}

/// Top-level configuration, the serde-deserialized form of
/// `seraph.config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Static bearer token required on `/logs`, `/chat`. `None` disables
    /// auth entirely (ingress logs a startup warning in that case).
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    /// Regexes that short-circuit triage to `Ok` without a model call.
    #[serde(default)]
    pub pre_filters: Vec<String>,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default = "default_recent_logs_max_size_mb")]
    pub recent_logs_max_size_mb: u64,

    #[serde(default = "default_report_retention_days")]
    pub report_retention_days: u32,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub alert_manager: AlertManagerConfig,

    #[serde(default)]
    pub llm_cache: LlmCacheConfig,

    #[serde(default)]
    pub priority_queue: PriorityQueueConfig,

    #[serde(default)]
    pub startup_prompts: Vec<String>,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            workers: default_workers(),
            api_key: None,
            pre_filters: Vec::new(),
            rate_limit: RateLimitConfig::default(),
            recent_logs_max_size_mb: default_recent_logs_max_size_mb(),
            report_retention_days: default_report_retention_days(),
            llm: LlmConfig::default(),
            alert_manager: AlertManagerConfig::default(),
            llm_cache: LlmCacheConfig::default(),
            priority_queue: PriorityQueueConfig::default(),
            startup_prompts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_rate_limit_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_rate_limit_max_requests(),
            window_secs: default_rate_limit_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    pub provider: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AlertManagerConfig {
    /// Base URL of the Alertmanager-compatible HTTP sink. `None` makes
    /// the `AlertSink` a synthetic-ID no-op.
    pub url: Option<String>,
}

fn default_similarity_threshold() -> f64 {
    0.85
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_max_incidents() -> usize {
    500
}

fn default_session_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmCacheConfig {
    pub redis: Option<RedisConfig>,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_seconds: u64,
    /// Cap on the `incident:timeline` sorted set; oldest entries are
    /// trimmed once this is exceeded.
    #[serde(default = "default_max_incidents")]
    pub max_incidents: usize,
    /// TTL applied to a session's recent-query list.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

fn default_max_queue_size() -> usize {
    256
}

fn default_max_concurrent_investigations() -> usize {
    4
}

fn default_investigation_timeout_ms() -> u64 {
    5 * 60 * 1000
}

fn default_preemption_threshold() -> u32 {
    1
}

fn default_burst_mode_concurrency() -> usize {
    8
}

fn default_burst_mode_threshold() -> Priority {
    Priority::High
}

fn default_dedup_window_secs() -> u64 {
    5 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityQueueConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_concurrent_investigations")]
    pub max_concurrent_investigations: usize,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_investigation_timeout_ms")]
    pub investigation_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub preemption_enabled: bool,
    #[serde(default = "default_preemption_threshold")]
    pub preemption_threshold: u32,
    #[serde(default)]
    pub burst_mode_enabled: bool,
    #[serde(default = "default_burst_mode_concurrency")]
    pub burst_mode_concurrency: usize,
    /// Burst mode activates once an incoming alert's priority is at or
    /// above this tier (default HIGH).
    #[serde(default = "default_burst_mode_threshold")]
    pub burst_mode_threshold: Priority,
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    #[serde(default)]
    pub priority_weights: PriorityWeights,
    #[serde(default)]
    pub services: Vec<ServiceProfile>,
    #[serde(default)]
    pub business_hours: Option<BusinessHours>,
    #[serde(default)]
    pub critical_keywords: Vec<String>,
    #[serde(default)]
    pub high_keywords: Vec<String>,
    #[serde(default)]
    pub medium_keywords: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for PriorityQueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_investigations: default_max_concurrent_investigations(),
            max_queue_size: default_max_queue_size(),
            investigation_timeout_ms: default_investigation_timeout_ms(),
            preemption_enabled: true,
            preemption_threshold: default_preemption_threshold(),
            burst_mode_enabled: false,
            burst_mode_concurrency: default_burst_mode_concurrency(),
            burst_mode_threshold: default_burst_mode_threshold(),
            dedup_window_secs: default_dedup_window_secs(),
            priority_weights: PriorityWeights::default(),
            services: Vec::new(),
            business_hours: None,
            critical_keywords: default_critical_keywords(),
            high_keywords: default_high_keywords(),
            medium_keywords: default_medium_keywords(),
        }
    }
}

fn default_critical_keywords() -> Vec<String> {
    ["outage", "down", "critical", "panic", "oom", "dataloss", "crashloopbackoff"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_high_keywords() -> Vec<String> {
    ["error", "failed", "timeout", "exception", "unavailable"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_medium_keywords() -> Vec<String> {
    ["warn", "degraded", "retry", "latency"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityWeights {
    pub keyword: f64,
    pub service_impact: f64,
    pub time_context: f64,
    pub historical: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            keyword: 0.4,
            service_impact: 0.3,
            time_context: 0.15,
            historical: 0.15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceProfile {
    pub name: String,
    #[serde(default = "default_service_impact")]
    pub impact: f64,
}

fn default_service_impact() -> f64 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessHours {
    pub start_hour_utc: u8,
    pub end_hour_utc: u8,
    #[serde(default)]
    pub weekdays_only: bool,
}

impl SentinelConfig {
    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist, then validate it. Returns `ConfigError` (and
    /// never partial defaults) on anything malformed.
    pub fn load_and_validate(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::FileNotFound(format!("{}: {e}", path.display())))?;
            let mut cfg: SentinelConfig = serde_json::from_str(&raw)
                .map_err(|e| ConfigError::ParseError(e.to_string()))?;
            if let Ok(key) = std::env::var("SERAPH_API_KEY") {
                cfg.api_key = Some(key);
            }
            cfg
        } else {
            let mut cfg = SentinelConfig::default();
            if let Ok(key) = std::env::var("SERAPH_API_KEY") {
                cfg.api_key = Some(key);
            }
            cfg
        };
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> PathBuf {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("seraph.config.json")
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be nonzero".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.rate_limit.max_requests == 0 {
            return Err(ConfigError::Invalid("rate_limit.max_requests must be at least 1".into()));
        }
        if self.priority_queue.max_queue_size == 0 {
            return Err(ConfigError::Invalid("priority_queue.max_queue_size must be at least 1".into()));
        }
        if self.priority_queue.max_concurrent_investigations == 0 {
            return Err(ConfigError::Invalid(
                "priority_queue.max_concurrent_investigations must be at least 1".into(),
            ));
        }
        let w = &self.priority_queue.priority_weights;
        let total = w.keyword + w.service_impact + w.time_context + w.historical;
        if (total - 1.0).abs() > 0.05 {
            return Err(ConfigError::Invalid(format!(
                "priority_weights must sum to ~1.0, got {total}"
            )));
        }
        if let Some(redis) = &self.llm_cache.redis {
            url::Url::parse(&redis.url)
                .map_err(|e| ConfigError::Invalid(format!("llm_cache.redis.url invalid: {e}")))?;
        }
        if let Some(url) = &self.alert_manager.url {
            url::Url::parse(url)
                .map_err(|e| ConfigError::Invalid(format!("alert_manager.url invalid: {e}")))?;
        }
        Ok(())
    }

    /// Number of triage workers: `floor(workers / 2)`, minimum 1.
    pub fn triage_worker_count(&self) -> usize {
        (self.workers / 2).max(1)
    }

    /// Number of investigation workers: `ceil(workers / 2)`.
    pub fn investigation_worker_count(&self) -> usize {
        self.workers.div_ceil(2).max(1)
    }

    pub fn recent_logs_max_size_bytes(&self) -> u64 {
        self.recent_logs_max_size_mb * 1024 * 1024
    }
}

/// Environment-derived overlay for secrets that should never live in the
/// config file on disk.
pub fn load_env_overrides(config: &mut SentinelConfig) {
    if let Ok(url) = std::env::var("SERAPH_ALERTMANAGER_URL") {
        config.alert_manager.url = Some(url);
    }
    let _: HashMap<String, String> = std::env::vars().collect();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = SentinelConfig::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_zero_workers() {
        let mut cfg = SentinelConfig::default();
        cfg.workers = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unbalanced_priority_weights() {
        let mut cfg = SentinelConfig::default();
        cfg.priority_queue.priority_weights.keyword = 0.9;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn worker_split_matches_spec() {
        let mut cfg = SentinelConfig::default();
        cfg.workers = 5;
        assert_eq!(cfg.triage_worker_count(), 2);
        assert_eq!(cfg.investigation_worker_count(), 3);
    }

    #[test]
    fn worker_split_floor_is_at_least_one() {
        let mut cfg = SentinelConfig::default();
        cfg.workers = 1;
        assert_eq!(cfg.triage_worker_count(), 1);
        assert_eq!(cfg.investigation_worker_count(), 1);
    }
}
