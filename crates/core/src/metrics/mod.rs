//! Process-wide metrics collection and Prometheus text exposition for
//! `GET /metrics`.
//!
//! Counters and gauges are plain atomics behind a registry so every
//! subsystem can cheaply record an event without contention; exposition
//! happens only when a scrape actually asks for it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A point-in-time value that can go up or down.
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn set(&self, v: i64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Every counter/gauge exposed by the agent. Fields are named after
/// their exported Prometheus metric name.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    pub logs_ingested_total: Counter,
    pub logs_rejected_total: Counter,
    pub triage_decisions_total: Counter,
    pub triage_alerts_total: Counter,
    pub triage_routine_dropped_total: Counter,
    pub investigations_started_total: Counter,
    pub investigations_completed_total: Counter,
    pub investigations_timed_out_total: Counter,
    pub investigations_preempted_total: Counter,
    pub alerts_deduped_total: Counter,
    pub queue_rejected_total: Counter,
    pub model_calls_total: Counter,
    pub model_call_failures_total: Counter,
    pub circuit_breaker_opens_total: Counter,
    pub cache_hits_total: Counter,
    pub cache_misses_total: Counter,
    pub rate_limited_requests_total: Counter,

    pub queue_depth: Gauge,
    pub running_investigations: Gauge,
    pub triage_workers_alive: Gauge,
    pub investigation_workers_alive: Gauge,

    start: RwLock<Option<Instant>>,
}

impl MetricsRegistry {
    pub fn new() -> Arc<Self> {
        let registry = Self::default();
        *registry.start.write() = Some(Instant::now());
        Arc::new(registry)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start
            .read()
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut lines = BTreeMap::new();
        lines.insert("sentinel_uptime_seconds", self.uptime_seconds().to_string());
        lines.insert("sentinel_logs_ingested_total", self.logs_ingested_total.get().to_string());
        lines.insert("sentinel_logs_rejected_total", self.logs_rejected_total.get().to_string());
        lines.insert("sentinel_triage_decisions_total", self.triage_decisions_total.get().to_string());
        lines.insert("sentinel_triage_alerts_total", self.triage_alerts_total.get().to_string());
        lines.insert(
            "sentinel_triage_routine_dropped_total",
            self.triage_routine_dropped_total.get().to_string(),
        );
        lines.insert(
            "sentinel_investigations_started_total",
            self.investigations_started_total.get().to_string(),
        );
        lines.insert(
            "sentinel_investigations_completed_total",
            self.investigations_completed_total.get().to_string(),
        );
        lines.insert(
            "sentinel_investigations_timed_out_total",
            self.investigations_timed_out_total.get().to_string(),
        );
        lines.insert(
            "sentinel_investigations_preempted_total",
            self.investigations_preempted_total.get().to_string(),
        );
        lines.insert("sentinel_alerts_deduped_total", self.alerts_deduped_total.get().to_string());
        lines.insert("sentinel_queue_rejected_total", self.queue_rejected_total.get().to_string());
        lines.insert("sentinel_model_calls_total", self.model_calls_total.get().to_string());
        lines.insert(
            "sentinel_model_call_failures_total",
            self.model_call_failures_total.get().to_string(),
        );
        lines.insert(
            "sentinel_circuit_breaker_opens_total",
            self.circuit_breaker_opens_total.get().to_string(),
        );
        lines.insert("sentinel_cache_hits_total", self.cache_hits_total.get().to_string());
        lines.insert("sentinel_cache_misses_total", self.cache_misses_total.get().to_string());
        lines.insert(
            "sentinel_rate_limited_requests_total",
            self.rate_limited_requests_total.get().to_string(),
        );
        lines.insert("sentinel_queue_depth", self.queue_depth.get().to_string());
        lines.insert("sentinel_running_investigations", self.running_investigations.get().to_string());
        lines.insert("sentinel_triage_workers_alive", self.triage_workers_alive.get().to_string());
        lines.insert(
            "sentinel_investigation_workers_alive",
            self.investigation_workers_alive.get().to_string(),
        );

        let mut out = String::new();
        for (name, value) in lines {
            out.push_str("# TYPE ");
            out.push_str(name);
            out.push_str(" gauge\n");
            out.push_str(name);
            out.push(' ');
            out.push_str(&value);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let reg = MetricsRegistry::new();
        assert_eq!(reg.logs_ingested_total.get(), 0);
    }

    #[test]
    fn counter_increments() {
        let reg = MetricsRegistry::new();
        reg.logs_ingested_total.inc();
        reg.logs_ingested_total.inc_by(4);
        assert_eq!(reg.logs_ingested_total.get(), 5);
    }

    #[test]
    fn gauge_tracks_up_and_down() {
        let reg = MetricsRegistry::new();
        reg.running_investigations.inc();
        reg.running_investigations.inc();
        reg.running_investigations.dec();
        assert_eq!(reg.running_investigations.get(), 1);
    }

    #[test]
    fn prometheus_render_contains_every_counter() {
        let reg = MetricsRegistry::new();
        reg.triage_alerts_total.inc();
        let text = reg.render_prometheus();
        assert!(text.contains("sentinel_triage_alerts_total 1"));
        assert!(text.contains("sentinel_uptime_seconds"));
    }
}
