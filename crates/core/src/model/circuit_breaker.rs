//! Per-backend circuit breaker for `Model` calls.
//!
//! Generalizes the scheduler's per-tool-endpoint breaker (closed → open
//! → half-open) from "per tool" to "per Model backend", and replaces its
//! bare consecutive-failure counter with a rolling failure window: the
//! circuit opens on 5 failures within a 5-minute window, and half-opens
//! 60 seconds after opening.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::types::CircuitOpenError;

const FAILURE_THRESHOLD: usize = 5;
const FAILURE_WINDOW: Duration = Duration::from_secs(5 * 60);
const RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);
const HALF_OPEN_MAX_CALLS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub failure_window: Duration,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: FAILURE_THRESHOLD,
            failure_window: FAILURE_WINDOW,
            recovery_timeout: RECOVERY_TIMEOUT,
            half_open_max_calls: HALF_OPEN_MAX_CALLS,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    recent_failures: VecDeque<Instant>,
    half_open_calls: u32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            recent_failures: VecDeque::new(),
            half_open_calls: 0,
        }
    }

    fn trim_window(&mut self, now: Instant) {
        while let Some(front) = self.recent_failures.front() {
            if now.duration_since(*front) > self.config.failure_window {
                self.recent_failures.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn check(&mut self, key: &str) -> Result<(), CircuitOpenError> {
        let now = Instant::now();
        match &self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open { opened_at } => {
                let elapsed = now.duration_since(*opened_at);
                if elapsed >= self.config.recovery_timeout {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_calls = 1;
                    tracing::info!(backend = key, "circuit breaker transitioning to half-open");
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        key: key.to_string(),
                        retry_after: self.config.recovery_timeout - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_calls < self.config.half_open_max_calls {
                    self.half_open_calls += 1;
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        key: key.to_string(),
                        retry_after: Duration::ZERO,
                    })
                }
            }
        }
    }

    pub fn record_success(&mut self, key: &str) {
        match self.state {
            CircuitState::Closed => {
                self.recent_failures.clear();
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                self.recent_failures.clear();
                self.half_open_calls = 0;
                tracing::info!(backend = key, "circuit breaker recovered, now closed");
            }
            CircuitState::Open { .. } => {
                self.state = CircuitState::Closed;
                self.recent_failures.clear();
            }
        }
    }

    pub fn record_failure(&mut self, key: &str) {
        let now = Instant::now();
        self.trim_window(now);
        self.recent_failures.push_back(now);

        match self.state {
            CircuitState::Closed => {
                if self.recent_failures.len() >= self.config.failure_threshold {
                    self.state = CircuitState::Open { opened_at: now };
                    tracing::warn!(
                        backend = key,
                        failures = self.recent_failures.len(),
                        "circuit breaker tripped open"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open { opened_at: now };
                self.half_open_calls = 0;
                tracing::warn!(backend = key, "circuit breaker recovery failed, reopening");
            }
            CircuitState::Open { .. } => {}
        }
    }

    pub fn state(&self) -> &CircuitState {
        &self.state
    }

    pub fn failure_count(&self) -> usize {
        self.recent_failures.len()
    }
}

/// Registry of circuit breakers keyed by Model backend identifier.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config,
        }
    }

    pub async fn check(&self, key: &str) -> Result<(), CircuitOpenError> {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.default_config));
        breaker.check(key)
    }

    pub async fn record_success(&self, key: &str) {
        let mut breakers = self.breakers.write().await;
        if let Some(breaker) = breakers.get_mut(key) {
            breaker.record_success(key);
        }
    }

    pub async fn record_failure(&self, key: &str) {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.default_config));
        breaker.record_failure(key);
    }

    pub async fn get_state(&self, key: &str) -> Option<CircuitState> {
        let breakers = self.breakers.read().await;
        breakers.get(key).map(|b| b.state().clone())
    }

    /// Snapshot exposed via `Model::getCircuitBreakerMetrics`.
    pub async fn snapshot(&self) -> HashMap<String, usize> {
        let breakers = self.breakers.read().await;
        breakers.iter().map(|(k, v)| (k.clone(), v.failure_count())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_closed() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::default());
        assert_eq!(*cb.state(), CircuitState::Closed);
    }

    #[test]
    fn trips_after_threshold_failures() {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            ..CircuitBreakerConfig::default()
        };
        let mut cb = CircuitBreaker::new(config);
        cb.record_failure("m");
        cb.record_failure("m");
        assert_eq!(*cb.state(), CircuitState::Closed);
        cb.record_failure("m");
        assert!(matches!(*cb.state(), CircuitState::Open { .. }));
        assert!(cb.check("m").is_err());
    }

    #[test]
    fn recovers_through_half_open() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_millis(1),
            ..CircuitBreakerConfig::default()
        };
        let mut cb = CircuitBreaker::new(config);
        cb.record_failure("m");
        cb.record_failure("m");
        assert!(matches!(*cb.state(), CircuitState::Open { .. }));

        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.check("m").is_ok());
        assert_eq!(*cb.state(), CircuitState::HalfOpen);

        cb.record_success("m");
        assert_eq!(*cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn registry_tracks_backends_independently() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 2,
            ..CircuitBreakerConfig::default()
        });
        registry.record_failure("backend-a").await;
        registry.record_failure("backend-a").await;
        assert!(registry.check("backend-a").await.is_err());
        assert!(registry.check("backend-b").await.is_ok());
    }
}
