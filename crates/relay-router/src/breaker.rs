//! Per-target circuit breakers for downstream delivery.
//!
//! A breaker opens once at least `min_calls` recent requests show a failure
//! ratio above the threshold, stays open for the reset timeout, then admits
//! trial requests; a run of consecutive successes closes it again.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Minimum recorded calls before the failure ratio is considered.
    pub min_calls: u32,
    /// Failure ratio above which the breaker opens.
    pub failure_ratio: f64,
    /// Consecutive successes in half-open required to close.
    pub success_threshold: u32,
    /// How long the breaker stays open before admitting trials.
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            min_calls: 10,
            failure_ratio: 0.5,
            success_threshold: 3,
            open_duration: Duration::from_secs(5),
        }
    }
}

struct BreakerState {
    state: CircuitState,
    /// Rolling window of recent call outcomes (true = success).
    window: VecDeque<bool>,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    target: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(target: String, config: CircuitBreakerConfig) -> Self {
        Self {
            target,
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                window: VecDeque::with_capacity(16),
                consecutive_successes: 0,
                opened_at: None,
            }),
        }
    }

    /// Whether a request may proceed. Transitions Open -> HalfOpen once the
    /// open duration has elapsed.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.config.open_duration)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    debug!(target = %self.target, "Circuit breaker half-open, admitting trial requests");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        Self::push_outcome(&mut inner.window, true, self.config.min_calls);

        match inner.state {
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.window.clear();
                    inner.opened_at = None;
                    info!(target = %self.target, "Circuit breaker closed");
                }
            }
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        Self::push_outcome(&mut inner.window, false, self.config.min_calls);

        match inner.state {
            CircuitState::Closed => {
                let calls = inner.window.len() as u32;
                if calls >= self.config.min_calls {
                    let failures = inner.window.iter().filter(|ok| !**ok).count() as f64;
                    let ratio = failures / inner.window.len() as f64;
                    if ratio > self.config.failure_ratio {
                        inner.state = CircuitState::Open;
                        inner.opened_at = Some(Instant::now());
                        warn!(
                            target = %self.target,
                            failure_ratio = ratio,
                            "Circuit breaker opened"
                        );
                    }
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.consecutive_successes = 0;
                warn!(target = %self.target, "Circuit breaker re-opened on trial failure");
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    fn push_outcome(window: &mut VecDeque<bool>, ok: bool, capacity: u32) {
        if window.len() >= capacity as usize {
            window.pop_front();
        }
        window.push_back(ok);
    }
}

/// Point-in-time view of one breaker, for operator visibility.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerStats {
    pub target: String,
    pub state: String,
    pub recent_calls: u32,
    pub recent_failures: u32,
}

/// One breaker per delivery target, created on first use.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    pub fn for_target(&self, target: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(target.to_string(), self.config.clone()))
            })
            .clone()
    }

    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        self.breakers
            .iter()
            .map(|entry| {
                let breaker = entry.value();
                let inner = breaker.inner.lock();
                CircuitBreakerStats {
                    target: breaker.target.clone(),
                    state: format!("{:?}", inner.state),
                    recent_calls: inner.window.len() as u32,
                    recent_failures: inner.window.iter().filter(|ok| !**ok).count() as u32,
                }
            })
            .collect()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("http://svc/hook".into(), CircuitBreakerConfig::default())
    }

    #[test]
    fn stays_closed_below_min_calls() {
        let cb = breaker();
        for _ in 0..9 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }

    #[test]
    fn opens_on_failure_ratio_after_min_calls() {
        let cb = breaker();
        for _ in 0..4 {
            cb.record_success();
        }
        for _ in 0..6 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn half_opens_after_reset_and_closes_on_successes() {
        let cb = CircuitBreaker::new(
            "t".into(),
            CircuitBreakerConfig {
                open_duration: Duration::from_millis(0),
                ..Default::default()
            },
        );
        for _ in 0..10 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);

        // Open duration elapsed: trial requests admitted.
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn trial_failure_reopens() {
        let cb = CircuitBreaker::new(
            "t".into(),
            CircuitBreakerConfig {
                open_duration: Duration::from_millis(0),
                ..Default::default()
            },
        );
        for _ in 0..10 {
            cb.record_failure();
        }
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn registry_reuses_breaker_per_target() {
        let registry = CircuitBreakerRegistry::default();
        let a = registry.for_target("http://a");
        let b = registry.for_target("http://a");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.stats().len(), 1);
    }
}
