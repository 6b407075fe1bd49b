//! Circuit breaker for external dependencies.
//!
//! One breaker guards each retrieval source and one guards the LLM. The
//! breaker tracks a sliding window of recent call outcomes and trips when
//! the window accumulates too much failure weight, either absolutely or as
//! a rate.
//!
//! # States
//!
//! - **Closed**: calls pass through, outcomes are recorded.
//! - **Open**: calls are rejected immediately until the cool-down elapses.
//! - **HalfOpen**: exactly one probe call is admitted. Success closes the
//!   circuit; failure reopens it with a doubled cool-down, capped.
//!
//! Timeouts, 5xx, and explicit unavailability count with weight 1.0;
//! rate limiting (429) counts with weight 0.5; other 4xx do not count.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{config::BreakerConfig, observability::metrics};

/// Outcome of a guarded call, as reported by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// The dependency answered usefully.
    Success,
    /// Timeout, 5xx, transport error, or explicit unavailability.
    Failure,
    /// The dependency asked us to back off (HTTP 429).
    RateLimited,
}

impl CallOutcome {
    fn failure_weight(self) -> f64 {
        match self {
            CallOutcome::Success => 0.0,
            CallOutcome::Failure => 1.0,
            CallOutcome::RateLimited => 0.5,
        }
    }
}

/// Breaker state, exposed for stats and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Error returned when the breaker rejects a call.
#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("circuit open for '{dependency}', retry in {}ms", retry_after.as_millis())]
    Open {
        dependency: Arc<str>,
        retry_after: Duration,
    },
}

struct BreakerInner {
    state: BreakerState,
    /// Failure weights of the most recent calls, newest at the back.
    window: VecDeque<f64>,
    opened_at: Instant,
    cool_down: Duration,
    /// Whether the half-open probe slot is taken.
    probe_in_flight: bool,
}

/// Sliding-window circuit breaker for one dependency.
pub struct CircuitBreaker {
    dependency: Arc<str>,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(dependency: impl Into<Arc<str>>, config: &BreakerConfig) -> Self {
        Self {
            dependency: dependency.into(),
            config: config.clone(),
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                window: VecDeque::with_capacity(config.window),
                opened_at: Instant::now(),
                cool_down: Duration::from_millis(config.cool_down_ms),
                probe_in_flight: false,
            }),
        }
    }

    /// Check whether a call may proceed.
    ///
    /// An open breaker whose cool-down has elapsed transitions to half-open
    /// here and admits the caller as the probe.
    pub fn check(&self) -> Result<(), BreakerError> {
        if !self.config.enabled {
            return Ok(());
        }

        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.opened_at.elapsed();
                if elapsed >= inner.cool_down {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(
                        dependency = %self.dependency,
                        "circuit breaker half-open, admitting probe"
                    );
                    metrics::record_breaker_state(&self.dependency, "half_open");
                    Ok(())
                } else {
                    Err(BreakerError::Open {
                        dependency: self.dependency.clone(),
                        retry_after: inner.cool_down - elapsed,
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    // Another caller holds the probe slot.
                    Err(BreakerError::Open {
                        dependency: self.dependency.clone(),
                        retry_after: Duration::from_millis(0),
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record the outcome of a call admitted by [`check`](Self::check).
    pub fn record(&self, outcome: CallOutcome) {
        if !self.config.enabled {
            return;
        }

        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.window.push_back(outcome.failure_weight());
                while inner.window.len() > self.config.window {
                    inner.window.pop_front();
                }

                let weight: f64 = inner.window.iter().sum();
                let tripped = weight >= self.config.failure_threshold as f64
                    || (inner.window.len() >= self.config.window
                        && weight / inner.window.len() as f64 >= self.config.failure_rate);
                if tripped {
                    self.open(&mut inner, false);
                } else {
                    debug!(
                        dependency = %self.dependency,
                        failure_weight = weight,
                        window = inner.window.len(),
                        "circuit breaker outcome recorded"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                match outcome {
                    CallOutcome::Success => {
                        inner.state = BreakerState::Closed;
                        inner.window.clear();
                        inner.cool_down = Duration::from_millis(self.config.cool_down_ms);
                        info!(
                            dependency = %self.dependency,
                            "circuit breaker closed after successful probe"
                        );
                        metrics::record_breaker_state(&self.dependency, "closed");
                    }
                    CallOutcome::Failure | CallOutcome::RateLimited => {
                        self.open(&mut inner, true);
                    }
                }
            }
            // Late outcome from a call admitted before the circuit opened.
            BreakerState::Open => {}
        }
    }

    fn open(&self, inner: &mut BreakerInner, double_cool_down: bool) {
        if double_cool_down {
            let doubled = inner.cool_down.saturating_mul(2);
            inner.cool_down = doubled.min(Duration::from_millis(self.config.max_cool_down_ms));
        }
        inner.state = BreakerState::Open;
        inner.opened_at = Instant::now();
        inner.window.clear();
        inner.probe_in_flight = false;
        warn!(
            dependency = %self.dependency,
            cool_down_ms = inner.cool_down.as_millis() as u64,
            "circuit breaker opened"
        );
        metrics::record_breaker_state(&self.dependency, "open");
    }

    /// Current state, for stats endpoints and tests.
    pub fn state(&self) -> BreakerState {
        if !self.config.enabled {
            return BreakerState::Closed;
        }
        let inner = self.inner.lock();
        if inner.state == BreakerState::Open && inner.opened_at.elapsed() >= inner.cool_down {
            return BreakerState::HalfOpen;
        }
        inner.state
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }
}

/// Registry of breakers, one per dependency name.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    /// Get or create the breaker for a dependency.
    pub fn get(&self, dependency: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(dependency.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(dependency, &self.config)))
            .clone()
    }

    /// Snapshot of all breaker states.
    pub fn states(&self) -> Vec<(String, BreakerState)> {
        let mut states: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BreakerConfig {
        BreakerConfig {
            enabled: true,
            failure_threshold: 5,
            failure_rate: 0.5,
            window: 20,
            cool_down_ms: 50,
            max_cool_down_ms: 400,
        }
    }

    #[test]
    fn disabled_breaker_never_trips() {
        let config = BreakerConfig {
            enabled: false,
            ..test_config()
        };
        let breaker = CircuitBreaker::new("jira", &config);
        for _ in 0..100 {
            breaker.record(CallOutcome::Failure);
        }
        assert!(breaker.check().is_ok());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn five_consecutive_failures_trip_the_breaker() {
        let breaker = CircuitBreaker::new("jira", &test_config());
        for _ in 0..4 {
            breaker.record(CallOutcome::Failure);
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
        breaker.record(CallOutcome::Failure);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.check().is_err());
    }

    #[test]
    fn rate_limits_count_half() {
        let breaker = CircuitBreaker::new("jira", &test_config());
        // Nine 429s weigh 4.5, still under the absolute threshold.
        for _ in 0..9 {
            breaker.record(CallOutcome::RateLimited);
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record(CallOutcome::RateLimited);
        // Ten 429s weigh 5.0 and trip.
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn failure_rate_over_full_window_trips() {
        let config = BreakerConfig {
            failure_threshold: 100, // out of reach, isolate the rate arm
            ..test_config()
        };
        let breaker = CircuitBreaker::new("jira", &config);
        // Alternate: 10 failures over a 20-call window is exactly 50%.
        for _ in 0..10 {
            breaker.record(CallOutcome::Success);
            breaker.record(CallOutcome::Failure);
        }
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn rate_arm_needs_a_full_window() {
        let config = BreakerConfig {
            failure_threshold: 100,
            ..test_config()
        };
        let breaker = CircuitBreaker::new("jira", &config);
        breaker.record(CallOutcome::Failure);
        breaker.record(CallOutcome::Success);
        // 50% of two calls must not trip.
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn successes_age_failures_out_of_the_window() {
        let breaker = CircuitBreaker::new("jira", &test_config());
        for _ in 0..4 {
            breaker.record(CallOutcome::Failure);
        }
        // Push the window full of successes; the old failures fall out.
        for _ in 0..20 {
            breaker.record(CallOutcome::Success);
        }
        breaker.record(CallOutcome::Failure);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn open_breaker_admits_single_probe_after_cool_down() {
        let breaker = CircuitBreaker::new("jira", &test_config());
        for _ in 0..5 {
            breaker.record(CallOutcome::Failure);
        }
        assert!(breaker.check().is_err());

        std::thread::sleep(Duration::from_millis(60));

        // First caller becomes the probe, second is rejected.
        assert!(breaker.check().is_ok());
        assert!(breaker.check().is_err());

        breaker.record(CallOutcome::Success);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn failed_probe_doubles_cool_down_up_to_cap() {
        let breaker = CircuitBreaker::new("jira", &test_config());
        for _ in 0..5 {
            breaker.record(CallOutcome::Failure);
        }

        let mut expected_cool_down = 50u64;
        for _ in 0..5 {
            std::thread::sleep(Duration::from_millis(expected_cool_down + 10));
            assert!(breaker.check().is_ok(), "probe should be admitted");
            breaker.record(CallOutcome::Failure);
            expected_cool_down = (expected_cool_down * 2).min(400);
            let inner_cool_down = breaker.inner.lock().cool_down;
            assert_eq!(inner_cool_down.as_millis() as u64, expected_cool_down);
        }
    }

    #[test]
    fn registry_hands_out_one_breaker_per_dependency() {
        let registry = BreakerRegistry::new(test_config());
        let a = registry.get("jira");
        let b = registry.get("jira");
        assert!(Arc::ptr_eq(&a, &b));
        let c = registry.get("llm");
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.states().len(), 2);
    }
}
