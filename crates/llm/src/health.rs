//! Per-model circuit breaker
//!
//! Consecutive failures open a model's circuit for a cooling period. After
//! it elapses, a single trial call is let through (half-open); its outcome
//! closes or re-opens the circuit.

use askforge_common::config::HealthPolicyConfig;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct ModelHealth {
    state: CircuitState,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    trial_in_flight: bool,
}

impl Default for ModelHealth {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            open_until: None,
            trial_in_flight: false,
        }
    }
}

/// Thread-safe health registry keyed by model id
#[derive(Debug)]
pub struct ModelHealthStore {
    failure_threshold: u32,
    open_duration: Duration,
    models: Mutex<HashMap<String, ModelHealth>>,
}

impl ModelHealthStore {
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            open_duration,
            models: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &HealthPolicyConfig) -> Self {
        Self::new(
            config.failure_threshold,
            Duration::from_secs(config.open_duration_secs),
        )
    }

    fn with_models<R>(&self, f: impl FnOnce(&mut HashMap<String, ModelHealth>) -> R) -> R {
        let mut guard = self.models.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Gate for a call that is about to be made.
    ///
    /// Moving an expired open circuit to half-open claims the single trial
    /// slot, so this has side effects: only call it right before calling
    /// the model.
    pub fn allow_call(&self, model_id: &str) -> bool {
        let now = Instant::now();
        self.with_models(|models| {
            let health = models.entry(model_id.to_string()).or_default();
            match health.state {
                CircuitState::Closed => true,
                CircuitState::Open => match health.open_until {
                    Some(until) if now < until => false,
                    _ => {
                        health.state = CircuitState::HalfOpen;
                        health.trial_in_flight = true;
                        info!(model = model_id, "Circuit half-open, allowing trial call");
                        true
                    }
                },
                CircuitState::HalfOpen => {
                    if health.trial_in_flight {
                        false
                    } else {
                        health.trial_in_flight = true;
                        true
                    }
                }
            }
        })
    }

    pub fn mark_success(&self, model_id: &str) {
        self.with_models(|models| {
            let health = models.entry(model_id.to_string()).or_default();
            if health.state != CircuitState::Closed {
                info!(model = model_id, "Circuit closed");
            }
            *health = ModelHealth::default();
        })
    }

    pub fn mark_failure(&self, model_id: &str) {
        let now = Instant::now();
        self.with_models(|models| {
            let health = models.entry(model_id.to_string()).or_default();
            health.consecutive_failures = health.consecutive_failures.saturating_add(1);
            health.trial_in_flight = false;

            let should_open = match health.state {
                CircuitState::HalfOpen => true,
                CircuitState::Closed => health.consecutive_failures >= self.failure_threshold,
                CircuitState::Open => false,
            };

            if should_open {
                health.state = CircuitState::Open;
                health.open_until = Some(now + self.open_duration);
                warn!(
                    model = model_id,
                    failures = health.consecutive_failures,
                    open_secs = self.open_duration.as_secs(),
                    "Circuit opened"
                );
            }
        })
    }

    /// Side-effect-free check used for ordering candidates
    pub fn is_open(&self, model_id: &str) -> bool {
        let now = Instant::now();
        self.with_models(|models| match models.get(model_id) {
            Some(health) => {
                health.state == CircuitState::Open
                    && health.open_until.map(|until| now < until).unwrap_or(false)
            }
            None => false,
        })
    }

    pub fn state(&self, model_id: &str) -> CircuitState {
        self.with_models(|models| {
            models
                .get(model_id)
                .map(|h| h.state)
                .unwrap_or(CircuitState::Closed)
        })
    }
}

impl Default for ModelHealthStore {
    fn default() -> Self {
        Self::from_config(&HealthPolicyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let store = ModelHealthStore::new(2, Duration::from_secs(30));
        store.mark_failure("a");
        assert_eq!(store.state("a"), CircuitState::Closed);
        assert!(store.allow_call("a"));

        store.mark_failure("a");
        assert_eq!(store.state("a"), CircuitState::Open);
        assert!(store.is_open("a"));
        assert!(!store.allow_call("a"));
    }

    #[test]
    fn test_success_resets_failures() {
        let store = ModelHealthStore::new(2, Duration::from_secs(30));
        store.mark_failure("a");
        store.mark_success("a");
        store.mark_failure("a");
        assert_eq!(store.state("a"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_allows_single_trial() {
        let store = ModelHealthStore::new(1, Duration::ZERO);
        store.mark_failure("a");
        assert_eq!(store.state("a"), CircuitState::Open);
        assert!(!store.is_open("a"));

        assert!(store.allow_call("a"));
        assert_eq!(store.state("a"), CircuitState::HalfOpen);
        assert!(!store.allow_call("a"));

        store.mark_success("a");
        assert_eq!(store.state("a"), CircuitState::Closed);
        assert!(store.allow_call("a"));
    }

    #[test]
    fn test_failed_trial_reopens() {
        let store = ModelHealthStore::new(3, Duration::ZERO);
        for _ in 0..3 {
            store.mark_failure("a");
        }
        assert!(store.allow_call("a"));
        store.mark_failure("a");
        assert_eq!(store.state("a"), CircuitState::Open);
    }

    #[test]
    fn test_unknown_model_is_healthy() {
        let store = ModelHealthStore::default();
        assert!(!store.is_open("unknown"));
        assert!(store.allow_call("unknown"));
    }
}
