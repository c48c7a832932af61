//! Circuit breaker pattern for resilience.
//!
//! Prevents cascading failures by tracking consecutive failures per
//! protected operation and temporarily rejecting calls to a known-bad
//! dependency.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use resilience_types::{OperationResult, SystemError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{ResilienceError, ResilienceResult};

/// Outcomes kept for the availability window, per breaker.
const MAX_WINDOW_SAMPLES: usize = 10_000;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally.
    Closed,

    /// Circuit is open, requests are rejected.
    Open,

    /// Circuit is probing whether the dependency recovered.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Mutable breaker state; only touched under the breaker's own mutex.
struct BreakerInner {
    state: CircuitState,

    /// Bumped on every transition. Outcomes of calls admitted under an
    /// older generation never drive the state machine.
    generation: u64,

    /// Consecutive failures in the current generation.
    failure_count: u32,

    last_failure_at: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    closed_since: Option<Instant>,
    half_open_in_flight: u32,
    last_transition: DateTime<Utc>,

    /// (completed_at, success) samples inside the monitor window.
    outcomes: VecDeque<(Instant, bool)>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            generation: 0,
            failure_count: 0,
            last_failure_at: None,
            opened_at: None,
            closed_since: Some(Instant::now()),
            half_open_in_flight: 0,
            last_transition: Utc::now(),
            outcomes: VecDeque::new(),
        }
    }
}

/// Circuit breaker for a single protected operation key.
///
/// Transitions:
/// - Closed: calls flow; `failure_threshold` consecutive failures open it
/// - Open: calls rejected without invoking the operation until `reset_timeout`
/// - Half-Open: up to `half_open_max_calls` concurrent probes; the first
///   success closes, any probe failure re-opens
pub struct CircuitBreaker {
    /// Key of the operation this breaker protects.
    key: String,

    /// Configuration.
    config: CircuitBreakerConfig,

    /// State machine.
    inner: Mutex<BreakerInner>,

    total_requests: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new closed circuit breaker.
    pub fn new(key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            key: key.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
            total_requests: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    /// Get the key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Get the configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.check_timeout(&mut inner);
        inner.state
    }

    /// Whether calls are currently rejected.
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Number of consecutive failures currently recorded.
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Run `operation` under the breaker.
    ///
    /// Rejected calls never invoke `operation`. Errors and timeouts count as
    /// failures.
    pub async fn execute<F, Fut>(&self, operation: F) -> ResilienceResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OperationResult>,
    {
        self.execute_within(operation, None).await
    }

    /// Like [`execute`](Self::execute), with the call timeout tightened to
    /// `budget` when one is given.
    pub async fn execute_within<F, Fut>(
        &self,
        operation: F,
        budget: Option<Duration>,
    ) -> ResilienceResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OperationResult>,
    {
        let admission = self.try_acquire()?;

        let limit = match budget {
            Some(budget) => budget.min(self.config.call_timeout),
            None => self.config.call_timeout,
        };

        let result = match tokio::time::timeout(limit, operation()).await {
            Ok(result) => result,
            Err(_) => Err(SystemError::timeout(&self.key, limit.as_millis() as u64)),
        };

        match result {
            Ok(value) => {
                admission.succeed();
                Ok(value)
            }
            Err(err) => {
                debug!(key = %self.key, code = err.code(), "Protected call failed");
                admission.fail();
                Err(ResilienceError::System(err))
            }
        }
    }

    /// Ask for permission to make a call.
    ///
    /// The returned permit must be settled with `succeed` or `fail`; dropping
    /// it unsettled releases any half-open probe slot without recording an
    /// outcome.
    pub fn try_acquire(&self) -> ResilienceResult<CallPermit<'_>> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.lock();
        self.check_timeout(&mut inner);

        let state = inner.state;
        match state {
            CircuitState::Closed => Ok(CallPermit::new(self, inner.generation, false)),
            CircuitState::Open => {
                drop(inner);
                self.reject()
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_calls {
                    inner.half_open_in_flight += 1;
                    debug!(
                        key = %self.key,
                        in_flight = inner.half_open_in_flight,
                        "Admitting half-open probe"
                    );
                    Ok(CallPermit::new(self, inner.generation, true))
                } else {
                    drop(inner);
                    self.reject()
                }
            }
        }
    }

    fn reject<'a>(&self) -> ResilienceResult<CallPermit<'a>> {
        self.total_rejections.fetch_add(1, Ordering::Relaxed);
        debug!(key = %self.key, "Circuit breaker rejected call");
        Err(ResilienceError::circuit_open(&self.key))
    }

    fn record_success(&self, generation: u64, probe: bool) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.lock();
        self.push_outcome(&mut inner, true);

        if inner.generation != generation {
            return;
        }

        let state = inner.state;
        match state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen if probe => {
                info!(key = %self.key, "Circuit breaker closing after successful probe");
                self.transition_to(&mut inner, CircuitState::Closed);
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                debug!(key = %self.key, state = %state, "Success ignored in current state");
            }
        }
    }

    fn record_failure(&self, generation: u64, probe: bool) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.lock();
        self.push_outcome(&mut inner, false);
        inner.last_failure_at = Some(Utc::now());

        if inner.generation != generation {
            return;
        }

        let state = inner.state;
        match state {
            CircuitState::Closed => {
                inner.failure_count += 1;

                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        key = %self.key,
                        failures = inner.failure_count,
                        "Circuit breaker opening due to failures"
                    );
                    self.transition_to(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen if probe => {
                inner.failure_count += 1;
                warn!(key = %self.key, "Circuit breaker re-opening after probe failure");
                self.transition_to(&mut inner, CircuitState::Open);
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn release_probe(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation == generation && inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Force the circuit to a specific state.
    pub fn force_state(&self, new_state: CircuitState) {
        let mut inner = self.lock();
        info!(
            key = %self.key,
            old_state = %inner.state,
            new_state = %new_state,
            "Circuit breaker state forced"
        );
        self.transition_to(&mut inner, new_state);
    }

    /// Operational override: open the circuit now.
    pub fn force_open(&self) {
        self.force_state(CircuitState::Open);
    }

    /// Reset to closed with zero recorded failures.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let generation = inner.generation + 1;
        *inner = BreakerInner::new();
        inner.generation = generation;
        drop(inner);

        self.total_requests.store(0, Ordering::Relaxed);
        self.total_successes.store(0, Ordering::Relaxed);
        self.total_failures.store(0, Ordering::Relaxed);
        self.total_rejections.store(0, Ordering::Relaxed);
        info!(key = %self.key, "Circuit breaker reset");
    }

    /// Get circuit breaker metrics.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut inner = self.lock();
        self.check_timeout(&mut inner);
        self.prune_window(&mut inner, Instant::now());

        let window_total = inner.outcomes.len();
        let window_successes = inner.outcomes.iter().filter(|(_, ok)| *ok).count();
        let availability = if window_total == 0 {
            1.0
        } else {
            window_successes as f64 / window_total as f64
        };

        let uptime_ms = match (inner.state, inner.closed_since) {
            (CircuitState::Closed, Some(since)) => since.elapsed().as_millis() as u64,
            _ => 0,
        };

        CircuitBreakerMetrics {
            key: self.key.clone(),
            state: inner.state,
            failures: inner.failure_count,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            uptime_ms,
            availability,
            last_failure_at: inner.last_failure_at,
            last_transition: inner.last_transition,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move from open to half-open once the reset timeout has passed.
    fn check_timeout(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }

        let elapsed = inner
            .opened_at
            .map(|opened| opened.elapsed() >= self.config.reset_timeout)
            .unwrap_or(false);

        if elapsed {
            info!(key = %self.key, "Circuit breaker transitioning to half-open after timeout");
            self.transition_to(inner, CircuitState::HalfOpen);
        }
    }

    /// Transition to a new state, resetting counters as needed.
    fn transition_to(&self, inner: &mut BreakerInner, new_state: CircuitState) {
        inner.state = new_state;
        inner.generation += 1;
        inner.last_transition = Utc::now();
        inner.half_open_in_flight = 0;

        match new_state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.opened_at = None;
                inner.closed_since = Some(Instant::now());
            }
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                inner.closed_since = None;
            }
            CircuitState::HalfOpen => {
                inner.closed_since = None;
            }
        }
    }

    fn push_outcome(&self, inner: &mut BreakerInner, success: bool) {
        let now = Instant::now();
        inner.outcomes.push_back((now, success));
        if inner.outcomes.len() > MAX_WINDOW_SAMPLES {
            inner.outcomes.pop_front();
        }
        self.prune_window(inner, now);
    }

    fn prune_window(&self, inner: &mut BreakerInner, now: Instant) {
        while let Some((at, _)) = inner.outcomes.front() {
            if now.saturating_duration_since(*at) > self.config.monitor_window {
                inner.outcomes.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Permission to make one call through a breaker.
#[must_use = "a permit must be settled with succeed() or fail()"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    probe: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, generation: u64, probe: bool) -> Self {
        Self {
            breaker,
            generation,
            probe,
            settled: false,
        }
    }

    /// Whether this call is a half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Record a successful call.
    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.record_success(self.generation, self.probe);
    }

    /// Record a failed call.
    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.generation, self.probe);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe(self.generation);
        }
    }
}

/// Metrics for a circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Breaker key.
    pub key: String,

    /// Current state.
    pub state: CircuitState,

    /// Consecutive failures currently recorded.
    pub failures: u32,

    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,

    /// Milliseconds since the breaker last closed; zero when not closed.
    pub uptime_ms: u64,

    /// Successes / completed calls within the monitor window (1.0 when idle).
    pub availability: f64,

    pub last_failure_at: Option<DateTime<Utc>>,

    /// Time of last state transition.
    pub last_transition: DateTime<Utc>,
}

/// Keyed store of breakers, one per protected operation.
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    overrides: DashMap<String, CircuitBreakerConfig>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry using `default_config` for new breakers.
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            overrides: DashMap::new(),
            breakers: DashMap::new(),
        }
    }

    /// Get or lazily create the breaker for `key`.
    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(key) {
            return breaker.clone();
        }

        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(key)
                    .map(|c| c.clone())
                    .unwrap_or_else(|| self.default_config.clone());
                debug!(key = %key, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(key, config))
            })
            .clone()
    }

    /// Breaker for `key` if one was created.
    pub fn existing(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(key).map(|b| b.clone())
    }

    /// Use a dedicated configuration for `key`. Replaces any existing breaker
    /// for the key with a fresh one.
    pub fn configure(&self, key: &str, config: CircuitBreakerConfig) -> ResilienceResult<()> {
        config.validate()?;
        self.overrides.insert(key.to_string(), config.clone());
        self.breakers
            .insert(key.to_string(), Arc::new(CircuitBreaker::new(key, config)));
        Ok(())
    }

    /// Number of breakers created so far.
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Whether no breaker has been created yet.
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Keys of breakers currently open.
    pub fn open_breakers(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .breakers
            .iter()
            .filter(|entry| entry.value().is_open())
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Metrics for every breaker, ordered by key.
    pub fn all_metrics(&self) -> Vec<CircuitBreakerMetrics> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| e.value().clone()).collect();
        let mut metrics: Vec<CircuitBreakerMetrics> =
            breakers.iter().map(|b| b.metrics()).collect();
        metrics.sort_by(|a, b| a.key.cmp(&b.key));
        metrics
    }

    /// Close every breaker and clear its counters.
    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| e.value().clone()).collect();
        for breaker in breakers {
            breaker.reset();
        }
    }
}
