//! Self-healing: automated corrective actions for recognized errors.
//!
//! The [`SelfHealingSystem`] matches an error against a priority-ordered
//! registry of strategies, runs the first matching action and re-invokes the
//! original operation to verify the heal. Attempts are capped per error
//! signature.

mod strategy;

pub use strategy::{
    default_strategies, BackoffHealing, ErrorMatcher, FnHealing, HealingAction, HealingStrategy,
    StrategyDescriptor,
};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use resilience_types::{ErrorContext, ErrorSignature, SystemError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::SelfHealingConfig;

/// Attempt bookkeeping for one error signature.
#[derive(Debug, Clone)]
pub struct HealingAttemptRecord {
    pub signature: ErrorSignature,

    /// Attempts made in the current window.
    pub attempts: u32,

    /// Start of the current window.
    pub window_started: Instant,

    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl HealingAttemptRecord {
    fn new(signature: ErrorSignature) -> Self {
        Self {
            signature,
            attempts: 0,
            window_started: Instant::now(),
            last_attempt_at: None,
        }
    }

    fn window_elapsed(&self, window: Duration) -> bool {
        self.window_started.elapsed() >= window
    }
}

/// Outcome of a single healing pass.
#[derive(Debug, Clone)]
pub enum HealingOutcome {
    /// Action ran and the original operation succeeded afterwards.
    Healed {
        strategy: String,
        attempt: u32,
        value: Value,
    },

    /// No registered strategy matches the error.
    NoStrategy,

    /// Attempt budget for the signature is used up.
    Exhausted { signature: ErrorSignature },

    /// The healing action itself failed.
    ActionFailed { strategy: String, error: SystemError },

    /// The action ran but the original operation still fails.
    VerificationFailed { strategy: String, error: SystemError },
}

impl HealingOutcome {
    /// Whether the heal was verified.
    pub fn is_healed(&self) -> bool {
        matches!(self, HealingOutcome::Healed { .. })
    }

    /// Whether a healing action was invoked.
    pub fn attempted(&self) -> bool {
        matches!(
            self,
            HealingOutcome::Healed { .. }
                | HealingOutcome::ActionFailed { .. }
                | HealingOutcome::VerificationFailed { .. }
        )
    }

    /// Verified value, if healed.
    pub fn into_value(self) -> Option<Value> {
        match self {
            HealingOutcome::Healed { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// Self-healing statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingStats {
    pub registered_strategies: usize,

    /// Signatures with attempts inside the current window.
    pub active_attempts: usize,

    pub max_attempts: u32,

    /// Signatures whose budget is used up.
    pub exhausted_signatures: usize,

    /// Healing actions invoked.
    pub total_heals: u64,

    /// Heals verified by a successful re-invocation.
    pub successful_heals: u64,
}

/// Matches errors to corrective actions and verifies the result.
pub struct SelfHealingSystem {
    /// Configuration.
    config: SelfHealingConfig,

    /// Priority-sorted strategies; replaced wholesale on registration.
    strategies: RwLock<Arc<Vec<HealingStrategy>>>,

    /// Attempt records per error signature.
    attempts: DashMap<ErrorSignature, HealingAttemptRecord>,

    total_heals: AtomicU64,
    successful_heals: AtomicU64,
}

impl SelfHealingSystem {
    /// Create a healing system, installing the built-in strategies when
    /// `config.install_defaults` is set.
    pub fn new(config: SelfHealingConfig) -> Self {
        let strategies = if config.install_defaults {
            default_strategies(&config)
        } else {
            Vec::new()
        };

        let system = Self {
            config,
            strategies: RwLock::new(Arc::new(Vec::new())),
            attempts: DashMap::new(),
            total_heals: AtomicU64::new(0),
            successful_heals: AtomicU64::new(0),
        };
        for strategy in strategies {
            system.register_strategy(strategy);
        }
        system
    }

    /// Attempt cap per error signature.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Add a strategy. Ordering is by ascending priority, registration order
    /// breaking ties. A strategy with the same name replaces the old one.
    pub fn register_strategy(&self, strategy: HealingStrategy) {
        let mut guard = self
            .strategies
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let mut next: Vec<HealingStrategy> = guard
            .iter()
            .filter(|s| s.name() != strategy.name())
            .cloned()
            .collect();
        debug!(strategy = strategy.name(), priority = strategy.priority(), "Registering healing strategy");
        next.push(strategy);
        next.sort_by_key(|s| s.priority());
        *guard = Arc::new(next);
    }

    /// Remove a strategy by name. Returns whether one was removed.
    pub fn remove_strategy(&self, name: &str) -> bool {
        let mut guard = self
            .strategies
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = guard.len();
        let next: Vec<HealingStrategy> = guard.iter().filter(|s| s.name() != name).cloned().collect();
        let removed = next.len() != before;
        *guard = Arc::new(next);
        removed
    }

    fn snapshot(&self) -> Arc<Vec<HealingStrategy>> {
        self.strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Registered strategies in evaluation order.
    pub fn strategies(&self) -> Vec<StrategyDescriptor> {
        self.snapshot().iter().map(|s| s.descriptor()).collect()
    }

    /// Try to heal `error`; true only when the heal was verified.
    pub async fn handle_error(&self, error: &SystemError, context: &ErrorContext) -> bool {
        self.heal(error, context).await.is_healed()
    }

    /// Full healing pass, returning the verified value on success.
    #[instrument(skip(self, error, context), fields(code = error.code(), component = error.component()))]
    pub async fn heal(&self, error: &SystemError, context: &ErrorContext) -> HealingOutcome {
        let strategies = self.snapshot();
        let Some(strategy) = strategies.iter().find(|s| s.matches(error)) else {
            debug!("No healing strategy matches");
            return HealingOutcome::NoStrategy;
        };

        let signature = error.signature();
        let Some(attempt) = self.reserve_attempt(&signature) else {
            warn!(
                signature = %signature,
                max_attempts = self.config.max_attempts,
                "Healing attempts exhausted"
            );
            return HealingOutcome::Exhausted { signature };
        };

        self.total_heals.fetch_add(1, Ordering::Relaxed);
        info!(
            strategy = strategy.name(),
            signature = %signature,
            attempt = attempt,
            "Executing healing action"
        );

        let action_result = if context.deadline_exceeded() {
            Err(SystemError::deadline_exceeded(context.component()))
        } else {
            let budget = context.attempt_budget();
            match tokio::time::timeout(budget, strategy.action().heal(error, context)).await {
                Ok(result) => result,
                Err(_) => Err(SystemError::timeout(
                    context.component(),
                    budget.as_millis() as u64,
                )),
            }
        };

        if let Err(action_error) = action_result {
            warn!(strategy = strategy.name(), error = %action_error, "Healing action failed");
            return HealingOutcome::ActionFailed {
                strategy: strategy.name().to_string(),
                error: action_error,
            };
        }

        match context.invoke_original().await {
            Ok(value) => {
                self.successful_heals.fetch_add(1, Ordering::Relaxed);
                info!(strategy = strategy.name(), signature = %signature, "Heal verified");
                HealingOutcome::Healed {
                    strategy: strategy.name().to_string(),
                    attempt,
                    value,
                }
            }
            Err(verify_error) => {
                debug!(strategy = strategy.name(), error = %verify_error, "Heal verification failed");
                HealingOutcome::VerificationFailed {
                    strategy: strategy.name().to_string(),
                    error: verify_error,
                }
            }
        }
    }

    /// Atomically take one attempt from the signature's budget.
    fn reserve_attempt(&self, signature: &ErrorSignature) -> Option<u32> {
        let mut record = self
            .attempts
            .entry(signature.clone())
            .or_insert_with(|| HealingAttemptRecord::new(signature.clone()));

        if record.attempts > 0 && record.window_elapsed(self.config.attempt_window) {
            debug!(signature = %signature, "Healing window elapsed, budget restored");
            record.attempts = 0;
        }

        if record.attempts >= self.config.max_attempts {
            return None;
        }

        if record.attempts == 0 {
            record.window_started = Instant::now();
        }
        record.attempts += 1;
        record.last_attempt_at = Some(Utc::now());
        Some(record.attempts)
    }

    /// Attempt record for a signature.
    pub fn attempt_record(&self, signature: &ErrorSignature) -> Option<HealingAttemptRecord> {
        self.attempts.get(signature).map(|r| r.clone())
    }

    /// Clear every attempt counter.
    pub fn reset_healing_attempts(&self) {
        self.attempts.clear();
        info!("Healing attempt counters reset");
    }

    /// Clear the attempt counter of one signature.
    pub fn reset_signature(&self, signature: &ErrorSignature) {
        self.attempts.remove(signature);
    }

    /// Signatures whose budget is used up and whose window is still running.
    pub fn exhausted_signatures(&self) -> Vec<ErrorSignature> {
        let mut exhausted: Vec<ErrorSignature> = self
            .attempts
            .iter()
            .filter(|r| {
                r.attempts >= self.config.max_attempts
                    && !r.window_elapsed(self.config.attempt_window)
            })
            .map(|r| r.signature.clone())
            .collect();
        exhausted.sort();
        exhausted
    }

    /// Registry and attempt statistics.
    pub fn stats(&self) -> HealingStats {
        let active_attempts = self
            .attempts
            .iter()
            .filter(|r| r.attempts > 0 && !r.window_elapsed(self.config.attempt_window))
            .count();

        HealingStats {
            registered_strategies: self.snapshot().len(),
            active_attempts,
            max_attempts: self.config.max_attempts,
            exhausted_signatures: self.exhausted_signatures().len(),
            total_heals: self.total_heals.load(Ordering::Relaxed),
            successful_heals: self.successful_heals.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resilience_types::{codes, Operation};
    use std::sync::atomic::AtomicU32;

    fn config(max_attempts: u32) -> SelfHealingConfig {
        SelfHealingConfig {
            max_attempts,
            attempt_window: Duration::from_secs(60),
            install_defaults: false,
            ..SelfHealingConfig::default()
        }
    }

    fn counting_strategy(name: &str, priority: u32, counter: Arc<AtomicU32>) -> HealingStrategy {
        HealingStrategy::new(
            name,
            priority,
            ErrorMatcher::code_and_component(codes::CONNECTION_RESET, "database"),
            FnHealing::new("reconnect", move |_err, _ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
    }

    fn db_error() -> SystemError {
        SystemError::new(codes::CONNECTION_RESET, "connection reset").with_component("database")
    }

    fn ok_context() -> ErrorContext {
        ErrorContext::new("database", "load_profile")
            .with_original_operation(Operation::constant(Value::from("row")))
    }

    #[tokio::test]
    async fn test_heal_verified() {
        let actions = Arc::new(AtomicU32::new(0));
        let system = SelfHealingSystem::new(config(3));
        system.register_strategy(counting_strategy("reconnect", 1, actions.clone()));

        let outcome = system.heal(&db_error(), &ok_context()).await;
        assert!(outcome.is_healed());
        assert_eq!(outcome.into_value(), Some(Value::from("row")));
        assert_eq!(actions.load(Ordering::SeqCst), 1);
        assert_eq!(system.stats().successful_heals, 1);
    }

    #[tokio::test]
    async fn test_verification_failure_is_not_healed() {
        let actions = Arc::new(AtomicU32::new(0));
        let system = SelfHealingSystem::new(config(3));
        system.register_strategy(counting_strategy("reconnect", 1, actions.clone()));

        let ctx = ErrorContext::new("database", "load_profile").with_original_operation(
            Operation::new(|| async { Err(SystemError::new(codes::CONNECTION_RESET, "still down")) }),
        );

        assert!(!system.handle_error(&db_error(), &ctx).await);
        assert_eq!(actions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_matching_strategy_consumes_nothing() {
        let system = SelfHealingSystem::new(config(1));
        let err = SystemError::new("UNMAPPED", "nothing knows this").with_component("voice");

        let outcome = system.heal(&err, &ok_context()).await;
        assert!(matches!(outcome, HealingOutcome::NoStrategy));
        assert!(system.attempt_record(&err.signature()).is_none());
    }

    #[tokio::test]
    async fn test_first_matching_strategy_by_priority() {
        let low = Arc::new(AtomicU32::new(0));
        let high = Arc::new(AtomicU32::new(0));
        let system = SelfHealingSystem::new(config(3));
        system.register_strategy(counting_strategy("later", 20, low.clone()));
        system.register_strategy(counting_strategy("first", 10, high.clone()));

        assert_eq!(system.strategies()[0].name, "first");
        assert!(system.handle_error(&db_error(), &ok_context()).await);
        assert_eq!(high.load(Ordering::SeqCst), 1);
        assert_eq!(low.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_restores_budget() {
        let actions = Arc::new(AtomicU32::new(0));
        let system = SelfHealingSystem::new(config(1));
        system.register_strategy(counting_strategy("reconnect", 1, actions.clone()));

        assert!(system.handle_error(&db_error(), &ok_context()).await);
        assert!(!system.handle_error(&db_error(), &ok_context()).await);
        assert_eq!(system.exhausted_signatures(), vec![db_error().signature()]);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(system.exhausted_signatures().is_empty());
        assert!(system.handle_error(&db_error(), &ok_context()).await);
        assert_eq!(actions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_identical_errors_respect_cap() {
        let actions = Arc::new(AtomicU32::new(0));
        let system = Arc::new(SelfHealingSystem::new(config(3)));
        system.register_strategy(counting_strategy("reconnect", 1, actions.clone()));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let system = system.clone();
            handles.push(tokio::spawn(async move {
                system.handle_error(&db_error(), &ok_context()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(actions.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_defaults_installed() {
        let system = SelfHealingSystem::new(SelfHealingConfig::default());
        let names: Vec<String> = system.strategies().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["transient_network", "rate_limit", "service_unavailable"]);
        assert!(system.remove_strategy("rate_limit"));
        assert_eq!(system.stats().registered_strategies, 2);
    }
}
