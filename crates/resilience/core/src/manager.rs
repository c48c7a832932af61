//! Resilience manager: the façade owning every keyed store.
//!
//! Hosts build one manager per process (or per tenant) and pass it around
//! explicitly; nothing in this crate is a process global.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use resilience_types::{ErrorContext, Operation, SystemError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerMetrics, CircuitBreakerRegistry, CircuitState,
};
use crate::config::{CircuitBreakerConfig, DeploymentProfile, ResilienceConfig};
use crate::error::{ResilienceError, ResilienceResult};
use crate::events::ResilienceEvent;
use crate::fallback::{FallbackStats, FallbackStrategy, IntelligentFallbackSystem};
use crate::healing::{HealingStats, HealingStrategy, SelfHealingSystem};
use crate::health::{HealthSnapshot, ResilienceHealth};
use crate::orchestrator::{RecoveryMetrics, RecoveryOrchestrator};
use crate::predictor::{ErrorPredictor, PredictionContext, PredictionResult, PredictorStats};
use crate::recovery::RecoveryResult;

/// Optional details a caller supplies with a protected operation.
#[derive(Debug, Clone, Default)]
pub struct ContextHints {
    pub component: Option<String>,

    /// Fallback category, e.g. `ai_tutoring`.
    pub operation_type: Option<String>,

    pub metadata: HashMap<String, String>,
    pub parameters: Value,

    /// Per-attempt timeout; the fallback default applies when absent.
    pub timeout: Option<Duration>,

    pub deadline: Option<Instant>,

    /// Key under which a successful result is cached for fallbacks.
    pub cache_key: Option<String>,

    /// Telemetry at call time; failures are fed to the predictor with it.
    pub telemetry: Option<PredictionContext>,
}

impl ContextHints {
    /// Empty hints.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the component; defaults to the operation name.
    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    /// Set the fallback category.
    pub fn operation_type(mut self, operation_type: impl Into<String>) -> Self {
        self.operation_type = Some(operation_type.into());
        self
    }

    /// Add a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set the operation parameters.
    pub fn parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Set the per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the overall deadline.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the cache key for successful results.
    pub fn cache_key(mut self, cache_key: impl Into<String>) -> Self {
        self.cache_key = Some(cache_key.into());
        self
    }

    /// Attach telemetry for the predictor.
    pub fn telemetry(mut self, telemetry: PredictionContext) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    fn into_context(
        self,
        operation_name: &str,
        operation: &Operation,
        default_timeout: Duration,
    ) -> ErrorContext {
        let component = self
            .component
            .unwrap_or_else(|| operation_name.to_string());
        let mut context = ErrorContext::new(component, operation_name)
            .with_original_operation(operation.clone())
            .with_parameters(self.parameters)
            .with_timeout(self.timeout.unwrap_or(default_timeout));

        if let Some(operation_type) = self.operation_type {
            context = context.with_operation_type(operation_type);
        }
        for (key, value) in self.metadata {
            context = context.with_metadata(key, value);
        }
        if let Some(deadline) = self.deadline {
            context = context.with_deadline(deadline);
        }
        if let Some(cache_key) = self.cache_key {
            context = context.with_cache_key(cache_key);
        }
        context
    }
}

/// Aggregated snapshot across every subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComprehensiveMetrics {
    pub orchestrator: RecoveryMetrics,
    pub circuit_breakers: Vec<CircuitBreakerMetrics>,
    pub self_healing: HealingStats,
    pub fallback: FallbackStats,
    pub predictor: PredictorStats,
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,

    /// successful / total; 1.0 before any operation ran.
    pub success_rate: f64,
}

/// Entry point of the resilience stack.
pub struct ResilienceManager {
    /// Configuration.
    config: ResilienceConfig,

    breakers: Arc<CircuitBreakerRegistry>,
    healing: Arc<SelfHealingSystem>,
    fallback: Arc<IntelligentFallbackSystem>,
    predictor: Arc<ErrorPredictor>,
    orchestrator: RecoveryOrchestrator,

    total_operations: AtomicU64,
    successful_operations: AtomicU64,
    failed_operations: AtomicU64,

    /// Event broadcaster.
    event_tx: broadcast::Sender<ResilienceEvent>,
}

impl ResilienceManager {
    /// Build a manager after validating `config`.
    pub fn new(config: ResilienceConfig) -> ResilienceResult<Self> {
        config.validate()?;

        let (event_tx, _) = broadcast::channel(config.recovery.event_capacity.max(1));
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let healing = Arc::new(SelfHealingSystem::new(config.self_healing.clone()));
        let fallback = Arc::new(IntelligentFallbackSystem::new(config.fallback.clone()));
        let predictor = Arc::new(ErrorPredictor::new(config.predictor.clone()));
        let orchestrator = RecoveryOrchestrator::new(
            config.recovery.clone(),
            breakers.clone(),
            healing.clone(),
            fallback.clone(),
            event_tx.clone(),
        );

        info!(
            failure_threshold = config.circuit_breaker.failure_threshold,
            max_healing_attempts = config.self_healing.max_attempts,
            max_retries = config.recovery.max_retries,
            "Resilience manager initialized"
        );

        Ok(Self {
            config,
            breakers,
            healing,
            fallback,
            predictor,
            orchestrator,
            total_operations: AtomicU64::new(0),
            successful_operations: AtomicU64::new(0),
            failed_operations: AtomicU64::new(0),
            event_tx,
        })
    }

    /// Build a manager with the presets of a deployment profile.
    pub fn for_profile(profile: DeploymentProfile) -> ResilienceResult<Self> {
        Self::new(ResilienceConfig::for_profile(profile))
    }

    /// Get the configuration.
    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Subscribe to resilience events.
    pub fn subscribe(&self) -> broadcast::Receiver<ResilienceEvent> {
        self.event_tx.subscribe()
    }

    /// Run `operation` under the breaker for `operation_name`, recovering
    /// through healing, retries and fallbacks when it fails.
    ///
    /// Callers see a (possibly degraded) value, or exactly one of
    /// `CircuitOpen`, `FallbackExhausted` or the original `SystemError`.
    #[instrument(skip(self, operation, hints), fields(operation = operation_name))]
    pub async fn execute_with_resilience(
        &self,
        operation: Operation,
        operation_name: &str,
        hints: ContextHints,
    ) -> ResilienceResult<Value> {
        self.total_operations.fetch_add(1, Ordering::Relaxed);

        let telemetry = hints.telemetry.clone();
        let context =
            hints.into_context(operation_name, &operation, self.config.fallback.default_timeout);

        if context.deadline_exceeded() {
            self.failed_operations.fetch_add(1, Ordering::Relaxed);
            return Err(SystemError::deadline_exceeded(context.component()).into());
        }

        let breaker = self.breakers.get(operation_name);
        let outcome = breaker
            .execute_within(|| operation.call(), Some(context.attempt_budget()))
            .await;

        let result = match outcome {
            Ok(value) => {
                if let (Some(operation_type), Some(key)) =
                    (context.operation_type(), context.cache_key())
                {
                    self.fallback.cache().put(operation_type, key, value.clone());
                }
                Ok(value)
            }
            Err(rejected @ ResilienceError::CircuitOpen { .. }) => {
                let _ = self.event_tx.send(ResilienceEvent::CircuitRejected {
                    key: operation_name.to_string(),
                });
                Err(rejected)
            }
            Err(ResilienceError::System(error)) => {
                debug!(code = error.code(), "Protected operation failed, starting recovery");
                if let Some(telemetry) = &telemetry {
                    self.predictor.record_error(telemetry, &error);
                }
                self.orchestrator.recover(&error, &context).await.into_result()
            }
            Err(other) => Err(other),
        };

        match &result {
            Ok(_) => self.successful_operations.fetch_add(1, Ordering::Relaxed),
            Err(err) => {
                warn!(kind = err.kind(), error = %err, "Protected operation failed");
                self.failed_operations.fetch_add(1, Ordering::Relaxed)
            }
        };
        result
    }

    /// Orchestrated recovery for an operation that already failed elsewhere.
    pub async fn recover_from_error(
        &self,
        error: &SystemError,
        context: &ErrorContext,
    ) -> RecoveryResult {
        self.orchestrator.recover(error, context).await
    }

    /// Predict error risk for `context`.
    pub fn predict(&self, context: &PredictionContext) -> PredictionResult {
        self.predictor.analyze_and_predict(context)
    }

    /// Register a healing strategy.
    pub fn register_healing_strategy(&self, strategy: HealingStrategy) {
        self.healing.register_strategy(strategy);
    }

    /// Remove a healing strategy by name.
    pub fn remove_healing_strategy(&self, name: &str) -> bool {
        self.healing.remove_strategy(name)
    }

    /// Register a fallback strategy.
    pub fn register_fallback_strategy(&self, strategy: FallbackStrategy) -> ResilienceResult<()> {
        self.fallback.register_strategy(strategy)
    }

    /// Remove a fallback strategy.
    pub fn remove_fallback_strategy(&self, operation_type: &str, name: &str) -> bool {
        self.fallback.remove_strategy(operation_type, name)
    }

    /// Override the breaker configuration of one operation.
    pub fn configure_breaker(&self, key: &str, config: CircuitBreakerConfig) -> ResilienceResult<()> {
        self.breakers.configure(key, config)
    }

    /// Breaker for `key`, created on first use.
    pub fn circuit_breaker(&self, key: &str) -> Arc<CircuitBreaker> {
        self.breakers.get(key)
    }

    /// Get the breaker registry.
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Get the self-healing system.
    pub fn self_healing(&self) -> &SelfHealingSystem {
        &self.healing
    }

    /// Get the fallback system.
    pub fn fallback(&self) -> &IntelligentFallbackSystem {
        &self.fallback
    }

    /// Get the error predictor.
    pub fn predictor(&self) -> &ErrorPredictor {
        &self.predictor
    }

    /// Get the recovery orchestrator.
    pub fn orchestrator(&self) -> &RecoveryOrchestrator {
        &self.orchestrator
    }

    /// Metrics across every subsystem.
    pub fn comprehensive_metrics(&self) -> ComprehensiveMetrics {
        let total_operations = self.total_operations.load(Ordering::Relaxed);
        let successful_operations = self.successful_operations.load(Ordering::Relaxed);

        ComprehensiveMetrics {
            orchestrator: self.orchestrator.metrics(),
            circuit_breakers: self.breakers.all_metrics(),
            self_healing: self.healing.stats(),
            fallback: self.fallback.stats(),
            predictor: self.predictor.stats(),
            total_operations,
            successful_operations,
            failed_operations: self.failed_operations.load(Ordering::Relaxed),
            success_rate: if total_operations == 0 {
                1.0
            } else {
                successful_operations as f64 / total_operations as f64
            },
        }
    }

    /// Assess the health of the resilience layer.
    pub fn resilience_health(&self) -> ResilienceHealth {
        let breaker_metrics = self.breakers.all_metrics();
        let keys_in = |state: CircuitState| -> Vec<String> {
            breaker_metrics
                .iter()
                .filter(|m| m.state == state)
                .map(|m| m.key.clone())
                .collect()
        };
        let recovery = self.orchestrator.metrics();

        ResilienceHealth::assess(&HealthSnapshot {
            open_breakers: keys_in(CircuitState::Open),
            half_open_breakers: keys_in(CircuitState::HalfOpen),
            exhausted_signatures: self.healing.exhausted_signatures(),
            active_recoveries: recovery.active,
            finished_recoveries: recovery.healed
                + recovery.recovered
                + recovery.circuit_open
                + recovery.failed,
            recovery_success_rate: recovery.success_rate,
            fallback_exhaustions: self.fallback.stats().total_exhaustions(),
            last_risk: self.predictor.stats().last_risk,
        })
    }

    /// Return every subsystem to its initial state. Registrations are kept.
    pub fn reset_all(&self) {
        self.breakers.reset_all();
        self.healing.reset_healing_attempts();
        self.predictor.clear_patterns();
        self.fallback.reset_stats();
        self.orchestrator.reset_metrics();
        self.total_operations.store(0, Ordering::Relaxed);
        self.successful_operations.store(0, Ordering::Relaxed);
        self.failed_operations.store(0, Ordering::Relaxed);
        info!("Resilience state reset");
    }
}
