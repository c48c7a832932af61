//! # Resilience Core - Fault Tolerance for Fallible Operations
//!
//! This crate protects fallible operations (database calls, AI model and
//! voice provider calls, network requests) from cascading failure.
//!
//! ## Overview
//!
//! A failed operation passes through layered recovery:
//!
//! - **Circuit breaking**: a failing dependency is cut off for a cooldown
//!   instead of being hammered
//! - **Self-healing**: recognized errors trigger a corrective action,
//!   verified by re-invoking the operation
//! - **Breaker-guarded retries**: exponential backoff bounded by the caller's
//!   deadline
//! - **Fallbacks**: priority-ordered alternates per operation type (cached
//!   response, canned response, secondary provider)
//!
//! An [`ErrorPredictor`] scores failure risk from load and health telemetry.
//!
//! ## Key Components
//!
//! - [`ResilienceManager`]: façade and owner of every keyed store
//! - [`CircuitBreaker`] and [`CircuitBreakerRegistry`]: per-operation breakers
//! - [`SelfHealingSystem`]: matcher + action registry with capped attempts
//! - [`IntelligentFallbackSystem`]: fallback chains per operation type
//! - [`RecoveryOrchestrator`]: the per-error recovery state machine
//! - [`ErrorPredictor`]: bucketed, decaying error patterns
//!
//! ## Example
//!
//! ```rust,no_run
//! use resilience_core::{
//!     ContextHints, DeploymentProfile, FallbackStrategy, ResilienceManager,
//!     StaticResponseFallback,
//! };
//! use resilience_types::{Operation, SystemError};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), resilience_core::ResilienceError> {
//! let manager = ResilienceManager::for_profile(DeploymentProfile::Production)?;
//!
//! manager.register_fallback_strategy(FallbackStrategy::new(
//!     "canned_problem",
//!     "ai_tutoring",
//!     10,
//!     StaticResponseFallback::new(json!("Let's work on a practice problem together.")),
//! ))?;
//!
//! let ask_model = Operation::new(|| async {
//!     Err(SystemError::new("MODEL_DOWN", "provider unavailable"))
//! });
//!
//! let answer = manager
//!     .execute_with_resilience(
//!         ask_model,
//!         "tutor.ask",
//!         ContextHints::new().operation_type("ai_tutoring"),
//!     )
//!     .await?;
//! println!("answer: {}", answer);
//! println!("health: {}", manager.resilience_health().overall);
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Semantics
//!
//! Callers observe either a (possibly degraded) value or exactly one of
//! [`ResilienceError::CircuitOpen`], [`ResilienceError::FallbackExhausted`]
//! or the original [`SystemError`](resilience_types::SystemError). Errors
//! marked non-recoverable skip healing and fallbacks entirely.

#![cfg_attr(feature = "strict-docs", warn(missing_docs))]

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod events;
pub mod fallback;
pub mod healing;
pub mod health;
pub mod manager;
pub mod orchestrator;
pub mod predictor;
pub mod recovery;

// Re-export main types
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerMetrics, CircuitBreakerRegistry, CircuitState,
};
pub use config::{
    CircuitBreakerConfig, DeploymentProfile, FallbackConfig, PatternConfig, PredictorConfig,
    RecoveryConfig, ResilienceConfig, RiskThresholds, RiskWeights, SelfHealingConfig,
};
pub use error::{ResilienceError, ResilienceResult};
pub use events::ResilienceEvent;
pub use fallback::{
    CachedResponseFallback, FallbackExecutor, FallbackResponse, FallbackStats, FallbackStrategy,
    FnFallback, IntelligentFallbackSystem, ResponseCache, StaticResponseFallback,
};
pub use healing::{
    BackoffHealing, ErrorMatcher, FnHealing, HealingAction, HealingOutcome, HealingStats,
    HealingStrategy, SelfHealingSystem,
};
pub use health::{HealthStatus, ResilienceHealth, SubsystemHealth};
pub use manager::{ComprehensiveMetrics, ContextHints, ResilienceManager};
pub use orchestrator::{RecoveryMetrics, RecoveryOrchestrator};
pub use predictor::{
    ErrorPredictor, PredictionContext, PredictionResult, PreventativeAction, RiskLevel,
};
pub use recovery::{RecoveryResult, RecoveryStatus, RecoveryStep, RecoverySummary};

#[cfg(test)]
mod tests {
    use super::*;
    use resilience_types::{ErrorContext, SystemError};

    #[test]
    fn test_profile_config() {
        let dev = ResilienceManager::for_profile(DeploymentProfile::Development).unwrap();
        let critical = ResilienceManager::for_profile(DeploymentProfile::Critical).unwrap();

        // Development tolerates more failures before opening
        assert!(
            dev.config().circuit_breaker.failure_threshold
                > critical.config().circuit_breaker.failure_threshold
        );
        assert_eq!(critical.config().recovery.max_retries, 0);
    }

    #[tokio::test]
    async fn test_manager_integration() {
        let manager = ResilienceManager::new(ResilienceConfig::default()).unwrap();

        let error = SystemError::new("QUOTA", "quota exceeded").with_component("voice");
        let context = ErrorContext::new("voice", "synthesize");
        let result = manager.recover_from_error(&error, &context).await;
        assert_eq!(result.status, RecoveryStatus::Failed);

        let metrics = manager.comprehensive_metrics();
        assert_eq!(metrics.orchestrator.total, 1);
        assert_eq!(metrics.orchestrator.failed, 1);
        assert_eq!(manager.breakers().len(), 1);
    }
}
