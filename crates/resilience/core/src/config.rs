//! Resilience configuration.
//!
//! Defines thresholds, budgets and timings for every layer of the stack.
//! Configuration is supplied by the host at initialization; nothing here
//! reads the environment.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ResilienceError, ResilienceResult};
use crate::predictor::RiskLevel;

/// Deployment profile used to pick configuration presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentProfile {
    /// Local development: relaxed thresholds, short waits.
    Development,
    /// Regular production traffic.
    Production,
    /// User-facing, latency-critical paths (live voice sessions).
    Critical,
}

/// Top-level configuration for the resilience stack.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Default circuit breaker configuration, applied to every new key.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Self-healing configuration.
    pub self_healing: SelfHealingConfig,

    /// Fallback configuration.
    pub fallback: FallbackConfig,

    /// Error predictor configuration.
    pub predictor: PredictorConfig,

    /// Recovery orchestration configuration.
    pub recovery: RecoveryConfig,
}

impl ResilienceConfig {
    /// Create config tuned for a deployment profile.
    pub fn for_profile(profile: DeploymentProfile) -> Self {
        let mut config = Self::default();

        match profile {
            DeploymentProfile::Development => {
                config.circuit_breaker.failure_threshold = 10;
                config.circuit_breaker.reset_timeout = Duration::from_secs(5);
                config.self_healing.max_attempts = 10;
                config.recovery.base_delay = Duration::from_millis(10);
            }
            DeploymentProfile::Production => {}
            DeploymentProfile::Critical => {
                // Fail fast: a stalled dependency must not hold a live session.
                config.circuit_breaker.failure_threshold = 3;
                config.circuit_breaker.call_timeout = Duration::from_secs(5);
                config.circuit_breaker.half_open_max_calls = 1;
                config.fallback.default_timeout = Duration::from_secs(3);
                config.recovery.max_retries = 0;
            }
        }

        config
    }

    /// Check internal consistency.
    pub fn validate(&self) -> ResilienceResult<()> {
        self.circuit_breaker.validate()?;

        if self.self_healing.max_attempts == 0 {
            return Err(ResilienceError::Configuration(
                "self_healing.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.recovery.base_delay > self.recovery.max_delay {
            return Err(ResilienceError::Configuration(
                "recovery.base_delay must not exceed recovery.max_delay".to_string(),
            ));
        }
        self.predictor.thresholds.validate()?;
        if self.predictor.weights.total() <= 0.0 {
            return Err(ResilienceError::Configuration(
                "predictor weights must sum to a positive value".to_string(),
            ));
        }

        Ok(())
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures to open the circuit.
    pub failure_threshold: u32,

    /// Time to wait before transitioning from open to half-open.
    pub reset_timeout: Duration,

    /// Maximum concurrent probes admitted in half-open.
    pub half_open_max_calls: u32,

    /// Window over which availability is computed.
    pub monitor_window: Duration,

    /// Upper bound on a single wrapped call.
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
            monitor_window: Duration::from_secs(60),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Check threshold and probe limits.
    pub fn validate(&self) -> ResilienceResult<()> {
        if self.failure_threshold == 0 {
            return Err(ResilienceError::Configuration(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.half_open_max_calls == 0 {
            return Err(ResilienceError::Configuration(
                "circuit_breaker.half_open_max_calls must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Self-healing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfHealingConfig {
    /// Maximum healing attempts per error signature.
    pub max_attempts: u32,

    /// Window after which an exhausted signature gets a fresh budget.
    pub attempt_window: Duration,

    /// Register the built-in transient-network and rate-limit strategies.
    pub install_defaults: bool,

    /// Wait used by the built-in transient-network strategy.
    pub transient_backoff: Duration,

    /// Wait used by the built-in rate-limit strategy.
    pub rate_limit_backoff: Duration,
}

impl Default for SelfHealingConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_window: Duration::from_secs(300),
            install_defaults: true,
            transient_backoff: Duration::from_millis(200),
            rate_limit_backoff: Duration::from_secs(1),
        }
    }
}

/// Fallback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Per-attempt timeout used when the caller supplies none.
    pub default_timeout: Duration,

    /// Time-to-live of cached primary responses.
    pub cache_ttl: Duration,

    /// Maximum cached responses kept.
    pub cache_capacity: usize,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(10),
            cache_ttl: Duration::from_secs(300),
            cache_capacity: 1024,
        }
    }
}

/// Recovery orchestration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Backed-off retries after the first breaker-guarded attempt of the
    /// original operation. Zero still makes that first attempt.
    pub max_retries: u32,

    /// First backoff delay; doubles per retry.
    pub base_delay: Duration,

    /// Cap on a single backoff delay.
    pub max_delay: Duration,

    /// Finalized recoveries kept for inspection.
    pub history_size: usize,

    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            history_size: 100,
            event_capacity: 1024,
        }
    }
}

impl RecoveryConfig {
    /// Backoff before retry number `retry` (zero-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Error predictor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictorConfig {
    /// Score thresholds for each risk level.
    pub thresholds: RiskThresholds,

    /// Weights of each risk factor.
    pub weights: RiskWeights,

    /// Pattern decay and confidence tuning.
    pub patterns: PatternConfig,
}

/// Thresholds mapping a risk score (0.0-1.0) to a level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskThresholds {
    /// Minimum score for medium risk.
    pub medium: f64,

    /// Minimum score for high risk.
    pub high: f64,

    /// Minimum score for critical risk.
    pub critical: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            medium: 0.3,
            high: 0.55,
            critical: 0.8,
        }
    }
}

impl RiskThresholds {
    /// Bucket a score into a risk level.
    pub fn classify(&self, score: f64) -> RiskLevel {
        if score >= self.critical {
            RiskLevel::Critical
        } else if score >= self.high {
            RiskLevel::High
        } else if score >= self.medium {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    fn validate(&self) -> ResilienceResult<()> {
        let ordered = 0.0 <= self.medium
            && self.medium <= self.high
            && self.high <= self.critical
            && self.critical <= 1.0;
        if ordered {
            Ok(())
        } else {
            Err(ResilienceError::Configuration(
                "predictor thresholds must satisfy 0 <= medium <= high <= critical <= 1"
                    .to_string(),
            ))
        }
    }
}

/// Weights of each risk factor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskWeights {
    /// Weight of operational load.
    pub load: f64,

    /// Weight of inverse system health.
    pub health: f64,

    /// Weight of the matched pattern strength.
    pub pattern: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            load: 0.4,
            health: 0.4,
            pattern: 0.2,
        }
    }
}

impl RiskWeights {
    /// Sum of all weights.
    pub fn total(&self) -> f64 {
        self.load + self.health + self.pattern
    }

    /// Weighted risk score from individual factors, clamped to 0.0-1.0.
    pub fn calculate_score(&self, load: f64, health: f64, pattern_strength: f64) -> f64 {
        let total = self.total();
        if total <= 0.0 {
            return 0.0;
        }

        let raw = load.clamp(0.0, 1.0) * self.load
            + (1.0 - health.clamp(0.0, 1.0)) * self.health
            + pattern_strength.clamp(0.0, 1.0) * self.pattern;
        (raw / total).clamp(0.0, 1.0)
    }
}

/// Pattern store tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Half-life of exponential decay applied to observations.
    pub half_life: Duration,

    /// Observations needed for full confidence.
    pub confidence_saturation: f64,

    /// Entries with less decayed weight than this are dropped.
    pub prune_below: f64,

    /// Active users at which load is considered pressured.
    pub high_user_count: u32,

    /// Load added under user pressure.
    pub user_pressure_bump: f64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            half_life: Duration::from_secs(600),
            confidence_saturation: 20.0,
            prune_below: 0.05,
            high_user_count: 500,
            user_pressure_bump: 0.1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_presets() {
        let dev = ResilienceConfig::for_profile(DeploymentProfile::Development);
        let critical = ResilienceConfig::for_profile(DeploymentProfile::Critical);

        assert!(dev.circuit_breaker.failure_threshold > critical.circuit_breaker.failure_threshold);
        assert_eq!(critical.recovery.max_retries, 0);
        assert!(dev.validate().is_ok());
        assert!(critical.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let mut config = ResilienceConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        assert!(matches!(
            config.validate(),
            Err(ResilienceError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_unordered_thresholds() {
        let mut config = ResilienceConfig::default();
        config.predictor.thresholds.high = 0.9;
        config.predictor.thresholds.critical = 0.7;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RecoveryConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            ..RecoveryConfig::default()
        };

        assert_eq!(config.backoff_for(0), Duration::from_millis(100));
        assert_eq!(config.backoff_for(1), Duration::from_millis(200));
        assert_eq!(config.backoff_for(2), Duration::from_millis(400));
        assert_eq!(config.backoff_for(3), Duration::from_millis(500));
        assert_eq!(config.backoff_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_risk_score_weighting() {
        let weights = RiskWeights::default();
        assert_eq!(weights.calculate_score(0.0, 1.0, 0.0), 0.0);
        assert!((weights.calculate_score(1.0, 0.0, 1.0) - 1.0).abs() < 1e-9);

        let thresholds = RiskThresholds::default();
        assert_eq!(thresholds.classify(0.1), RiskLevel::Low);
        assert_eq!(thresholds.classify(0.6), RiskLevel::High);
        assert_eq!(thresholds.classify(0.95), RiskLevel::Critical);
    }
}
