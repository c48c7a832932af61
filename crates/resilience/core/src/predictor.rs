//! Error prediction from operational telemetry.
//!
//! Observations are bucketed by (load band, health band). Each bucket keeps
//! exponentially decayed observation and per-code error weights; decay is
//! applied lazily whenever the bucket is touched.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use resilience_types::{codes, SystemError};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::{PatternConfig, PredictorConfig, RiskThresholds, RiskWeights};

/// Predicted risk of imminent failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Telemetry snapshot fed to the predictor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionContext {
    pub timestamp: DateTime<Utc>,
    pub active_users: u32,

    /// Operational load, 0.0 (idle) to 1.0 (saturated).
    pub operational_load: f64,

    /// System health, 0.0 (failing) to 1.0 (healthy).
    pub system_health: f64,

    pub metadata: HashMap<String, String>,
}

impl PredictionContext {
    /// Telemetry reading taken now.
    pub fn new(operational_load: f64, system_health: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            active_users: 0,
            operational_load,
            system_health,
            metadata: HashMap::new(),
        }
    }

    /// Set the active user count.
    pub fn with_active_users(mut self, active_users: u32) -> Self {
        self.active_users = active_users;
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Override the reading time.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Load band of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadBand {
    Idle,
    Normal,
    High,
    Saturated,
}

impl LoadBand {
    /// Band for a load reading.
    pub fn from_load(load: f64) -> Self {
        if load < 0.3 {
            LoadBand::Idle
        } else if load < 0.6 {
            LoadBand::Normal
        } else if load < 0.85 {
            LoadBand::High
        } else {
            LoadBand::Saturated
        }
    }

    fn is_pressured(self) -> bool {
        matches!(self, LoadBand::High | LoadBand::Saturated)
    }
}

/// Health band of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthBand {
    Healthy,
    Degraded,
    Impaired,
    Failing,
}

impl HealthBand {
    /// Band for a health reading.
    pub fn from_health(health: f64) -> Self {
        if health >= 0.8 {
            HealthBand::Healthy
        } else if health >= 0.5 {
            HealthBand::Degraded
        } else if health >= 0.25 {
            HealthBand::Impaired
        } else {
            HealthBand::Failing
        }
    }

    fn is_poor(self) -> bool {
        matches!(self, HealthBand::Impaired | HealthBand::Failing)
    }
}

/// Bucket key: one pattern entry per context class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatternKey {
    pub load: LoadBand,
    pub health: HealthBand,
}

impl PatternKey {
    /// Bucket for a load and health reading.
    pub fn classify(load: f64, health: f64) -> Self {
        Self {
            load: LoadBand::from_load(load),
            health: HealthBand::from_health(health),
        }
    }
}

impl fmt::Display for PatternKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.load, self.health)
    }
}

#[derive(Debug, Clone)]
struct PatternEntry {
    observations: f64,
    errors: HashMap<String, f64>,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    decayed_at: Instant,
}

impl PatternEntry {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            observations: 0.0,
            errors: HashMap::new(),
            first_seen: now,
            last_seen: now,
            decayed_at: Instant::now(),
        }
    }

    /// Bring weights up to date. A zero half-life disables decay.
    fn decay(&mut self, config: &PatternConfig) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.decayed_at);
        self.decayed_at = now;
        if config.half_life.is_zero() || elapsed.is_zero() {
            return;
        }

        let factor = decay_factor(elapsed, config.half_life);
        self.observations *= factor;
        for weight in self.errors.values_mut() {
            *weight *= factor;
        }
        self.errors.retain(|_, weight| *weight >= config.prune_below);
    }

    fn error_weight(&self) -> f64 {
        self.errors.values().sum()
    }

    fn pattern_strength(&self) -> f64 {
        let errors = self.error_weight();
        if errors <= 0.0 {
            0.0
        } else if self.observations <= 0.0 {
            1.0
        } else {
            (errors / self.observations).min(1.0)
        }
    }

    /// Recorded codes, heaviest first.
    fn ranked_codes(&self) -> Vec<String> {
        let mut ranked: Vec<(&String, &f64)> = self.errors.iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(a.1).then_with(|| a.0.cmp(b.0)));
        ranked.into_iter().map(|(code, _)| code.clone()).collect()
    }

    fn is_stale(&self, prune_below: f64) -> bool {
        self.observations < prune_below && self.errors.is_empty()
    }
}

fn decay_factor(elapsed: Duration, half_life: Duration) -> f64 {
    0.5f64.powf(elapsed.as_secs_f64() / half_life.as_secs_f64())
}

/// Map a reading into 0.0-1.0, substituting `fallback` for non-finite input.
fn unit(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        fallback
    }
}

/// Preventative measure suggested by a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreventativeAction {
    ShedLoad,
    ScaleWorkers,
    InvalidateCache,
    OpenCircuitsProactively,
    EnableFallbacks,
    Monitor,
}

impl fmt::Display for PreventativeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PreventativeAction::ShedLoad => "shed_load",
            PreventativeAction::ScaleWorkers => "scale_workers",
            PreventativeAction::InvalidateCache => "invalidate_cache",
            PreventativeAction::OpenCircuitsProactively => "open_circuits_proactively",
            PreventativeAction::EnableFallbacks => "enable_fallbacks",
            PreventativeAction::Monitor => "monitor",
        };
        write!(f, "{}", name)
    }
}

/// Result of one prediction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResult {
    pub risk: RiskLevel,

    /// Weighted score, 0.0-1.0.
    pub risk_score: f64,

    /// Likely error codes, most likely first.
    pub predicted_errors: Vec<String>,

    pub preventative_actions: Vec<PreventativeAction>,

    /// How much history backs this prediction, 0.0-1.0.
    pub confidence: f64,

    pub bucket: PatternKey,
    pub timestamp: DateTime<Utc>,
}

/// Weights and thresholds in effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskFactors {
    pub weights: RiskWeights,
    pub thresholds: RiskThresholds,
}

/// Predictor statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictorStats {
    pub patterns_count: usize,
    pub risk_factors: RiskFactors,
    pub last_risk: Option<RiskLevel>,
    pub total_predictions: u64,
    pub recorded_errors: u64,
}

/// Predicts error likelihood from load, health and recorded history.
pub struct ErrorPredictor {
    config: PredictorConfig,
    patterns: DashMap<PatternKey, PatternEntry>,
    last_risk: Mutex<Option<RiskLevel>>,
    total_predictions: AtomicU64,
    recorded_errors: AtomicU64,
}

impl ErrorPredictor {
    /// Create a predictor with an empty pattern store.
    pub fn new(config: PredictorConfig) -> Self {
        Self {
            config,
            patterns: DashMap::new(),
            last_risk: Mutex::new(None),
            total_predictions: AtomicU64::new(0),
            recorded_errors: AtomicU64::new(0),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &PredictorConfig {
        &self.config
    }

    fn effective_load(&self, context: &PredictionContext) -> f64 {
        let load = unit(context.operational_load, 0.0);
        if context.active_users >= self.config.patterns.high_user_count {
            (load + self.config.patterns.user_pressure_bump).min(1.0)
        } else {
            load
        }
    }

    fn bucket_for(&self, context: &PredictionContext) -> (PatternKey, f64, f64) {
        let load = self.effective_load(context);
        let health = unit(context.system_health, 1.0);
        (PatternKey::classify(load, health), load, health)
    }

    /// Predict the risk for `context` and count it as an observation of its
    /// bucket.
    pub fn analyze_and_predict(&self, context: &PredictionContext) -> PredictionResult {
        let patterns = &self.config.patterns;
        let (bucket, load, health) = self.bucket_for(context);

        let (strength, recorded, confidence) = {
            let mut entry = self.patterns.entry(bucket).or_insert_with(PatternEntry::new);
            entry.decay(patterns);
            entry.observations += 1.0;
            entry.last_seen = Utc::now();

            let confidence = if patterns.confidence_saturation > 0.0 {
                (entry.observations / patterns.confidence_saturation).clamp(0.0, 1.0)
            } else {
                1.0
            };
            (entry.pattern_strength(), entry.ranked_codes(), confidence)
        };
        self.prune();

        let risk_score = self.config.weights.calculate_score(load, health, strength);
        let risk = self.config.thresholds.classify(risk_score);

        let predicted_errors = predicted_errors(bucket, recorded);
        let preventative_actions = preventative_actions(risk, bucket);

        *self.last_risk.lock().unwrap_or_else(PoisonError::into_inner) = Some(risk);
        self.total_predictions.fetch_add(1, Ordering::Relaxed);

        debug!(
            bucket = %bucket,
            risk = %risk,
            risk_score = risk_score,
            confidence = confidence,
            "Error prediction computed"
        );

        PredictionResult {
            risk,
            risk_score,
            predicted_errors,
            preventative_actions,
            confidence,
            bucket,
            timestamp: context.timestamp,
        }
    }

    /// Feed an observed failure into the bucket of `context`.
    pub fn record_error(&self, context: &PredictionContext, error: &SystemError) {
        let (bucket, _, _) = self.bucket_for(context);
        let mut entry = self.patterns.entry(bucket).or_insert_with(PatternEntry::new);
        entry.decay(&self.config.patterns);
        *entry.errors.entry(error.code().to_string()).or_insert(0.0) += 1.0;
        entry.last_seen = Utc::now();
        drop(entry);

        self.recorded_errors.fetch_add(1, Ordering::Relaxed);
        trace!(bucket = %bucket, code = error.code(), "Recorded error pattern");
    }

    /// Decay every bucket and drop the ones that faded out.
    fn prune(&self) {
        let config = &self.config.patterns;
        self.patterns.retain(|_, entry| {
            entry.decay(config);
            !entry.is_stale(config.prune_below)
        });
    }

    /// First/last time a bucket was touched.
    pub fn pattern_span(&self, bucket: &PatternKey) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.patterns
            .get(bucket)
            .map(|entry| (entry.first_seen, entry.last_seen))
    }

    /// Pattern store statistics.
    pub fn stats(&self) -> PredictorStats {
        self.prune();
        PredictorStats {
            patterns_count: self.patterns.len(),
            risk_factors: RiskFactors {
                weights: self.config.weights.clone(),
                thresholds: self.config.thresholds.clone(),
            },
            last_risk: *self.last_risk.lock().unwrap_or_else(PoisonError::into_inner),
            total_predictions: self.total_predictions.load(Ordering::Relaxed),
            recorded_errors: self.recorded_errors.load(Ordering::Relaxed),
        }
    }

    /// Forget every recorded pattern.
    pub fn clear_patterns(&self) {
        self.patterns.clear();
        *self.last_risk.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

fn predicted_errors(bucket: PatternKey, recorded: Vec<String>) -> Vec<String> {
    let mut predicted = recorded;
    let mut heuristics = Vec::new();
    if bucket.load.is_pressured() {
        heuristics.extend([codes::RESOURCE_EXHAUSTED, codes::OPERATION_TIMEOUT]);
    }
    if bucket.health.is_poor() {
        heuristics.extend([codes::SERVICE_UNAVAILABLE, codes::CONNECTION_RESET]);
    }

    for code in heuristics {
        if !predicted.iter().any(|p| p == code) {
            predicted.push(code.to_string());
        }
    }
    predicted
}

fn preventative_actions(risk: RiskLevel, bucket: PatternKey) -> Vec<PreventativeAction> {
    let mut actions = Vec::new();

    if bucket.load == LoadBand::Saturated && risk >= RiskLevel::High {
        actions.push(PreventativeAction::ShedLoad);
    }
    if bucket.load.is_pressured() {
        actions.push(PreventativeAction::ScaleWorkers);
    }
    if bucket.health.is_poor() {
        actions.push(PreventativeAction::OpenCircuitsProactively);
    }
    if bucket.health != HealthBand::Healthy && risk >= RiskLevel::Medium {
        actions.push(PreventativeAction::EnableFallbacks);
    }
    if risk == RiskLevel::Critical {
        actions.push(PreventativeAction::InvalidateCache);
    }
    actions.push(PreventativeAction::Monitor);
    actions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn predictor() -> ErrorPredictor {
        ErrorPredictor::new(PredictorConfig::default())
    }

    #[test]
    fn test_bands() {
        assert_eq!(LoadBand::from_load(0.1), LoadBand::Idle);
        assert_eq!(LoadBand::from_load(0.6), LoadBand::High);
        assert_eq!(LoadBand::from_load(0.9), LoadBand::Saturated);
        assert_eq!(HealthBand::from_health(0.95), HealthBand::Healthy);
        assert_eq!(HealthBand::from_health(0.3), HealthBand::Impaired);
        assert_eq!(HealthBand::from_health(0.0), HealthBand::Failing);
    }

    #[test]
    fn test_calm_system_is_low_risk() {
        let result = predictor().analyze_and_predict(&PredictionContext::new(0.1, 1.0));
        assert_eq!(result.risk, RiskLevel::Low);
        assert!(result.predicted_errors.is_empty());
        assert_eq!(result.preventative_actions, vec![PreventativeAction::Monitor]);
    }

    #[test]
    fn test_stressed_system_is_critical() {
        let predictor = predictor();
        let ctx = PredictionContext::new(0.95, 0.1);
        let exhausted = SystemError::new(codes::RESOURCE_EXHAUSTED, "pool empty");
        for _ in 0..3 {
            predictor.record_error(&ctx, &exhausted);
        }

        let result = predictor.analyze_and_predict(&ctx);
        assert_eq!(result.risk, RiskLevel::Critical);
        assert!(result
            .predicted_errors
            .contains(&codes::RESOURCE_EXHAUSTED.to_string()));
        assert!(result
            .predicted_errors
            .contains(&codes::SERVICE_UNAVAILABLE.to_string()));
        assert!(result
            .preventative_actions
            .contains(&PreventativeAction::ShedLoad));
        assert!(result
            .preventative_actions
            .contains(&PreventativeAction::OpenCircuitsProactively));
    }

    #[test]
    fn test_user_pressure_moves_bucket() {
        let predictor = predictor();
        let quiet = predictor.analyze_and_predict(&PredictionContext::new(0.55, 0.9));
        let busy = predictor
            .analyze_and_predict(&PredictionContext::new(0.55, 0.9).with_active_users(1000));
        assert_eq!(quiet.bucket.load, LoadBand::Normal);
        assert_eq!(busy.bucket.load, LoadBand::High);
    }

    #[test]
    fn test_recorded_errors_ranked_first() {
        let predictor = predictor();
        let ctx = PredictionContext::new(0.7, 0.9);
        let reset = SystemError::new(codes::CONNECTION_RESET, "reset").with_component("database");
        let limited = SystemError::new(codes::RATE_LIMITED, "slow down").with_component("model");

        predictor.record_error(&ctx, &limited);
        predictor.record_error(&ctx, &limited);
        predictor.record_error(&ctx, &reset);

        let result = predictor.analyze_and_predict(&ctx);
        assert_eq!(result.predicted_errors[0], codes::RATE_LIMITED);
        assert_eq!(result.predicted_errors[1], codes::CONNECTION_RESET);
        assert!(result
            .predicted_errors
            .contains(&codes::RESOURCE_EXHAUSTED.to_string()));

        let baseline = ErrorPredictor::new(PredictorConfig::default()).analyze_and_predict(&ctx);
        assert!(result.risk_score > baseline.risk_score);
    }

    #[test]
    fn test_confidence_grows_with_observations() {
        let predictor = predictor();
        let ctx = PredictionContext::new(0.4, 0.9);

        let first = predictor.analyze_and_predict(&ctx);
        for _ in 0..30 {
            predictor.analyze_and_predict(&ctx);
        }
        let later = predictor.analyze_and_predict(&ctx);

        assert!(first.confidence < later.confidence);
        assert_eq!(later.confidence, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_patterns_decay_and_prune() {
        let predictor = predictor();
        let ctx = PredictionContext::new(0.4, 0.9);
        for _ in 0..10 {
            predictor.analyze_and_predict(&ctx);
        }
        let before = predictor.analyze_and_predict(&ctx).confidence;

        tokio::time::advance(Duration::from_secs(600)).await;
        let after = predictor.analyze_and_predict(&ctx).confidence;
        assert!(after < before);

        tokio::time::advance(Duration::from_secs(6 * 3600)).await;
        assert_eq!(predictor.stats().patterns_count, 0);
    }

    #[test]
    fn test_clear_patterns() {
        let predictor = predictor();
        predictor.analyze_and_predict(&PredictionContext::new(0.9, 0.2));
        assert_eq!(predictor.stats().patterns_count, 1);
        assert_eq!(predictor.stats().last_risk, Some(RiskLevel::High));

        predictor.clear_patterns();
        let stats = predictor.stats();
        assert_eq!(stats.patterns_count, 0);
        assert_eq!(stats.last_risk, None);
        assert_eq!(stats.total_predictions, 1);
    }

    #[test]
    fn test_non_finite_readings_are_tolerated() {
        let ctx = PredictionContext::new(f64::NAN, f64::INFINITY);
        let result = predictor().analyze_and_predict(&ctx);
        assert!((0.0..=1.0).contains(&result.risk_score));
        assert!((0.0..=1.0).contains(&result.confidence));
    }
}
