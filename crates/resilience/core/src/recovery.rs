//! Recovery records produced by the orchestrator.

use chrono::{DateTime, Utc};
use resilience_types::{codes, ErrorSignature, RecoveryId, SystemError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ResilienceError;

/// Status of a recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    /// Recovery is running.
    InProgress,

    /// A healing action fixed the condition and the operation was verified.
    Healed,

    /// A breaker-guarded retry or a fallback produced a value.
    Recovered,

    /// The dependency's breaker is open; no fallback was attempted.
    CircuitOpen,

    /// Nothing could recover the operation.
    Failed,
}

impl RecoveryStatus {
    /// Whether the recovery has finished.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RecoveryStatus::InProgress)
    }

    /// Whether the caller got a value.
    pub fn is_success(&self) -> bool {
        matches!(self, RecoveryStatus::Healed | RecoveryStatus::Recovered)
    }
}

impl std::fmt::Display for RecoveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryStatus::InProgress => write!(f, "in_progress"),
            RecoveryStatus::Healed => write!(f, "healed"),
            RecoveryStatus::Recovered => write!(f, "recovered"),
            RecoveryStatus::CircuitOpen => write!(f, "circuit_open"),
            RecoveryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Stage of the recovery pipeline a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStage {
    Classification,
    Healing,
    CircuitCheck,
    Retry,
    Fallback,
}

impl std::fmt::Display for RecoveryStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryStage::Classification => write!(f, "classification"),
            RecoveryStage::Healing => write!(f, "healing"),
            RecoveryStage::CircuitCheck => write!(f, "circuit_check"),
            RecoveryStage::Retry => write!(f, "retry"),
            RecoveryStage::Fallback => write!(f, "fallback"),
        }
    }
}

/// One entry of a recovery's step log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStep {
    pub stage: RecoveryStage,
    pub success: bool,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl RecoveryStep {
    /// Step that succeeded.
    pub fn success(stage: RecoveryStage, detail: impl Into<String>) -> Self {
        Self {
            stage,
            success: true,
            detail: detail.into(),
            at: Utc::now(),
        }
    }

    /// Step that failed.
    pub fn failure(stage: RecoveryStage, detail: impl Into<String>) -> Self {
        Self {
            stage,
            success: false,
            detail: detail.into(),
            at: Utc::now(),
        }
    }
}

/// Full record of one recovery. Immutable once finalized.
#[derive(Debug, Clone)]
pub struct RecoveryResult {
    pub recovery_id: RecoveryId,
    pub signature: ErrorSignature,
    pub status: RecoveryStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Recovered value for `healed` and `recovered`.
    pub value: Option<Value>,

    /// Who produced the value: a strategy name or `retry`.
    pub served_by: Option<String>,

    /// Terminal error for `circuit_open` and `failed`.
    pub error: Option<ResilienceError>,

    pub steps: Vec<RecoveryStep>,
    pub healing_attempted: bool,
    pub fallback_attempted: bool,
}

impl RecoveryResult {
    pub(crate) fn begin(recovery_id: RecoveryId, signature: ErrorSignature) -> Self {
        Self {
            recovery_id,
            signature,
            status: RecoveryStatus::InProgress,
            started_at: Utc::now(),
            completed_at: None,
            value: None,
            served_by: None,
            error: None,
            steps: Vec::new(),
            healing_attempted: false,
            fallback_attempted: false,
        }
    }

    pub(crate) fn record(&mut self, step: RecoveryStep) {
        self.steps.push(step);
    }

    pub(crate) fn succeed(
        mut self,
        status: RecoveryStatus,
        value: Value,
        served_by: impl Into<String>,
    ) -> Self {
        self.status = status;
        self.value = Some(value);
        self.served_by = Some(served_by.into());
        self.completed_at = Some(Utc::now());
        self
    }

    pub(crate) fn fail(mut self, status: RecoveryStatus, error: ResilienceError) -> Self {
        self.status = status;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
        self
    }

    /// Whether the caller receives a value.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Elapsed time, up to now while still running.
    pub fn duration_ms(&self) -> u64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }

    /// Turn the record into what the caller observes.
    pub fn into_result(self) -> Result<Value, ResilienceError> {
        match (self.value, self.error) {
            (Some(value), _) => Ok(value),
            (None, Some(error)) => Err(error),
            (None, None) => Err(ResilienceError::System(SystemError::new(
                codes::UNKNOWN,
                format!("recovery {} finished without an outcome", self.recovery_id),
            ))),
        }
    }

    /// Serializable summary for history.
    pub fn summary(&self) -> RecoverySummary {
        RecoverySummary {
            recovery_id: self.recovery_id,
            signature: self.signature.clone(),
            status: self.status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: self.duration_ms(),
            steps: self.steps.len(),
            healing_attempted: self.healing_attempted,
            fallback_attempted: self.fallback_attempted,
            served_by: self.served_by.clone(),
            error: self.error.as_ref().map(|e| e.to_string()),
        }
    }
}

/// Serializable digest of a finalized recovery, kept in history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySummary {
    pub recovery_id: RecoveryId,
    pub signature: ErrorSignature,
    pub status: RecoveryStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub steps: usize,
    pub healing_attempted: bool,
    pub fallback_attempted: bool,
    pub served_by: Option<String>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn begin() -> RecoveryResult {
        RecoveryResult::begin(
            RecoveryId::generate(),
            ErrorSignature::new("ECONNRESET", "database"),
        )
    }

    #[test]
    fn test_status_classification() {
        assert!(!RecoveryStatus::InProgress.is_terminal());
        assert!(RecoveryStatus::CircuitOpen.is_terminal());
        assert!(RecoveryStatus::Healed.is_success());
        assert!(!RecoveryStatus::Failed.is_success());
        assert_eq!(RecoveryStatus::CircuitOpen.to_string(), "circuit_open");
    }

    #[test]
    fn test_success_into_result() {
        let mut result = begin();
        result.record(RecoveryStep::success(RecoveryStage::Retry, "retry 1 succeeded"));
        let result = result.succeed(RecoveryStatus::Recovered, Value::from(7), "retry");

        let summary = result.summary();
        assert_eq!(summary.steps, 1);
        assert_eq!(summary.served_by.as_deref(), Some("retry"));
        assert!(summary.completed_at.is_some());
        assert_eq!(result.into_result().unwrap(), Value::from(7));
    }

    #[test]
    fn test_failure_into_result() {
        let err = SystemError::new("FATAL", "disk gone").fatal();
        let result = begin().fail(RecoveryStatus::Failed, ResilienceError::System(err.clone()));

        assert_eq!(result.summary().error, Some(err.to_string()));
        match result.into_result() {
            Err(ResilienceError::System(surfaced)) => assert_eq!(surfaced, err),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
