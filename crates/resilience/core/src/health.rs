//! Health model for the resilience stack itself.
//!
//! Each subsystem reports healthy or degraded; the overall status escalates
//! to critical when an open breaker coincides with an exhausted healing
//! budget.

use chrono::{DateTime, Utc};
use resilience_types::ErrorSignature;
use serde::{Deserialize, Serialize};

use crate::predictor::RiskLevel;

/// Overall health of the resilience layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Everything nominal.
    Healthy,

    /// At least one subsystem is in a non-ideal state.
    Degraded,

    /// A dependency is cut off and healing gave up on it.
    Critical,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Critical => write!(f, "critical"),
        }
    }
}

/// Health of one subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsystemHealth {
    pub status: HealthStatus,

    /// Why the subsystem is not healthy.
    pub notes: Vec<String>,
}

impl SubsystemHealth {
    /// Healthy with no notes.
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            notes: Vec::new(),
        }
    }

    /// Downgrade to degraded with a note.
    pub fn degrade(&mut self, note: impl Into<String>) {
        self.status = self.status.max(HealthStatus::Degraded);
        self.notes.push(note.into());
    }

    /// Whether the subsystem is healthy.
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Per-subsystem breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthDetails {
    pub orchestrator: SubsystemHealth,
    pub circuit_breakers: SubsystemHealth,
    pub self_healing: SubsystemHealth,
    pub fallback: SubsystemHealth,
    pub predictor: SubsystemHealth,
}

impl HealthDetails {
    fn all(&self) -> [&SubsystemHealth; 5] {
        [
            &self.orchestrator,
            &self.circuit_breakers,
            &self.self_healing,
            &self.fallback,
            &self.predictor,
        ]
    }
}

/// Point-in-time readings the assessment is computed from.
#[derive(Debug, Clone, Default)]
pub struct HealthSnapshot {
    pub open_breakers: Vec<String>,
    pub half_open_breakers: Vec<String>,
    pub exhausted_signatures: Vec<ErrorSignature>,
    pub active_recoveries: usize,
    pub finished_recoveries: u64,
    pub recovery_success_rate: f64,
    pub fallback_exhaustions: u64,
    pub last_risk: Option<RiskLevel>,
}

/// Health report of the resilience layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceHealth {
    pub overall: HealthStatus,
    pub details: HealthDetails,
    pub assessed_at: DateTime<Utc>,
}

/// Recovery success rate under which the orchestrator counts as degraded.
pub const MIN_RECOVERY_SUCCESS_RATE: f64 = 0.5;

impl ResilienceHealth {
    /// Compute health from a snapshot.
    pub fn assess(snapshot: &HealthSnapshot) -> Self {
        let mut orchestrator = SubsystemHealth::healthy();
        if snapshot.finished_recoveries > 0
            && snapshot.recovery_success_rate < MIN_RECOVERY_SUCCESS_RATE
        {
            orchestrator.degrade(format!(
                "recovery success rate {:.2} over {} recoveries",
                snapshot.recovery_success_rate, snapshot.finished_recoveries
            ));
        }

        let mut circuit_breakers = SubsystemHealth::healthy();
        if !snapshot.open_breakers.is_empty() {
            circuit_breakers.degrade(format!("open: {}", snapshot.open_breakers.join(", ")));
        }
        if !snapshot.half_open_breakers.is_empty() {
            circuit_breakers.degrade(format!(
                "half-open: {}",
                snapshot.half_open_breakers.join(", ")
            ));
        }

        let mut self_healing = SubsystemHealth::healthy();
        if !snapshot.exhausted_signatures.is_empty() {
            let signatures: Vec<&str> = snapshot
                .exhausted_signatures
                .iter()
                .map(ErrorSignature::as_str)
                .collect();
            self_healing.degrade(format!("exhausted: {}", signatures.join(", ")));
        }

        let mut fallback = SubsystemHealth::healthy();
        if snapshot.fallback_exhaustions > 0 {
            fallback.degrade(format!(
                "{} exhausted fallback chains",
                snapshot.fallback_exhaustions
            ));
        }

        let mut predictor = SubsystemHealth::healthy();
        if let Some(risk) = snapshot.last_risk.filter(|r| *r >= RiskLevel::High) {
            predictor.degrade(format!("last predicted risk {}", risk));
        }

        let details = HealthDetails {
            orchestrator,
            circuit_breakers,
            self_healing,
            fallback,
            predictor,
        };

        let overall = if !snapshot.open_breakers.is_empty()
            && !snapshot.exhausted_signatures.is_empty()
        {
            HealthStatus::Critical
        } else if details.all().iter().any(|s| !s.is_healthy()) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Self {
            overall,
            details,
            assessed_at: Utc::now(),
        }
    }

    /// Whether the overall status is healthy.
    pub fn is_healthy(&self) -> bool {
        self.overall == HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_stack_is_healthy() {
        let health = ResilienceHealth::assess(&HealthSnapshot {
            recovery_success_rate: 1.0,
            ..HealthSnapshot::default()
        });
        assert!(health.is_healthy());
        assert!(health.details.circuit_breakers.notes.is_empty());
    }

    #[test]
    fn test_single_subsystem_degrades() {
        let health = ResilienceHealth::assess(&HealthSnapshot {
            open_breakers: vec!["db.query".to_string()],
            recovery_success_rate: 1.0,
            ..HealthSnapshot::default()
        });
        assert_eq!(health.overall, HealthStatus::Degraded);
        assert_eq!(health.details.circuit_breakers.notes, vec!["open: db.query"]);
        assert!(health.details.self_healing.is_healthy());
    }

    #[test]
    fn test_open_breaker_and_exhausted_healing_is_critical() {
        let health = ResilienceHealth::assess(&HealthSnapshot {
            open_breakers: vec!["db.query".to_string()],
            exhausted_signatures: vec![ErrorSignature::new("ECONNRESET", "database")],
            recovery_success_rate: 1.0,
            ..HealthSnapshot::default()
        });
        assert_eq!(health.overall, HealthStatus::Critical);
    }

    #[test]
    fn test_low_recovery_rate_and_high_risk() {
        let health = ResilienceHealth::assess(&HealthSnapshot {
            finished_recoveries: 4,
            recovery_success_rate: 0.25,
            last_risk: Some(RiskLevel::High),
            ..HealthSnapshot::default()
        });
        assert_eq!(health.overall, HealthStatus::Degraded);
        assert!(!health.details.orchestrator.is_healthy());
        assert!(!health.details.predictor.is_healthy());
    }
}
