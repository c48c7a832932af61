//! Recovery orchestrator coordinating healing, breaker-guarded retries and
//! fallbacks for a failed operation.
//!
//! Every recovery runs independently; the only shared state two recoveries
//! touch is the breaker of their operation and the healing budget of their
//! error signature.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use resilience_types::{ErrorContext, ErrorSignature, RecoveryId, SystemError};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::RecoveryConfig;
use crate::error::ResilienceError;
use crate::events::ResilienceEvent;
use crate::fallback::IntelligentFallbackSystem;
use crate::healing::{HealingOutcome, SelfHealingSystem};
use crate::recovery::{RecoveryResult, RecoveryStage, RecoveryStatus, RecoveryStep, RecoverySummary};

/// Served-by marker for values produced by a breaker-guarded retry.
pub const RETRY: &str = "retry";

/// A recovery that has not reached a terminal status yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveRecovery {
    pub recovery_id: RecoveryId,
    pub signature: ErrorSignature,
    pub operation: String,
    pub started_at: DateTime<Utc>,
}

/// Orchestrator metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryMetrics {
    pub total: u64,
    pub active: usize,
    pub healed: u64,
    pub recovered: u64,
    pub circuit_open: u64,
    pub failed: u64,

    /// Recoveries dropped by their caller before reaching a terminal status.
    pub cancelled: u64,

    /// Finalized recoveries currently kept in history.
    pub history_size: usize,

    /// (healed + recovered) / finalized; 1.0 before any recovery finished.
    pub success_rate: f64,
}

/// Keeps a recovery listed as active until it completes or its future is
/// dropped.
struct ActiveGuard<'a> {
    orchestrator: &'a RecoveryOrchestrator,
    recovery_id: RecoveryId,
    completed: bool,
}

impl ActiveGuard<'_> {
    fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.active.remove(&self.recovery_id);
        if !self.completed {
            self.orchestrator.cancelled.fetch_add(1, Ordering::Relaxed);
            warn!(recovery_id = %self.recovery_id, "Recovery cancelled before completion");
        }
    }
}

/// Runs the per-error recovery state machine.
pub struct RecoveryOrchestrator {
    /// Configuration.
    config: RecoveryConfig,

    /// Breakers, shared with the manager.
    breakers: Arc<CircuitBreakerRegistry>,

    /// Self-healing system.
    healing: Arc<SelfHealingSystem>,

    /// Fallback system.
    fallback: Arc<IntelligentFallbackSystem>,

    /// Recoveries in flight.
    active: DashMap<RecoveryId, ActiveRecovery>,

    /// Most recent finalized recoveries, oldest first.
    history: Mutex<VecDeque<RecoverySummary>>,

    total: AtomicU64,
    healed: AtomicU64,
    recovered: AtomicU64,
    circuit_open: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,

    /// Event broadcaster.
    event_tx: broadcast::Sender<ResilienceEvent>,
}

impl RecoveryOrchestrator {
    /// Create an orchestrator over shared subsystems.
    pub fn new(
        config: RecoveryConfig,
        breakers: Arc<CircuitBreakerRegistry>,
        healing: Arc<SelfHealingSystem>,
        fallback: Arc<IntelligentFallbackSystem>,
        event_tx: broadcast::Sender<ResilienceEvent>,
    ) -> Self {
        Self {
            config,
            breakers,
            healing,
            fallback,
            active: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            total: AtomicU64::new(0),
            healed: AtomicU64::new(0),
            recovered: AtomicU64::new(0),
            circuit_open: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            event_tx,
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Subscribe to recovery events.
    pub fn subscribe(&self) -> broadcast::Receiver<ResilienceEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: ResilienceEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    /// Recover from `error` raised by the operation described by `context`.
    #[instrument(
        skip(self, error, context),
        fields(code = error.code(), component = error.component(), operation = context.operation())
    )]
    pub async fn recover(&self, error: &SystemError, context: &ErrorContext) -> RecoveryResult {
        let recovery_id = RecoveryId::generate();
        let signature = error.signature();
        let result = RecoveryResult::begin(recovery_id, signature.clone());

        self.total.fetch_add(1, Ordering::Relaxed);
        let guard = ActiveGuard {
            orchestrator: self,
            recovery_id,
            completed: false,
        };
        self.active.insert(
            recovery_id,
            ActiveRecovery {
                recovery_id,
                signature: signature.clone(),
                operation: context.operation().to_string(),
                started_at: result.started_at,
            },
        );
        self.emit(ResilienceEvent::RecoveryStarted {
            recovery_id,
            signature: signature.clone(),
            operation: context.operation().to_string(),
        });
        info!(recovery_id = %recovery_id, signature = %signature, "Recovery started");

        let finished = self.run(result, error, context).await;
        guard.complete();
        self.finalize(finished)
    }

    async fn run(
        &self,
        mut result: RecoveryResult,
        error: &SystemError,
        context: &ErrorContext,
    ) -> RecoveryResult {
        // Fatal errors are surfaced untouched.
        if !error.is_recoverable() {
            result.record(RecoveryStep::failure(
                RecoveryStage::Classification,
                format!("{} is not recoverable", error.code()),
            ));
            return result.fail(RecoveryStatus::Failed, ResilienceError::System(error.clone()));
        }
        result.record(RecoveryStep::success(RecoveryStage::Classification, "recoverable"));

        let outcome = self.healing.heal(error, context).await;
        result.healing_attempted = outcome.attempted();
        match outcome {
            HealingOutcome::Healed {
                strategy, value, ..
            } => {
                result.record(RecoveryStep::success(
                    RecoveryStage::Healing,
                    format!("healed by {}", strategy),
                ));
                return result.succeed(RecoveryStatus::Healed, value, strategy);
            }
            HealingOutcome::NoStrategy => {
                result.record(RecoveryStep::failure(RecoveryStage::Healing, "no matching strategy"));
            }
            HealingOutcome::Exhausted { signature } => {
                self.emit(ResilienceEvent::HealingExhausted {
                    signature: signature.clone(),
                });
                result.record(RecoveryStep::failure(
                    RecoveryStage::Healing,
                    format!("attempts exhausted for {}", signature),
                ));
            }
            HealingOutcome::ActionFailed { strategy, error } => {
                result.record(RecoveryStep::failure(
                    RecoveryStage::Healing,
                    format!("{} action failed: {}", strategy, error),
                ));
            }
            HealingOutcome::VerificationFailed { strategy, error } => {
                result.record(RecoveryStep::failure(
                    RecoveryStage::Healing,
                    format!("{} not verified: {}", strategy, error),
                ));
            }
        }

        // Fail fast on a known-bad dependency instead of masking it.
        let breaker = self.breakers.get(context.operation());
        if breaker.is_open() {
            self.emit(ResilienceEvent::CircuitRejected {
                key: breaker.key().to_string(),
            });
            result.record(RecoveryStep::failure(
                RecoveryStage::CircuitCheck,
                format!("breaker {} is open", breaker.key()),
            ));
            return result.fail(RecoveryStatus::CircuitOpen, ResilienceError::circuit_open(breaker.key()));
        }
        result.record(RecoveryStep::success(RecoveryStage::CircuitCheck, "breaker admits calls"));

        // One immediate attempt, then up to `max_retries` backed-off retries.
        if let Some(operation) = context.original_operation() {
            for attempt in 0..=self.config.max_retries {
                let admitted = if attempt == 0 {
                    !context.deadline_exceeded()
                } else {
                    self.backoff(attempt - 1, context).await
                };
                if !admitted {
                    result.record(RecoveryStep::failure(RecoveryStage::Retry, "deadline exceeded"));
                    break;
                }

                let outcome = breaker
                    .execute_within(|| operation.call(), Some(context.attempt_budget()))
                    .await;
                match outcome {
                    Ok(value) => {
                        result.record(RecoveryStep::success(
                            RecoveryStage::Retry,
                            format!("attempt {} succeeded", attempt + 1),
                        ));
                        return result.succeed(RecoveryStatus::Recovered, value, RETRY);
                    }
                    Err(rejected @ ResilienceError::CircuitOpen { .. }) => {
                        self.emit(ResilienceEvent::CircuitRejected {
                            key: breaker.key().to_string(),
                        });
                        result.record(RecoveryStep::failure(
                            RecoveryStage::Retry,
                            format!("attempt {} rejected by breaker", attempt + 1),
                        ));
                        return result.fail(RecoveryStatus::CircuitOpen, rejected);
                    }
                    Err(err) => {
                        debug!(attempt = attempt + 1, error = %err, "Recovery attempt failed");
                        result.record(RecoveryStep::failure(
                            RecoveryStage::Retry,
                            format!("attempt {} failed: {}", attempt + 1, err),
                        ));
                    }
                }
            }
        }

        let chain = context
            .operation_type()
            .filter(|operation_type| self.fallback.has_strategies(operation_type));
        let Some(operation_type) = chain else {
            return result.fail(RecoveryStatus::Failed, ResilienceError::System(error.clone()));
        };

        result.fallback_attempted = true;
        match self.fallback.execute_fallback_chain(operation_type, context).await {
            Ok(response) => {
                result.record(RecoveryStep::success(
                    RecoveryStage::Fallback,
                    format!("served by {} after {} attempts", response.served_by, response.attempts),
                ));
                result.succeed(RecoveryStatus::Recovered, response.value, response.served_by)
            }
            Err(err) => {
                result.record(RecoveryStep::failure(RecoveryStage::Fallback, err.to_string()));
                result.fail(RecoveryStatus::Failed, err)
            }
        }
    }

    /// Sleep before retry `retry`, never past the deadline. Returns false
    /// when the deadline leaves no room for another attempt.
    async fn backoff(&self, retry: u32, context: &ErrorContext) -> bool {
        let mut delay = self.config.backoff_for(retry);
        if let Some(remaining) = context.remaining() {
            if remaining.is_zero() {
                return false;
            }
            delay = delay.min(remaining);
        }
        tokio::time::sleep(delay).await;
        !context.deadline_exceeded()
    }

    fn finalize(&self, result: RecoveryResult) -> RecoveryResult {
        let counter = match result.status {
            RecoveryStatus::Healed => &self.healed,
            RecoveryStatus::Recovered => &self.recovered,
            RecoveryStatus::CircuitOpen => &self.circuit_open,
            RecoveryStatus::Failed | RecoveryStatus::InProgress => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let summary = result.summary();
        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            history.push_back(summary.clone());
            while history.len() > self.config.history_size {
                history.pop_front();
            }
        }

        if result.status.is_success() {
            info!(
                recovery_id = %result.recovery_id,
                status = %result.status,
                served_by = ?result.served_by,
                duration_ms = summary.duration_ms,
                "Recovery completed"
            );
        } else {
            warn!(
                recovery_id = %result.recovery_id,
                status = %result.status,
                error = ?summary.error,
                duration_ms = summary.duration_ms,
                "Recovery failed"
            );
        }

        self.emit(ResilienceEvent::RecoveryCompleted {
            recovery_id: result.recovery_id,
            status: result.status,
            duration_ms: summary.duration_ms,
        });
        result
    }

    /// Recoveries currently running.
    pub fn active_recoveries(&self) -> Vec<ActiveRecovery> {
        let mut active: Vec<ActiveRecovery> = self.active.iter().map(|e| e.value().clone()).collect();
        active.sort_by_key(|a| a.started_at);
        active
    }

    /// Finalized recoveries, oldest first.
    pub fn recent_history(&self) -> Vec<RecoverySummary> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Counters, active recoveries and success rate.
    pub fn metrics(&self) -> RecoveryMetrics {
        let healed = self.healed.load(Ordering::Relaxed);
        let recovered = self.recovered.load(Ordering::Relaxed);
        let circuit_open = self.circuit_open.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let finished = healed + recovered + circuit_open + failed;

        RecoveryMetrics {
            total: self.total.load(Ordering::Relaxed),
            active: self.active.len(),
            healed,
            recovered,
            circuit_open,
            failed,
            cancelled: self.cancelled.load(Ordering::Relaxed),
            history_size: self
                .history
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            success_rate: if finished == 0 {
                1.0
            } else {
                (healed + recovered) as f64 / finished as f64
            },
        }
    }

    /// Clear history and counters. Running recoveries are unaffected.
    pub fn reset_metrics(&self) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        for counter in [
            &self.total,
            &self.healed,
            &self.recovered,
            &self.circuit_open,
            &self.failed,
            &self.cancelled,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
