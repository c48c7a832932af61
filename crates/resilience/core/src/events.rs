//! Events broadcast by the resilience stack.

use resilience_types::{ErrorSignature, RecoveryId};
use serde::{Deserialize, Serialize};

use crate::recovery::RecoveryStatus;

/// Events emitted during protection and recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResilienceEvent {
    /// A recovery began for a failed operation.
    RecoveryStarted {
        recovery_id: RecoveryId,
        signature: ErrorSignature,
        operation: String,
    },

    /// A recovery reached a terminal status.
    RecoveryCompleted {
        recovery_id: RecoveryId,
        status: RecoveryStatus,
        duration_ms: u64,
    },

    /// A breaker rejected a call.
    CircuitRejected { key: String },

    /// Healing budget for a signature is used up.
    HealingExhausted { signature: ErrorSignature },
}
