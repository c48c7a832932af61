//! Error types for resilience-core crate.
//!
//! Callers of the protection stack observe either a successful value or
//! exactly one of the terminal variants below.

use resilience_types::SystemError;
use thiserror::Error;

/// Terminal errors surfaced by the resilience layer.
#[derive(Debug, Clone, Error)]
pub enum ResilienceError {
    /// Circuit breaker is open, rejecting requests.
    #[error("circuit breaker open for {key}")]
    CircuitOpen { key: String },

    /// The primary operation and every registered fallback failed.
    #[error("all {attempts} strategies failed for operation type {operation_type}")]
    FallbackExhausted {
        operation_type: String,
        attempts: u32,
        failures: Vec<String>,
    },

    /// Original error, surfaced when it is fatal or nothing could recover it.
    #[error(transparent)]
    System(#[from] SystemError),

    /// Configuration or registration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ResilienceError {
    /// Rejection by the breaker for `key`.
    pub fn circuit_open(key: impl Into<String>) -> Self {
        ResilienceError::CircuitOpen { key: key.into() }
    }

    /// Whether this is a breaker rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }

    /// Short machine-readable kind, used in logs and recovery steps.
    pub fn kind(&self) -> &'static str {
        match self {
            ResilienceError::CircuitOpen { .. } => "circuit_open",
            ResilienceError::FallbackExhausted { .. } => "fallback_exhausted",
            ResilienceError::System(_) => "system",
            ResilienceError::Configuration(_) => "configuration",
        }
    }
}

/// Result type for resilience operations.
pub type ResilienceResult<T> = Result<T, ResilienceError>;
