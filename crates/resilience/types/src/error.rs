//! System error value type.
//!
//! `SystemError` is the immutable, origin-classified failure that flows
//! through every layer of the protection stack.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::ErrorSignature;

/// Well-known error codes produced by callers and by the stack itself.
pub mod codes {
    pub const CONNECTION_RESET: &str = "ECONNRESET";
    pub const CONNECTION_REFUSED: &str = "ECONNREFUSED";
    pub const TIMED_OUT: &str = "ETIMEDOUT";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const RESOURCE_EXHAUSTED: &str = "RESOURCE_EXHAUSTED";
    pub const SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
    pub const OPERATION_TIMEOUT: &str = "TIMEOUT";
    pub const DEADLINE_EXCEEDED: &str = "DEADLINE_EXCEEDED";
    pub const NO_ORIGINAL_OPERATION: &str = "NO_ORIGINAL_OPERATION";
    pub const UNKNOWN: &str = "UNKNOWN";
}

/// Severity of a system error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// An immutable, classified failure.
///
/// Build one with [`SystemError::new`] and the consuming `with_*` methods;
/// once built, fields are only readable.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{name} [{code}] in {component}: {message}")]
pub struct SystemError {
    name: String,
    message: String,
    code: String,
    severity: Severity,
    component: String,
    context: HashMap<String, String>,
    timestamp: DateTime<Utc>,
    recoverable: bool,
}

impl SystemError {
    /// Create a recoverable, medium-severity error.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: "SystemError".to_string(),
            message: message.into(),
            code: code.into(),
            severity: Severity::Medium,
            component: "unknown".to_string(),
            context: HashMap::new(),
            timestamp: Utc::now(),
            recoverable: true,
        }
    }

    /// Error raised when an operation exceeded its time budget.
    pub fn timeout(component: impl Into<String>, timeout_ms: u64) -> Self {
        Self::new(
            codes::OPERATION_TIMEOUT,
            format!("operation timed out after {}ms", timeout_ms),
        )
        .with_name("TimeoutError")
        .with_component(component)
        .with_context("timeout_ms", timeout_ms.to_string())
    }

    /// Error raised when the caller-supplied deadline has already passed.
    pub fn deadline_exceeded(component: impl Into<String>) -> Self {
        Self::new(codes::DEADLINE_EXCEEDED, "caller deadline exceeded")
            .with_name("DeadlineExceeded")
            .with_component(component)
    }

    /// Set the error name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the severity.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Set the originating component.
    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = component.into();
        self
    }

    /// Add a context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Override the timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Mark the error as fatal: the orchestrator will not heal or fall back.
    pub fn fatal(mut self) -> Self {
        self.recoverable = false;
        self
    }

    /// Get the error name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the error code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Get the severity.
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Get the originating component.
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Get the context entries.
    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    /// Get the timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Whether recovery may be attempted.
    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    /// Derived key of (code, component).
    pub fn signature(&self) -> ErrorSignature {
        ErrorSignature::new(&self.code, &self.component)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let err = SystemError::new(codes::CONNECTION_RESET, "socket closed");
        assert_eq!(err.code(), "ECONNRESET");
        assert_eq!(err.severity(), Severity::Medium);
        assert!(err.is_recoverable());
        assert!(err.context().is_empty());
    }

    #[test]
    fn test_fatal_and_signature() {
        let err = SystemError::new("AUTH_REVOKED", "token revoked")
            .with_component("auth")
            .with_severity(Severity::Critical)
            .fatal();

        assert!(!err.is_recoverable());
        assert_eq!(err.signature().as_str(), "AUTH_REVOKED@auth");
        assert!(err.to_string().contains("AUTH_REVOKED"));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Low < Severity::Medium);
    }
}
