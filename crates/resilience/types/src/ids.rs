//! Strongly-typed identifiers for resilience entities
//!
//! Recovery ids are UUID-based; error signatures are derived string keys.
//! Both are wrapped in newtype structs for type safety.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a single recovery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecoveryId(Uuid);

impl RecoveryId {
    /// Generate a new random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for RecoveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "recovery:{}", self.0)
    }
}

/// Key grouping equivalent failures, derived from error code and component.
///
/// Used for attempt-limiting in self-healing and for event reporting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ErrorSignature(String);

impl ErrorSignature {
    /// Signature for `code` raised by `component`.
    pub fn new(code: &str, component: &str) -> Self {
        Self(format!("{}@{}", code, component))
    }

    /// Get the `code@component` string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ErrorSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
