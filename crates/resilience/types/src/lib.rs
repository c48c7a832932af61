//! # Resilience Types
//!
//! Value types shared by every layer of the resilience stack:
//!
//! - [`SystemError`]: immutable, origin-classified failure
//! - [`ErrorContext`]: context carried with a failure through recovery
//! - [`Operation`]: the re-invocable, zero-argument protected action
//! - [`RecoveryId`] / [`ErrorSignature`]: identifiers

#![cfg_attr(feature = "strict-docs", warn(missing_docs))]

pub mod context;
pub mod error;
pub mod ids;

pub use context::{ErrorContext, Operation, OperationResult, DEFAULT_TIMEOUT};
pub use error::{codes, Severity, SystemError};
pub use ids::{ErrorSignature, RecoveryId};
