//! Operation delegate and error context.
//!
//! An [`Operation`] is the retryable, zero-argument action a caller wants
//! protected. An [`ErrorContext`] travels with a failure through healing,
//! circuit breaking and fallback; it is enriched by copy, never in place.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::time::Instant;

use crate::error::SystemError;

/// Default per-attempt time budget.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Result produced by every protected operation.
pub type OperationResult = Result<Value, SystemError>;

type OperationFn = dyn Fn() -> BoxFuture<'static, OperationResult> + Send + Sync;

/// A zero-argument, re-invocable protected action.
///
/// Cheap to clone; every call produces a fresh future.
#[derive(Clone)]
pub struct Operation {
    inner: Arc<OperationFn>,
}

impl Operation {
    /// Wrap an async closure.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = OperationResult> + Send + 'static,
    {
        Self {
            inner: Arc::new(move || -> BoxFuture<'static, OperationResult> { Box::pin(f()) }),
        }
    }

    /// Operation that always resolves to `value`.
    pub fn constant(value: Value) -> Self {
        Self::new(move || {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    /// Start a fresh invocation.
    pub fn call(&self) -> BoxFuture<'static, OperationResult> {
        (self.inner)()
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation").finish_non_exhaustive()
    }
}

/// Context carried alongside a failure.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    component: String,
    operation: String,
    operation_type: Option<String>,
    metadata: HashMap<String, String>,
    parameters: Value,
    original_operation: Option<Operation>,
    timeout: Duration,
    retry_count: u32,
    deadline: Option<Instant>,
    cache_key: Option<String>,
}

impl ErrorContext {
    /// Context for `operation` of `component`.
    pub fn new(component: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            operation: operation.into(),
            operation_type: None,
            metadata: HashMap::new(),
            parameters: Value::Null,
            original_operation: None,
            timeout: DEFAULT_TIMEOUT,
            retry_count: 0,
            deadline: None,
            cache_key: None,
        }
    }

    /// Set the fallback category.
    pub fn with_operation_type(mut self, operation_type: impl Into<String>) -> Self {
        self.operation_type = Some(operation_type.into());
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set the operation parameters.
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Record the operation to re-invoke.
    pub fn with_original_operation(mut self, operation: Operation) -> Self {
        self.original_operation = Some(operation);
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the retry count.
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Set the overall deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the response cache key.
    pub fn with_cache_key(mut self, cache_key: impl Into<String>) -> Self {
        self.cache_key = Some(cache_key.into());
        self
    }

    /// Copy of this context with one extra metadata entry.
    pub fn enriched(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.clone().with_metadata(key, value)
    }

    /// Get the component.
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Get the operation name.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Get the fallback category.
    pub fn operation_type(&self) -> Option<&str> {
        self.operation_type.as_deref()
    }

    /// Get the metadata.
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Get the parameters.
    pub fn parameters(&self) -> &Value {
        &self.parameters
    }

    /// Get the operation to re-invoke.
    pub fn original_operation(&self) -> Option<&Operation> {
        self.original_operation.as_ref()
    }

    /// Get the per-attempt timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Get the retry count.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Get the deadline.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Get the response cache key.
    pub fn cache_key(&self) -> Option<&str> {
        self.cache_key.as_deref()
    }

    /// Time left before the deadline, if one was supplied.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has passed.
    pub fn deadline_exceeded(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }

    /// Budget for a single attempt: the per-attempt timeout, tightened by
    /// whatever remains of the deadline.
    pub fn attempt_budget(&self) -> Duration {
        match self.remaining() {
            Some(remaining) => remaining.min(self.timeout),
            None => self.timeout,
        }
    }

    /// Drive `fut` within the attempt budget. Exceeding it yields a timeout
    /// error attributed to this context's component.
    pub async fn bounded<F>(&self, fut: F) -> OperationResult
    where
        F: Future<Output = OperationResult>,
    {
        if self.deadline_exceeded() {
            return Err(SystemError::deadline_exceeded(&self.component));
        }

        let budget = self.attempt_budget();
        match tokio::time::timeout(budget, fut).await {
            Ok(result) => result,
            Err(_) => Err(SystemError::timeout(
                &self.component,
                budget.as_millis() as u64,
            )),
        }
    }

    /// Re-invoke the original operation within the attempt budget.
    pub async fn invoke_original(&self) -> OperationResult {
        match &self.original_operation {
            Some(op) => self.bounded(op.call()).await,
            None => Err(SystemError::new(
                crate::error::codes::NO_ORIGINAL_OPERATION,
                format!("no original operation recorded for {}", self.operation),
            )
            .with_component(&self.component)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_operation_is_reinvocable() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let op = Operation::new(move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Value::from(n))
            }
        });

        assert_eq!(op.call().await.unwrap(), Value::from(1));
        assert_eq!(op.call().await.unwrap(), Value::from(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_enriched_leaves_original_untouched() {
        let ctx = ErrorContext::new("database", "load_profile");
        let enriched = ctx.enriched("attempt", "2");

        assert!(ctx.metadata().is_empty());
        assert_eq!(enriched.metadata().get("attempt").map(String::as_str), Some("2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let ctx = ErrorContext::new("voice", "synthesize").with_timeout(Duration::from_millis(50));
        let result = ctx
            .bounded(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Value::Null)
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.code(), crate::error::codes::OPERATION_TIMEOUT);
        assert_eq!(err.component(), "voice");
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_budget_respects_deadline() {
        let ctx = ErrorContext::new("api", "fetch")
            .with_original_operation(Operation::constant(Value::Null))
            .with_timeout(Duration::from_secs(10))
            .with_deadline(Instant::now() + Duration::from_secs(2));

        assert!(ctx.attempt_budget() <= Duration::from_secs(2));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(ctx.deadline_exceeded());
        let err = ctx.invoke_original().await.unwrap_err();
        assert_eq!(err.code(), crate::error::codes::DEADLINE_EXCEEDED);
    }

    #[tokio::test]
    async fn test_invoke_original_without_operation() {
        let ctx = ErrorContext::new("api", "fetch");
        let err = ctx.invoke_original().await.unwrap_err();
        assert_eq!(err.code(), crate::error::codes::NO_ORIGINAL_OPERATION);
    }
}
