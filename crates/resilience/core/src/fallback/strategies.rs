//! Built-in fallback executors.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use resilience_types::{ErrorContext, OperationResult, SystemError};
use serde_json::Value;

use super::cache::ResponseCache;

/// Code reported when the cache holds nothing usable.
pub const CACHE_MISS: &str = "CACHE_MISS";

/// Alternate operation executed when earlier attempts failed.
#[async_trait]
pub trait FallbackExecutor: Send + Sync {
    async fn execute(&self, context: &ErrorContext) -> OperationResult;

    /// Short description for observability.
    fn description(&self) -> String {
        "custom".to_string()
    }
}

/// Serves the last successful primary response for the context's cache key.
pub struct CachedResponseFallback {
    cache: Arc<ResponseCache>,
    operation_type: String,
}

impl CachedResponseFallback {
    /// Serve entries of `operation_type` from `cache`.
    pub fn new(cache: Arc<ResponseCache>, operation_type: impl Into<String>) -> Self {
        Self {
            cache,
            operation_type: operation_type.into(),
        }
    }
}

#[async_trait]
impl FallbackExecutor for CachedResponseFallback {
    async fn execute(&self, context: &ErrorContext) -> OperationResult {
        let miss = || {
            SystemError::new(CACHE_MISS, "no cached response available")
                .with_component(context.component())
        };

        let key = context.cache_key().ok_or_else(miss)?;
        self.cache.get(&self.operation_type, key).ok_or_else(miss)
    }

    fn description(&self) -> String {
        format!("cached response ({})", self.operation_type)
    }
}

/// Canned response, optionally chosen by a metadata value (e.g. `topic`).
pub struct StaticResponseFallback {
    selector: Option<String>,
    variants: HashMap<String, Value>,
    default: Value,
}

impl StaticResponseFallback {
    /// Always answer with `value`.
    pub fn new(value: Value) -> Self {
        Self {
            selector: None,
            variants: HashMap::new(),
            default: value,
        }
    }

    /// Answer with the variant named by `context.metadata[selector]`
    /// (case-insensitive), or `default` when absent.
    pub fn keyed(
        selector: impl Into<String>,
        variants: HashMap<String, Value>,
        default: Value,
    ) -> Self {
        Self {
            selector: Some(selector.into()),
            variants: variants
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v))
                .collect(),
            default,
        }
    }
}

#[async_trait]
impl FallbackExecutor for StaticResponseFallback {
    async fn execute(&self, context: &ErrorContext) -> OperationResult {
        let chosen = self
            .selector
            .as_ref()
            .and_then(|selector| context.metadata().get(selector))
            .and_then(|value| self.variants.get(&value.to_lowercase()));

        Ok(chosen.unwrap_or(&self.default).clone())
    }

    fn description(&self) -> String {
        match &self.selector {
            Some(selector) => format!("static response by {}", selector),
            None => "static response".to_string(),
        }
    }
}

/// Adapter turning an async closure into a [`FallbackExecutor`].
pub struct FnFallback<F> {
    description: String,
    f: F,
}

impl<F, Fut> FnFallback<F>
where
    F: Fn(ErrorContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = OperationResult> + Send + 'static,
{
    /// Wrap `f` under `description`.
    pub fn new(description: impl Into<String>, f: F) -> Self {
        Self {
            description: description.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> FallbackExecutor for FnFallback<F>
where
    F: Fn(ErrorContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = OperationResult> + Send + 'static,
{
    async fn execute(&self, context: &ErrorContext) -> OperationResult {
        (self.f)(context.clone()).await
    }

    fn description(&self) -> String {
        self.description.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_static_keyed_by_topic() {
        let mut variants = HashMap::new();
        variants.insert(
            "Algebra".to_string(),
            Value::from("Solve for x: 2x + 5 = 13"),
        );
        let fallback = StaticResponseFallback::keyed(
            "topic",
            variants,
            Value::from("Let's work on a problem together."),
        );

        let algebra = ErrorContext::new("tutor", "practice").with_metadata("topic", "algebra");
        let unknown = ErrorContext::new("tutor", "practice").with_metadata("topic", "poetry");

        assert_eq!(
            fallback.execute(&algebra).await.unwrap(),
            Value::from("Solve for x: 2x + 5 = 13")
        );
        assert_eq!(
            fallback.execute(&unknown).await.unwrap(),
            Value::from("Let's work on a problem together.")
        );
    }

    #[tokio::test]
    async fn test_cached_fallback_miss_and_hit() {
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(60), 16));
        let fallback = CachedResponseFallback::new(cache.clone(), "ai_tutoring");

        let no_key = ErrorContext::new("tutor", "ask");
        assert_eq!(fallback.execute(&no_key).await.unwrap_err().code(), CACHE_MISS);

        let keyed = no_key.clone().with_cache_key("q-42");
        assert!(fallback.execute(&keyed).await.is_err());

        cache.put("ai_tutoring", "q-42", Value::from("stored"));
        assert_eq!(fallback.execute(&keyed).await.unwrap(), Value::from("stored"));
    }
}
