//! Intelligent fallback: ordered chains of alternate operations per
//! operation category.
//!
//! Strategy lists are immutable snapshots replaced on every registry edit,
//! so a concurrent `remove_strategy` never disturbs an in-flight chain.

mod cache;
mod strategies;

pub use cache::ResponseCache;
pub use strategies::{
    CachedResponseFallback, FallbackExecutor, FnFallback, StaticResponseFallback, CACHE_MISS,
};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use resilience_types::{ErrorContext, Operation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::config::FallbackConfig;
use crate::error::{ResilienceError, ResilienceResult};

/// Name reported when the primary operation served the response.
pub const PRIMARY: &str = "primary";

/// One alternate operation registered for an operation type.
#[derive(Clone)]
pub struct FallbackStrategy {
    name: String,
    operation_type: String,
    priority: u32,
    executor: Arc<dyn FallbackExecutor>,
}

impl FallbackStrategy {
    /// Lower priority values are tried first.
    pub fn new(
        name: impl Into<String>,
        operation_type: impl Into<String>,
        priority: u32,
        executor: impl FallbackExecutor + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            operation_type: operation_type.into(),
            priority,
            executor: Arc::new(executor),
        }
    }

    /// Strategy name, unique within its operation type.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Operation type this strategy serves.
    pub fn operation_type(&self) -> &str {
        &self.operation_type
    }

    /// Lower values run first.
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Executor description for observability.
    pub fn description(&self) -> String {
        self.executor.description()
    }
}

impl fmt::Debug for FallbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackStrategy")
            .field("name", &self.name)
            .field("operation_type", &self.operation_type)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Successful result of a fallback chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackResponse {
    pub value: Value,

    /// Strategy that produced the value ([`PRIMARY`] for the primary).
    pub served_by: String,

    /// Attempts made, including the successful one.
    pub attempts: u32,

    /// Whether an alternate served the value.
    pub degraded: bool,
}

/// Counters for one operation type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FallbackTypeStats {
    pub executions: u64,
    pub primary_successes: u64,
    pub fallback_successes: u64,
    pub exhaustions: u64,
    pub failed_attempts: u64,
}

/// Fallback statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FallbackStats {
    pub registered_types: usize,
    pub total_strategies: usize,
    pub cached_responses: usize,
    pub by_type: BTreeMap<String, FallbackTypeStats>,
}

impl FallbackStats {
    /// Exhausted chains across every operation type.
    pub fn total_exhaustions(&self) -> u64 {
        self.by_type.values().map(|s| s.exhaustions).sum()
    }
}

/// Executes ordered fallback chains.
pub struct IntelligentFallbackSystem {
    /// Configuration.
    config: FallbackConfig,

    /// Priority-sorted strategy snapshots per operation type.
    registry: DashMap<String, Arc<Vec<FallbackStrategy>>>,

    /// Counters per operation type.
    stats: DashMap<String, FallbackTypeStats>,

    /// Successful primary responses.
    cache: Arc<ResponseCache>,
}

impl IntelligentFallbackSystem {
    /// Create a fallback system with an empty registry.
    pub fn new(config: FallbackConfig) -> Self {
        let cache = Arc::new(ResponseCache::new(config.cache_ttl, config.cache_capacity));
        Self {
            config,
            registry: DashMap::new(),
            stats: DashMap::new(),
            cache,
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    /// Shared response cache, for building [`CachedResponseFallback`]s.
    pub fn cache(&self) -> Arc<ResponseCache> {
        self.cache.clone()
    }

    /// Register a strategy under its operation type. A strategy with the same
    /// name in that type is replaced.
    pub fn register_strategy(&self, strategy: FallbackStrategy) -> ResilienceResult<()> {
        if strategy.name().is_empty() || strategy.operation_type().is_empty() {
            return Err(ResilienceError::Configuration(
                "fallback strategy needs a name and an operation type".to_string(),
            ));
        }
        if strategy.name() == PRIMARY {
            return Err(ResilienceError::Configuration(format!(
                "fallback strategy name '{}' is reserved",
                PRIMARY
            )));
        }

        info!(
            operation_type = strategy.operation_type(),
            strategy = strategy.name(),
            priority = strategy.priority(),
            "Registering fallback strategy"
        );

        let mut entry = self
            .registry
            .entry(strategy.operation_type().to_string())
            .or_insert_with(|| Arc::new(Vec::new()));

        let mut next: Vec<FallbackStrategy> = entry
            .iter()
            .filter(|s| s.name() != strategy.name())
            .cloned()
            .collect();
        next.push(strategy);
        next.sort_by_key(|s| s.priority());
        *entry = Arc::new(next);
        Ok(())
    }

    /// Remove a strategy. In-flight chains keep their snapshot.
    pub fn remove_strategy(&self, operation_type: &str, name: &str) -> bool {
        let Some(mut entry) = self.registry.get_mut(operation_type) else {
            return false;
        };

        let next: Vec<FallbackStrategy> = entry
            .iter()
            .filter(|s| s.name() != name)
            .cloned()
            .collect();
        let removed = next.len() != entry.len();
        *entry = Arc::new(next);

        if removed {
            info!(operation_type = operation_type, strategy = name, "Removed fallback strategy");
        }
        removed
    }

    fn snapshot(&self, operation_type: &str) -> Arc<Vec<FallbackStrategy>> {
        self.registry
            .get(operation_type)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Whether any fallback is registered for `operation_type`.
    pub fn has_strategies(&self, operation_type: &str) -> bool {
        !self.snapshot(operation_type).is_empty()
    }

    /// Strategies for one type, in the order they are tried.
    pub fn strategies(&self, operation_type: &str) -> Vec<FallbackStrategy> {
        self.snapshot(operation_type).as_ref().clone()
    }

    /// Every registered strategy, grouped by operation type.
    pub fn all_strategies(&self) -> BTreeMap<String, Vec<FallbackStrategy>> {
        self.registry
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| (e.key().clone(), e.value().as_ref().clone()))
            .collect()
    }

    /// Run `primary`, then each registered fallback for `operation_type`
    /// until one succeeds.
    #[instrument(skip(self, primary, context), fields(operation = context.operation()))]
    pub async fn execute_with_fallback(
        &self,
        primary: &Operation,
        operation_type: &str,
        context: &ErrorContext,
    ) -> ResilienceResult<FallbackResponse> {
        let chain = self.snapshot(operation_type);
        self.bump(operation_type, |s| s.executions += 1);

        match context.bounded(primary.call()).await {
            Ok(value) => {
                if let Some(key) = context.cache_key() {
                    self.cache.put(operation_type, key, value.clone());
                }
                self.bump(operation_type, |s| s.primary_successes += 1);
                return Ok(FallbackResponse {
                    value,
                    served_by: PRIMARY.to_string(),
                    attempts: 1,
                    degraded: false,
                });
            }
            Err(err) => {
                debug!(code = err.code(), "Primary failed, entering fallback chain");
                self.bump(operation_type, |s| s.failed_attempts += 1);
                let failures = vec![format!("{}: {}", PRIMARY, err)];
                self.run_chain(&chain, operation_type, context, 1, failures)
                    .await
            }
        }
    }

    /// Run only the registered fallbacks; the caller already saw the primary
    /// fail.
    #[instrument(skip(self, context), fields(operation = context.operation()))]
    pub async fn execute_fallback_chain(
        &self,
        operation_type: &str,
        context: &ErrorContext,
    ) -> ResilienceResult<FallbackResponse> {
        let chain = self.snapshot(operation_type);
        self.bump(operation_type, |s| s.executions += 1);
        self.run_chain(&chain, operation_type, context, 0, Vec::new())
            .await
    }

    async fn run_chain(
        &self,
        chain: &[FallbackStrategy],
        operation_type: &str,
        context: &ErrorContext,
        mut attempts: u32,
        mut failures: Vec<String>,
    ) -> ResilienceResult<FallbackResponse> {
        for strategy in chain {
            if context.deadline_exceeded() {
                failures.push(format!("{}: deadline exceeded", strategy.name()));
                break;
            }

            attempts += 1;
            match context.bounded(strategy.executor.execute(context)).await {
                Ok(value) => {
                    info!(
                        operation_type = operation_type,
                        strategy = strategy.name(),
                        attempts = attempts,
                        "Fallback strategy succeeded"
                    );
                    self.bump(operation_type, |s| s.fallback_successes += 1);
                    return Ok(FallbackResponse {
                        value,
                        served_by: strategy.name().to_string(),
                        attempts,
                        degraded: true,
                    });
                }
                Err(err) => {
                    debug!(
                        strategy = strategy.name(),
                        code = err.code(),
                        "Fallback strategy failed"
                    );
                    self.bump(operation_type, |s| s.failed_attempts += 1);
                    failures.push(format!("{}: {}", strategy.name(), err));
                }
            }
        }

        warn!(
            operation_type = operation_type,
            attempts = attempts,
            "Fallback chain exhausted"
        );
        self.bump(operation_type, |s| s.exhaustions += 1);
        Err(ResilienceError::FallbackExhausted {
            operation_type: operation_type.to_string(),
            attempts,
            failures,
        })
    }

    fn bump(&self, operation_type: &str, update: impl FnOnce(&mut FallbackTypeStats)) {
        let mut stats = self.stats.entry(operation_type.to_string()).or_default();
        update(&mut stats);
    }

    /// Registry and execution statistics.
    pub fn stats(&self) -> FallbackStats {
        let by_type: BTreeMap<String, FallbackTypeStats> = self
            .stats
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let (registered_types, total_strategies) = self
            .registry
            .iter()
            .filter(|e| !e.value().is_empty())
            .fold((0, 0), |(types, total), e| (types + 1, total + e.value().len()));

        FallbackStats {
            registered_types,
            total_strategies,
            cached_responses: self.cache.len(),
            by_type,
        }
    }

    /// Clear counters and cached responses; registrations are kept.
    pub fn reset_stats(&self) {
        self.stats.clear();
        self.cache.clear();
    }
}
