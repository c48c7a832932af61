//! End-to-end scenarios through the public API: breaker opening, capped
//! healing, fallback chains, fatal errors and concurrent load.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use resilience_core::*;
use resilience_types::{codes, ErrorContext, Operation, SystemError};
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_config() -> ResilienceConfig {
    let mut config = ResilienceConfig::default();
    config.recovery.base_delay = Duration::from_millis(1);
    config.recovery.max_delay = Duration::from_millis(2);
    config.self_healing.transient_backoff = Duration::from_millis(1);
    config.self_healing.rate_limit_backoff = Duration::from_millis(1);
    config
}

fn counting_failure(calls: Arc<AtomicU32>, code: &'static str) -> Operation {
    Operation::new(move || {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SystemError::new(code, "dependency failed"))
        }
    })
}

// ---------------------------------------------------------------------------
// Breaker opens after the threshold
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_breaker_opens_after_threshold_and_stops_invoking() {
    init_tracing();
    let mut config = fast_config();
    config.circuit_breaker.failure_threshold = 3;
    let manager = ResilienceManager::new(config).unwrap();
    let breaker = manager.circuit_breaker("db.query");
    let calls = Arc::new(AtomicU32::new(0));
    let operation = counting_failure(calls.clone(), "UPSTREAM_DOWN");

    for _ in 0..3 {
        let err = breaker.execute(|| operation.call()).await.unwrap_err();
        assert!(!err.is_circuit_open());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(breaker.state(), CircuitState::Open);

    let err = manager
        .execute_with_resilience(operation, "db.query", ContextHints::new())
        .await
        .unwrap_err();

    assert!(err.is_circuit_open());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(manager.breakers().open_breakers(), vec!["db.query".to_string()]);
    assert_eq!(manager.comprehensive_metrics().orchestrator.total, 0);
}

// ---------------------------------------------------------------------------
// Healing attempts are capped per signature
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_healing_budget_is_capped_and_restored_by_reset() {
    init_tracing();
    let healing = SelfHealingSystem::new(SelfHealingConfig {
        max_attempts: 2,
        install_defaults: false,
        ..SelfHealingConfig::default()
    });
    let actions = Arc::new(AtomicU32::new(0));
    let counter = actions.clone();
    healing.register_strategy(HealingStrategy::new(
        "reconnect",
        10,
        ErrorMatcher::code_and_component(codes::CONNECTION_RESET, "database"),
        FnHealing::new("reconnect pool", move |_, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    ));

    let error = SystemError::new(codes::CONNECTION_RESET, "connection reset by peer")
        .with_component("database");
    let context = ErrorContext::new("database", "db.query")
        .with_original_operation(Operation::constant(json!({"rows": 1})));

    let mut results = Vec::new();
    for _ in 0..4 {
        results.push(healing.handle_error(&error, &context).await);
    }

    assert_eq!(results, vec![true, true, false, false]);
    assert_eq!(actions.load(Ordering::SeqCst), 2);
    assert_eq!(healing.exhausted_signatures(), vec![error.signature()]);

    healing.reset_healing_attempts();
    assert!(healing.handle_error(&error, &context).await);
    assert_eq!(actions.load(Ordering::SeqCst), 3);
}

// ---------------------------------------------------------------------------
// Fallback chain walks strategies in priority order
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_fallback_chain_serves_static_after_cache_miss() {
    init_tracing();
    let fallback = IntelligentFallbackSystem::new(FallbackConfig::default());
    fallback
        .register_strategy(FallbackStrategy::new(
            "cached",
            "ai_tutoring",
            1,
            CachedResponseFallback::new(fallback.cache(), "ai_tutoring"),
        ))
        .unwrap();
    fallback
        .register_strategy(FallbackStrategy::new(
            "static",
            "ai_tutoring",
            2,
            StaticResponseFallback::new(json!("Let's review the last lesson together.")),
        ))
        .unwrap();

    let primary = counting_failure(Arc::new(AtomicU32::new(0)), "MODEL_DOWN");
    let context = ErrorContext::new("tutor", "tutor.ask")
        .with_operation_type("ai_tutoring")
        .with_cache_key("never-cached");

    let response = fallback
        .execute_with_fallback(&primary, "ai_tutoring", &context)
        .await
        .unwrap();
    assert_eq!(response.served_by, "static");
    assert_eq!(response.attempts, 3);
    assert!(response.degraded);
    assert_eq!(
        response.value,
        Value::from("Let's review the last lesson together.")
    );

    assert!(fallback.remove_strategy("ai_tutoring", "static"));
    fallback
        .register_strategy(FallbackStrategy::new(
            "static",
            "ai_tutoring",
            2,
            FnFallback::new("broken canned response", |_| async {
                Err(SystemError::new("TEMPLATE_MISSING", "no canned response"))
            }),
        ))
        .unwrap();

    match fallback
        .execute_with_fallback(&primary, "ai_tutoring", &context)
        .await
    {
        Err(ResilienceError::FallbackExhausted {
            operation_type,
            attempts,
            failures,
        }) => {
            assert_eq!(operation_type, "ai_tutoring");
            assert_eq!(attempts, 3);
            assert_eq!(failures.len(), 3);
        }
        other => panic!("expected exhaustion, got {:?}", other),
    }
    assert_eq!(fallback.stats().total_exhaustions(), 1);
}

// ---------------------------------------------------------------------------
// Fatal errors skip healing and fallbacks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_fatal_error_fails_without_healing_or_fallback() {
    init_tracing();
    let manager = ResilienceManager::new(fast_config()).unwrap();
    let fallbacks_run = Arc::new(AtomicU32::new(0));
    let counter = fallbacks_run.clone();
    manager
        .register_fallback_strategy(FallbackStrategy::new(
            "secondary",
            "payments",
            1,
            FnFallback::new("secondary processor", move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            }),
        ))
        .unwrap();

    let error = SystemError::new(codes::CONNECTION_RESET, "ledger corrupted")
        .with_component("payments")
        .fatal();
    let context = ErrorContext::new("payments", "charge").with_operation_type("payments");

    let result = manager.recover_from_error(&error, &context).await;

    assert_eq!(result.status, RecoveryStatus::Failed);
    assert!(!result.healing_attempted);
    assert!(!result.fallback_attempted);
    assert_eq!(fallbacks_run.load(Ordering::SeqCst), 0);
    assert!(manager.self_healing().attempt_record(&error.signature()).is_none());
}

// ---------------------------------------------------------------------------
// Concurrent load
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_account_for_every_failure() {
    init_tracing();
    let mut config = fast_config();
    config.circuit_breaker.failure_threshold = 1_000;
    let manager = Arc::new(ResilienceManager::new(config).unwrap());
    let failing_invocations = Arc::new(AtomicU32::new(0));

    let handles: Vec<_> = (0..100u32)
        .map(|i| {
            let manager = manager.clone();
            let failing_invocations = failing_invocations.clone();
            tokio::spawn(async move {
                let operation = Operation::new(move || {
                    let failing_invocations = failing_invocations.clone();
                    async move {
                        if i % 5 == 0 {
                            failing_invocations.fetch_add(1, Ordering::SeqCst);
                            Err(SystemError::new("INTENTIONAL", "every fifth call fails"))
                        } else {
                            Ok(json!(i))
                        }
                    }
                });
                manager
                    .execute_with_resilience(operation, "load.test", ContextHints::new())
                    .await
            })
        })
        .collect();

    let results = tokio::time::timeout(
        Duration::from_secs(10),
        futures::future::join_all(handles),
    )
    .await
    .expect("concurrent calls finish within the time budget");

    let mut successes = 0;
    let mut failures = 0;
    for joined in results {
        match joined.expect("task panicked") {
            Ok(_) => successes += 1,
            Err(_) => failures += 1,
        }
    }
    assert_eq!(successes, 80);
    assert_eq!(failures, 20);
    assert_eq!(successes + failures, 100);

    let metrics = manager.circuit_breaker("load.test").metrics();
    assert_eq!(
        metrics.total_failures,
        failing_invocations.load(Ordering::SeqCst) as u64
    );
    assert_eq!(metrics.total_successes, 80);
    assert_eq!(metrics.state, CircuitState::Closed);

    let overall = manager.comprehensive_metrics();
    assert_eq!(overall.total_operations, 100);
    assert_eq!(overall.failed_operations, 20);
    assert_eq!(overall.orchestrator.failed, 20);
    assert_eq!(overall.orchestrator.active, 0);
}
