//! Property tests: breaker thresholds, healing caps and predictor bounds hold
//! for arbitrary inputs.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use proptest::prelude::*;
use resilience_core::*;
use resilience_types::{ErrorContext, Operation, SystemError};
use serde_json::Value;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

/// Telemetry readings, including the non-finite values hosts sometimes
/// report.
fn arb_reading() -> impl Strategy<Value = f64> {
    prop_oneof![
        4 => -2.0f64..3.0,
        1 => Just(f64::NAN),
        1 => Just(f64::INFINITY),
        1 => Just(f64::NEG_INFINITY),
    ]
}

proptest! {
    #[test]
    fn property_breaker_opens_after_exactly_threshold_failures(
        threshold in 1u32..12,
        leading_successes in 0usize..5,
    ) {
        let rt = runtime();
        rt.block_on(async move {
            let breaker = CircuitBreaker::new(
                "prop.op",
                CircuitBreakerConfig {
                    failure_threshold: threshold,
                    ..CircuitBreakerConfig::default()
                },
            );
            for _ in 0..leading_successes {
                breaker.execute(|| async { Ok(Value::Null) }).await.unwrap();
            }

            for _ in 0..threshold - 1 {
                let _ = breaker
                    .execute(|| async { Err(SystemError::new("X", "fail")) })
                    .await;
                assert_eq!(breaker.state(), CircuitState::Closed);
            }

            let _ = breaker
                .execute(|| async { Err(SystemError::new("X", "fail")) })
                .await;
            assert_eq!(breaker.state(), CircuitState::Open);

            let invoked = AtomicU32::new(0);
            let rejected = breaker
                .execute(|| async {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                })
                .await;
            assert!(rejected.unwrap_err().is_circuit_open());
            assert_eq!(invoked.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn property_healing_actions_never_exceed_budget(
        max_attempts in 1u32..6,
        calls in 0u32..12,
    ) {
        let rt = runtime();
        rt.block_on(async move {
            let healing = SelfHealingSystem::new(SelfHealingConfig {
                max_attempts,
                install_defaults: false,
                ..SelfHealingConfig::default()
            });
            let actions = Arc::new(AtomicU32::new(0));
            let counter = actions.clone();
            healing.register_strategy(HealingStrategy::new(
                "flush",
                1,
                ErrorMatcher::code("STALE"),
                FnHealing::new("flush cache", move |_, _| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            ));

            let error = SystemError::new("STALE", "stale read").with_component("cache");
            let context = ErrorContext::new("cache", "cache.get")
                .with_original_operation(Operation::constant(Value::Bool(true)));

            let mut healed = 0;
            for _ in 0..calls {
                if healing.handle_error(&error, &context).await {
                    healed += 1;
                }
            }

            assert_eq!(healed, calls.min(max_attempts));
            assert_eq!(actions.load(Ordering::SeqCst), calls.min(max_attempts));
        });
    }

    #[test]
    fn property_prediction_stays_in_unit_range(
        load in arb_reading(),
        health in arb_reading(),
        active_users in 0u32..5_000,
        recorded in 0usize..8,
    ) {
        let predictor = ErrorPredictor::new(PredictorConfig::default());
        let context = PredictionContext::new(load, health).with_active_users(active_users);
        for _ in 0..recorded {
            predictor.record_error(&context, &SystemError::new("RESOURCE_EXHAUSTED", "oom"));
        }

        let prediction = predictor.analyze_and_predict(&context);

        prop_assert!((0.0..=1.0).contains(&prediction.risk_score));
        prop_assert!((0.0..=1.0).contains(&prediction.confidence));
        prop_assert!(prediction
            .preventative_actions
            .contains(&PreventativeAction::Monitor));
        prop_assert_eq!(
            prediction.risk,
            PredictorConfig::default().thresholds.classify(prediction.risk_score)
        );
    }

    #[test]
    fn property_risk_classification_is_monotonic(a in 0.0f64..=1.0, b in 0.0f64..=1.0) {
        let thresholds = RiskThresholds::default();
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(thresholds.classify(low) <= thresholds.classify(high));
    }
}
