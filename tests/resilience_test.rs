//! Resilience invariants: breaker state machine, retry delay bands,
//! reset idempotence, provider failover.

mod common;

use common::{harness_with_llm, ScriptedLlm};
use kb_core::config::{ResilienceConfig, ResilienceSection};
use kb_core::llm::{LlmProviderManager, Message};
use kb_core::resilience::{CircuitBreaker, CircuitState, DegradationManager, ResiliencePolicy, RetryPolicy};
use kb_core::CoreError;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn breaker_config(failure: u32, success: u32, recovery_ms: u64) -> ResilienceConfig {
    ResilienceConfig {
        failure_threshold: Some(failure),
        success_threshold: Some(success),
        recovery_timeout_s: Some(recovery_ms as f64 / 1000.0),
        half_open_max_concurrent: Some(3),
        max_retries: Some(0),
        base_delay_s: Some(0.001),
        jitter: Some(0.0),
        timeout_s: Some(5.0),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_breaker_full_lifecycle_through_policy() {
    let policy = ResiliencePolicy::new("svc", &breaker_config(3, 2, 30));
    let invocations = AtomicU32::new(0);

    // Exactly failure_threshold counted failures open the circuit.
    for _ in 0..3 {
        let _: Result<(), _> = policy
            .call(|| async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err(CoreError::upstream("svc", "boom"))
            })
            .await;
    }
    assert_eq!(policy.breaker().state(), CircuitState::Open);
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    // Within the recovery window the wrapped function is never invoked.
    let rejected: Result<(), _> = policy
        .call(|| async {
            invocations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    assert!(matches!(rejected, Err(CoreError::CircuitOpen(_))));
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    // After the timeout the next call probes half-open; success_threshold
    // consecutive successes close the circuit.
    tokio::time::sleep(Duration::from_millis(60)).await;
    policy.call(|| async { Ok(()) }).await.unwrap();
    assert_eq!(policy.breaker().state(), CircuitState::HalfOpen);
    policy.call(|| async { Ok(()) }).await.unwrap();
    assert_eq!(policy.breaker().state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_half_open_failure_reopens() {
    let policy = ResiliencePolicy::new("svc", &breaker_config(1, 2, 20));
    let _: Result<(), _> = policy
        .call(|| async { Err(CoreError::upstream("svc", "boom")) })
        .await;
    assert_eq!(policy.breaker().state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let _: Result<(), _> = policy
        .call(|| async { Err(CoreError::upstream("svc", "still broken")) })
        .await;
    assert_eq!(policy.breaker().state(), CircuitState::Open);
}

#[test]
fn test_retry_delays_fit_jitter_bands() {
    // base=1s, base_exp=2, max_delay=30s, max_retries=3, jitter=0.5.
    let policy = RetryPolicy::new(&ResilienceConfig {
        max_retries: Some(3),
        base_delay_s: Some(1.0),
        max_delay_s: Some(30.0),
        backoff_base: Some(2.0),
        jitter: Some(0.5),
        ..Default::default()
    });

    for i in 0..3u32 {
        let nominal = 2f64.powi(i as i32);
        for _ in 0..500 {
            let delay = policy.jittered_delay(i).as_secs_f64();
            assert!(
                delay >= nominal * 0.5 - 1e-9 && delay <= nominal * 1.5 + 1e-9,
                "delay {delay}s for retry {i} outside [{}, {}]",
                nominal * 0.5,
                nominal * 1.5
            );
        }
    }
}

#[test]
fn test_reset_idempotence() {
    let breaker = CircuitBreaker::new("svc", &breaker_config(2, 2, 60_000));

    // Reset on a closed circuit is a no-op.
    let before = breaker.snapshot();
    breaker.reset();
    let after = breaker.snapshot();
    assert_eq!(before.state, after.state);
    assert_eq!(after.consecutive_failures, 0);

    // Reset from any state returns closed with zeroed counters.
    breaker.admit().unwrap().failure();
    breaker.admit().unwrap().failure();
    assert_eq!(breaker.state(), CircuitState::Open);
    breaker.reset();
    let snap = breaker.snapshot();
    assert_eq!(snap.state, CircuitState::Closed);
    assert_eq!(snap.consecutive_failures, 0);
    assert_eq!(snap.consecutive_successes, 0);
}

#[tokio::test]
async fn test_failover_across_providers() {
    // Provider order [a, b, c]; a retries then gives up, b succeeds.
    let section = ResilienceSection {
        default: ResilienceConfig {
            max_retries: Some(2),
            base_delay_s: Some(0.001),
            jitter: Some(0.0),
            failure_threshold: Some(5),
            timeout_s: Some(5.0),
            ..Default::default()
        },
        services: Default::default(),
    };
    let a = Arc::new(ScriptedLlm::failing());
    let b = Arc::new(ScriptedLlm::replying("from b"));
    let c = Arc::new(ScriptedLlm::replying("from c"));
    let providers: Vec<(String, Arc<dyn kb_core::llm::CompletionModel>)> = vec![
        ("a".to_string(), a.clone()),
        ("b".to_string(), b.clone()),
        ("c".to_string(), c.clone()),
    ];
    let manager = LlmProviderManager::new(providers, &section, Arc::new(DegradationManager::new()));

    let result = manager
        .generate(None, &[Message::user("hello")], None, None)
        .await
        .unwrap();
    assert_eq!(result.content, "from b");
    assert_eq!(result.provider, "b");

    // a exhausted its retry budget (3 attempts), b answered once, c untouched.
    assert_eq!(a.calls.load(Ordering::SeqCst), 3);
    assert_eq!(b.calls.load(Ordering::SeqCst), 1);
    assert_eq!(c.calls.load(Ordering::SeqCst), 0);

    let snapshots = manager.breaker_snapshots();
    let snap_a = snapshots.iter().find(|s| s.service == "llm.a").unwrap();
    let snap_b = snapshots.iter().find(|s| s.service == "llm.b").unwrap();
    assert!(snap_a.consecutive_failures >= 1);
    assert_eq!(snap_b.state, CircuitState::Closed);
    assert_eq!(snap_b.consecutive_failures, 0);
}

#[tokio::test]
async fn test_registry_status_and_circuit_reset() {
    let h = harness_with_llm(Some(Arc::new(ScriptedLlm::replying("ok")))).await;

    h.registry.force_open("embedding");
    let status = h.registry.status().await;
    assert!(status.initialized);
    let embedding = status
        .breakers
        .iter()
        .find(|b| b.service == "embedding")
        .unwrap();
    assert_eq!(embedding.state, CircuitState::Open);

    assert!(h.registry.reset_circuit("embedding"));
    let status = h.registry.status().await;
    let embedding = status
        .breakers
        .iter()
        .find(|b| b.service == "embedding")
        .unwrap();
    assert_eq!(embedding.state, CircuitState::Closed);

    assert!(!h.registry.reset_circuit("no-such-service"));
    assert!(h.registry.reset_circuit("llm.mock"));
}
