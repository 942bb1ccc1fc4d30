pub mod breaker;
pub mod degradation;
pub mod retry;

pub use breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
pub use degradation::DegradationManager;
pub use retry::RetryPolicy;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::ResilienceConfig;
use crate::error::{CoreError, CoreResult, ErrorKind};

/// Timeout → retry → circuit breaker composition wrapping one external
/// service. The breaker accounts the whole retry sequence as a single call:
/// one success or one counted failure per `call`.
pub struct ResiliencePolicy {
    service: String,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl ResiliencePolicy {
    pub fn new(service: &str, config: &ResilienceConfig) -> Self {
        Self {
            service: service.to_string(),
            breaker: Arc::new(CircuitBreaker::new(service, config)),
            retry: RetryPolicy::new(config),
            timeout: config.timeout(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Whether calls would currently be rejected without reaching the service.
    pub fn is_open(&self) -> bool {
        self.breaker.state() == CircuitState::Open
    }

    /// Run `op` under the composed policy. `op` is invoked once per attempt.
    pub async fn call<T, F, Fut>(&self, op: F) -> CoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let permit = self.breaker.admit()?;

        let result = match tokio::time::timeout(self.timeout, self.retry_loop(&op)).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::DeadlineExceeded),
        };

        match &result {
            Ok(_) => permit.success(),
            Err(e) if e.kind() == ErrorKind::Transient => permit.failure(),
            Err(_) => permit.forgive(),
        }
        result
    }

    async fn retry_loop<T, F, Fut>(&self, op: &F) -> CoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let retryable = err.kind() == ErrorKind::Transient;
                    if !retryable || attempt >= self.retry.max_retries() {
                        return Err(err);
                    }
                    let delay = self.retry.jittered_delay(attempt);
                    debug!(
                        "{}: attempt {} failed ({err}), retrying in {:?}",
                        self.service,
                        attempt + 1,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_retries: u32, failure_threshold: u32) -> ResilienceConfig {
        ResilienceConfig {
            failure_threshold: Some(failure_threshold),
            success_threshold: Some(1),
            recovery_timeout_s: Some(60.0),
            max_retries: Some(max_retries),
            base_delay_s: Some(0.001),
            max_delay_s: Some(0.002),
            jitter: Some(0.0),
            timeout_s: Some(5.0),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let policy = ResiliencePolicy::new("svc", &fast_config(2, 3));
        let result: CoreResult<u32> = policy.call(|| async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(policy.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let policy = ResiliencePolicy::new("svc", &fast_config(3, 3));
        let calls = AtomicU32::new(0);
        let result = policy
            .call(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CoreError::upstream("svc", "connection reset"))
                } else {
                    Ok("ok")
                }
            })
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // The aggregated outcome is one success.
        assert_eq!(policy.breaker().snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let policy = ResiliencePolicy::new("svc", &fast_config(3, 1));
        let calls = AtomicU32::new(0);
        let result: CoreResult<()> = policy
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CoreError::rejected("svc", "401"))
            })
            .await;
        assert!(matches!(result, Err(CoreError::ProviderRejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Excluded kinds never open the circuit.
        assert_eq!(policy.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_retry_sequence_counts_as_one_failure() {
        let policy = ResiliencePolicy::new("svc", &fast_config(2, 2));
        let result: CoreResult<()> = policy
            .call(|| async { Err(CoreError::upstream("svc", "boom")) })
            .await;
        assert!(result.is_err());
        let snap = policy.breaker().snapshot();
        // Three attempts, one counted failure.
        assert_eq!(snap.consecutive_failures, 1);
        assert_eq!(snap.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_circuit_rejects_without_invoking() {
        let policy = ResiliencePolicy::new("svc", &fast_config(0, 1));
        let _: CoreResult<()> = policy
            .call(|| async { Err(CoreError::upstream("svc", "boom")) })
            .await;
        assert_eq!(policy.breaker().state(), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let result: CoreResult<()> = policy
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(CoreError::CircuitOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_deadline_exceeded() {
        let config = ResilienceConfig {
            timeout_s: Some(0.02),
            max_retries: Some(0),
            ..fast_config(0, 5)
        };
        let policy = ResiliencePolicy::new("svc", &config);
        let result: CoreResult<()> = policy
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(CoreError::DeadlineExceeded)));
        // Timeouts are transient and counted.
        assert_eq!(policy.breaker().snapshot().consecutive_failures, 1);
    }
}
