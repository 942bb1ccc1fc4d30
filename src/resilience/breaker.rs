use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::ResilienceConfig;
use crate::error::CoreError;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn tag(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    fn from_tag(tag: u8) -> Self {
        match tag {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Point-in-time view of a breaker, for operator status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub seconds_since_last_failure: Option<f64>,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_at: Option<Instant>,
    half_open_in_flight: usize,
}

/// Per-service circuit breaker.
///
/// closed → open after `failure_threshold` consecutive counted failures;
/// open → half_open lazily once `recovery_timeout` has elapsed (checked on
/// the next admission, not by a timer); half_open → closed after
/// `success_threshold` consecutive successes, or back to open on any failure.
/// At most `half_open_max_concurrent` probes run while half-open.
pub struct CircuitBreaker {
    service: String,
    failure_threshold: u32,
    success_threshold: u32,
    recovery_timeout: Duration,
    half_open_max_concurrent: usize,
    inner: Mutex<Inner>,
    // Mirror of the state for lock-free inspection.
    state_tag: AtomicU8,
}

impl CircuitBreaker {
    pub fn new(service: &str, config: &ResilienceConfig) -> Self {
        Self {
            service: service.to_string(),
            failure_threshold: config.failure_threshold(),
            success_threshold: config.success_threshold(),
            recovery_timeout: config.recovery_timeout(),
            half_open_max_concurrent: config.half_open_max_concurrent(),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_failure_at: None,
                half_open_in_flight: 0,
            }),
            state_tag: AtomicU8::new(CircuitState::Closed.tag()),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Current state without taking the lock. The value may lag a concurrent
    /// transition by one call; callers that need exactness use `admit`.
    pub fn state(&self) -> CircuitState {
        CircuitState::from_tag(self.state_tag.load(Ordering::Acquire))
    }

    /// Request admission for one call. Returns a permit that must be resolved
    /// with `success`, `failure`, or `forgive` once the call completes.
    pub fn admit(&self) -> Result<BreakerPermit<'_>, CoreError> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => Ok(BreakerPermit::new(self, false)),
            CircuitState::Open => {
                let elapsed = inner.last_failure_at.map(|t| t.elapsed());
                if elapsed.is_some_and(|e| e >= self.recovery_timeout) {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.consecutive_successes = 0;
                    inner.half_open_in_flight = 1;
                    Ok(BreakerPermit::new(self, true))
                } else {
                    Err(CoreError::CircuitOpen(self.service.clone()))
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.half_open_max_concurrent {
                    inner.half_open_in_flight += 1;
                    Ok(BreakerPermit::new(self, true))
                } else {
                    Err(CoreError::CircuitOpen(self.service.clone()))
                }
            }
        }
    }

    /// Close the circuit and zero all counters. No-op when already closed
    /// with clean counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.transition(&mut inner, CircuitState::Closed);
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.half_open_in_flight = 0;
        inner.last_failure_at = None;
    }

    /// Operator override: open the circuit immediately.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.transition(&mut inner, CircuitState::Open);
        inner.last_failure_at = Some(Instant::now());
        warn!("circuit {} forced open", self.service);
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        BreakerSnapshot {
            service: self.service.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            seconds_since_last_failure: inner.last_failure_at.map(|t| t.elapsed().as_secs_f64()),
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        if inner.state != to {
            info!("circuit {}: {:?} -> {:?}", self.service, inner.state, to);
        }
        inner.state = to;
        self.state_tag.store(to.tag(), Ordering::Release);
    }

    fn record_success(&self, half_open: bool) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if half_open {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        inner.consecutive_failures = 0;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                    inner.consecutive_successes = 0;
                }
            }
            _ => {
                inner.consecutive_successes = inner.consecutive_successes.saturating_add(1);
            }
        }
    }

    fn record_failure(&self, half_open: bool) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if half_open {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        inner.consecutive_successes = 0;
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn release(&self, half_open: bool) {
        if half_open {
            let mut inner = self.inner.lock().expect("breaker lock poisoned");
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }
}

/// Admission token for one wrapped call. Exactly one of `success`, `failure`,
/// or `forgive` should be called; dropping the permit unresolved only frees
/// the half-open slot without touching the counters.
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    half_open: bool,
    resolved: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, half_open: bool) -> Self {
        Self {
            breaker,
            half_open,
            resolved: false,
        }
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.record_success(self.half_open);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.record_failure(self.half_open);
    }

    /// Resolve without counting: excluded error kinds (input and programmer
    /// errors) pass through the breaker untouched.
    pub fn forgive(mut self) {
        self.resolved = true;
        self.breaker.release(self.half_open);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.release(self.half_open);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(failure: u32, success: u32, recovery_ms: u64) -> ResilienceConfig {
        ResilienceConfig {
            failure_threshold: Some(failure),
            success_threshold: Some(success),
            recovery_timeout_s: Some(recovery_ms as f64 / 1000.0),
            half_open_max_concurrent: Some(2),
            ..Default::default()
        }
    }

    fn fail_once(breaker: &CircuitBreaker) {
        breaker.admit().unwrap().failure();
    }

    #[test]
    fn test_opens_after_exact_threshold() {
        let breaker = CircuitBreaker::new("svc", &config(3, 2, 60_000));
        fail_once(&breaker);
        fail_once(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail_once(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
        // Rejected without invoking the wrapped call.
        assert!(matches!(breaker.admit(), Err(CoreError::CircuitOpen(_))));
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let breaker = CircuitBreaker::new("svc", &config(3, 2, 60_000));
        fail_once(&breaker);
        fail_once(&breaker);
        breaker.admit().unwrap().success();
        fail_once(&breaker);
        fail_once(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_after_recovery() {
        let breaker = CircuitBreaker::new("svc", &config(1, 2, 20));
        fail_once(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(40));
        // Lazy transition on the next admission.
        let permit = breaker.admit().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        permit.success();
        breaker.admit().unwrap().success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("svc", &config(1, 2, 20));
        fail_once(&breaker);
        std::thread::sleep(Duration::from_millis(40));
        breaker.admit().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_concurrency_cap() {
        let breaker = CircuitBreaker::new("svc", &config(1, 3, 20));
        fail_once(&breaker);
        std::thread::sleep(Duration::from_millis(40));

        let p1 = breaker.admit().unwrap();
        let p2 = breaker.admit().unwrap();
        // Cap is 2: the third concurrent probe is rejected.
        assert!(matches!(breaker.admit(), Err(CoreError::CircuitOpen(_))));
        p1.success();
        p2.success();
        // Slots freed: probing may continue.
        assert!(breaker.admit().is_ok());
    }

    #[test]
    fn test_forgive_does_not_count() {
        let breaker = CircuitBreaker::new("svc", &config(1, 1, 60_000));
        breaker.admit().unwrap().forgive();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn test_reset_is_idempotent_and_zeroes_counters() {
        let breaker = CircuitBreaker::new("svc", &config(2, 2, 60_000));
        // No-op on a closed circuit.
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);

        fail_once(&breaker);
        fail_once(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
        breaker.reset();
        let snap = breaker.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.consecutive_successes, 0);
    }

    #[test]
    fn test_force_open() {
        let breaker = CircuitBreaker::new("svc", &config(5, 2, 60_000));
        breaker.force_open();
        assert!(matches!(breaker.admit(), Err(CoreError::CircuitOpen(_))));
    }
}
