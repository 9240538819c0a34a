// src/breaker.rs
//! Per-dependency circuit breaker.
//!
//! ```text
//! Closed --(failure_threshold consecutive transient failures)--> Open
//! Open   --(recovery_timeout elapsed, first caller wins)-------> HalfOpen
//! HalfOpen --success--> Closed
//! HalfOpen --failure--> Open (timer restarts)
//! ```
//!
//! All state is atomics, so callers never block each other. Time comes from
//! `tokio::time::Instant` so paused-clock tests can step over the timeout.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::{CircuitOpenError, Classify, FailureKind};

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    cfg: BreakerConfig,
    state: AtomicU8,
    failures: AtomicU32,
    /// Millis since `epoch` at which the breaker last opened.
    opened_at: AtomicU64,
    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            cfg,
            state: AtomicU8::new(CLOSED),
            failures: AtomicU32::new(0),
            opened_at: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        match self.state.load(Ordering::Acquire) {
            OPEN => BreakerState::Open,
            HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn remaining(&self) -> Duration {
        let elapsed = self
            .now_ms()
            .saturating_sub(self.opened_at.load(Ordering::Acquire));
        self.cfg
            .recovery_timeout
            .saturating_sub(Duration::from_millis(elapsed))
    }

    /// Admission check. `Ok` means the caller may hit the dependency and must
    /// report the result through [`on_success`](Self::on_success) or
    /// [`on_failure`](Self::on_failure).
    pub fn try_acquire(&self) -> Result<(), CircuitOpenError> {
        self.admit().map(|_| ())
    }

    /// Like `try_acquire`, but says whether the caller holds the half-open
    /// probe slot.
    fn admit(&self) -> Result<bool, CircuitOpenError> {
        match self.state.load(Ordering::Acquire) {
            CLOSED => Ok(false),
            OPEN => {
                let left = self.remaining();
                if left.is_zero()
                    && self
                        .state
                        .compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    tracing::info!(target: "breaker", dependency = %self.name, "half-open: admitting probe");
                    return Ok(true);
                }
                Err(self.rejected(left))
            }
            // A probe is already in flight.
            _ => Err(self.rejected(self.remaining())),
        }
    }

    /// The probe never reported back. Reopen with a fresh timer so a later
    /// caller can probe again.
    fn abandon_trial(&self) {
        self.opened_at.store(self.now_ms(), Ordering::Release);
        if self
            .state
            .compare_exchange(HALF_OPEN, OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::warn!(target: "breaker", dependency = %self.name, "probe dropped before completing, circuit reopened");
        }
    }

    fn rejected(&self, retry_after: Duration) -> CircuitOpenError {
        counter!("breaker_rejected_total", "dependency" => self.name.clone()).increment(1);
        CircuitOpenError {
            dependency: self.name.clone(),
            retry_after,
        }
    }

    pub fn on_success(&self) {
        self.failures.store(0, Ordering::Release);
        let prev = self.state.swap(CLOSED, Ordering::AcqRel);
        if prev != CLOSED {
            tracing::info!(target: "breaker", dependency = %self.name, "circuit closed");
        }
    }

    pub fn on_failure(&self) {
        let n = self.failures.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        match self.state.load(Ordering::Acquire) {
            HALF_OPEN => self.trip(HALF_OPEN, n),
            CLOSED if n >= self.cfg.failure_threshold => self.trip(CLOSED, n),
            _ => {}
        }
    }

    fn trip(&self, from: u8, failures: u32) {
        // Publish the timestamp before the state so readers of OPEN see it.
        self.opened_at.store(self.now_ms(), Ordering::Release);
        if self
            .state
            .compare_exchange(from, OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            counter!("breaker_open_total", "dependency" => self.name.clone()).increment(1);
            tracing::warn!(
                target: "breaker",
                dependency = %self.name,
                failures,
                recovery_ms = self.cfg.recovery_timeout.as_millis() as u64,
                "circuit opened"
            );
        }
    }

    /// Run `f` under the breaker. Only transient failures count against the
    /// dependency; a permanent failure proves it is reachable.
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + From<CircuitOpenError>,
    {
        let mut trial = TrialGuard {
            breaker: self,
            armed: self.admit()?,
        };
        let res = f().await;
        trial.armed = false;
        match &res {
            Ok(_) => self.on_success(),
            Err(e) => match e.kind() {
                FailureKind::Transient => self.on_failure(),
                FailureKind::Permanent => self.on_success(),
                // Nested breaker refused: says nothing about this dependency.
                // Release a probe slot so the breaker does not stay half-open.
                FailureKind::CircuitOpen => {
                    let _ = self.state.compare_exchange(
                        HALF_OPEN,
                        OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }
            },
        }
        res
    }
}

/// Reopens the circuit if a half-open probe is cancelled mid-flight.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon_trial();
        }
    }
}

/// Named breakers shared by every caller of a dependency.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    cfg: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.cfg)))
            .clone()
    }

    pub fn states(&self) -> Vec<(String, BreakerState)> {
        let mut v: Vec<_> = self
            .breakers
            .lock()
            .iter()
            .map(|(k, b)| (k.clone(), b.state()))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PublishError;
    use std::sync::atomic::AtomicUsize;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "publisher",
            BreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_secs(30),
            },
        )
    }

    async fn fail(b: &CircuitBreaker, calls: &AtomicUsize) -> Result<(), PublishError> {
        b.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(PublishError::Transient("503".into()))
        })
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_fails_fast() {
        let b = breaker(3);
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            assert!(matches!(fail(&b, &calls).await, Err(PublishError::Transient(_))));
        }
        assert_eq!(b.state(), BreakerState::Open);

        let res = fail(&b, &calls).await;
        assert!(matches!(res, Err(PublishError::CircuitOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn single_probe_after_recovery_timeout() {
        let b = breaker(1);
        let calls = AtomicUsize::new(0);
        let _ = fail(&b, &calls).await;
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(b.try_acquire().is_ok());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        // Second caller while the probe is in flight is refused.
        assert!(b.try_acquire().is_err());

        b.on_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens_and_restarts_timer() {
        let b = breaker(1);
        let calls = AtomicUsize::new(0);
        let _ = fail(&b, &calls).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        let _ = fail(&b, &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        let err = b.try_acquire().unwrap_err();
        assert!(err.retry_after > Duration::from_secs(19));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_half_open_call_reopens_the_circuit() {
        let b = breaker(1);
        let calls = AtomicUsize::new(0);
        let _ = fail(&b, &calls).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        let slow = b.call(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<(), PublishError>(())
        });
        assert!(tokio::time::timeout(Duration::from_secs(1), slow).await.is_err());
        assert_eq!(b.state(), BreakerState::Open);

        // Timer restarted at the cancellation, then another probe is allowed.
        assert!(b.try_acquire().is_err());
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(b.try_acquire().is_ok());
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_call_while_closed_leaves_state_alone() {
        let b = breaker(3);
        let slow = b.call(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<(), PublishError>(())
        });
        assert!(tokio::time::timeout(Duration::from_secs(1), slow).await.is_err());
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn permanent_failures_do_not_trip() {
        let b = breaker(2);
        for _ in 0..5 {
            let r: Result<(), PublishError> = b
                .call(|| async { Err(PublishError::Permanent("chat not found".into())) })
                .await;
            assert!(r.is_err());
        }
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn success_resets_consecutive_count() {
        let b = breaker(3);
        let calls = AtomicUsize::new(0);
        let _ = fail(&b, &calls).await;
        let _ = fail(&b, &calls).await;
        let ok: Result<u8, PublishError> = b.call(|| async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);
        let _ = fail(&b, &calls).await;
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn registry_shares_breakers_by_name() {
        let r = BreakerRegistry::new(BreakerConfig::default());
        let a = r.get("translator");
        let b = r.get("translator");
        assert!(Arc::ptr_eq(&a, &b));
        r.get("publisher");
        assert_eq!(r.states().len(), 2);
    }
}
