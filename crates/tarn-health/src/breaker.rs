//! Circuit breaker for a single flaky dependency.
//!
//! State lives behind one mutex so that a read of the state and the
//! transition it triggers happen as a unit, even when many reconcile
//! tasks consult the same breaker at once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Consecutive failures in `Closed` that open the breaker.
    pub failure_threshold: u32,
    /// How long `Open` rejects calls before admitting a probe.
    pub reset_timeout: Duration,
    /// Calls admitted while `HalfOpen`, the transitioning call included.
    pub half_open_max_probes: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_probes: 1,
        }
    }
}

/// Outcome of [`CircuitBreaker::try_execute`] when no value was produced.
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    #[error("circuit breaker '{0}' is open")]
    Rejected(String),
    #[error("{0}")]
    Inner(E),
}

/// Point-in-time view of a breaker, for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_probes: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings: BreakerSettings {
                failure_threshold: settings.failure_threshold.max(1),
                half_open_max_probes: settings.half_open_max_probes.max(1),
                ..settings
            },
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_probes: 0,
                opened_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a call may proceed right now.
    ///
    /// An `Open` breaker whose reset timeout has elapsed moves to
    /// `HalfOpen` and admits the caller as its first probe.
    pub fn allow(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.settings.reset_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_probes = 1;
                    info!(breaker = %self.name, from = "open", to = "half_open", "circuit breaker probing");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_probes < self.settings.half_open_max_probes {
                    inner.half_open_probes += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => inner.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Closed;
                inner.consecutive_failures = 0;
                inner.half_open_probes = 0;
                inner.opened_at = None;
                info!(breaker = %self.name, from = "half_open", to = "closed", "circuit breaker recovered");
            }
            // A call admitted before the breaker opened; its result is stale.
            BreakerState::Open => {}
        }
    }

    pub fn on_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.settings.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        from = "closed",
                        to = "open",
                        "circuit breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.half_open_probes = 0;
                inner.opened_at = Some(Instant::now());
                warn!(breaker = %self.name, from = "half_open", to = "open", "circuit breaker probe failed");
            }
            BreakerState::Open => {}
        }
    }

    /// Administrative override: force `Closed` with all counters zeroed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Closed {
            info!(breaker = %self.name, to = "closed", "circuit breaker reset");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.half_open_probes = 0;
        inner.opened_at = None;
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }

    /// Run `op` through the breaker, returning `fallback` when the call
    /// is rejected or fails. Never surfaces an error.
    pub async fn execute<T, E, F, Fut>(&self, op: F, fallback: T) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        match self.try_execute(op).await {
            Ok(value) => value,
            Err(CallError::Rejected(_)) => {
                debug!(breaker = %self.name, "call rejected, using fallback");
                fallback
            }
            Err(CallError::Inner(e)) => {
                debug!(breaker = %self.name, error = %e, "call failed, using fallback");
                fallback
            }
        }
    }

    /// Like [`execute`](Self::execute) but reports why no value came back.
    pub async fn try_execute<T, E, F, Fut>(&self, op: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.allow() {
            return Err(CallError::Rejected(self.name.clone()));
        }
        match op().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(CallError::Inner(e))
            }
        }
    }
}

/// One breaker per protected dependency, created on first use.
#[derive(Debug)]
pub struct BreakerRegistry {
    settings: BreakerSettings,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, key: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.settings)))
            .clone()
    }

    /// Forget a dependency that no longer exists (e.g., a departed replica).
    pub fn remove(&self, key: &str) -> bool {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshots sorted by name.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = breakers.values().map(|b| b.snapshot()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_breaker(threshold: u32, probes: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "replica-1",
            BreakerSettings {
                failure_threshold: threshold,
                reset_timeout: Duration::from_secs(30),
                half_open_max_probes: probes,
            },
        )
    }

    fn trip(breaker: &CircuitBreaker) {
        for _ in 0..breaker.settings.failure_threshold {
            breaker.on_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn opens_after_exactly_threshold_failures() {
        let breaker = test_breaker(3, 1);
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow());

        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn success_while_closed_resets_counter() {
        let breaker = test_breaker(3, 1);
        breaker.on_failure();
        breaker.on_failure();
        breaker.on_success();
        assert_eq!(breaker.consecutive_failures(), 0);

        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn open_rejects_until_reset_timeout() {
        let breaker = test_breaker(1, 1);
        trip(&breaker);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!breaker.allow());
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breaker.allow());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_bounded_probes() {
        let breaker = test_breaker(1, 2);
        trip(&breaker);
        tokio::time::advance(Duration::from_secs(30)).await;

        assert!(breaker.allow());
        assert!(breaker.allow());
        assert!(!breaker.allow());
        assert!(!breaker.allow());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let breaker = test_breaker(1, 1);
        trip(&breaker);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.allow());

        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());

        // The reset window restarts from the reopen.
        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(!breaker.allow());
        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(breaker.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_success_closes_and_resets() {
        let breaker = test_breaker(2, 1);
        trip(&breaker);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.allow());

        breaker.on_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);

        // Needs a full threshold again to reopen.
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn reset_forces_closed() {
        let breaker = test_breaker(1, 1);
        trip(&breaker);
        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
        assert!(breaker.allow());
    }

    #[tokio::test]
    async fn execute_returns_fallback_on_failure_and_rejection() {
        let breaker = test_breaker(1, 1);

        let value = breaker
            .execute(|| async { Err::<f64, _>("connection refused") }, 0.0)
            .await;
        assert_eq!(value, 0.0);
        assert_eq!(breaker.state(), BreakerState::Open);

        let mut called = false;
        let value = breaker
            .execute(
                || {
                    called = true;
                    async { Ok::<_, String>(0.9) }
                },
                0.0,
            )
            .await;
        assert_eq!(value, 0.0);
        assert!(!called, "open breaker must not invoke the operation");
    }

    #[tokio::test]
    async fn try_execute_distinguishes_rejection() {
        let breaker = test_breaker(1, 1);
        let err = breaker
            .try_execute(|| async { Err::<(), _>("boom") })
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Inner("boom")));

        let err = breaker
            .try_execute(|| async { Ok::<_, &str>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Rejected(name) if name == "replica-1"));
    }

    #[tokio::test]
    async fn concurrent_failures_open_exactly_once() {
        let breaker = Arc::new(test_breaker(10, 1));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let b = breaker.clone();
            handles.push(tokio::spawn(async move { b.on_failure() }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.consecutive_failures(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_half_open_admits_at_most_probe_limit() {
        let breaker = Arc::new(test_breaker(1, 2));
        trip(&breaker);
        tokio::time::advance(Duration::from_secs(30)).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let b = breaker.clone();
            handles.push(tokio::spawn(async move { b.allow() }));
        }
        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 2);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn registry_reuses_and_forgets() {
        let registry = BreakerRegistry::new(BreakerSettings::default());
        let a = registry.get_or_create("r-1");
        let b = registry.get_or_create("r-1");
        assert!(Arc::ptr_eq(&a, &b));
        registry.get_or_create("r-0");
        assert_eq!(registry.len(), 2);

        let names: Vec<_> = registry.snapshot().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["r-0", "r-1"]);

        assert!(registry.remove("r-1"));
        assert!(!registry.remove("r-1"));
        assert_eq!(registry.len(), 1);
    }
}
