//! Circuit breaker for a single named dependency.
//!
//! ```text
//!            N consecutive failures
//!   Closed ──────────────────────────▶ Open
//!     ▲                                 │ reset_timeout elapses
//!     │ M consecutive probe successes   ▼
//!     └──────────────────────────── HalfOpen ──(any failure)──▶ Open
//! ```
//!
//! `Open → HalfOpen` happens lazily: the next call (or [`CircuitBreaker::state`])
//! after the cooldown observes it. While half-open only `half_open_max_calls`
//! trial calls may be in flight at once; the rest are rejected.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rollcall_core::config::BreakerConfig;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ResilienceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls are rejected without running.
    Open,
    /// A limited number of trial calls test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&BreakerConfig::default())
    }
}

impl From<&BreakerConfig> for BreakerSettings {
    fn from(cfg: &BreakerConfig) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold.max(1),
            success_threshold: cfg.success_threshold.max(1),
            reset_timeout: Duration::from_secs(cfg.reset_timeout_secs),
            half_open_max_calls: cfg.half_open_max_calls.max(1),
        }
    }
}

/// Lifetime call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BreakerStats {
    /// Every call offered to the breaker, rejected ones included.
    pub total_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

/// Point-in-time view for operators.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Milliseconds until an open breaker admits a trial call.
    pub retry_in_ms: Option<u64>,
    pub stats: BreakerStats,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Set while open: when the next trial call is permitted.
    next_attempt_at: Option<Instant>,
    half_open_in_flight: u32,
    /// Bumped on every state transition; permits from an older generation
    /// only count towards the stats.
    generation: u64,
    stats: BreakerStats,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            next_attempt_at: None,
            half_open_in_flight: 0,
            generation: 0,
            stats: BreakerStats::default(),
        }
    }

    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.generation += 1;
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

/// Admission ticket for one call. Dropping it unsettled (the caller's future
/// was cancelled) frees a half-open slot without recording an outcome.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    generation: u64,
    settled: bool,
}

impl Permit<'_> {
    fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe, self.generation);
    }

    fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe, self.generation);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            let mut inner = self.breaker.lock();
            if inner.generation == self.generation {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            }
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(Inner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state, applying a due `Open → HalfOpen` transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> BreakerStats {
        self.lock().stats
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        let retry_in_ms = match (inner.state, inner.next_attempt_at) {
            (CircuitState::Open, Some(at)) => {
                Some(at.saturating_duration_since(Instant::now()).as_millis() as u64)
            }
            _ => None,
        };
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            retry_in_ms,
            stats: inner.stats,
        }
    }

    /// Operator escape hatch: force the breaker closed and clear its streaks.
    /// Lifetime stats are kept.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let stats = inner.stats;
        let generation = inner.generation;
        *inner = Inner::new();
        inner.stats = stats;
        inner.generation = generation + 1;
        info!(breaker = %self.name, "circuit breaker manually reset");
    }

    /// Run `op` if the breaker admits it and record the outcome.
    ///
    /// A rejected call returns [`ResilienceError::CircuitOpen`] without
    /// invoking `op`.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let permit = self.acquire().ok_or_else(|| ResilienceError::CircuitOpen {
            dependency: self.name.clone(),
        })?;
        match op().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(e)
            }
        }
    }

    fn acquire(&self) -> Option<Permit<'_>> {
        let mut inner = self.lock();
        inner.stats.total_calls += 1;
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => Some(Permit {
                breaker: self,
                probe: false,
                generation: inner.generation,
                settled: false,
            }),
            CircuitState::HalfOpen if inner.half_open_in_flight < self.settings.half_open_max_calls => {
                inner.half_open_in_flight += 1;
                debug!(breaker = %self.name, "admitting trial call");
                Some(Permit {
                    breaker: self,
                    probe: true,
                    generation: inner.generation,
                    settled: false,
                })
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.stats.rejections += 1;
                debug!(breaker = %self.name, state = %inner.state, "call rejected");
                None
            }
        }
    }

    fn refresh(&self, inner: &mut Inner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let due = inner
            .next_attempt_at
            .map_or(true, |at| Instant::now() >= at);
        if due {
            inner.transition(CircuitState::HalfOpen);
            inner.consecutive_successes = 0;
            inner.half_open_in_flight = 0;
            inner.next_attempt_at = None;
            info!(breaker = %self.name, "circuit breaker half-open, probing recovery");
        }
    }

    fn on_success(&self, probe: bool, generation: u64) {
        let mut inner = self.lock();
        inner.stats.successes += 1;
        if inner.generation != generation {
            debug!(breaker = %self.name, "ignoring outcome of a call admitted before the last transition");
            return;
        }
        if probe {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        inner.consecutive_failures = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.settings.success_threshold {
                inner.transition(CircuitState::Closed);
                inner.consecutive_successes = 0;
                info!(breaker = %self.name, "circuit breaker closed");
            }
        }
    }

    fn on_failure(&self, probe: bool, generation: u64) {
        let mut inner = self.lock();
        inner.stats.failures += 1;
        if inner.generation != generation {
            debug!(breaker = %self.name, "ignoring outcome of a call admitted before the last transition");
            return;
        }
        if probe {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.settings.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                inner.consecutive_failures += 1;
                self.trip(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&self, inner: &mut Inner) {
        inner.transition(CircuitState::Open);
        inner.consecutive_successes = 0;
        inner.next_attempt_at = Some(Instant::now() + self.settings.reset_timeout);
        warn!(
            breaker = %self.name,
            consecutive_failures = inner.consecutive_failures,
            cooldown_secs = self.settings.reset_timeout.as_secs(),
            "circuit breaker opened"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Boom;

    fn settings() -> BreakerSettings {
        BreakerSettings {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), ResilienceError<Boom>> {
        breaker.call(|| async { Err(ResilienceError::Call(Boom)) }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), ResilienceError<Boom>> {
        breaker.call(|| async { Ok(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_rejects_without_running() {
        let breaker = CircuitBreaker::new("api", settings());
        for _ in 0..3 {
            assert!(matches!(fail(&breaker).await, Err(ResilienceError::Call(_))));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let res: Result<(), ResilienceError<Boom>> = breaker
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(ResilienceError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        let stats = breaker.stats();
        assert_eq!(stats.total_calls, 4);
        assert_eq!(stats.failures, 3);
        assert_eq!(stats.rejections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_failure_streak() {
        let breaker = CircuitBreaker::new("api", settings());
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        succeed(&breaker).await.unwrap();
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_cooldown_and_probe_successes() {
        let breaker = CircuitBreaker::new("api", settings());
        for _ in 0..3 {
            fail(&breaker).await.unwrap_err();
        }
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(matches!(
            succeed(&breaker).await,
            Err(ResilienceError::CircuitOpen { .. })
        ));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_reopens_and_restarts_cooldown() {
        let breaker = CircuitBreaker::new("api", settings());
        for _ in 0..3 {
            fail(&breaker).await.unwrap_err();
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        succeed(&breaker).await.unwrap();
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);

        // the cooldown restarted at the probe failure
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_limits_concurrent_probes() {
        let breaker = CircuitBreaker::new("api", settings());
        for _ in 0..3 {
            fail(&breaker).await.unwrap_err();
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let slow = breaker.call(|| async move {
            let _ = release_rx.await;
            Ok::<_, ResilienceError<Boom>>(())
        });
        let second = async {
            tokio::task::yield_now().await;
            let res = succeed(&breaker).await;
            let _ = release_tx.send(());
            res
        };
        let (slow_res, second_res) = tokio::join!(slow, second);
        assert!(slow_res.is_ok());
        assert!(matches!(second_res, Err(ResilienceError::CircuitOpen { .. })));
    }

    fn trip_on_first_failure() -> BreakerSettings {
        BreakerSettings {
            failure_threshold: 1,
            ..settings()
        }
    }

    /// Starts a call while closed that finishes only after `release` fires,
    /// trips the breaker with a second call and lets the cooldown elapse.
    async fn outlive_cooldown(
        breaker: &CircuitBreaker,
        late: Result<(), ResilienceError<Boom>>,
    ) -> Result<(), ResilienceError<Boom>> {
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let slow = breaker.call(|| async move {
            let _ = release_rx.await;
            late
        });
        let driver = async {
            tokio::task::yield_now().await;
            fail(breaker).await.unwrap_err();
            assert_eq!(breaker.state(), CircuitState::Open);
            tokio::time::advance(Duration::from_secs(30)).await;
            assert_eq!(breaker.state(), CircuitState::HalfOpen);
            let _ = release_tx.send(());
        };
        let (slow_res, ()) = tokio::join!(slow, driver);
        slow_res
    }

    #[tokio::test(start_paused = true)]
    async fn late_success_from_closed_is_not_a_probe() {
        let breaker = CircuitBreaker::new("api", trip_on_first_failure());
        outlive_cooldown(&breaker, Ok(())).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().successes, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn late_failure_from_closed_does_not_reopen() {
        let breaker = CircuitBreaker::new("api", trip_on_first_failure());
        outlive_cooldown(&breaker, Err(ResilienceError::Call(Boom)))
            .await
            .unwrap_err();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.stats().failures, 2);

        succeed(&breaker).await.unwrap();
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_closes_an_open_breaker() {
        let breaker = CircuitBreaker::new("printer", settings());
        for _ in 0..3 {
            fail(&breaker).await.unwrap_err();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.snapshot().stats.failures, 3);
    }
}
