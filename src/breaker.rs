//! Circuit breaker for recognition provider starts
//!
//! Counts consecutive critical failures of a guarded operation. Once the count
//! reaches `max_failures` the breaker opens for `cooldown`; while open every
//! guarded call fails fast with [`BreakerOpen`] without touching the backend.
//! When the cooldown has passed the next call goes through as a probe and is
//! scored like any other call.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Default consecutive failures before opening
pub const DEFAULT_MAX_FAILURES: u32 = 3;

/// Default time the breaker stays open
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);

/// Failure classification used to decide whether a failure is scored
pub trait Classify {
    /// Whether this failure counts toward opening the breaker
    fn is_critical(&self) -> bool;
}

/// Refusal returned while the breaker is open
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("circuit open, retry in {}ms", retry_after.as_millis())]
pub struct BreakerOpen {
    /// Time left until a probe is allowed
    pub retry_after: Duration,
}

/// Error from a guarded call
#[derive(Debug, PartialEq, Eq)]
pub enum Guarded<E> {
    /// Breaker refused; the operation was not attempted
    Open(BreakerOpen),
    /// The operation ran and failed
    Failed(E),
}

/// Snapshot of breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerState {
    /// Consecutive scored failures
    pub consecutive_failures: u32,
    /// Deadline until which calls are refused
    pub open_until: Option<Instant>,
}

/// Consecutive-failure circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    max_failures: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FAILURES, DEFAULT_COOLDOWN)
    }
}

impl CircuitBreaker {
    /// Create a breaker opening after `max_failures` for `cooldown`
    ///
    /// A `max_failures` of zero is treated as one.
    #[must_use]
    pub fn new(max_failures: u32, cooldown: Duration) -> Self {
        Self {
            max_failures: max_failures.max(1),
            cooldown,
            consecutive_failures: 0,
            open_until: None,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> BreakerState {
        BreakerState {
            consecutive_failures: self.consecutive_failures,
            open_until: self.open_until,
        }
    }

    /// Whether calls are being refused at `now`
    #[must_use]
    pub fn is_open_at(&self, now: Instant) -> bool {
        self.open_until.is_some_and(|until| now < until)
    }

    /// Fail fast if open
    ///
    /// # Errors
    ///
    /// Returns [`BreakerOpen`] while the cooldown has not elapsed
    pub fn check(&self) -> Result<(), BreakerOpen> {
        let now = Instant::now();
        match self.open_until {
            Some(until) if now < until => Err(BreakerOpen {
                retry_after: until - now,
            }),
            _ => Ok(()),
        }
    }

    /// Reset after a successful call
    pub fn record_success(&mut self) {
        if self.consecutive_failures > 0 || self.open_until.is_some() {
            tracing::debug!(
                failures = self.consecutive_failures,
                "circuit breaker reset"
            );
        }
        self.consecutive_failures = 0;
        self.open_until = None;
    }

    /// Score a critical failure, opening the breaker at the threshold
    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.consecutive_failures >= self.max_failures {
            self.open_until = Some(Instant::now() + self.cooldown);
            tracing::warn!(
                failures = self.consecutive_failures,
                cooldown_ms = self.cooldown.as_millis(),
                "circuit breaker opened"
            );
        } else {
            tracing::debug!(
                failures = self.consecutive_failures,
                max = self.max_failures,
                "circuit breaker failure recorded"
            );
        }
    }

    /// Run `op` through the breaker
    ///
    /// Success resets the breaker. A failure is scored only when it
    /// classifies as critical; other failures pass through unscored.
    ///
    /// # Errors
    ///
    /// Returns [`Guarded::Open`] without running `op` while open, or
    /// [`Guarded::Failed`] with the operation's own error.
    pub async fn call<T, E, F, Fut>(&mut self, op: F) -> Result<T, Guarded<E>>
    where
        E: Classify,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let value = self.attempt(op).await?;
        self.record_success();
        Ok(value)
    }

    /// Run `op` through the breaker, scoring only its failures
    ///
    /// For operations whose success is known later than their return, such
    /// as a session that can still fail after it was acknowledged. The
    /// caller reports the eventual outcome with [`Self::record_success`] or
    /// [`Self::record_failure`].
    ///
    /// # Errors
    ///
    /// Same as [`Self::call`]
    pub async fn attempt<T, E, F, Fut>(&mut self, op: F) -> Result<T, Guarded<E>>
    where
        E: Classify,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.check().map_err(Guarded::Open)?;

        op().await.map_err(|e| {
            if e.is_critical() {
                self.record_failure();
            }
            Guarded::Failed(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    enum Fail {
        Critical,
        Benign,
    }

    impl Classify for Fail {
        fn is_critical(&self) -> bool {
            matches!(self, Self::Critical)
        }
    }

    async fn fail(breaker: &mut CircuitBreaker, kind: Fail) -> Result<(), Guarded<Fail>> {
        breaker.call(|| async { Err::<(), _>(kind) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_max_consecutive_critical_failures() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(10));

        for _ in 0..3 {
            assert_eq!(
                fail(&mut breaker, Fail::Critical).await,
                Err(Guarded::Failed(Fail::Critical))
            );
        }

        assert!(breaker.is_open_at(Instant::now()));
        assert_eq!(breaker.state().consecutive_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_does_not_invoke_operation() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_secs(10));
        let _ = fail(&mut breaker, Fail::Critical).await;

        let invoked = Cell::new(false);
        let result = breaker
            .call(|| async {
                invoked.set(true);
                Ok::<_, Fail>(())
            })
            .await;

        assert!(matches!(result, Err(Guarded::Open(_))));
        assert!(!invoked.get());
    }

    #[tokio::test(start_paused = true)]
    async fn benign_failures_are_not_scored() {
        let mut breaker = CircuitBreaker::new(2, Duration::from_secs(10));
        for _ in 0..5 {
            let _ = fail(&mut breaker, Fail::Benign).await;
        }
        assert_eq!(breaker.state().consecutive_failures, 0);
        assert!(breaker.check().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_count() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(10));
        let _ = fail(&mut breaker, Fail::Critical).await;
        let _ = fail(&mut breaker, Fail::Critical).await;

        assert!(breaker.call(|| async { Ok::<_, Fail>(()) }).await.is_ok());
        assert_eq!(
            breaker.state(),
            BreakerState {
                consecutive_failures: 0,
                open_until: None
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn probe_allowed_after_cooldown() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_secs(10));
        let _ = fail(&mut breaker, Fail::Critical).await;

        tokio::time::advance(Duration::from_secs(4)).await;
        let refusal = breaker.check().unwrap_err();
        assert_eq!(refusal.retry_after, Duration::from_secs(6));

        tokio::time::advance(Duration::from_secs(6)).await;
        let invoked = Cell::new(false);
        let _ = breaker
            .call(|| async {
                invoked.set(true);
                Err::<(), _>(Fail::Critical)
            })
            .await;
        assert!(invoked.get());
        // Failed probe re-opens immediately since the count is still at max
        assert!(breaker.is_open_at(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_leaves_success_to_the_caller() {
        let mut breaker = CircuitBreaker::new(2, Duration::from_secs(10));

        for _ in 0..2 {
            assert!(breaker.attempt(|| async { Ok::<_, Fail>(()) }).await.is_ok());
            // Acknowledged, then failed later
            breaker.record_failure();
        }

        assert!(breaker.is_open_at(Instant::now()));
        assert!(matches!(
            breaker.attempt(|| async { Ok::<_, Fail>(()) }).await,
            Err(Guarded::Open(_))
        ));
    }

    #[test]
    fn zero_threshold_is_clamped() {
        let breaker = CircuitBreaker::new(0, Duration::from_secs(1));
        assert_eq!(breaker.max_failures, 1);
    }
}
