//! Resilience utilities: time-budgeted retry with exponential backoff.
//!
//! Every attempt result is classified into an [`Attempt`]. Retryable
//! failures sleep for a deterministic, growing delay and try again until the
//! elapsed-time budget would be exceeded; terminal failures return at once.
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Failure classification used by the retry loop.
pub trait Classify {
    fn is_retryable(&self) -> bool;
    /// Stable snake_case name of the failure kind, suitable as a metric label.
    fn kind(&self) -> &'static str;
}

/// Outcome of one attempt.
#[derive(Debug, PartialEq)]
pub enum Attempt<T, E> {
    Success(T),
    Retryable(E),
    Terminal(E),
}

impl<T, E: Classify> Attempt<T, E> {
    pub fn classify(res: Result<T, E>) -> Self {
        match res {
            Ok(v) => Attempt::Success(v),
            Err(e) if e.is_retryable() => Attempt::Retryable(e),
            Err(e) => Attempt::Terminal(e),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RetryError<E> {
    #[error("retry budget of {budget:?} exhausted after {attempts} attempts ({elapsed:?} elapsed): {last}")]
    BudgetExceeded {
        last: E,
        attempts: u32,
        elapsed: Duration,
        budget: Duration,
    },
    #[error(transparent)]
    Terminal(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::BudgetExceeded { last, .. } => last,
            RetryError::Terminal(e) => e,
        }
    }
}

/// Deterministic exponential backoff: `min(base * multiplier^n, max)`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self { base: Duration::from_millis(500), multiplier: 1.5, max: Duration::from_secs(60) }
    }
}

impl ExponentialBackoff {
    /// Delay to wait after the `retry`-th failed attempt (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let exp = self.base.as_secs_f64() * self.multiplier.powi(retry.min(i32::MAX as u32) as i32);
        if !exp.is_finite() || exp >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(exp)
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Wall-clock budget across all attempts of one logical call.
    pub budget: Duration,
    pub backoff: ExponentialBackoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { budget: Duration::from_secs(30), backoff: ExponentialBackoff::default() }
    }
}

impl RetryPolicy {
    pub fn with_budget(budget: Duration) -> Self {
        Self { budget, ..Self::default() }
    }
}

/// Per-call bookkeeping; lives for one retrying call only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempts: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self { attempts: 0 }
    }

    /// Decide what follows a retryable failure, given the time already spent.
    /// `Some(delay)` means sleep then retry, `None` means the budget is spent.
    pub fn next_delay(&self, policy: &RetryPolicy, elapsed: Duration) -> Option<Duration> {
        let retry = self.attempts.saturating_sub(1);
        let delay = policy.backoff.delay(retry);
        if elapsed.saturating_add(delay) > policy.budget {
            None
        } else {
            Some(delay)
        }
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

/// Receives retry events; used for counting and logging.
pub trait RetryObserver<E> {
    fn on_retry(&self, _err: &E, _attempt: u32, _delay: Duration) {}
}

/// Observer that ignores every event.
pub struct NoopObserver;

impl<E> RetryObserver<E> for NoopObserver {}

pub async fn retry_with_budget<F, Fut, T, E, O>(policy: &RetryPolicy, observer: &O, mut op: F) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify,
    O: RetryObserver<E> + ?Sized,
{
    let started = Instant::now();
    let mut state = RetryState::new();
    loop {
        let attempt = state.attempts;
        state.attempts += 1;
        match Attempt::classify(op(attempt).await) {
            Attempt::Success(v) => return Ok(v),
            Attempt::Terminal(e) => return Err(RetryError::Terminal(e)),
            Attempt::Retryable(e) => {
                let elapsed = started.elapsed();
                match state.next_delay(policy, elapsed) {
                    Some(delay) => {
                        debug!(kind = e.kind(), attempt = state.attempts, delay_ms = delay.as_millis() as u64, "retrying");
                        observer.on_retry(&e, state.attempts, delay);
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(RetryError::BudgetExceeded { last: e, attempts: state.attempts, elapsed, budget: policy.budget });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Debug, PartialEq)]
    enum TestErr {
        Busy,
        Broken,
    }

    impl Classify for TestErr {
        fn is_retryable(&self) -> bool {
            matches!(self, TestErr::Busy)
        }
        fn kind(&self) -> &'static str {
            match self {
                TestErr::Busy => "busy",
                TestErr::Broken => "broken",
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        delays: RefCell<Vec<Duration>>,
    }

    impl RetryObserver<TestErr> for Recorder {
        fn on_retry(&self, _err: &TestErr, _attempt: u32, delay: Duration) {
            self.delays.borrow_mut().push(delay);
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let b = ExponentialBackoff { base: Duration::from_millis(100), multiplier: 2.0, max: Duration::from_millis(500) };
        assert_eq!(b.delay(0), Duration::from_millis(100));
        assert_eq!(b.delay(1), Duration::from_millis(200));
        assert_eq!(b.delay(2), Duration::from_millis(400));
        assert_eq!(b.delay(3), Duration::from_millis(500));
        assert_eq!(b.delay(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn next_delay_respects_budget() {
        let policy = RetryPolicy::with_budget(Duration::from_secs(1));
        let state = RetryState { attempts: 1 };
        assert_eq!(state.next_delay(&policy, Duration::ZERO), Some(Duration::from_millis(500)));
        assert_eq!(state.next_delay(&policy, Duration::from_millis(600)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success_with_growing_delays() {
        let rec = Recorder::default();
        let mut calls = 0;
        let res = retry_with_budget(&RetryPolicy::default(), &rec, |_| {
            calls += 1;
            let n = calls;
            async move { if n < 4 { Err(TestErr::Busy) } else { Ok(n) } }
        })
        .await;
        assert_eq!(res, Ok(4));
        let delays = rec.delays.borrow();
        assert_eq!(delays.len(), 3);
        assert!(delays.windows(2).all(|w| w[0] < w[1]), "delays not increasing: {delays:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_failure_is_not_retried() {
        let rec = Recorder::default();
        let mut calls = 0;
        let res: Result<(), _> = retry_with_budget(&RetryPolicy::default(), &rec, |_| {
            calls += 1;
            async { Err(TestErr::Broken) }
        })
        .await;
        assert_eq!(res, Err(RetryError::Terminal(TestErr::Broken)));
        assert_eq!(calls, 1);
        assert!(rec.delays.borrow().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn budget_exhaustion_carries_last_error() {
        let policy = RetryPolicy::with_budget(Duration::from_secs(3));
        let mut calls = 0;
        let res: Result<(), _> = retry_with_budget(&policy, &NoopObserver, |_| {
            calls += 1;
            async { Err(TestErr::Busy) }
        })
        .await;
        // 0.5 + 0.75 + 1.125 = 2.375s slept; the next 1.6875s delay would overshoot
        match res {
            Err(RetryError::BudgetExceeded { last, attempts, budget, .. }) => {
                assert_eq!(last, TestErr::Busy);
                assert_eq!(attempts, 4);
                assert_eq!(budget, Duration::from_secs(3));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(calls, 4);
    }
}
