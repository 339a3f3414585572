//! Retrying remote operations under eventual consistency.
//!
//! A [`RetryPolicy`] names which failures are transient (a dependency that
//! has not propagated yet, throttling) and how long to keep trying. The
//! [`RetryExecutor`] runs an operation under a policy, sleeping between
//! attempts with a non-decreasing backoff. Every sleep is bounded by the
//! policy deadline and races the executor's cancellation token.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// First backoff interval.
pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(100);
/// Upper bound of the exponential backoff.
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(10);
/// Fixed poll intervals above this are ignored in favour of the backoff.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(180);

/// Wait schedule between attempts.
///
/// Exponential from `initial`, doubling per attempt, raised to `min` and
/// capped at `max`. A fixed interval replaces the schedule entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    min: Duration,
    max: Duration,
    fixed: Option<Duration>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential()
    }
}

impl Backoff {
    pub const fn exponential() -> Self {
        Self {
            initial: DEFAULT_INITIAL_INTERVAL,
            min: Duration::ZERO,
            max: DEFAULT_MAX_INTERVAL,
            fixed: None,
        }
    }

    pub const fn fixed(interval: Duration) -> Self {
        Self {
            initial: DEFAULT_INITIAL_INTERVAL,
            min: Duration::ZERO,
            max: DEFAULT_MAX_INTERVAL,
            fixed: Some(interval),
        }
    }

    pub const fn with_initial_interval(mut self, initial: Duration) -> Self {
        self.initial = initial;
        self
    }

    pub const fn with_min_interval(mut self, min: Duration) -> Self {
        self.min = min;
        self
    }

    pub const fn with_max_interval(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    /// Wait before attempt `attempt + 1`.
    pub fn interval(&self, attempt: u32) -> Duration {
        if let Some(fixed) = self.fixed {
            if !fixed.is_zero() && fixed <= MAX_POLL_INTERVAL {
                return fixed;
            }
        }

        let factor = 2u32.saturating_pow(attempt.min(31));
        let wait = self.initial.saturating_mul(factor);
        if wait < self.min {
            self.min
        } else if wait > self.max {
            self.max.max(self.min)
        } else {
            wait
        }
    }
}

/// Decides whether an error is transient.
pub type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// How one family of remote operations is retried.
#[derive(Clone)]
pub struct RetryPolicy {
    timeout: Duration,
    backoff: Backoff,
    delay: Duration,
    delay_jitter: Option<Duration>,
    predicates: Vec<RetryPredicate>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("timeout", &self.timeout)
            .field("backoff", &self.backoff)
            .field("delay", &self.delay)
            .field("delay_jitter", &self.delay_jitter)
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

impl RetryPolicy {
    /// A policy that retries nothing until predicates are added.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            backoff: Backoff::default(),
            delay: Duration::ZERO,
            delay_jitter: None,
            predicates: Vec::new(),
        }
    }

    pub fn retry_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Arc::new(predicate));
        self
    }

    /// Retry API errors whose code is one of `codes`.
    pub fn retry_on_codes<I, S>(self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let codes: Vec<String> = codes.into_iter().map(Into::into).collect();
        self.retry_when(move |err| {
            err.code()
                .map(|code| codes.iter().any(|c| c == code))
                .unwrap_or(false)
        })
    }

    /// Retry API errors with `code` whose message contains `fragment`.
    pub fn retry_on_message(self, code: impl Into<String>, fragment: impl Into<String>) -> Self {
        let code = code.into();
        let fragment = fragment.into();
        self.retry_when(move |err| match err {
            Error::Api(api) => api.code == code && api.message.contains(&fragment),
            _ => false,
        })
    }

    /// Treat `NotFound` as propagation lag.
    pub fn retry_when_not_found(self) -> Self {
        self.retry_when(Error::is_not_found)
    }

    /// Wait this long before the first attempt.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Wait a random duration below `max` before the first attempt.
    pub fn with_delay_rand(mut self, max: Duration) -> Self {
        self.delay_jitter = Some(max);
        self
    }

    /// Poll at a fixed interval instead of backing off.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.backoff = Backoff::fixed(interval);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Identifier errors are never retried regardless of predicates.
    pub fn is_retryable(&self, err: &Error) -> bool {
        if err.is_identifier_error() || matches!(err, Error::Cancelled { .. }) {
            return false;
        }
        self.predicates.iter().any(|p| p(err))
    }

    fn initial_delay(&self) -> Duration {
        let jitter = match self.delay_jitter {
            Some(max) if !max.is_zero() => rand::thread_rng().gen_range(Duration::ZERO..max),
            _ => Duration::ZERO,
        };
        self.delay.saturating_add(jitter)
    }
}

/// Sleep until `until`; false if cancelled first.
pub(crate) async fn sleep_until(cancel: &CancellationToken, until: Instant) -> bool {
    tokio::select! {
        _ = tokio::time::sleep_until(until) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Runs operations under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    cancel: CancellationToken,
}

impl RetryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Call `op` until it succeeds, fails permanently, or the policy deadline passes.
    ///
    /// Non-retryable errors are returned as-is after a single attempt. On
    /// deadline the result is `Error::Timeout` wrapping the last error.
    pub async fn execute<T, F, Fut>(&self, policy: &RetryPolicy, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = None;
        self.execute_tracked(policy, &mut last_error, op).await
    }

    /// Like [`execute`](Self::execute), but keeps the error currently being
    /// retried in `last_error`.
    ///
    /// A caller that abandons the returned future (an outer deadline, a
    /// `select!`) can still report what the operation was failing with. The
    /// slot is cleared on entry and on success.
    pub async fn execute_tracked<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        last_error: &mut Option<Error>,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let deadline = started + policy.timeout;
        *last_error = None;

        if self.cancel.is_cancelled() {
            return Err(Error::cancelled(None));
        }

        let delay = policy.initial_delay();
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "Delaying first attempt");
            if !sleep_until(&self.cancel, (started + delay).min(deadline)).await {
                return Err(Error::cancelled(None));
            }
        }

        let mut attempt: u32 = 0;
        loop {
            let outcome = tokio::select! {
                res = tokio::time::timeout_at(deadline, op()) => res,
                _ = self.cancel.cancelled() => {
                    debug!(attempt = attempt + 1, "Operation cancelled in flight");
                    return Err(Error::cancelled(last_error.take()));
                }
            };
            let err = match outcome {
                Ok(Ok(value)) => {
                    if attempt > 0 {
                        debug!(attempts = attempt + 1, "Operation succeeded after retries");
                    }
                    *last_error = None;
                    return Ok(value);
                }
                Ok(Err(err)) => err,
                Err(_) => {
                    warn!(
                        timeout_ms = policy.timeout.as_millis() as u64,
                        "Operation outlived its deadline"
                    );
                    return Err(Error::timeout(policy.timeout, None, last_error.take()));
                }
            };

            if !policy.is_retryable(&err) {
                *last_error = None;
                return Err(err);
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    attempts = attempt + 1,
                    timeout_ms = policy.timeout.as_millis() as u64,
                    error = %err,
                    "Giving up on retryable error"
                );
                *last_error = None;
                return Err(Error::timeout(policy.timeout, None, Some(err)));
            }

            let wait = policy.backoff.interval(attempt).min(deadline - now);
            debug!(
                attempt = attempt + 1,
                wait_ms = wait.as_millis() as u64,
                error = %err,
                "Retryable error, backing off"
            );
            *last_error = Some(err);
            if !sleep_until(&self.cancel, now + wait).await {
                return Err(Error::cancelled(last_error.take()));
            }
            attempt = attempt.saturating_add(1);
        }
    }

    /// Read a resource, tolerating `NotFound` only when it was just created.
    ///
    /// A resource created in this pass may not be visible yet; an existing
    /// one that reads as absent really is gone and the error passes through.
    pub async fn retry_when_new_resource_not_found<T, F, Fut>(
        &self,
        timeout: Duration,
        is_new_resource: bool,
        op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut policy = RetryPolicy::new(timeout);
        if is_new_resource {
            policy = policy.retry_when_not_found();
        }
        self.execute(&policy, op).await
    }

    /// Poll `op` until it reports `NotFound`.
    ///
    /// Reads that still succeed are retried; on deadline the timeout wraps
    /// [`Error::StillExists`].
    pub async fn retry_until_not_found<T, F, Fut>(&self, timeout: Duration, mut op: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = RetryPolicy::new(timeout).retry_when(|err| matches!(err, Error::StillExists));
        self.execute(&policy, || {
            let read = op();
            async move {
                match read.await {
                    Ok(_) => Err(Error::StillExists),
                    Err(err) if err.is_not_found() => Ok(()),
                    Err(err) => Err(err),
                }
            }
        })
        .await
    }
}
