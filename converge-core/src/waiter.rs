//! Polling waiter for asynchronous remote state transitions.
//!
//! Create and delete calls return before the remote object has finished
//! transitioning. [`StateWaiter::wait_for`] polls a caller-supplied refresh
//! function and classifies every observation as pending, target, failed or
//! vanished until a terminal state is reached or the deadline passes.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Interrupted, Result};
use crate::retry::{sleep_until, Backoff};

/// One observation of a remote object.
///
/// An absent object has no snapshot and an empty state tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedState<T> {
    pub state: String,
    pub snapshot: Option<T>,
    /// Status detail reported alongside the state, e.g. why it failed.
    pub message: Option<String>,
}

impl<T> ObservedState<T> {
    pub fn present(state: impl Into<String>, snapshot: T) -> Self {
        Self {
            state: state.into(),
            snapshot: Some(snapshot),
            message: None,
        }
    }

    pub fn absent() -> Self {
        Self {
            state: String::new(),
            snapshot: None,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_absent(&self) -> bool {
        self.snapshot.is_none()
    }

    pub fn into_snapshot(self) -> Option<T> {
        self.snapshot
    }
}

/// What an absent observation means for a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundPolicy {
    /// Absence is the goal (waiting for deletion).
    Target,
    /// Tolerate up to this many consecutive absent observations before
    /// concluding the object vanished. `Tolerate(0)` fails on the first one.
    Tolerate(u32),
}

/// Classification of a single observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    Pending,
    Target,
    Failed,
    Vanished,
}

/// Configuration of one wait.
///
/// The not-found policy has no default: whether a missing object is success,
/// lag, or failure depends on the resource and must be declared.
#[derive(Debug, Clone)]
pub struct WaitSpec {
    pending: BTreeSet<String>,
    target: BTreeSet<String>,
    failure: BTreeSet<String>,
    timeout: Duration,
    delay: Duration,
    min_poll_interval: Duration,
    poll_interval: Option<Duration>,
    not_found: NotFoundPolicy,
    continuous_target_occurrence: u32,
}

fn to_set<I, S>(states: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    states.into_iter().map(Into::into).collect()
}

impl WaitSpec {
    pub fn new(timeout: Duration, not_found: NotFoundPolicy) -> Self {
        Self {
            pending: BTreeSet::new(),
            target: BTreeSet::new(),
            failure: BTreeSet::new(),
            timeout,
            delay: Duration::ZERO,
            min_poll_interval: Duration::ZERO,
            poll_interval: None,
            not_found,
            continuous_target_occurrence: 1,
        }
    }

    pub fn pending<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pending = to_set(states);
        self
    }

    pub fn target<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target = to_set(states);
        self
    }

    pub fn failure<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failure = to_set(states);
        self
    }

    /// Wait before the first poll.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn min_poll_interval(mut self, interval: Duration) -> Self {
        self.min_poll_interval = interval;
        self
    }

    /// Poll at a fixed interval instead of backing off.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Require this many consecutive target observations.
    pub fn continuous_target_occurrence(mut self, count: u32) -> Self {
        self.continuous_target_occurrence = count;
        self
    }

    pub fn timeout_duration(&self) -> Duration {
        self.timeout
    }

    pub fn not_found_policy(&self) -> NotFoundPolicy {
        self.not_found
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(Error::InvalidWaitSpec("timeout must be positive".to_string()));
        }
        if let Some(state) = self.pending.intersection(&self.target).next() {
            return Err(Error::InvalidWaitSpec(format!(
                "state {state:?} is both pending and target"
            )));
        }
        if let Some(state) = self
            .failure
            .iter()
            .find(|s| self.pending.contains(*s) || self.target.contains(*s))
        {
            return Err(Error::InvalidWaitSpec(format!(
                "failure state {state:?} is also pending or target"
            )));
        }
        if self.continuous_target_occurrence == 0 {
            return Err(Error::InvalidWaitSpec(
                "continuous target occurrence must be at least 1".to_string(),
            ));
        }
        if self.target.is_empty() && self.not_found != NotFoundPolicy::Target {
            return Err(Error::InvalidWaitSpec(
                "empty target set requires absence to be the target".to_string(),
            ));
        }
        Ok(())
    }

    /// Classify an observation given how many consecutive absent
    /// observations (including this one) have been seen.
    pub fn classify<T>(&self, observed: &ObservedState<T>, consecutive_not_found: u32) -> Result<WaitState> {
        if observed.is_absent() {
            return Ok(match self.not_found {
                NotFoundPolicy::Target => WaitState::Vanished,
                NotFoundPolicy::Tolerate(checks) if consecutive_not_found <= checks => {
                    WaitState::Pending
                }
                NotFoundPolicy::Tolerate(_) => WaitState::Vanished,
            });
        }

        let state = observed.state.as_str();
        if self.target.contains(state) {
            Ok(WaitState::Target)
        } else if self.failure.contains(state) {
            Ok(WaitState::Failed)
        } else if self.pending.contains(state) || self.pending.is_empty() {
            Ok(WaitState::Pending)
        } else {
            Err(Error::UnexpectedState {
                state: state.to_string(),
                expected: self.target.iter().cloned().collect(),
            })
        }
    }

    fn backoff(&self) -> Backoff {
        match self.poll_interval {
            Some(interval) => Backoff::fixed(interval),
            None => Backoff::exponential().with_min_interval(self.min_poll_interval),
        }
    }
}

/// Outcome of a wait: the final observation, or the error with the last one.
pub type WaitResult<T> = std::result::Result<ObservedState<T>, Interrupted<ObservedState<T>>>;

/// Blocks until a remote object reaches a terminal state.
#[derive(Debug, Clone)]
pub struct StateWaiter {
    spec: WaitSpec,
    cancel: CancellationToken,
}

impl StateWaiter {
    pub fn new(spec: WaitSpec) -> Result<Self> {
        spec.validate()?;
        Ok(Self {
            spec,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn spec(&self) -> &WaitSpec {
        &self.spec
    }

    /// Poll `refresh` until the observed state is terminal.
    ///
    /// `refresh` reports absence either as [`ObservedState::absent`] or as
    /// `Error::NotFound`; any other error aborts the wait and is returned
    /// unchanged.
    pub async fn wait_for<T, F, Fut>(&self, mut refresh: F) -> WaitResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<ObservedState<T>>>,
    {
        let spec = &self.spec;
        let started = Instant::now();
        let deadline = started + spec.timeout;
        let backoff = spec.backoff();

        let mut last: ObservedState<T> = ObservedState::absent();
        let mut polled = false;
        let mut not_found: u32 = 0;
        let mut target_seen: u32 = 0;
        let mut attempt: u32 = 0;

        if !spec.delay.is_zero() && !sleep_until(&self.cancel, (started + spec.delay).min(deadline)).await {
            return Err(Interrupted::new(last, Error::cancelled(None)));
        }

        loop {
            let polled_now = tokio::select! {
                res = tokio::time::timeout_at(deadline, refresh()) => res,
                _ = self.cancel.cancelled() => {
                    debug!("Wait cancelled during refresh");
                    return Err(Interrupted::new(last, Error::cancelled(None)));
                }
            };
            let observed = match polled_now {
                Ok(Ok(observed)) => observed,
                Ok(Err(err)) if err.is_not_found() => ObservedState::absent(),
                Ok(Err(err)) => return Err(Interrupted::new(last, err)),
                Err(_) => {
                    let err = self.timeout_error(polled.then(|| last.state.clone()));
                    return Err(Interrupted::new(last, err));
                }
            };
            polled = true;

            if observed.is_absent() {
                not_found = not_found.saturating_add(1);
            } else {
                not_found = 0;
            }

            let state = match spec.classify(&observed, not_found) {
                Ok(state) => state,
                Err(err) => return Err(Interrupted::new(observed, err)),
            };
            debug!(state = %observed.state, classified = ?state, not_found, "Polled remote state");
            last = observed;

            match state {
                WaitState::Pending => target_seen = 0,
                WaitState::Target => target_seen += 1,
                WaitState::Vanished if spec.not_found == NotFoundPolicy::Target => target_seen += 1,
                WaitState::Vanished => {
                    warn!(checks = not_found, "Remote object vanished");
                    let err = Error::not_found(format!("couldn't find resource ({not_found} retries)"));
                    return Err(Interrupted::new(last, err));
                }
                WaitState::Failed => {
                    let err = Error::RemoteFailed {
                        state: last.state.clone(),
                        reason: last.message.clone(),
                    };
                    return Err(Interrupted::new(last, err));
                }
            }

            if target_seen >= spec.continuous_target_occurrence {
                debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Reached target state"
                );
                return Ok(last);
            }

            let now = Instant::now();
            if now >= deadline {
                let err = self.timeout_error(Some(last.state.clone()));
                return Err(Interrupted::new(last, err));
            }

            // Hold the interval while confirming a target observation.
            if target_seen == 0 {
                attempt = attempt.saturating_add(1);
            }
            let wait = backoff.interval(attempt).min(deadline - now);
            if !sleep_until(&self.cancel, now + wait).await {
                return Err(Interrupted::new(last, Error::cancelled(None)));
            }
        }
    }

    fn timeout_error(&self, last_state: Option<String>) -> Error {
        warn!(
            timeout_ms = self.spec.timeout.as_millis() as u64,
            last_state = ?last_state,
            "Timed out waiting for target state"
        );
        Error::timeout(self.spec.timeout, last_state, None)
    }
}
