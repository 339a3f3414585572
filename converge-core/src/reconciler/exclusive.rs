//! Exclusive-set reconciler.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ChildCollection, ChildSet, Diff};
use crate::error::{Error, Interrupted, Result};
use crate::retry::{RetryExecutor, RetryPolicy};

/// Default deadline for one reconciliation pass.
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(20 * 60);
/// Default deadline for retrying a single add or remove.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Configuration for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Deadline for a whole `apply`, including verification.
    pub timeout: Duration,
    /// Retry policy for each `add`.
    pub add_policy: RetryPolicy,
    /// Retry policy for each `remove`.
    pub remove_policy: RetryPolicy,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_APPLY_TIMEOUT,
            add_policy: RetryPolicy::new(DEFAULT_OPERATION_TIMEOUT),
            remove_policy: RetryPolicy::new(DEFAULT_OPERATION_TIMEOUT),
        }
    }
}

/// Makes a remote child collection equal a declared set.
///
/// After a successful [`apply`](Self::apply) the collection holds exactly the
/// desired children. Failures are not rolled back: the error carries the set
/// actually reached and the next pass continues from there.
#[derive(Debug, Clone, Default)]
pub struct ExclusiveSetReconciler {
    config: ReconcileConfig,
    executor: RetryExecutor,
}

impl ExclusiveSetReconciler {
    pub fn new(config: ReconcileConfig) -> Self {
        Self {
            config,
            executor: RetryExecutor::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.executor = RetryExecutor::with_cancellation(cancel);
        self
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Compute the changes `apply` would make, without making them.
    pub async fn plan<C>(&self, parent_id: &str, desired: &ChildSet, collection: &C) -> Result<Diff>
    where
        C: ChildCollection + ?Sized,
    {
        let actual = collection.list(parent_id).await?;
        Ok(Diff::compute(desired, &actual))
    }

    /// Converge `parent_id`'s collection to `desired`.
    ///
    /// Removals are applied before additions. The collection is listed again
    /// afterwards; any difference from `desired` is `DriftDetected`.
    pub async fn apply<C>(
        &self,
        parent_id: &str,
        desired: &ChildSet,
        collection: &C,
    ) -> std::result::Result<ChildSet, Interrupted<ChildSet>>
    where
        C: ChildCollection + ?Sized,
    {
        let cancel = self.executor.cancellation_token();
        let mut achieved = ChildSet::new();
        let mut last_error = None;

        let outcome = {
            let work = tokio::time::timeout(
                self.config.timeout,
                self.converge(parent_id, desired, collection, &mut achieved, &mut last_error),
            );
            tokio::select! {
                res = work => Some(res),
                _ = cancel.cancelled() => None,
            }
        };

        match outcome {
            Some(Ok(Ok(applied))) => Ok(applied),
            Some(Ok(Err(err))) => Err(Interrupted::new(achieved, err)),
            Some(Err(_)) => {
                warn!(
                    parent = parent_id,
                    timeout_secs = self.config.timeout.as_secs(),
                    last_error = ?last_error.as_ref().map(ToString::to_string),
                    "Reconciliation timed out"
                );
                let err = Error::timeout(self.config.timeout, None, last_error);
                Err(Interrupted::new(achieved, err))
            }
            None => Err(Interrupted::new(achieved, Error::cancelled(last_error))),
        }
    }

    /// `last_error` holds the error the in-flight add or remove is retrying.
    async fn converge<C>(
        &self,
        parent_id: &str,
        desired: &ChildSet,
        collection: &C,
        achieved: &mut ChildSet,
        last_error: &mut Option<Error>,
    ) -> Result<ChildSet>
    where
        C: ChildCollection + ?Sized,
    {
        let actual = collection.list(parent_id).await?;
        *achieved = actual.clone();

        let diff = Diff::compute(desired, &actual);
        if diff.is_empty() {
            debug!(parent = parent_id, children = actual.len(), "Already converged");
            return Ok(actual);
        }

        info!(
            parent = parent_id,
            additions = diff.additions.len(),
            removals = diff.removals.len(),
            "Applying diff"
        );

        for child in &diff.removals {
            self.check_cancelled()?;
            let removed = self
                .executor
                .execute_tracked(&self.config.remove_policy, last_error, || {
                    collection.remove(parent_id, child)
                })
                .await;
            match removed {
                Ok(()) => info!(parent = parent_id, child = %child, "Removed child"),
                Err(err) if err.is_not_found() => {
                    debug!(parent = parent_id, child = %child, "Child already removed")
                }
                Err(err) => {
                    error!(parent = parent_id, child = %child, error = %err, "Failed to remove child");
                    return Err(err);
                }
            }
            achieved.remove(child);
        }

        for child in &diff.additions {
            self.check_cancelled()?;
            let added = self
                .executor
                .execute_tracked(&self.config.add_policy, last_error, || collection.add(parent_id, child))
                .await;
            if let Err(err) = added {
                error!(parent = parent_id, child = %child, error = %err, "Failed to add child");
                return Err(err);
            }
            info!(parent = parent_id, child = %child, "Added child");
            achieved.insert(child.clone());
        }

        let observed = collection.list(parent_id).await?;
        *achieved = observed.clone();

        if observed != *desired {
            let drift = Diff::compute(desired, &observed);
            warn!(
                parent = parent_id,
                missing = ?drift.additions,
                unexpected = ?drift.removals,
                "Collection drifted during reconciliation"
            );
            return Err(Error::DriftDetected {
                parent: parent_id.to_string(),
                missing: drift.additions.into_iter().collect(),
                unexpected: drift.removals.into_iter().collect(),
            });
        }

        Ok(observed)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.executor.cancellation_token().is_cancelled() {
            return Err(Error::cancelled(None));
        }
        Ok(())
    }
}
