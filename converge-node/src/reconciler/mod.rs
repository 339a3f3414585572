//! Reconcilers for the resource kinds the agent manages.
//!
//! Every kind pairs a parent resource with a remote child collection
//! (subnets associated with a route table, policies attached to a role).
//! The exclusive-set engine from `converge-core` converges that collection
//! to the declared children; this module decides, per kind, how children are
//! listed, added and removed and which remote errors are worth retrying.

pub mod association;
pub mod policy;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use converge_core::{
    ChildCollection, ChildSet, Diff, Error as CoreError, ExclusiveSetReconciler, Interrupted,
    ReconcileConfig, RetryPolicy,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clients::{codes, ControlPlane};

pub use association::SubnetAssociations;
pub use policy::PolicyAttachments;

/// Resource kinds known to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    SubnetAssociation,
    PolicyAttachment,
}

impl ResourceKind {
    /// Every kind, in reconciliation order.
    pub const ALL: [ResourceKind; 2] = [ResourceKind::SubnetAssociation, ResourceKind::PolicyAttachment];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::SubnetAssociation => "subnet_association",
            ResourceKind::PolicyAttachment => "policy_attachment",
        }
    }

    /// Engine configuration for this kind.
    pub fn reconcile_config(&self, settings: &ReconcileSettings) -> ReconcileConfig {
        match self {
            ResourceKind::SubnetAssociation => ReconcileConfig {
                timeout: settings.apply_timeout,
                add_policy: settings
                    .retry_policy(settings.operation_timeout)
                    .retry_on_codes([codes::DEPENDENCY_VIOLATION]),
                remove_policy: settings
                    .retry_policy(settings.operation_timeout)
                    .retry_on_codes([codes::DEPENDENCY_VIOLATION]),
            },
            // A role created moments ago is rejected until it propagates.
            ResourceKind::PolicyAttachment => ReconcileConfig {
                timeout: settings.apply_timeout,
                add_policy: settings
                    .retry_policy(settings.propagation_timeout)
                    .retry_on_codes([codes::NO_SUCH_ENTITY]),
                remove_policy: settings.retry_policy(settings.operation_timeout),
            },
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown resource kind {s:?}"))
    }
}

/// Timeouts and polling shared by all kinds.
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    /// Deadline for converging one parent.
    pub apply_timeout: Duration,
    /// Deadline for one add or remove, including its state wait.
    pub operation_timeout: Duration,
    /// How long a new identity object may take to become usable.
    pub propagation_timeout: Duration,
    /// Fixed polling interval; exponential backoff when unset.
    pub poll_interval: Option<Duration>,
    /// Consecutive not-found reads tolerated while a new association appears.
    pub not_found_checks: u32,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            apply_timeout: Duration::from_secs(20 * 60),
            operation_timeout: Duration::from_secs(5 * 60),
            propagation_timeout: Duration::from_secs(2 * 60),
            poll_interval: None,
            not_found_checks: association::ASSOCIATION_CREATED_NOT_FOUND_CHECKS,
        }
    }
}

impl ReconcileSettings {
    fn retry_policy(&self, timeout: Duration) -> RetryPolicy {
        let policy = RetryPolicy::new(timeout);
        match self.poll_interval {
            Some(interval) => policy.with_poll_interval(interval),
            None => policy,
        }
    }
}

/// A child collection of one kind, selected by [`ResourceKind`].
pub enum KindCollection {
    SubnetAssociations(SubnetAssociations),
    PolicyAttachments(PolicyAttachments),
}

impl KindCollection {
    pub fn new(
        kind: ResourceKind,
        plane: Arc<dyn ControlPlane>,
        settings: &ReconcileSettings,
        cancel: CancellationToken,
    ) -> Self {
        match kind {
            ResourceKind::SubnetAssociation => {
                KindCollection::SubnetAssociations(SubnetAssociations::new(plane, settings, cancel))
            }
            ResourceKind::PolicyAttachment => KindCollection::PolicyAttachments(PolicyAttachments::new(plane)),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            KindCollection::SubnetAssociations(_) => ResourceKind::SubnetAssociation,
            KindCollection::PolicyAttachments(_) => ResourceKind::PolicyAttachment,
        }
    }

    /// Make sure the parent exists before its children are reconciled.
    pub async fn prepare(&self, parent_id: &str) -> converge_core::Result<()> {
        match self {
            // Route tables are owned elsewhere; an unknown one lists as empty.
            KindCollection::SubnetAssociations(_) => Ok(()),
            KindCollection::PolicyAttachments(c) => c.ensure_role(parent_id).await,
        }
    }

    /// Read one existing child by its composite id.
    pub async fn import(&self, id: &str) -> converge_core::Result<ImportedResource> {
        match self {
            KindCollection::SubnetAssociations(c) => c.import(id).await,
            KindCollection::PolicyAttachments(c) => c.import(id).await,
        }
    }
}

#[async_trait]
impl ChildCollection for KindCollection {
    async fn list(&self, parent_id: &str) -> converge_core::Result<ChildSet> {
        match self {
            KindCollection::SubnetAssociations(c) => c.list(parent_id).await,
            KindCollection::PolicyAttachments(c) => c.list(parent_id).await,
        }
    }

    async fn add(&self, parent_id: &str, child_id: &str) -> converge_core::Result<()> {
        match self {
            KindCollection::SubnetAssociations(c) => c.add(parent_id, child_id).await,
            KindCollection::PolicyAttachments(c) => c.add(parent_id, child_id).await,
        }
    }

    async fn remove(&self, parent_id: &str, child_id: &str) -> converge_core::Result<()> {
        match self {
            KindCollection::SubnetAssociations(c) => c.remove(parent_id, child_id).await,
            KindCollection::PolicyAttachments(c) => c.remove(parent_id, child_id).await,
        }
    }
}

/// An existing child read back from the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportedResource {
    pub kind: ResourceKind,
    pub id: String,
    pub parent: String,
    pub child: String,
    pub state: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Outcome of reconciling one manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Converged,
    Failed,
    Drifted,
}

/// Status reported for one parent after a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryStatus {
    pub kind: ResourceKind,
    pub parent: String,
    pub phase: Phase,
    /// Children the parent actually has after the pass.
    pub children: ChildSet,
    /// Whether the parent was dropped from the manifest and emptied.
    #[serde(default)]
    pub pruned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub reconciled_at: DateTime<Utc>,
}

impl EntryStatus {
    pub fn failed(kind: ResourceKind, parent: &str, message: String) -> Self {
        Self {
            kind,
            parent: parent.to_string(),
            phase: Phase::Failed,
            children: ChildSet::new(),
            pruned: false,
            message: Some(message),
            reconciled_at: Utc::now(),
        }
    }
}

/// Trait for resource reconcilers.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Desired state of one resource.
    type Spec;
    /// The status type to report back.
    type Status;

    /// Reconcile the resource - compare desired vs actual state and take action.
    async fn reconcile(&self, id: &str, spec: &Self::Spec) -> Result<Self::Status>;

    /// Handle a resource that is no longer declared.
    async fn finalize(&self, id: &str) -> Result<Self::Status>;
}

/// Converges every parent of one kind through the exclusive-set engine.
pub struct CollectionReconciler {
    collection: KindCollection,
    engine: ExclusiveSetReconciler,
}

impl CollectionReconciler {
    pub fn new(
        kind: ResourceKind,
        plane: Arc<dyn ControlPlane>,
        settings: &ReconcileSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            collection: KindCollection::new(kind, plane, settings, cancel.clone()),
            engine: ExclusiveSetReconciler::new(kind.reconcile_config(settings)).with_cancellation(cancel),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.collection.kind()
    }

    pub fn collection(&self) -> &KindCollection {
        &self.collection
    }

    /// Changes a reconcile would make. A parent that does not exist yet
    /// gets all of its children added.
    pub async fn plan(&self, parent_id: &str, desired: &ChildSet) -> converge_core::Result<Diff> {
        match self.engine.plan(parent_id, desired, &self.collection).await {
            Err(err) if err.is_not_found() => Ok(Diff::compute(desired, &ChildSet::new())),
            other => other,
        }
    }

    fn status(
        &self,
        parent_id: &str,
        outcome: std::result::Result<ChildSet, Interrupted<ChildSet>>,
        pruned: bool,
    ) -> EntryStatus {
        let kind = self.kind();
        let (phase, children, message) = match outcome {
            Ok(children) => (Phase::Converged, children, None),
            Err(Interrupted { last, error }) => {
                let phase = match &error {
                    CoreError::DriftDetected { .. } => {
                        warn!(kind = %kind, parent = parent_id, error = %error, "Drift detected");
                        Phase::Drifted
                    }
                    _ => {
                        error!(kind = %kind, parent = parent_id, error = %error, "Reconciliation failed");
                        Phase::Failed
                    }
                };
                let message = match error.last_error() {
                    Some(cause) => format!("{error}: {cause}"),
                    None => error.to_string(),
                };
                (phase, last, Some(message))
            }
        };
        EntryStatus {
            kind,
            parent: parent_id.to_string(),
            phase,
            children,
            pruned,
            message,
            reconciled_at: Utc::now(),
        }
    }
}

#[async_trait]
impl Reconciler for CollectionReconciler {
    type Spec = ChildSet;
    type Status = EntryStatus;

    async fn reconcile(&self, id: &str, spec: &Self::Spec) -> Result<Self::Status> {
        info!(kind = %self.kind(), parent = id, children = spec.len(), "Reconciling");
        self.collection
            .prepare(id)
            .await
            .with_context(|| format!("failed to prepare {} parent {id}", self.kind()))?;

        let outcome = self.engine.apply(id, spec, &self.collection).await;
        Ok(self.status(id, outcome, false))
    }

    async fn finalize(&self, id: &str) -> Result<Self::Status> {
        info!(kind = %self.kind(), parent = id, "Pruning undeclared parent");
        let outcome = match self.engine.apply(id, &ChildSet::new(), &self.collection).await {
            // Parent itself is gone, so it has no children left.
            Err(interrupted) if interrupted.error.is_not_found() => Ok(ChildSet::new()),
            other => other,
        };
        Ok(self.status(id, outcome, true))
    }
}
