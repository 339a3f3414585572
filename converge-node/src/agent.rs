//! Node agent - loads the manifest, reconciles every declared parent with the
//! control plane and prunes parents that are no longer declared.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use converge_core::Diff;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clients::ControlPlane;
use crate::manifest::Manifest;
use crate::reconciler::{
    CollectionReconciler, EntryStatus, ImportedResource, Phase, ReconcileSettings, Reconciler,
    ResourceKind,
};

/// Why an import failed.
#[derive(Debug, Error)]
pub enum ImportError {
    /// The id does not have the shape the kind expects; a usage error.
    #[error("invalid {kind} import id: {source}")]
    InvalidId {
        kind: ResourceKind,
        #[source]
        source: converge_core::Error,
    },

    #[error("{kind} {id} does not exist")]
    NotFound { kind: ResourceKind, id: String },

    #[error("failed to read {kind} {id}: {source}")]
    Remote {
        kind: ResourceKind,
        id: String,
        #[source]
        source: converge_core::Error,
    },
}

/// Status of every entry after one pass over a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestStatus {
    pub revision: u64,
    pub entries: Vec<EntryStatus>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ManifestStatus {
    pub fn is_converged(&self) -> bool {
        self.entries.iter().all(|e| e.phase == Phase::Converged)
    }
}

/// Planned changes for one parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedChange {
    pub kind: ResourceKind,
    pub parent: String,
    #[serde(flatten)]
    pub diff: Diff,
    pub prune: bool,
}

/// Node agent that reconciles declared state with the control plane.
pub struct NodeAgent {
    cancel: CancellationToken,
    /// Parents seen in the previous pass, per kind, for pruning.
    known_parents: BTreeMap<ResourceKind, BTreeSet<String>>,
    association_reconciler: CollectionReconciler,
    policy_reconciler: CollectionReconciler,
}

impl NodeAgent {
    pub fn new(plane: Arc<dyn ControlPlane>, settings: ReconcileSettings, cancel: CancellationToken) -> Self {
        Self {
            association_reconciler: CollectionReconciler::new(
                ResourceKind::SubnetAssociation,
                Arc::clone(&plane),
                &settings,
                cancel.clone(),
            ),
            policy_reconciler: CollectionReconciler::new(
                ResourceKind::PolicyAttachment,
                plane,
                &settings,
                cancel.clone(),
            ),
            cancel,
            known_parents: BTreeMap::new(),
        }
    }

    fn reconciler(&self, kind: ResourceKind) -> &CollectionReconciler {
        match kind {
            ResourceKind::SubnetAssociation => &self.association_reconciler,
            ResourceKind::PolicyAttachment => &self.policy_reconciler,
        }
    }

    /// Parents the agent currently owns for `kind`.
    pub fn known_parents(&self, kind: ResourceKind) -> BTreeSet<String> {
        self.known_parents.get(&kind).cloned().unwrap_or_default()
    }

    /// Reconcile every entry in kind order, then prune parents that left the
    /// manifest by emptying their collections.
    pub async fn apply_manifest(&mut self, manifest: &Manifest) -> ManifestStatus {
        let started_at = Utc::now();
        info!(
            revision = manifest.revision,
            resources = manifest.resources.len(),
            "Applying manifest"
        );

        let mut entries = Vec::new();
        for kind in ResourceKind::ALL {
            let reconciler = self.reconciler(kind);
            let desired: BTreeSet<String> = manifest.entries(kind).map(|s| s.parent.clone()).collect();

            for spec in manifest.entries(kind) {
                let status = match reconciler.reconcile(&spec.parent, &spec.children).await {
                    Ok(status) => status,
                    Err(e) => {
                        error!(kind = %kind, parent = %spec.parent, "Reconciliation failed: {:#}", e);
                        EntryStatus::failed(kind, &spec.parent, format!("{e:#}"))
                    }
                };
                entries.push(status);
            }

            let known = self.known_parents.get(&kind).cloned().unwrap_or_default();
            let mut still_known = desired.clone();
            for parent in known.difference(&desired) {
                let status = match reconciler.finalize(parent).await {
                    Ok(status) => status,
                    Err(e) => EntryStatus::failed(kind, parent, format!("{e:#}")),
                };
                if status.phase != Phase::Converged {
                    // Try again next pass.
                    warn!(kind = %kind, parent = %parent, "Failed to prune parent");
                    still_known.insert(parent.clone());
                }
                entries.push(status);
            }
            self.known_parents.insert(kind, still_known);
        }

        let status = ManifestStatus {
            revision: manifest.revision,
            entries,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            revision = status.revision,
            entries = status.entries.len(),
            converged = status.is_converged(),
            "Manifest applied"
        );
        status
    }

    /// Changes the next `apply_manifest` would make, without making them.
    pub async fn plan(&self, manifest: &Manifest) -> Result<Vec<PlannedChange>> {
        let mut changes = Vec::new();
        for kind in ResourceKind::ALL {
            let reconciler = self.reconciler(kind);
            for spec in manifest.entries(kind) {
                let diff = reconciler
                    .plan(&spec.parent, &spec.children)
                    .await
                    .with_context(|| format!("failed to plan {kind} {}", spec.parent))?;
                changes.push(PlannedChange {
                    kind,
                    parent: spec.parent.clone(),
                    diff,
                    prune: false,
                });
            }

            let declared: BTreeSet<&str> = manifest.entries(kind).map(|s| s.parent.as_str()).collect();
            for parent in self.known_parents(kind) {
                if declared.contains(parent.as_str()) {
                    continue;
                }
                let diff = reconciler
                    .plan(&parent, &BTreeSet::new())
                    .await
                    .with_context(|| format!("failed to plan pruning {kind} {parent}"))?;
                changes.push(PlannedChange {
                    kind,
                    parent,
                    diff,
                    prune: true,
                });
            }
        }
        Ok(changes)
    }

    /// Read one existing child by its composite id.
    pub async fn import(&self, kind: ResourceKind, id: &str) -> Result<ImportedResource, ImportError> {
        match self.reconciler(kind).collection().import(id).await {
            Ok(resource) => Ok(resource),
            Err(source) if source.is_identifier_error() => Err(ImportError::InvalidId { kind, source }),
            Err(err) if err.is_not_found() => Err(ImportError::NotFound {
                kind,
                id: id.to_string(),
            }),
            Err(source) => Err(ImportError::Remote {
                kind,
                id: id.to_string(),
                source,
            }),
        }
    }

    /// Main agent loop: apply the manifest every `interval` until cancelled,
    /// or once. Returns the status of the last pass.
    pub async fn run(&mut self, manifest_path: &Path, interval: Duration, once: bool) -> Result<ManifestStatus> {
        loop {
            let manifest = Manifest::load(manifest_path)
                .await
                .context("Failed to load manifest")?;

            let status = self.apply_manifest(&manifest).await;
            let json = serde_json::to_string(&status).context("Failed to serialize status")?;
            info!(status = %json, "Pass complete");

            if once || self.cancel.is_cancelled() {
                return Ok(status);
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.cancel.cancelled() => {
                    info!("Agent stopping");
                    return Ok(status);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{MemoryControlPlane, SimulationConfig};
    use crate::manifest::ResourceSpec;
    use converge_core::ChildSet;

    fn set(items: &[&str]) -> ChildSet {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn make_agent(config: SimulationConfig) -> (Arc<MemoryControlPlane>, NodeAgent) {
        let plane = Arc::new(MemoryControlPlane::new(config));
        let settings = ReconcileSettings {
            poll_interval: Some(Duration::from_millis(5)),
            not_found_checks: 5,
            ..Default::default()
        };
        let agent = NodeAgent::new(plane.clone(), settings, CancellationToken::new());
        (plane, agent)
    }

    fn make_manifest(revision: u64, resources: &[(ResourceKind, &str, &[&str])]) -> Manifest {
        Manifest {
            revision,
            resources: resources
                .iter()
                .map(|(kind, parent, children)| ResourceSpec {
                    kind: *kind,
                    parent: parent.to_string(),
                    children: set(children),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_apply_manifest_converges_all_kinds() {
        let (plane, mut agent) = make_agent(SimulationConfig {
            route_tables: [("rtb-1".to_string(), set(&["subnet-old"]))].into(),
            ..Default::default()
        });
        let manifest = make_manifest(
            1,
            &[
                (ResourceKind::PolicyAttachment, "app", &["arn:p1", "arn:p2"]),
                (ResourceKind::SubnetAssociation, "rtb-1", &["subnet-a"]),
            ],
        );

        let status = agent.apply_manifest(&manifest).await;

        assert!(status.is_converged(), "{status:?}");
        // Kind order, not declaration order.
        assert_eq!(status.entries[0].kind, ResourceKind::SubnetAssociation);
        assert_eq!(status.entries[1].kind, ResourceKind::PolicyAttachment);
        assert_eq!(plane.live_subnets("rtb-1").await, set(&["subnet-a"]));
        assert_eq!(plane.attached_policies("app").await.unwrap(), set(&["arn:p1", "arn:p2"]));
        assert_eq!(agent.known_parents(ResourceKind::PolicyAttachment), set(&["app"]));
    }

    #[tokio::test]
    async fn test_dropped_parent_is_pruned() {
        let (plane, mut agent) = make_agent(SimulationConfig::default());
        let first = make_manifest(
            1,
            &[
                (ResourceKind::SubnetAssociation, "rtb-1", &["subnet-a"]),
                (ResourceKind::SubnetAssociation, "rtb-2", &["subnet-b"]),
            ],
        );
        agent.apply_manifest(&first).await;

        let second = make_manifest(2, &[(ResourceKind::SubnetAssociation, "rtb-1", &["subnet-a"])]);
        let status = agent.apply_manifest(&second).await;

        assert!(status.is_converged(), "{status:?}");
        let pruned: Vec<_> = status.entries.iter().filter(|e| e.pruned).collect();
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].parent, "rtb-2");
        assert!(plane.live_subnets("rtb-2").await.is_empty());
        assert_eq!(agent.known_parents(ResourceKind::SubnetAssociation), set(&["rtb-1"]));
    }

    #[tokio::test]
    async fn test_failed_entry_does_not_stop_others() {
        let (plane, mut agent) = make_agent(SimulationConfig {
            failing_subnets: set(&["subnet-bad"]),
            ..Default::default()
        });
        let manifest = make_manifest(
            1,
            &[
                (ResourceKind::SubnetAssociation, "rtb-1", &["subnet-bad"]),
                (ResourceKind::SubnetAssociation, "rtb-2", &["subnet-a"]),
            ],
        );

        let status = agent.apply_manifest(&manifest).await;

        assert!(!status.is_converged());
        assert_eq!(status.entries[0].phase, Phase::Failed);
        assert_eq!(status.entries[1].phase, Phase::Converged);
        assert_eq!(plane.live_subnets("rtb-2").await, set(&["subnet-a"]));
    }

    #[tokio::test]
    async fn test_status_serializes_as_json() {
        let (_, mut agent) = make_agent(SimulationConfig::default());
        let manifest = make_manifest(4, &[(ResourceKind::SubnetAssociation, "rtb-1", &[])]);

        let status = agent.apply_manifest(&manifest).await;
        let json: serde_json::Value = serde_json::to_value(&status).unwrap();

        assert_eq!(json["revision"], 4);
        assert_eq!(json["entries"][0]["kind"], "subnet_association");
        assert_eq!(json["entries"][0]["phase"], "converged");
        assert!(json["entries"][0].get("message").is_none());
    }

    #[tokio::test]
    async fn test_plan_includes_prunes_and_changes_nothing() {
        let (plane, mut agent) = make_agent(SimulationConfig::default());
        agent
            .apply_manifest(&make_manifest(1, &[(ResourceKind::SubnetAssociation, "rtb-1", &["subnet-a"])]))
            .await;
        plane.clear_calls().await;

        let next = make_manifest(2, &[(ResourceKind::PolicyAttachment, "app", &["arn:p"])]);
        let changes = agent.plan(&next).await.unwrap();

        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].parent, "rtb-1");
        assert!(changes[0].prune);
        assert_eq!(changes[0].diff.removals, set(&["subnet-a"]));
        assert_eq!(changes[1].diff.additions, set(&["arn:p"]));
        assert!(plane.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_import_distinguishes_errors() {
        let (plane, agent) = make_agent(SimulationConfig::default());
        plane.associate_out_of_band("rtb-1", "subnet-a").await;

        let imported = agent
            .import(ResourceKind::SubnetAssociation, "rtb-1,subnet-a")
            .await
            .unwrap();
        assert_eq!(imported.child, "subnet-a");

        let malformed = agent.import(ResourceKind::SubnetAssociation, "rtb-1").await.unwrap_err();
        assert!(matches!(malformed, ImportError::InvalidId { .. }));

        let missing = agent
            .import(ResourceKind::SubnetAssociation, "rtb-1,subnet-z")
            .await
            .unwrap_err();
        assert!(matches!(missing, ImportError::NotFound { .. }));
    }
}
