//! Route table subnet associations.
//!
//! Associating a subnet is asynchronous: the call returns an association in
//! `associating` that may not even be readable yet. Adds therefore wait for
//! `associated` while tolerating a bounded run of not-found reads, and
//! removals wait until the association can no longer be read.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use converge_core::{
    find, ChildCollection, ChildSet, CompositeIdCodec, Error, NotFoundPolicy, ObservedState, Result,
    StateWaiter, WaitSpec,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ImportedResource, ReconcileSettings, ResourceKind};
use crate::clients::{codes, collect_pages, Association, AssociationState, ControlPlane};

/// Not-found reads tolerated while a new association becomes visible.
pub const ASSOCIATION_CREATED_NOT_FOUND_CHECKS: u32 = 1000;

/// Subnets associated with route tables; the parent id is the route table.
pub struct SubnetAssociations {
    plane: Arc<dyn ControlPlane>,
    codec: CompositeIdCodec,
    wait_timeout: Duration,
    poll_interval: Option<Duration>,
    not_found_checks: u32,
    cancel: CancellationToken,
}

impl SubnetAssociations {
    pub fn new(plane: Arc<dyn ControlPlane>, settings: &ReconcileSettings, cancel: CancellationToken) -> Self {
        Self {
            plane,
            codec: CompositeIdCodec::default(),
            wait_timeout: settings.operation_timeout,
            poll_interval: settings.poll_interval,
            not_found_checks: settings.not_found_checks,
            cancel,
        }
    }

    /// Import id of an association: `route_table_id,subnet_id`.
    pub fn resource_id(&self, route_table_id: &str, subnet_id: &str) -> Result<String> {
        Ok(self.codec.encode(&[route_table_id, subnet_id])?.to_string())
    }

    pub async fn import(&self, id: &str) -> Result<ImportedResource> {
        let parts = self.codec.decode(id, 2)?.into_parts();
        let (route_table_id, subnet_id) = (&parts[0], &parts[1]);

        let association = self
            .find(route_table_id, subnet_id)
            .await?
            .ok_or_else(|| not_associated(route_table_id, subnet_id))?;

        Ok(ImportedResource {
            kind: ResourceKind::SubnetAssociation,
            id: id.to_string(),
            parent: association.route_table_id,
            child: association.subnet_id,
            state: association.state.as_str().to_string(),
            created_at: Some(association.created_at),
        })
    }

    async fn find(&self, route_table_id: &str, subnet_id: &str) -> Result<Option<Association>> {
        let associations = collect_pages(|token| self.plane.list_associations(route_table_id, token)).await?;
        find::at_most_one(
            associations
                .into_iter()
                .filter(|a| a.subnet_id == subnet_id && a.state.is_live()),
            "route table association",
        )
    }

    async fn refresh(&self, association_id: &str) -> Result<ObservedState<Association>> {
        let association = self.plane.describe_association(association_id).await?;
        let state = association.state.as_str();
        let observed = match association.status_message.clone() {
            Some(message) => ObservedState::present(state, association).with_message(message),
            None => ObservedState::present(state, association),
        };
        Ok(observed)
    }

    fn with_polling(&self, spec: WaitSpec) -> WaitSpec {
        match self.poll_interval {
            Some(interval) => spec.poll_interval(interval),
            None => spec,
        }
    }

    fn created_spec(&self) -> WaitSpec {
        self.with_polling(
            WaitSpec::new(self.wait_timeout, NotFoundPolicy::Tolerate(self.not_found_checks))
                .pending([AssociationState::Associating.as_str()])
                .target([AssociationState::Associated.as_str()])
                .failure([AssociationState::Failed.as_str()]),
        )
    }

    /// Any state short of gone keeps the wait going.
    fn deleted_spec(&self) -> WaitSpec {
        self.with_polling(
            WaitSpec::new(self.wait_timeout, NotFoundPolicy::Target).pending([
                AssociationState::Associating.as_str(),
                AssociationState::Associated.as_str(),
                AssociationState::Disassociating.as_str(),
                AssociationState::Failed.as_str(),
            ]),
        )
    }
}

fn not_associated(route_table_id: &str, subnet_id: &str) -> Error {
    Error::not_found(format!("association of {subnet_id} with {route_table_id}"))
}

#[async_trait]
impl ChildCollection for SubnetAssociations {
    async fn list(&self, parent_id: &str) -> Result<ChildSet> {
        let associations = collect_pages(|token| self.plane.list_associations(parent_id, token)).await?;
        Ok(associations
            .into_iter()
            .filter(|a| a.state.is_live())
            .map(|a| a.subnet_id)
            .collect())
    }

    async fn add(&self, parent_id: &str, child_id: &str) -> Result<()> {
        let association = match self.plane.associate(parent_id, child_id).await {
            Ok(association) => association,
            Err(err) if err.code() == Some(codes::ALREADY_ASSOCIATED) => {
                debug!(route_table = parent_id, subnet = child_id, "Subnet already associated");
                self.find(parent_id, child_id)
                    .await?
                    .ok_or_else(|| not_associated(parent_id, child_id))?
            }
            Err(err) => return Err(err),
        };
        if association.state == AssociationState::Associated {
            return Ok(());
        }

        info!(
            route_table = parent_id,
            subnet = child_id,
            association_id = %association.association_id,
            "Waiting for association"
        );
        let association_id = association.association_id.as_str();
        StateWaiter::new(self.created_spec())?
            .with_cancellation(self.cancel.clone())
            .wait_for(|| self.refresh(association_id))
            .await?;
        Ok(())
    }

    async fn remove(&self, parent_id: &str, child_id: &str) -> Result<()> {
        let Some(association) = self.find(parent_id, child_id).await? else {
            return Err(not_associated(parent_id, child_id));
        };
        let association_id = association.association_id.as_str();

        match self.plane.disassociate(association_id).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        }

        debug!(route_table = parent_id, subnet = child_id, association_id, "Waiting for disassociation");
        StateWaiter::new(self.deleted_spec())?
            .with_cancellation(self.cancel.clone())
            .wait_for(|| self.refresh(association_id))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{MemoryControlPlane, SimulationConfig};
    use converge_core::WaitState;

    fn make_collection(config: SimulationConfig) -> (Arc<MemoryControlPlane>, SubnetAssociations) {
        let plane = Arc::new(MemoryControlPlane::new(config));
        let settings = ReconcileSettings {
            operation_timeout: Duration::from_secs(5),
            poll_interval: Some(Duration::from_millis(5)),
            not_found_checks: 3,
            ..Default::default()
        };
        let collection = SubnetAssociations::new(plane.clone(), &settings, CancellationToken::new());
        (plane, collection)
    }

    #[tokio::test]
    async fn test_add_waits_through_visibility_lag() {
        let (plane, collection) = make_collection(SimulationConfig {
            transition_reads: 2,
            visibility_lag_reads: 2,
            ..Default::default()
        });

        collection.add("rtb-1", "subnet-a").await.unwrap();

        let imported = collection.import("rtb-1,subnet-a").await.unwrap();
        assert_eq!(imported.state, "associated");
        assert_eq!(plane.live_subnets("rtb-1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_add_gives_up_when_association_never_appears() {
        let (_, collection) = make_collection(SimulationConfig {
            visibility_lag_reads: 10,
            ..Default::default()
        });

        let err = collection.add("rtb-1", "subnet-a").await.unwrap_err();
        assert!(err.is_not_found(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_add_of_existing_association_is_success() {
        let (plane, collection) = make_collection(SimulationConfig::default());
        plane.associate_out_of_band("rtb-1", "subnet-a").await;

        collection.add("rtb-1", "subnet-a").await.unwrap();

        assert_eq!(plane.calls().await, vec!["associate:rtb-1,subnet-a"]);
    }

    #[tokio::test]
    async fn test_failed_association() {
        let (_, collection) = make_collection(SimulationConfig {
            failing_subnets: ["subnet-a".to_string()].into(),
            ..Default::default()
        });

        let err = collection.add("rtb-1", "subnet-a").await.unwrap_err();
        match err {
            Error::RemoteFailed { state, reason } => {
                assert_eq!(state, "failed");
                assert!(reason.is_some());
            }
            other => panic!("expected RemoteFailed, got {other}"),
        }
        assert!(collection.list("rtb-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_waits_until_gone() {
        let (plane, collection) = make_collection(SimulationConfig {
            transition_reads: 2,
            route_tables: [("rtb-1".to_string(), ["subnet-a".to_string()].into())].into(),
            ..Default::default()
        });

        collection.remove("rtb-1", "subnet-a").await.unwrap();

        assert!(plane.live_subnets("rtb-1").await.is_empty());
        assert!(collection.import("rtb-1,subnet-a").await.unwrap_err().is_not_found());
    }

    #[test]
    fn test_removal_waits_out_every_remaining_state() {
        let (_, collection) = make_collection(SimulationConfig::default());
        let spec = collection.deleted_spec();

        for state in ["associating", "associated", "disassociating", "failed"] {
            let observed = ObservedState::present(state, ());
            assert_eq!(spec.classify(&observed, 0).unwrap(), WaitState::Pending, "{state}");
        }
        assert_eq!(
            spec.classify(&ObservedState::<()>::absent(), 1).unwrap(),
            WaitState::Vanished
        );
    }

    #[tokio::test]
    async fn test_remove_of_missing_association_is_not_found() {
        let (plane, collection) = make_collection(SimulationConfig::default());

        let err = collection.remove("rtb-1", "subnet-a").await.unwrap_err();

        assert!(err.is_not_found());
        assert!(plane.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_import_rejects_malformed_ids() {
        let (_, collection) = make_collection(SimulationConfig::default());

        for id in ["rtb-1", "rtb-1,subnet-a,extra", ",subnet-a"] {
            let err = collection.import(id).await.unwrap_err();
            assert!(matches!(err, Error::MalformedId { .. }), "{id}: {err}");
        }
    }

    #[test]
    fn test_resource_id() {
        let (_, collection) = make_collection(SimulationConfig::default());
        assert_eq!(collection.resource_id("rtb-1", "subnet-a").unwrap(), "rtb-1,subnet-a");
        assert!(collection.resource_id("rtb-1", "subnet,a").is_err());
    }
}
