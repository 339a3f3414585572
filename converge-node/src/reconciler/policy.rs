//! Managed policies attached to identity roles.

use std::sync::Arc;

use async_trait::async_trait;
use converge_core::{find, ChildCollection, ChildSet, CompositeIdCodec, Error, Result};
use tracing::{debug, info};

use super::{ImportedResource, ResourceKind};
use crate::clients::{codes, collect_pages, ControlPlane};

/// Policy ARNs attached to roles; the parent id is the role name.
pub struct PolicyAttachments {
    plane: Arc<dyn ControlPlane>,
    codec: CompositeIdCodec,
}

impl PolicyAttachments {
    pub fn new(plane: Arc<dyn ControlPlane>) -> Self {
        Self {
            plane,
            codec: CompositeIdCodec::default(),
        }
    }

    pub async fn ensure_role(&self, role_name: &str) -> Result<()> {
        let (role, created) = self.plane.ensure_role(role_name).await?;
        if created {
            info!(role = role_name, arn = %role.arn, "Created role");
        }
        Ok(())
    }

    /// Import id of an attachment: `role_name,policy_arn`.
    pub async fn import(&self, id: &str) -> Result<ImportedResource> {
        let parts = self.codec.decode(id, 2)?.into_parts();
        let (role_name, policy_arn) = (&parts[0], &parts[1]);

        let attached = self.attached(role_name).await?;
        let policy = find::at_most_one(attached.into_iter().filter(|arn| arn == policy_arn), "policy attachment")?
            .ok_or_else(|| Error::not_found(format!("policy {policy_arn} attached to role {role_name}")))?;

        Ok(ImportedResource {
            kind: ResourceKind::PolicyAttachment,
            id: id.to_string(),
            parent: role_name.clone(),
            child: policy,
            state: "attached".to_string(),
            created_at: None,
        })
    }

    async fn attached(&self, role_name: &str) -> Result<Vec<String>> {
        collect_pages(|token| self.plane.list_attached_policies(role_name, token))
            .await
            .map_err(|err| {
                if err.code() == Some(codes::NO_SUCH_ENTITY) {
                    Error::not_found(format!("role {role_name}"))
                } else {
                    err
                }
            })
    }
}

#[async_trait]
impl ChildCollection for PolicyAttachments {
    async fn list(&self, parent_id: &str) -> Result<ChildSet> {
        Ok(self.attached(parent_id).await?.into_iter().collect())
    }

    async fn add(&self, parent_id: &str, child_id: &str) -> Result<()> {
        self.plane.attach_policy(parent_id, child_id).await
    }

    async fn remove(&self, parent_id: &str, child_id: &str) -> Result<()> {
        match self.plane.detach_policy(parent_id, child_id).await {
            Err(err) if err.code() == Some(codes::NO_SUCH_ENTITY) => {
                debug!(role = parent_id, policy = child_id, "Policy already detached");
                Ok(())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{MemoryControlPlane, SimulationConfig};

    fn make_collection(config: SimulationConfig) -> (Arc<MemoryControlPlane>, PolicyAttachments) {
        let plane = Arc::new(MemoryControlPlane::new(config));
        (plane.clone(), PolicyAttachments::new(plane))
    }

    #[tokio::test]
    async fn test_list_exhausts_pages() {
        let policies: ChildSet = (0..7).map(|i| format!("arn:aws:iam::aws:policy/P{i}")).collect();
        let (_, collection) = make_collection(SimulationConfig {
            page_size: 3,
            roles: [("app".to_string(), policies.clone())].into(),
            ..Default::default()
        });

        assert_eq!(collection.list("app").await.unwrap(), policies);
    }

    #[tokio::test]
    async fn test_list_of_missing_role_is_not_found() {
        let (_, collection) = make_collection(SimulationConfig::default());
        assert!(collection.list("ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_add_to_fresh_role_surfaces_propagation_error() {
        let (_, collection) = make_collection(SimulationConfig {
            role_propagation_calls: 1,
            ..Default::default()
        });
        collection.ensure_role("app").await.unwrap();

        let err = collection.add("app", "arn:p").await.unwrap_err();
        assert_eq!(err.code(), Some(codes::NO_SUCH_ENTITY));
        collection.add("app", "arn:p").await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_of_detached_policy_is_success() {
        let (plane, collection) = make_collection(SimulationConfig::default());
        plane.attach_out_of_band("app", "arn:p").await;

        collection.remove("app", "arn:p").await.unwrap();
        collection.remove("app", "arn:p").await.unwrap();
        assert!(plane.attached_policies("app").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_import() {
        let (plane, collection) = make_collection(SimulationConfig::default());
        plane
            .attach_out_of_band("app", "arn:aws:iam::aws:policy/ReadOnlyAccess")
            .await;

        let imported = collection
            .import("app,arn:aws:iam::aws:policy/ReadOnlyAccess")
            .await
            .unwrap();
        assert_eq!(imported.parent, "app");
        assert_eq!(imported.child, "arn:aws:iam::aws:policy/ReadOnlyAccess");

        let missing = collection.import("app,arn:other").await.unwrap_err();
        assert!(missing.is_not_found());
        let malformed = collection.import("app").await.unwrap_err();
        assert!(matches!(malformed, Error::MalformedId { .. }));
    }
}
