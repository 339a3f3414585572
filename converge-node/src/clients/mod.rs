//! Clients for the cloud control plane.
//!
//! The agent talks to the remote API only through [`ControlPlane`], passed in
//! explicitly. [`MemoryControlPlane`] is an in-process implementation that
//! reproduces the eventual consistency of the real service.

pub mod memory;

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use converge_core::Result;
use serde::{Deserialize, Serialize};

pub use memory::{MemoryControlPlane, SimulationConfig};

/// Error codes returned by the control plane.
pub mod codes {
    /// A referenced object exists but is not yet usable.
    pub const DEPENDENCY_VIOLATION: &str = "DependencyViolation";
    /// Identity object unknown, including a freshly created one that has not
    /// propagated yet.
    pub const NO_SUCH_ENTITY: &str = "NoSuchEntity";
    /// The subnet already has a live association with this route table.
    pub const ALREADY_ASSOCIATED: &str = "Resource.AlreadyAssociated";
    pub const INVALID_NEXT_TOKEN: &str = "InvalidNextToken";
}

/// Lifecycle state of a route table association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationState {
    Associating,
    Associated,
    Disassociating,
    Failed,
}

impl AssociationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssociationState::Associating => "associating",
            AssociationState::Associated => "associated",
            AssociationState::Disassociating => "disassociating",
            AssociationState::Failed => "failed",
        }
    }

    /// Whether the association counts as a member of the route table.
    pub fn is_live(&self) -> bool {
        matches!(self, AssociationState::Associating | AssociationState::Associated)
    }
}

/// A subnet associated with a route table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Association {
    pub association_id: String,
    pub route_table_id: String,
    pub subnet_id: String,
    pub state: AssociationState,
    pub status_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An identity role that policies attach to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub role_id: String,
    pub name: String,
    pub arn: String,
    pub created_at: DateTime<Utc>,
}

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

/// Remote control plane operations used by the reconcilers.
///
/// Absent objects are reported as `Error::NotFound` by the describe calls;
/// everything else the service rejects comes back as `Error::Api` with the
/// service's error code.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn describe_association(&self, association_id: &str) -> Result<Association>;

    async fn list_associations(
        &self,
        route_table_id: &str,
        next_token: Option<String>,
    ) -> Result<Page<Association>>;

    async fn associate(&self, route_table_id: &str, subnet_id: &str) -> Result<Association>;

    async fn disassociate(&self, association_id: &str) -> Result<()>;

    /// Create the role if it does not exist. Returns the role and whether it
    /// was created by this call.
    async fn ensure_role(&self, role_name: &str) -> Result<(Role, bool)>;

    async fn attach_policy(&self, role_name: &str, policy_arn: &str) -> Result<()>;

    async fn detach_policy(&self, role_name: &str, policy_arn: &str) -> Result<()>;

    async fn list_attached_policies(
        &self,
        role_name: &str,
        next_token: Option<String>,
    ) -> Result<Page<String>>;
}

/// Follow `next_token` until the listing is exhausted.
pub async fn collect_pages<T, F, Fut>(mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>>>,
{
    let mut items = Vec::new();
    let mut token = None;
    loop {
        let page = fetch(token.take()).await?;
        items.extend(page.items);
        match page.next_token {
            Some(next) => token = Some(next),
            None => return Ok(items),
        }
    }
}
