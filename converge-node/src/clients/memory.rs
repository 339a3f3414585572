//! In-process control plane with eventual consistency.
//!
//! Writes are acknowledged immediately but take effect over several reads:
//! new associations are invisible for a while, then sit in `associating`
//! before settling; disassociations linger in `disassociating`; policy
//! attachment to a brand new role is rejected until the role propagates.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::Utc;
use converge_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{codes, Association, AssociationState, ControlPlane, Page, Role};

/// Behaviour of the simulated control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Reads an association spends in a transitional state.
    pub transition_reads: u32,
    /// Reads during which a new association is not visible at all.
    pub visibility_lag_reads: u32,
    /// Associate calls rejected with `DependencyViolation` before any succeeds.
    pub dependency_violations: u32,
    /// Attach calls to a freshly created role rejected with `NoSuchEntity`.
    pub role_propagation_calls: u32,
    /// Subnets whose associations end up `failed`.
    pub failing_subnets: BTreeSet<String>,
    pub page_size: usize,
    /// Existing associations: route table id to subnet ids.
    pub route_tables: BTreeMap<String, BTreeSet<String>>,
    /// Existing roles: role name to attached policy ARNs.
    pub roles: BTreeMap<String, BTreeSet<String>>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            transition_reads: 2,
            visibility_lag_reads: 1,
            dependency_violations: 0,
            role_propagation_calls: 2,
            failing_subnets: BTreeSet::new(),
            page_size: 100,
            route_tables: BTreeMap::new(),
            roles: BTreeMap::new(),
        }
    }
}

struct AssociationRecord {
    association: Association,
    reads_left: u32,
    hidden_reads: u32,
}

struct RoleRecord {
    role: Role,
    policies: BTreeSet<String>,
    propagation_left: u32,
}

#[derive(Default)]
struct Inner {
    associations: BTreeMap<String, AssociationRecord>,
    roles: BTreeMap<String, RoleRecord>,
    dependency_violations: u32,
    /// Mutating calls in order, for inspection.
    calls: Vec<String>,
}

impl Inner {
    fn live_association(&self, route_table_id: &str, subnet_id: &str) -> Option<&Association> {
        self.associations
            .values()
            .map(|r| &r.association)
            .find(|a| a.route_table_id == route_table_id && a.subnet_id == subnet_id && a.state.is_live())
    }

    fn insert_association(&mut self, route_table_id: &str, subnet_id: &str, state: AssociationState) -> String {
        let association_id = new_association_id();
        self.associations.insert(
            association_id.clone(),
            AssociationRecord {
                association: Association {
                    association_id: association_id.clone(),
                    route_table_id: route_table_id.to_string(),
                    subnet_id: subnet_id.to_string(),
                    state,
                    status_message: None,
                    created_at: Utc::now(),
                },
                reads_left: 0,
                hidden_reads: 0,
            },
        );
        association_id
    }

    fn insert_role(&mut self, name: &str, propagation_left: u32) -> Role {
        let role = Role {
            role_id: format!("AROA{}", Uuid::new_v4().simple().to_string()[..17].to_uppercase()),
            name: name.to_string(),
            arn: format!("arn:aws:iam::000000000000:role/{name}"),
            created_at: Utc::now(),
        };
        self.roles.insert(
            name.to_string(),
            RoleRecord {
                role: role.clone(),
                policies: BTreeSet::new(),
                propagation_left,
            },
        );
        role
    }
}

fn new_association_id() -> String {
    format!("rtbassoc-{}", &Uuid::new_v4().simple().to_string()[..17])
}

fn no_such_role(name: &str) -> Error {
    Error::api(codes::NO_SUCH_ENTITY, format!("role {name} cannot be found"))
}

fn paginate<T>(items: Vec<T>, next_token: Option<String>, page_size: usize) -> Result<Page<T>> {
    let start = match next_token {
        Some(token) => token
            .parse::<usize>()
            .ok()
            .filter(|offset| *offset <= items.len())
            .ok_or_else(|| Error::api(codes::INVALID_NEXT_TOKEN, format!("invalid token {token:?}")))?,
        None => 0,
    };
    let end = (start + page_size.max(1)).min(items.len());
    let next_token = (end < items.len()).then(|| end.to_string());
    let items = items.into_iter().skip(start).take(end - start).collect();
    Ok(Page { items, next_token })
}

/// Simulated control plane; state lives for the life of the value.
pub struct MemoryControlPlane {
    config: SimulationConfig,
    inner: Mutex<Inner>,
}

impl MemoryControlPlane {
    pub fn new(config: SimulationConfig) -> Self {
        let mut inner = Inner {
            dependency_violations: config.dependency_violations,
            ..Default::default()
        };
        for (route_table_id, subnets) in &config.route_tables {
            for subnet_id in subnets {
                inner.insert_association(route_table_id, subnet_id, AssociationState::Associated);
            }
        }
        for (name, policies) in &config.roles {
            inner.insert_role(name, 0);
            if let Some(record) = inner.roles.get_mut(name) {
                record.policies = policies.clone();
            }
        }
        Self {
            config,
            inner: Mutex::new(inner),
        }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Mutating calls received so far.
    pub async fn calls(&self) -> Vec<String> {
        self.inner.lock().await.calls.clone()
    }

    pub async fn clear_calls(&self) {
        self.inner.lock().await.calls.clear();
    }

    /// Associate a subnet behind the agent's back, already settled.
    pub async fn associate_out_of_band(&self, route_table_id: &str, subnet_id: &str) -> String {
        let mut inner = self.inner.lock().await;
        inner.insert_association(route_table_id, subnet_id, AssociationState::Associated)
    }

    /// Attach a policy behind the agent's back. Creates the role if needed.
    pub async fn attach_out_of_band(&self, role_name: &str, policy_arn: &str) {
        let mut inner = self.inner.lock().await;
        if !inner.roles.contains_key(role_name) {
            inner.insert_role(role_name, 0);
        }
        if let Some(record) = inner.roles.get_mut(role_name) {
            record.policies.insert(policy_arn.to_string());
        }
    }

    /// Subnets with a live association to the route table, ignoring lag.
    pub async fn live_subnets(&self, route_table_id: &str) -> BTreeSet<String> {
        let inner = self.inner.lock().await;
        inner
            .associations
            .values()
            .map(|r| &r.association)
            .filter(|a| a.route_table_id == route_table_id && a.state.is_live())
            .map(|a| a.subnet_id.clone())
            .collect()
    }

    /// Policies attached to a role, or `None` if the role does not exist.
    pub async fn attached_policies(&self, role_name: &str) -> Option<BTreeSet<String>> {
        let inner = self.inner.lock().await;
        inner.roles.get(role_name).map(|r| r.policies.clone())
    }
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn describe_association(&self, association_id: &str) -> Result<Association> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let not_found = || Error::not_found(format!("association {association_id}"));

        let Some(record) = inner.associations.get_mut(association_id) else {
            return Err(not_found());
        };
        if record.hidden_reads > 0 {
            record.hidden_reads -= 1;
            return Err(not_found());
        }
        if record.reads_left > 0 {
            record.reads_left -= 1;
            return Ok(record.association.clone());
        }

        let state = record.association.state;
        let failing = self.config.failing_subnets.contains(&record.association.subnet_id);
        match state {
            AssociationState::Associating if failing => {
                let association = &mut record.association;
                association.state = AssociationState::Failed;
                association.status_message = Some(format!(
                    "subnet {} cannot be associated with {}",
                    association.subnet_id, association.route_table_id
                ));
            }
            AssociationState::Associating => record.association.state = AssociationState::Associated,
            AssociationState::Disassociating => {
                inner.associations.remove(association_id);
                debug!(association_id, "Association removed");
                return Err(not_found());
            }
            AssociationState::Associated | AssociationState::Failed => {}
        }
        Ok(record.association.clone())
    }

    async fn list_associations(
        &self,
        route_table_id: &str,
        next_token: Option<String>,
    ) -> Result<Page<Association>> {
        let inner = self.inner.lock().await;
        let mut visible: Vec<Association> = inner
            .associations
            .values()
            .filter(|r| r.hidden_reads == 0 && r.association.route_table_id == route_table_id)
            .map(|r| r.association.clone())
            .collect();
        visible.sort_by(|a, b| a.subnet_id.cmp(&b.subnet_id));
        paginate(visible, next_token, self.config.page_size)
    }

    async fn associate(&self, route_table_id: &str, subnet_id: &str) -> Result<Association> {
        let mut inner = self.inner.lock().await;
        inner.calls.push(format!("associate:{route_table_id},{subnet_id}"));

        if inner.dependency_violations > 0 {
            inner.dependency_violations -= 1;
            return Err(Error::api(
                codes::DEPENDENCY_VIOLATION,
                format!("subnet {subnet_id} is not yet available"),
            ));
        }
        if let Some(existing) = inner.live_association(route_table_id, subnet_id) {
            return Err(Error::api(
                codes::ALREADY_ASSOCIATED,
                format!("{subnet_id} is already associated ({})", existing.association_id),
            ));
        }
        inner.associations.retain(|_, r| {
            !(r.association.route_table_id == route_table_id
                && r.association.subnet_id == subnet_id
                && r.association.state == AssociationState::Failed)
        });

        let association_id = inner.insert_association(route_table_id, subnet_id, AssociationState::Associating);
        let (transition_reads, hidden_reads) = (self.config.transition_reads, self.config.visibility_lag_reads);
        let record = inner
            .associations
            .get_mut(&association_id)
            .ok_or_else(|| Error::not_found(format!("association {association_id}")))?;
        record.reads_left = transition_reads;
        record.hidden_reads = hidden_reads;
        Ok(record.association.clone())
    }

    async fn disassociate(&self, association_id: &str) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        inner.calls.push(format!("disassociate:{association_id}"));

        let record = inner
            .associations
            .get_mut(association_id)
            .filter(|r| r.hidden_reads == 0)
            .ok_or_else(|| Error::not_found(format!("association {association_id}")))?;
        if record.association.state != AssociationState::Disassociating {
            record.association.state = AssociationState::Disassociating;
            record.reads_left = self.config.transition_reads;
        }
        Ok(())
    }

    async fn ensure_role(&self, role_name: &str) -> Result<(Role, bool)> {
        let mut inner = self.inner.lock().await;
        if let Some(record) = inner.roles.get(role_name) {
            return Ok((record.role.clone(), false));
        }
        inner.calls.push(format!("create_role:{role_name}"));
        let role = inner.insert_role(role_name, self.config.role_propagation_calls);
        Ok((role, true))
    }

    async fn attach_policy(&self, role_name: &str, policy_arn: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.calls.push(format!("attach:{role_name},{policy_arn}"));

        let record = inner.roles.get_mut(role_name).ok_or_else(|| no_such_role(role_name))?;
        if record.propagation_left > 0 {
            record.propagation_left -= 1;
            return Err(no_such_role(role_name));
        }
        record.policies.insert(policy_arn.to_string());
        Ok(())
    }

    async fn detach_policy(&self, role_name: &str, policy_arn: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.calls.push(format!("detach:{role_name},{policy_arn}"));

        let record = inner.roles.get_mut(role_name).ok_or_else(|| no_such_role(role_name))?;
        if !record.policies.remove(policy_arn) {
            return Err(Error::api(
                codes::NO_SUCH_ENTITY,
                format!("policy {policy_arn} is not attached to role {role_name}"),
            ));
        }
        Ok(())
    }

    async fn list_attached_policies(&self, role_name: &str, next_token: Option<String>) -> Result<Page<String>> {
        let inner = self.inner.lock().await;
        let record = inner.roles.get(role_name).ok_or_else(|| no_such_role(role_name))?;
        paginate(record.policies.iter().cloned().collect(), next_token, self.config.page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_plane(config: SimulationConfig) -> MemoryControlPlane {
        MemoryControlPlane::new(config)
    }

    #[tokio::test]
    async fn test_association_lifecycle() {
        let plane = make_plane(SimulationConfig {
            transition_reads: 1,
            visibility_lag_reads: 1,
            ..Default::default()
        });

        let created = plane.associate("rtb-1", "subnet-a").await.unwrap();
        assert_eq!(created.state, AssociationState::Associating);
        let id = created.association_id;

        assert!(plane.describe_association(&id).await.unwrap_err().is_not_found());
        assert_eq!(plane.describe_association(&id).await.unwrap().state, AssociationState::Associating);
        assert_eq!(plane.describe_association(&id).await.unwrap().state, AssociationState::Associated);

        plane.disassociate(&id).await.unwrap();
        assert_eq!(
            plane.describe_association(&id).await.unwrap().state,
            AssociationState::Disassociating
        );
        assert!(plane.describe_association(&id).await.unwrap_err().is_not_found());
        assert!(plane.live_subnets("rtb-1").await.is_empty());
    }

    #[tokio::test]
    async fn test_failing_subnet_reports_reason() {
        let plane = make_plane(SimulationConfig {
            transition_reads: 0,
            visibility_lag_reads: 0,
            failing_subnets: ["subnet-bad".to_string()].into(),
            ..Default::default()
        });

        let id = plane.associate("rtb-1", "subnet-bad").await.unwrap().association_id;
        let described = plane.describe_association(&id).await.unwrap();

        assert_eq!(described.state, AssociationState::Failed);
        assert!(described.status_message.unwrap().contains("subnet-bad"));
    }

    #[tokio::test]
    async fn test_duplicate_association_is_rejected() {
        let plane = make_plane(SimulationConfig::default());
        plane.associate("rtb-1", "subnet-a").await.unwrap();

        let err = plane.associate("rtb-1", "subnet-a").await.unwrap_err();
        assert_eq!(err.code(), Some(codes::ALREADY_ASSOCIATED));
    }

    #[tokio::test]
    async fn test_dependency_violations_then_success() {
        let plane = make_plane(SimulationConfig {
            dependency_violations: 1,
            ..Default::default()
        });

        let err = plane.associate("rtb-1", "subnet-a").await.unwrap_err();
        assert_eq!(err.code(), Some(codes::DEPENDENCY_VIOLATION));
        assert!(plane.associate("rtb-1", "subnet-a").await.is_ok());
    }

    #[tokio::test]
    async fn test_new_role_propagation() {
        let plane = make_plane(SimulationConfig {
            role_propagation_calls: 2,
            ..Default::default()
        });

        let (role, created) = plane.ensure_role("app").await.unwrap();
        assert!(created);
        assert_eq!(role.arn, "arn:aws:iam::000000000000:role/app");
        assert!(!plane.ensure_role("app").await.unwrap().1);

        for _ in 0..2 {
            let err = plane.attach_policy("app", "arn:aws:iam::aws:policy/ReadOnly").await.unwrap_err();
            assert_eq!(err.code(), Some(codes::NO_SUCH_ENTITY));
        }
        plane.attach_policy("app", "arn:aws:iam::aws:policy/ReadOnly").await.unwrap();
        assert_eq!(plane.attached_policies("app").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_listing_is_paginated() {
        let plane = make_plane(SimulationConfig {
            page_size: 2,
            route_tables: [(
                "rtb-1".to_string(),
                ["subnet-a", "subnet-b", "subnet-c"].iter().map(|s| s.to_string()).collect(),
            )]
            .into(),
            ..Default::default()
        });

        let first = plane.list_associations("rtb-1", None).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.next_token.as_deref(), Some("2"));

        let second = plane.list_associations("rtb-1", first.next_token).await.unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0].subnet_id, "subnet-c");
        assert!(second.next_token.is_none());

        let err = plane
            .list_associations("rtb-1", Some("bogus".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::INVALID_NEXT_TOKEN));
    }

    #[tokio::test]
    async fn test_detach_of_unattached_policy() {
        let plane = make_plane(SimulationConfig::default());
        plane.attach_out_of_band("app", "arn:p").await;

        plane.detach_policy("app", "arn:p").await.unwrap();
        let err = plane.detach_policy("app", "arn:p").await.unwrap_err();
        assert_eq!(err.code(), Some(codes::NO_SUCH_ENTITY));
        assert_eq!(plane.calls().await, vec!["detach:app,arn:p", "detach:app,arn:p"]);
    }
}
