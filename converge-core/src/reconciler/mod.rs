//! Exclusive reconciliation of child collections.
//!
//! A parent resource owns a remote collection of children (subnets
//! associated with a route table, policies attached to a role). The
//! reconciler makes that collection equal the declared set exactly, removing
//! anything added out of band.

mod exclusive;

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use exclusive::{ExclusiveSetReconciler, ReconcileConfig};

/// Set of child identifiers.
pub type ChildSet = BTreeSet<String>;

/// Remote collection of children belonging to a parent.
#[async_trait]
pub trait ChildCollection: Send + Sync {
    /// Complete current membership; implementations exhaust pagination.
    async fn list(&self, parent_id: &str) -> Result<ChildSet>;

    /// Add a child. "Already exists" must be reported as success.
    async fn add(&self, parent_id: &str, child_id: &str) -> Result<()>;

    /// Remove a child. An already-absent child is success, either `Ok` or
    /// `Error::NotFound`.
    async fn remove(&self, parent_id: &str, child_id: &str) -> Result<()>;
}

/// Changes needed to turn the actual set into the desired one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    pub additions: ChildSet,
    pub removals: ChildSet,
}

impl Diff {
    pub fn compute(desired: &ChildSet, actual: &ChildSet) -> Self {
        Self {
            additions: desired.difference(actual).cloned().collect(),
            removals: actual.difference(desired).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.additions.len() + self.removals.len()
    }
}
