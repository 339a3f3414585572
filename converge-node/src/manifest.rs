//! Declared desired state.
//!
//! A manifest is a revisioned JSON document listing, per resource kind, the
//! parents the agent owns and the exact children each must have:
//!
//! ```json
//! {
//!   "revision": 3,
//!   "resources": [
//!     { "kind": "subnet_association", "parent": "rtb-1", "children": ["subnet-a"] },
//!     { "kind": "policy_attachment", "parent": "app", "children": [] }
//!   ]
//! }
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use converge_core::{ChildSet, CompositeIdCodec};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reconciler::ResourceKind;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{kind} entry has an empty parent id")]
    EmptyParent { kind: ResourceKind },

    #[error("{kind} {parent} is declared more than once")]
    Duplicate { kind: ResourceKind, parent: String },

    #[error("{kind} {parent}: {source}")]
    InvalidId {
        kind: ResourceKind,
        parent: String,
        #[source]
        source: converge_core::Error,
    },
}

/// Desired state for every managed parent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub revision: u64,
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
}

/// One parent and the exact set of children it must have.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub kind: ResourceKind,
    pub parent: String,
    #[serde(default)]
    pub children: ChildSet,
}

impl Manifest {
    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest = serde_json::from_str(json)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub async fn load(path: &Path) -> Result<Self, ManifestError> {
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ManifestError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_json(&json)
    }

    /// Every parent is declared once and every parent/child pair forms a
    /// valid composite id.
    pub fn validate(&self) -> Result<(), ManifestError> {
        let codec = CompositeIdCodec::default();
        let mut seen = BTreeSet::new();

        for spec in &self.resources {
            if spec.parent.is_empty() {
                return Err(ManifestError::EmptyParent { kind: spec.kind });
            }
            if !seen.insert((spec.kind, spec.parent.as_str())) {
                return Err(ManifestError::Duplicate {
                    kind: spec.kind,
                    parent: spec.parent.clone(),
                });
            }
            for child in &spec.children {
                codec
                    .encode(&[spec.parent.as_str(), child.as_str()])
                    .map_err(|source| ManifestError::InvalidId {
                        kind: spec.kind,
                        parent: spec.parent.clone(),
                        source,
                    })?;
            }
        }
        Ok(())
    }

    /// Entries of one kind, in declaration order.
    pub fn entries(&self, kind: ResourceKind) -> impl Iterator<Item = &ResourceSpec> {
        self.resources.iter().filter(move |spec| spec.kind == kind)
    }
}
