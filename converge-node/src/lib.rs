//! converge-node: agent that keeps declared child collections converged.
//!
//! The agent reads a revisioned manifest of parents (route tables, roles) and
//! the exact children each must have, and drives the control plane until the
//! remote collections match:
//! - Creates and removes subnet associations, waiting out eventual consistency
//! - Attaches and detaches role policies, retrying while new roles propagate
//! - Prunes parents that disappear from the manifest
//! - Reports a per-entry status after every pass

pub mod agent;
pub mod clients;
pub mod manifest;
pub mod reconciler;

pub use agent::{ImportError, ManifestStatus, NodeAgent, PlannedChange};
pub use clients::{ControlPlane, MemoryControlPlane, SimulationConfig};
pub use manifest::{Manifest, ManifestError, ResourceSpec};
pub use reconciler::{EntryStatus, Phase, ReconcileSettings, ResourceKind};
