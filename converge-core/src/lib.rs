//! converge-core - asynchronous state reconciliation against eventually
//! consistent control planes.
//!
//! ## Components
//!
//! - **Composite identifiers** ([`id`]): reversible multi-part resource ids
//! - **Retries** ([`retry`]): run remote calls until success, a permanent
//!   error, or a deadline
//! - **State waiter** ([`waiter`]): poll a remote object until it reaches a
//!   target state
//! - **Exclusive-set reconciler** ([`reconciler`]): make a remote child
//!   collection equal a declared set and detect out-of-band drift
//!
//! # Example
//! ```ignore
//! use converge_core::{NotFoundPolicy, StateWaiter, WaitSpec};
//!
//! let spec = WaitSpec::new(Duration::from_secs(300), NotFoundPolicy::Tolerate(20))
//!     .pending(["associating"])
//!     .target(["associated"]);
//! let association = StateWaiter::new(spec)?
//!     .wait_for(|| client.describe_association(&id))
//!     .await?;
//! ```

pub mod error;
pub mod find;
pub mod id;
pub mod reconciler;
pub mod retry;
pub mod waiter;

pub use error::{ApiError, Error, Interrupted, Result};
pub use id::{CompositeId, CompositeIdCodec};
pub use reconciler::{ChildCollection, ChildSet, Diff, ExclusiveSetReconciler, ReconcileConfig};
pub use retry::{Backoff, RetryExecutor, RetryPolicy};
pub use waiter::{NotFoundPolicy, ObservedState, StateWaiter, WaitResult, WaitSpec, WaitState};
pub use tokio_util::sync::CancellationToken;
