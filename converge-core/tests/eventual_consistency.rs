//! End-to-end tests of the reconciler driving waits and retries against an
//! eventually consistent collection.
//!
//! Run with: cargo test -p converge-core --test eventual_consistency

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use converge_core::{
    ChildCollection, ChildSet, Error, ExclusiveSetReconciler, NotFoundPolicy, ObservedState,
    ReconcileConfig, Result, RetryPolicy, StateWaiter, WaitSpec,
};

const POLL: Duration = Duration::from_millis(5);

/// Lifecycle of one association in the fake control plane.
#[derive(Debug, Clone)]
struct Association {
    state: &'static str,
    /// Reads remaining before the next transition.
    reads_left: u32,
    /// Reads remaining during which the object is invisible.
    hidden_reads: u32,
}

/// A control plane whose writes take several reads to become visible.
struct LaggyCollection {
    associations: Mutex<BTreeMap<String, Association>>,
    transition_reads: u32,
    hidden_reads: u32,
    /// Initial associate calls rejected with DependencyViolation.
    rejections: Mutex<u32>,
    /// Never leave `associating`.
    stuck: bool,
}

impl LaggyCollection {
    fn new(transition_reads: u32, hidden_reads: u32) -> Self {
        Self {
            associations: Mutex::new(BTreeMap::new()),
            transition_reads,
            hidden_reads,
            rejections: Mutex::new(0),
            stuck: false,
        }
    }

    fn seed(&self, child: &str) {
        self.associations.lock().unwrap().insert(
            child.to_string(),
            Association {
                state: "associated",
                reads_left: 0,
                hidden_reads: 0,
            },
        );
    }

    fn describe(&self, child: &str) -> Result<ObservedState<Association>> {
        let mut associations = self.associations.lock().unwrap();
        let Some(assoc) = associations.get_mut(child) else {
            return Err(Error::not_found(child));
        };

        if assoc.hidden_reads > 0 {
            assoc.hidden_reads -= 1;
            return Ok(ObservedState::absent());
        }

        if assoc.reads_left > 0 {
            assoc.reads_left -= 1;
        } else if !self.stuck {
            match assoc.state {
                "associating" => assoc.state = "associated",
                "disassociating" => {
                    associations.remove(child);
                    return Ok(ObservedState::absent());
                }
                _ => {}
            }
        }

        Ok(ObservedState::present(assoc.state, assoc.clone()))
    }

    fn create_spec(&self) -> WaitSpec {
        WaitSpec::new(Duration::from_secs(5), NotFoundPolicy::Tolerate(self.hidden_reads))
            .pending(["associating"])
            .target(["associated"])
            .poll_interval(POLL)
    }

    fn delete_spec(&self) -> WaitSpec {
        WaitSpec::new(Duration::from_secs(5), NotFoundPolicy::Target)
            .pending(["disassociating"])
            .poll_interval(POLL)
    }
}

#[async_trait]
impl ChildCollection for LaggyCollection {
    async fn list(&self, _parent_id: &str) -> Result<ChildSet> {
        Ok(self
            .associations
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, a)| a.state != "disassociating")
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn add(&self, _parent_id: &str, child_id: &str) -> Result<()> {
        {
            let mut rejections = self.rejections.lock().unwrap();
            if *rejections > 0 {
                *rejections -= 1;
                return Err(Error::api("DependencyViolation", "subnet not yet visible"));
            }
        }
        self.associations.lock().unwrap().insert(
            child_id.to_string(),
            Association {
                state: "associating",
                reads_left: self.transition_reads,
                hidden_reads: self.hidden_reads,
            },
        );

        StateWaiter::new(self.create_spec())?
            .wait_for(|| std::future::ready(self.describe(child_id)))
            .await?;
        Ok(())
    }

    async fn remove(&self, _parent_id: &str, child_id: &str) -> Result<()> {
        {
            let mut associations = self.associations.lock().unwrap();
            match associations.get_mut(child_id) {
                Some(assoc) => {
                    assoc.state = "disassociating";
                    assoc.reads_left = self.transition_reads;
                }
                None => return Err(Error::not_found(child_id)),
            }
        }

        StateWaiter::new(self.delete_spec())?
            .wait_for(|| std::future::ready(self.describe(child_id)))
            .await?;
        Ok(())
    }
}

fn set(items: &[&str]) -> ChildSet {
    items.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_converges_through_visibility_lag() {
    let collection = LaggyCollection::new(2, 2);
    collection.seed("subnet-old");
    let reconciler = ExclusiveSetReconciler::default();

    let applied = reconciler
        .apply("rtb-1", &set(&["subnet-a", "subnet-b"]), &collection)
        .await
        .unwrap();

    assert_eq!(applied, set(&["subnet-a", "subnet-b"]));

    // Nothing left to do on the next pass.
    let diff = reconciler
        .plan("rtb-1", &set(&["subnet-a", "subnet-b"]), &collection)
        .await
        .unwrap();
    assert!(diff.is_empty());
}

#[tokio::test]
async fn test_dependency_violation_is_retried() {
    let collection = LaggyCollection::new(0, 0);
    *collection.rejections.lock().unwrap() = 2;
    let reconciler = ExclusiveSetReconciler::new(ReconcileConfig {
        add_policy: RetryPolicy::new(Duration::from_secs(5))
            .retry_on_codes(["DependencyViolation"])
            .with_poll_interval(POLL),
        ..ReconcileConfig::default()
    });

    let applied = reconciler
        .apply("rtb-1", &set(&["subnet-a"]), &collection)
        .await
        .unwrap();
    assert_eq!(applied, set(&["subnet-a"]));
}

#[tokio::test]
async fn test_dependency_violation_without_policy_fails_fast() {
    let collection = LaggyCollection::new(0, 0);
    *collection.rejections.lock().unwrap() = 1;
    let reconciler = ExclusiveSetReconciler::default();

    let err = reconciler
        .apply("rtb-1", &set(&["subnet-a"]), &collection)
        .await
        .unwrap_err();
    assert_eq!(err.error.code(), Some("DependencyViolation"));
    assert!(err.last.is_empty());
}

#[tokio::test]
async fn test_apply_deadline_reports_partial_state() {
    let mut collection = LaggyCollection::new(0, 0);
    collection.stuck = true;
    collection.seed("subnet-old");
    let reconciler = ExclusiveSetReconciler::new(ReconcileConfig {
        timeout: Duration::from_millis(150),
        ..ReconcileConfig::default()
    });
    let started = std::time::Instant::now();

    let err = reconciler
        .apply("rtb-1", &set(&["subnet-a"]), &collection)
        .await
        .unwrap_err();

    assert!(err.error.is_timeout(), "unexpected error: {}", err.error);
    assert!(started.elapsed() < Duration::from_secs(2));
    // The stuck disassociation never completed, so the old child is still counted.
    assert_eq!(err.last, set(&["subnet-old"]));
}

#[tokio::test]
async fn test_apply_deadline_keeps_the_retried_error() {
    let collection = LaggyCollection::new(0, 0);
    *collection.rejections.lock().unwrap() = u32::MAX;
    let reconciler = ExclusiveSetReconciler::new(ReconcileConfig {
        timeout: Duration::from_millis(100),
        add_policy: RetryPolicy::new(Duration::from_secs(60))
            .retry_on_codes(["DependencyViolation"])
            .with_poll_interval(POLL),
        ..ReconcileConfig::default()
    });

    let err = reconciler
        .apply("rtb-1", &set(&["subnet-a"]), &collection)
        .await
        .unwrap_err();

    assert!(err.error.is_timeout(), "unexpected error: {}", err.error);
    assert_eq!(
        err.error.last_error().and_then(Error::code),
        Some("DependencyViolation")
    );
    assert!(err.last.is_empty());
}
