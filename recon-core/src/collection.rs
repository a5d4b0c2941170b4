//! Per-item sub-collection synchronisation.
//!
//! Used for sub-collections the provider mutates one item per call (attached
//! addresses, VPC associations). All attaches run before any detach so the
//! collection never dips below a provider-enforced minimum size.

use std::fmt::Debug;
use std::hash::Hash;

use async_trait::async_trait;
use tracing::debug;

use crate::context::CallContext;
use crate::diff::diff;
use crate::error::{Error, Result};

/// Remote operations for one sub-collection of one resource.
#[async_trait]
pub trait SubCollection: Send + Sync {
    /// Sub-item as declared by the user.
    type Item: Clone + Debug + Send + Sync;
    /// Natural key used to compare items.
    type Key: Clone + Debug + Eq + Hash + Send + Sync;
    /// Aggregate field the provider returns after a mutation (e.g. a count).
    type Aggregate: Debug + Send;

    /// Short name for logging.
    fn name(&self) -> &'static str;

    fn key_of(&self, item: &Self::Item) -> Self::Key;

    async fn attach(&self, ctx: &CallContext, item: &Self::Item)
    -> Result<Option<Self::Aggregate>>;

    async fn detach(&self, ctx: &CallContext, key: &Self::Key) -> Result<Option<Self::Aggregate>>;
}

/// What a sync call managed to apply before finishing or failing.
#[derive(Debug)]
pub struct SyncProgress<T, K, A> {
    pub attached: Vec<T>,
    pub detached: Vec<K>,
    /// Latest aggregate value reported by the provider, if any call succeeded.
    pub aggregate: Option<A>,
    /// First failure; nothing after it was attempted.
    pub error: Option<Error>,
}

/// Progress type for a given [`SubCollection`].
pub type Progress<S> = SyncProgress<
    <S as SubCollection>::Item,
    <S as SubCollection>::Key,
    <S as SubCollection>::Aggregate,
>;

impl<T, K, A> SyncProgress<T, K, A> {
    fn new() -> Self {
        Self {
            attached: Vec::new(),
            detached: Vec::new(),
            aggregate: None,
            error: None,
        }
    }

    /// True if at least one remote mutation succeeded.
    pub fn changed(&self) -> bool {
        !self.attached.is_empty() || !self.detached.is_empty()
    }

    /// Apply the successful mutations to an observed collection.
    pub fn merge_into<F>(&self, observed: &[T], key_of: F) -> Vec<T>
    where
        T: Clone,
        K: PartialEq,
        F: Fn(&T) -> K,
    {
        observed
            .iter()
            .filter(|item| !self.detached.contains(&key_of(*item)))
            .chain(self.attached.iter())
            .cloned()
            .collect()
    }
}

/// Diff `desired` against `observed` by natural key and apply the result one
/// item at a time: every attach first, then every detach, stopping at the
/// first error.
pub async fn sync_collection<S>(
    ctx: &CallContext,
    syncer: &S,
    desired: &[S::Item],
    observed: &[S::Item],
) -> Progress<S>
where
    S: SubCollection + ?Sized,
{
    let plan = diff(desired, observed, |item| syncer.key_of(item));
    let mut progress = SyncProgress::new();

    if plan.is_empty() {
        return progress;
    }
    debug!(
        collection = syncer.name(),
        added = plan.added.len(),
        removed = plan.removed.len(),
        "Syncing sub-collection"
    );

    for item in plan.added {
        match syncer.attach(ctx, &item).await {
            Ok(aggregate) => {
                if aggregate.is_some() {
                    progress.aggregate = aggregate;
                }
                progress.attached.push(item);
            }
            Err(e) => {
                progress.error = Some(e);
                return progress;
            }
        }
    }

    for key in plan.removed {
        match syncer.detach(ctx, &key).await {
            Ok(aggregate) => {
                if aggregate.is_some() {
                    progress.aggregate = aggregate;
                }
                progress.detached.push(key);
            }
            Err(e) => {
                progress.error = Some(e);
                return progress;
            }
        }
    }

    progress
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Membership list where the provider reports the new size after each call.
    struct Members {
        log: Mutex<Vec<String>>,
        size: Mutex<u32>,
        fail_on: Option<String>,
    }

    impl Members {
        fn new(size: u32) -> Self {
            Self {
                log: Mutex::new(Vec::new()),
                size: Mutex::new(size),
                fail_on: None,
            }
        }

        fn failing_on(mut self, op: &str) -> Self {
            self.fail_on = Some(op.to_string());
            self
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SubCollection for Members {
        type Item = String;
        type Key = String;
        type Aggregate = u32;

        fn name(&self) -> &'static str {
            "members"
        }

        fn key_of(&self, item: &String) -> String {
            item.clone()
        }

        async fn attach(&self, _ctx: &CallContext, item: &String) -> Result<Option<u32>> {
            let op = format!("attach:{item}");
            self.log.lock().unwrap().push(op.clone());
            if self.fail_on.as_deref() == Some(op.as_str()) {
                return Err(Error::provider("LimitExceededException", "too many"));
            }
            let mut size = self.size.lock().unwrap();
            *size += 1;
            Ok(Some(*size))
        }

        async fn detach(&self, _ctx: &CallContext, key: &String) -> Result<Option<u32>> {
            let op = format!("detach:{key}");
            self.log.lock().unwrap().push(op.clone());
            if self.fail_on.as_deref() == Some(op.as_str()) {
                return Err(Error::provider("InvalidRequestException", "minimum"));
            }
            let mut size = self.size.lock().unwrap();
            *size -= 1;
            Ok(Some(*size))
        }
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_attaches_precede_detaches() {
        let members = Members::new(2);
        let ctx = CallContext::new();

        let progress = sync_collection(
            &ctx,
            &members,
            &strings(&["s2", "s3", "s4"]),
            &strings(&["s1", "s2"]),
        )
        .await;

        assert!(progress.error.is_none());
        assert_eq!(members.log(), strings(&["attach:s3", "attach:s4", "detach:s1"]));
        assert_eq!(progress.aggregate, Some(3));
    }

    #[tokio::test]
    async fn test_only_additions() {
        let members = Members::new(2);
        let ctx = CallContext::new();

        let progress = sync_collection(
            &ctx,
            &members,
            &strings(&["s1", "s2", "s3"]),
            &strings(&["s1", "s2"]),
        )
        .await;

        assert_eq!(members.log(), strings(&["attach:s3"]));
        assert_eq!(progress.attached, strings(&["s3"]));
        assert!(progress.detached.is_empty());
    }

    #[tokio::test]
    async fn test_stops_on_first_error_and_keeps_progress() {
        let members = Members::new(2).failing_on("attach:s4");
        let ctx = CallContext::new();

        let progress = sync_collection(
            &ctx,
            &members,
            &strings(&["s3", "s4"]),
            &strings(&["s1", "s2"]),
        )
        .await;

        assert_eq!(members.log(), strings(&["attach:s3", "attach:s4"]));
        assert_eq!(progress.attached, strings(&["s3"]));
        assert_eq!(progress.aggregate, Some(3));
        assert!(progress.error.is_some());
        assert!(progress.changed());
    }

    #[tokio::test]
    async fn test_no_calls_when_converged() {
        let members = Members::new(2);
        let ctx = CallContext::new();
        let items = strings(&["s1", "s2"]);

        let progress = sync_collection(&ctx, &members, &items, &items).await;

        assert!(members.log().is_empty());
        assert!(!progress.changed());
        assert!(progress.aggregate.is_none());
    }

    #[test]
    fn test_merge_into() {
        let progress: SyncProgress<String, String, u32> = SyncProgress {
            attached: strings(&["s3"]),
            detached: strings(&["s1"]),
            aggregate: None,
            error: None,
        };
        let merged = progress.merge_into(&strings(&["s1", "s2"]), |s| s.clone());
        assert_eq!(merged, strings(&["s2", "s3"]));
    }
}
