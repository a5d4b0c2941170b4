//! Convergence executor.
//!
//! One call to [`Reconciler::reconcile`] is one convergence pass:
//!
//! 1. observe the remote resource
//! 2. absent → create (with a request token), then sync post-create
//!    sub-collections
//! 3. present → compute the [`Delta`]; if non-empty sync tags, then
//!    sub-collections, then issue the primary update when scalar fields
//!    differ
//! 4. fold the result into the condition list and pick an [`Outcome`]
//!
//! The first failing step ends the pass. Steps that already succeeded are not
//! rolled back; the next pass re-diffs from the returned observed snapshot.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::condition::Conditions;
use crate::context::CallContext;
use crate::delta::Delta;
use crate::error::{Error, Result, Severity};
use crate::outcome::Outcome;
use crate::token::RequestToken;

/// Delta path of the tag set, shared by every resource kind.
pub const TAGS_PATH: &str = "spec.tags";

/// Which groups of remote mutations a pass performed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Changes {
    pub created: bool,
    pub tags: bool,
    pub collections: bool,
    pub primary: bool,
}

impl Changes {
    pub fn any(&self) -> bool {
        self.created || self.tags || self.collections || self.primary
    }
}

/// Result of a step that may have partially applied before failing.
#[derive(Debug)]
pub struct Applied<O> {
    /// Observed snapshot including everything that succeeded.
    pub observed: O,
    /// True if at least one remote mutation succeeded.
    pub changed: bool,
    pub error: Option<Error>,
}

impl<O> Applied<O> {
    pub fn ok(observed: O, changed: bool) -> Self {
        Self {
            observed,
            changed,
            error: None,
        }
    }

    pub fn failed(observed: O, changed: bool, error: Error) -> Self {
        Self {
            observed,
            changed,
            error: Some(error),
        }
    }
}

/// Per-kind behaviour plugged into the [`Reconciler`].
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// User intent. Never mutated by the engine.
    type Desired: Clone + Debug + Send + Sync;
    /// Remote-authoritative snapshot.
    type Observed: Clone + Debug + Send + Sync;

    /// Kind name for logs, e.g. `ResolverEndpoint`.
    fn kind(&self) -> &'static str;

    fn name<'a>(&self, desired: &'a Self::Desired) -> &'a str;

    /// Creation timestamp of the desired object, used to derive a request
    /// token that is stable across passes.
    fn created_at(&self, _desired: &Self::Desired) -> Option<DateTime<Utc>> {
        None
    }

    /// Provider error codes that are never worth retrying.
    fn terminal_codes(&self) -> &'static [&'static str] {
        &[]
    }

    /// Delta paths of the sub-collections handled by
    /// [`sync_collections`](Self::sync_collections).
    fn collection_paths(&self) -> &'static [&'static str] {
        &[]
    }

    /// Read the remote resource. `Ok(None)` means it does not exist yet.
    async fn observe(
        &self,
        ctx: &CallContext,
        desired: &Self::Desired,
        last: Option<&Self::Observed>,
    ) -> Result<Option<Self::Observed>>;

    async fn create(
        &self,
        ctx: &CallContext,
        desired: &Self::Desired,
        token: &RequestToken,
    ) -> Result<Self::Observed>;

    /// Sync sub-collections the create call cannot set.
    async fn after_create(
        &self,
        _ctx: &CallContext,
        _desired: &Self::Desired,
        created: Self::Observed,
    ) -> Applied<Self::Observed> {
        Applied::ok(created, false)
    }

    /// Reject desired changes the provider can never apply.
    fn check_immutable(&self, _desired: &Self::Desired, _observed: &Self::Observed) -> Result<()> {
        Ok(())
    }

    fn delta(&self, desired: &Self::Desired, observed: &Self::Observed) -> Delta;

    /// Bring the tag set to the desired one. Returns the updated snapshot.
    async fn sync_tags(
        &self,
        ctx: &CallContext,
        desired: &Self::Desired,
        observed: &Self::Observed,
    ) -> Result<Self::Observed>;

    /// Bring every sub-collection to the desired one.
    async fn sync_collections(
        &self,
        _ctx: &CallContext,
        _desired: &Self::Desired,
        observed: Self::Observed,
        _delta: &Delta,
    ) -> Applied<Self::Observed> {
        Applied::ok(observed, false)
    }

    /// Patch the primary record's scalar fields.
    async fn update(
        &self,
        ctx: &CallContext,
        desired: &Self::Desired,
        observed: &Self::Observed,
        delta: &Delta,
    ) -> Result<Self::Observed>;

    async fn delete(&self, ctx: &CallContext, observed: &Self::Observed) -> Result<()>;

    /// True if the mutations of this pass must be re-read before the
    /// resource counts as synced.
    fn needs_refresh(&self, _changes: &Changes) -> bool {
        false
    }

    /// True once the provider-side lifecycle status is stable.
    fn settled(&self, _observed: &Self::Observed) -> bool {
        true
    }
}

/// Tunables for the executor.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Requeue delay after a pass that must re-read canonical state.
    pub refresh_delay: Duration,
    /// Requeue delay while the provider reports a transitional status.
    pub settle_delay: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            refresh_delay: Duration::from_secs(5),
            settle_delay: Duration::from_secs(15),
        }
    }
}

/// What one pass hands back to the scheduler.
#[derive(Debug, Clone)]
pub struct Reconciled<O> {
    /// New baseline. `None` only if the resource was never created.
    pub observed: Option<O>,
    pub conditions: Conditions,
    pub outcome: Outcome,
    pub changes: Changes,
}

struct Pass<O> {
    observed: Option<O>,
    changes: Changes,
    error: Option<Error>,
}

impl<O> Pass<O> {
    fn failed(observed: Option<O>, changes: Changes, error: Error) -> Self {
        Self {
            observed,
            changes,
            error: Some(error),
        }
    }
}

/// Runs convergence passes for one resource kind.
pub struct Reconciler<M> {
    manager: M,
    config: ReconcilerConfig,
}

impl<M: ResourceManager> Reconciler<M> {
    pub fn new(manager: M) -> Self {
        Self::with_config(manager, ReconcilerConfig::default())
    }

    pub fn with_config(manager: M, config: ReconcilerConfig) -> Self {
        Self { manager, config }
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Run one convergence pass.
    pub async fn reconcile(
        &self,
        ctx: &CallContext,
        desired: &M::Desired,
        last: Option<&M::Observed>,
        conditions: &Conditions,
    ) -> Reconciled<M::Observed> {
        let kind = self.manager.kind();
        let name = self.manager.name(desired);
        info!(kind, name, pass = ctx.pass_id(), "Reconciling");

        // Generated once so every create attempt in this pass shares it.
        let token = RequestToken::for_resource(name, self.manager.created_at(desired));

        let pass = self.run(ctx, desired, last, &token).await;
        self.conclude(name, pass, conditions)
    }

    /// Delete the remote resource. A resource that is already gone, or was
    /// never created, is not an error.
    pub async fn finalize(&self, ctx: &CallContext, observed: Option<&M::Observed>) -> Result<()> {
        let Some(observed) = observed else {
            return Ok(());
        };
        info!(kind = self.manager.kind(), "Finalizing");
        match self.manager.delete(ctx, observed).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn run(
        &self,
        ctx: &CallContext,
        desired: &M::Desired,
        last: Option<&M::Observed>,
        token: &RequestToken,
    ) -> Pass<M::Observed> {
        let observed = match self.manager.observe(ctx, desired, last).await {
            Ok(Some(observed)) => observed,
            Ok(None) => return self.create(ctx, desired, last, token).await,
            Err(e) => return Pass::failed(last.cloned(), Changes::default(), e),
        };

        if let Err(e) = self.manager.check_immutable(desired, &observed) {
            return Pass::failed(Some(observed), Changes::default(), e);
        }

        let delta = self.manager.delta(desired, &observed);
        if delta.is_empty() {
            debug!(kind = self.manager.kind(), "No changes");
            return Pass {
                observed: Some(observed),
                changes: Changes::default(),
                error: None,
            };
        }
        debug!(kind = self.manager.kind(), paths = ?delta.paths(), "Delta");

        self.update(ctx, desired, observed, &delta).await
    }

    async fn create(
        &self,
        ctx: &CallContext,
        desired: &M::Desired,
        last: Option<&M::Observed>,
        token: &RequestToken,
    ) -> Pass<M::Observed> {
        info!(kind = self.manager.kind(), token = %token, "Creating");
        let created = match self.manager.create(ctx, desired, token).await {
            Ok(created) => created,
            Err(e) => return Pass::failed(last.cloned(), Changes::default(), e),
        };

        let applied = self.manager.after_create(ctx, desired, created).await;
        Pass {
            observed: Some(applied.observed),
            changes: Changes {
                created: true,
                collections: applied.changed,
                ..Changes::default()
            },
            error: applied.error,
        }
    }

    async fn update(
        &self,
        ctx: &CallContext,
        desired: &M::Desired,
        mut observed: M::Observed,
        delta: &Delta,
    ) -> Pass<M::Observed> {
        let mut changes = Changes::default();

        if delta.different_at(TAGS_PATH) {
            match self.manager.sync_tags(ctx, desired, &observed).await {
                Ok(updated) => {
                    observed = updated;
                    changes.tags = true;
                }
                Err(e) => return Pass::failed(Some(observed), changes, e),
            }
        }

        let collection_paths = self.manager.collection_paths();
        if collection_paths.iter().any(|p| delta.different_at(p)) {
            let applied = self
                .manager
                .sync_collections(ctx, desired, observed, delta)
                .await;
            observed = applied.observed;
            changes.collections = applied.changed;
            if let Some(e) = applied.error {
                return Pass::failed(Some(observed), changes, e);
            }
        }

        let mut handled = vec![TAGS_PATH];
        handled.extend_from_slice(collection_paths);
        if delta.different_except(&handled) {
            match self.manager.update(ctx, desired, &observed, delta).await {
                Ok(updated) => {
                    observed = updated;
                    changes.primary = true;
                }
                Err(e) => return Pass::failed(Some(observed), changes, e),
            }
        }

        Pass {
            observed: Some(observed),
            changes,
            error: None,
        }
    }

    fn conclude(
        &self,
        name: &str,
        pass: Pass<M::Observed>,
        prior: &Conditions,
    ) -> Reconciled<M::Observed> {
        let kind = self.manager.kind();
        let mut conditions = prior.clone();

        let outcome = match &pass.error {
            Some(err) => {
                let severity = err.severity(self.manager.terminal_codes());
                conditions.track(Some((err, severity)), false, Some(err.to_string()));
                match severity {
                    Severity::Terminal => {
                        error!(kind, name, error = %err, "Reconcile failed (terminal)");
                        Outcome::Fatal {
                            reason: err.to_string(),
                        }
                    }
                    Severity::Recoverable => {
                        warn!(kind, name, error = %err, "Reconcile failed, will retry");
                        Outcome::retry(err.to_string())
                    }
                }
            }
            None => self.settle(&pass, &mut conditions),
        };

        if outcome.is_converged() {
            info!(kind, name, changed = pass.changes.any(), "Converged");
        }

        Reconciled {
            observed: pass.observed,
            conditions,
            outcome,
            changes: pass.changes,
        }
    }

    fn settle(&self, pass: &Pass<M::Observed>, conditions: &mut Conditions) -> Outcome {
        if self.manager.needs_refresh(&pass.changes) {
            let reason = "requeued to refresh resource status".to_string();
            conditions.track(None, false, Some(reason.clone()));
            return Outcome::retry_after(self.config.refresh_delay, reason);
        }

        let settled = pass
            .observed
            .as_ref()
            .is_some_and(|o| self.manager.settled(o));
        if !settled {
            let reason = "waiting for resource to settle".to_string();
            conditions.track(None, false, Some(reason.clone()));
            return Outcome::retry_after(self.config.settle_delay, reason);
        }

        conditions.track(None, true, None);
        Outcome::Converged
    }
}
