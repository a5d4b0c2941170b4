//! Agent: drives every resource in the manifest toward its desired state.
//!
//! Each resource identity gets one long-lived task that runs convergence
//! passes strictly one after another. A semaphore caps how many passes are in
//! flight across identities. After every pass the task stores the returned
//! observed snapshot and conditions in the [`StatusTable`] and feeds them
//! into the next pass.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recon_core::{
    CallContext, Conditions, ConditionType, Error, Outcome, Reconciled, Reconciler,
    ReconcilerConfig, ResourceManager, Severity,
};
use serde::Serialize;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::clients::ResolverApi;
use crate::manifest::Manifest;
use crate::model::{Endpoint, EndpointSpec, Rule, RuleSpec};
use crate::reconciler::{EndpointManager, RuleManager};

/// Scheduling knobs.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Passes in flight at once, across all resources.
    pub workers: usize,
    /// Delay before re-checking a converged resource.
    pub resync_interval: Duration,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Deadline for one pass.
    pub call_timeout: Option<Duration>,
    /// Stop each resource once it converges instead of resyncing.
    pub once: bool,
    /// Delay before re-reading a resource whose change the provider applies
    /// asynchronously.
    pub refresh_delay: Duration,
    /// Delay between checks while a resource is in a transitional status.
    pub settle_delay: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_interval: Duration::from_secs(60),
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            call_timeout: Some(Duration::from_secs(30)),
            once: false,
            refresh_delay: Duration::from_secs(5),
            settle_delay: Duration::from_secs(15),
        }
    }
}

impl AgentConfig {
    fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            refresh_delay: self.refresh_delay,
            settle_delay: self.settle_delay,
        }
    }
}

/// Exponential backoff between failed passes.
#[derive(Debug, Clone)]
struct Backoff {
    min: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            current: None,
        }
    }

    fn next(&mut self) -> Duration {
        let next = match self.current {
            None => self.min,
            Some(d) => d.saturating_mul(2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

// =============================================================================
// Status table
// =============================================================================

/// Persisted state of one resource between passes.
#[derive(Debug, Clone)]
pub struct Entry<O> {
    /// Baseline for the next pass.
    pub observed: Option<O>,
    pub conditions: Conditions,
    pub outcome: Option<Outcome>,
    pub passes: u64,
    pub last_pass: Option<DateTime<Utc>>,
}

impl<O> Default for Entry<O> {
    fn default() -> Self {
        Self {
            observed: None,
            conditions: Conditions::new(),
            outcome: None,
            passes: 0,
            last_pass: None,
        }
    }
}

impl<O> Entry<O> {
    fn record(&mut self, result: Reconciled<O>) {
        // A failed create leaves nothing to observe; keep what we had.
        if result.observed.is_some() {
            self.observed = result.observed;
        }
        self.conditions = result.conditions;
        self.outcome = Some(result.outcome);
        self.passes += 1;
        self.last_pass = Some(Utc::now());
    }
}

type Table<O> = Arc<RwLock<BTreeMap<String, Entry<O>>>>;

/// One line of [`StatusTable::summary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub kind: &'static str,
    pub name: String,
    pub id: Option<String>,
    /// `Converged`, `Retry` or `Fatal`; `None` before the first pass.
    pub outcome: Option<String>,
    pub synced: bool,
    pub message: Option<String>,
    pub passes: u64,
}

fn outcome_label(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Converged => "Converged",
        Outcome::Retry { .. } => "Retry",
        Outcome::Fatal { .. } => "Fatal",
    }
    .to_string()
}

fn summarize<O>(kind: &'static str, name: &str, entry: &Entry<O>, id: Option<&str>) -> Summary {
    let message = [
        ConditionType::Terminal,
        ConditionType::Recoverable,
        ConditionType::Synced,
    ]
    .into_iter()
    .filter_map(|t| entry.conditions.get(t))
    .find_map(|c| c.message.clone());

    Summary {
        kind,
        name: name.to_string(),
        id: id.map(str::to_string),
        outcome: entry.outcome.as_ref().map(outcome_label),
        synced: entry.conditions.is_true(ConditionType::Synced),
        message,
        passes: entry.passes,
    }
}

/// Last known state of every resource, keyed by kind and name.
#[derive(Clone, Default)]
pub struct StatusTable {
    endpoints: Table<Endpoint>,
    rules: Table<Rule>,
}

impl StatusTable {
    pub async fn endpoint(&self, name: &str) -> Option<Entry<Endpoint>> {
        self.endpoints.read().await.get(name).cloned()
    }

    pub async fn rule(&self, name: &str) -> Option<Entry<Rule>> {
        self.rules.read().await.get(name).cloned()
    }

    pub async fn summary(&self) -> Vec<Summary> {
        let mut lines = Vec::new();
        for (name, entry) in self.endpoints.read().await.iter() {
            let id = entry.observed.as_ref().and_then(Endpoint::id);
            lines.push(summarize("ResolverEndpoint", name, entry, id));
        }
        for (name, entry) in self.rules.read().await.iter() {
            let id = entry.observed.as_ref().and_then(Rule::id);
            lines.push(summarize("ResolverRule", name, entry, id));
        }
        lines
    }
}

// =============================================================================
// Reference resolution
// =============================================================================

/// Fills in references to other resources before a pass.
#[async_trait]
trait Resolve<D>: Send + Sync {
    async fn resolve(&self, desired: &D) -> recon_core::Result<D>;
}

struct NoReferences;

#[async_trait]
impl<D: Clone + Send + Sync> Resolve<D> for NoReferences {
    async fn resolve(&self, desired: &D) -> recon_core::Result<D> {
        Ok(desired.clone())
    }
}

/// Resolves `resolver_endpoint_ref` to the endpoint's provider id.
struct EndpointReferences {
    endpoints: Table<Endpoint>,
}

#[async_trait]
impl Resolve<RuleSpec> for EndpointReferences {
    async fn resolve(&self, desired: &RuleSpec) -> recon_core::Result<RuleSpec> {
        let Some(name) = &desired.resolver_endpoint_ref else {
            return Ok(desired.clone());
        };
        let endpoints = self.endpoints.read().await;
        let entry = endpoints.get(name);
        if let Some(Outcome::Fatal { reason }) = entry.and_then(|e| e.outcome.as_ref()) {
            return Err(Error::Terminal(format!(
                "resolver endpoint {name} failed: {reason}"
            )));
        }
        let id = entry
            .and_then(|e| e.observed.as_ref())
            .and_then(Endpoint::id)
            .ok_or_else(|| Error::Validation(format!("resolver endpoint {name} has no id yet")))?;

        let mut resolved = desired.clone();
        resolved.resolver_endpoint_id = Some(id.to_string());
        Ok(resolved)
    }
}

// =============================================================================
// Workers
// =============================================================================

/// Drives one resource identity.
struct Worker<M: ResourceManager> {
    reconciler: Arc<Reconciler<M>>,
    table: Table<M::Observed>,
    references: Arc<dyn Resolve<M::Desired>>,
    permits: Arc<Semaphore>,
    config: AgentConfig,
    root: CallContext,
}

impl<M> Worker<M>
where
    M: ResourceManager + 'static,
{
    async fn drive(self, desired: M::Desired) {
        let kind = self.reconciler.manager().kind();
        let name = self.reconciler.manager().name(&desired).to_string();
        let mut backoff = Backoff::new(self.config.min_backoff, self.config.max_backoff);

        loop {
            let Ok(permit) = self.permits.acquire().await else {
                return;
            };
            if self.root.is_cancelled() {
                return;
            }

            let (last, conditions) = {
                let table = self.table.read().await;
                match table.get(&name) {
                    Some(entry) => (entry.observed.clone(), entry.conditions.clone()),
                    None => (None, Conditions::new()),
                }
            };

            let result = match self.references.resolve(&desired).await {
                Ok(resolved) => {
                    let mut ctx = self.root.next_pass();
                    if let Some(timeout) = self.config.call_timeout {
                        ctx = ctx.with_timeout(timeout);
                    }
                    self.reconciler
                        .reconcile(&ctx, &resolved, last.as_ref(), &conditions)
                        .await
                }
                Err(e) => {
                    debug!(kind, name = %name, error = %e, "References not resolved");
                    let severity = e.severity(&[]);
                    let mut conditions = conditions;
                    conditions.track(Some((&e, severity)), false, Some(e.to_string()));
                    let outcome = match severity {
                        Severity::Terminal => Outcome::Fatal {
                            reason: e.to_string(),
                        },
                        Severity::Recoverable => Outcome::retry(e.to_string()),
                    };
                    Reconciled {
                        observed: last,
                        conditions,
                        outcome,
                        changes: Default::default(),
                    }
                }
            };
            drop(permit);

            let outcome = result.outcome.clone();
            self.table
                .write()
                .await
                .entry(name.clone())
                .or_default()
                .record(result);

            let delay = match outcome {
                Outcome::Converged => {
                    backoff.reset();
                    if self.config.once {
                        return;
                    }
                    self.config.resync_interval
                }
                Outcome::Retry {
                    after: Some(after), ..
                } => after,
                Outcome::Retry { after: None, .. } => backoff.next(),
                Outcome::Fatal { reason } => {
                    warn!(kind, name = %name, reason = %reason, "Giving up until the desired state changes");
                    return;
                }
            };

            debug!(kind, name = %name, delay_ms = delay.as_millis() as u64, "Next pass scheduled");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.root.cancelled() => return,
            }
        }
    }
}

// =============================================================================
// Agent
// =============================================================================

/// Reconciles every resource in a manifest against a resolver provider.
pub struct Agent {
    manifest: Manifest,
    config: AgentConfig,
    status: StatusTable,
    endpoints: Arc<Reconciler<EndpointManager>>,
    rules: Arc<Reconciler<RuleManager>>,
}

impl Agent {
    pub fn new(client: Arc<dyn ResolverApi>, mut manifest: Manifest, config: AgentConfig) -> Self {
        // Every pass of an identity must reuse the same create token.
        manifest.stamp_creation(Utc::now());
        let endpoints = Reconciler::with_config(
            EndpointManager::new(Arc::clone(&client)),
            config.reconciler(),
        );
        let rules = Reconciler::with_config(RuleManager::new(client), config.reconciler());
        Self {
            manifest,
            config,
            status: StatusTable::default(),
            endpoints: Arc::new(endpoints),
            rules: Arc::new(rules),
        }
    }

    /// Handle on the status table. Stays valid after [`run`](Self::run).
    pub fn status(&self) -> StatusTable {
        self.status.clone()
    }

    /// Run until every resource task has stopped (with `once`) or until
    /// `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            endpoints = self.manifest.endpoints.len(),
            rules = self.manifest.rules.len(),
            workers = self.config.workers,
            "Starting agent"
        );

        let (root, cancel) = CallContext::new().cancellable();
        let permits = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut tasks = JoinSet::new();

        for spec in &self.manifest.endpoints {
            let worker = Worker {
                reconciler: Arc::clone(&self.endpoints),
                table: Arc::clone(&self.status.endpoints),
                references: Arc::new(NoReferences) as Arc<dyn Resolve<EndpointSpec>>,
                permits: Arc::clone(&permits),
                config: self.config.clone(),
                root: root.clone(),
            };
            tasks.spawn(worker.drive(spec.clone()));
        }
        for spec in &self.manifest.rules {
            let worker = Worker {
                reconciler: Arc::clone(&self.rules),
                table: Arc::clone(&self.status.rules),
                references: Arc::new(EndpointReferences {
                    endpoints: Arc::clone(&self.status.endpoints),
                }) as Arc<dyn Resolve<RuleSpec>>,
                permits: Arc::clone(&permits),
                config: self.config.clone(),
                root: root.clone(),
            };
            tasks.spawn(worker.drive(spec.clone()));
        }

        tokio::pin!(shutdown);
        let mut panicked = 0usize;
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        error!("Resource task failed: {}", e);
                        panicked += 1;
                    }
                },
                _ = &mut shutdown, if !root.is_cancelled() => {
                    info!("Shutdown requested");
                    cancel.cancel();
                }
            }
        }

        if !self.config.once && !root.is_cancelled() {
            info!("All resources stopped, waiting for shutdown");
            shutdown.await;
        }

        if panicked > 0 {
            anyhow::bail!("{} resource tasks failed", panicked);
        }
        info!("Agent stopped");
        Ok(())
    }

    /// Delete every resource this agent created. Rules go first since they
    /// reference endpoints.
    pub async fn teardown(&self) -> Result<()> {
        let mut failed = 0usize;

        let rules: Vec<(String, Option<Rule>)> = self
            .status
            .rules
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), entry.observed.clone()))
            .collect();
        for (name, observed) in rules {
            let ctx = self.teardown_context();
            match self.rules.finalize(&ctx, observed.as_ref()).await {
                Ok(()) => {
                    info!(name = %name, "Deleted rule");
                    self.status.rules.write().await.remove(&name);
                }
                Err(e) => {
                    error!(name = %name, error = %e, "Failed to delete rule");
                    failed += 1;
                }
            }
        }

        let endpoints: Vec<(String, Option<Endpoint>)> = self
            .status
            .endpoints
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), entry.observed.clone()))
            .collect();
        for (name, observed) in endpoints {
            let ctx = self.teardown_context();
            match self.endpoints.finalize(&ctx, observed.as_ref()).await {
                Ok(()) => {
                    info!(name = %name, "Deleted endpoint");
                    self.status.endpoints.write().await.remove(&name);
                }
                Err(e) => {
                    error!(name = %name, error = %e, "Failed to delete endpoint");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            anyhow::bail!("{} resources could not be deleted", failed);
        }
        Ok(())
    }

    fn teardown_context(&self) -> CallContext {
        let ctx = CallContext::new();
        match self.config.call_timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx,
        }
    }
}
