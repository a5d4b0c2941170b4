//! Convergence executor tests against an in-process fake provider.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use recon_core::{
    Applied, CallContext, Changes, ConditionType, Conditions, Delta, Error, Outcome,
    Reconciler, ReconcilerConfig, RequestToken, ResourceManager, Result, SubCollection, Tag,
    TagClient, Tags, TAGS_PATH, sync_collection, sync_tags,
};

// =============================================================================
// Fake provider
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct GroupSpec {
    name: String,
    size: u32,
    members: Vec<String>,
    tags: Tags,
}

#[derive(Debug, Clone, PartialEq)]
struct Group {
    id: Option<String>,
    arn: String,
    spec: GroupSpec,
    member_count: u32,
}

#[derive(Default)]
struct Cloud {
    group: Mutex<Option<Group>>,
    tokens: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<String>>,
    /// Operation name → error code to return for it.
    faults: Mutex<HashMap<String, String>>,
    /// Apply the create, then fail the call as if the response was lost.
    lose_create_response: Mutex<bool>,
}

impl Cloud {
    fn call(&self, op: String) -> Result<()> {
        self.calls.lock().unwrap().push(op.clone());
        match self.faults.lock().unwrap().get(&op) {
            Some(code) => Err(Error::provider(code.clone(), format!("{op} failed"))),
            None => Ok(()),
        }
    }

    fn fail(&self, op: &str, code: &str) {
        self.faults
            .lock()
            .unwrap()
            .insert(op.to_string(), code.to_string());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn stored(&self) -> Group {
        self.group.lock().unwrap().clone().unwrap()
    }
}

#[async_trait]
impl TagClient for Cloud {
    async fn list_tags(&self, _ctx: &CallContext, _arn: &str) -> Result<Vec<Tag>> {
        self.call("list_tags".into())?;
        Ok(self
            .stored()
            .spec
            .tags
            .iter()
            .map(|(k, v)| Tag::new(k, v))
            .collect())
    }

    async fn tag_resource(&self, _ctx: &CallContext, _arn: &str, tags: Vec<Tag>) -> Result<()> {
        self.call("tag".into())?;
        let mut group = self.group.lock().unwrap();
        let group = group.as_mut().unwrap();
        for t in tags {
            group.spec.tags.insert(t.key, t.value);
        }
        Ok(())
    }

    async fn untag_resource(&self, _ctx: &CallContext, _arn: &str, keys: Vec<String>) -> Result<()> {
        self.call("untag".into())?;
        let mut group = self.group.lock().unwrap();
        let group = group.as_mut().unwrap();
        for k in keys {
            group.spec.tags.remove(&k);
        }
        Ok(())
    }
}

struct MemberSync<'a> {
    cloud: &'a Cloud,
}

#[async_trait]
impl SubCollection for MemberSync<'_> {
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
        self.cloud.call(format!("attach:{item}"))?;
        let mut group = self.cloud.group.lock().unwrap();
        let group = group.as_mut().unwrap();
        group.spec.members.push(item.clone());
        group.member_count += 1;
        Ok(Some(group.member_count))
    }

    async fn detach(&self, _ctx: &CallContext, key: &String) -> Result<Option<u32>> {
        self.cloud.call(format!("detach:{key}"))?;
        let mut group = self.cloud.group.lock().unwrap();
        let group = group.as_mut().unwrap();
        group.spec.members.retain(|m| m != key);
        group.member_count -= 1;
        Ok(Some(group.member_count))
    }
}

const MEMBERS_PATH: &str = "spec.members";

struct GroupManager {
    cloud: Arc<Cloud>,
}

#[async_trait]
impl ResourceManager for GroupManager {
    type Desired = GroupSpec;
    type Observed = Group;

    fn kind(&self) -> &'static str {
        "Group"
    }

    fn name<'a>(&self, desired: &'a GroupSpec) -> &'a str {
        &desired.name
    }

    fn created_at(&self, _desired: &GroupSpec) -> Option<chrono::DateTime<Utc>> {
        Utc.timestamp_millis_opt(1_700_000_000_000).single()
    }

    fn terminal_codes(&self) -> &'static [&'static str] {
        &["InvalidParameterException"]
    }

    fn collection_paths(&self) -> &'static [&'static str] {
        &[MEMBERS_PATH]
    }

    async fn observe(
        &self,
        _ctx: &CallContext,
        _desired: &GroupSpec,
        last: Option<&Group>,
    ) -> Result<Option<Group>> {
        if last.and_then(|g| g.id.as_ref()).is_none() {
            return Ok(None);
        }
        self.cloud.call("describe".into())?;
        Ok(self.cloud.group.lock().unwrap().clone())
    }

    async fn create(
        &self,
        _ctx: &CallContext,
        desired: &GroupSpec,
        token: &RequestToken,
    ) -> Result<Group> {
        self.cloud.call(format!("create:{token}"))?;
        let existing = self.cloud.tokens.lock().unwrap().get(token.as_str()).cloned();
        let group = match existing {
            Some(_) => self.cloud.stored(),
            None => {
                let count = self.cloud.tokens.lock().unwrap().len();
                let group = Group {
                    id: Some(format!("grp-{count}")),
                    arn: format!("arn:fake:group/grp-{count}"),
                    spec: desired.clone(),
                    member_count: desired.members.len() as u32,
                };
                self.cloud
                    .tokens
                    .lock()
                    .unwrap()
                    .insert(token.to_string(), group.id.clone().unwrap());
                *self.cloud.group.lock().unwrap() = Some(group.clone());
                group
            }
        };
        if std::mem::take(&mut *self.cloud.lose_create_response.lock().unwrap()) {
            return Err(Error::provider("InternalServiceErrorException", "connection reset"));
        }
        Ok(group)
    }

    fn check_immutable(&self, desired: &GroupSpec, observed: &Group) -> Result<()> {
        if desired.size < observed.spec.size {
            return Err(Error::Terminal("size cannot shrink".into()));
        }
        Ok(())
    }

    fn delta(&self, desired: &GroupSpec, observed: &Group) -> Delta {
        Delta::builder()
            .compare(TAGS_PATH, &desired.tags, &observed.spec.tags)
            .compare_keys(MEMBERS_PATH, &desired.members, &observed.spec.members, |m| m.clone())
            .compare("spec.size", &desired.size, &observed.spec.size)
            .build()
    }

    async fn sync_tags(&self, ctx: &CallContext, desired: &GroupSpec, observed: &Group) -> Result<Group> {
        sync_tags(ctx, self.cloud.as_ref(), &observed.arn, &desired.tags, &observed.spec.tags).await?;
        let mut updated = observed.clone();
        updated.spec.tags = desired.tags.clone();
        Ok(updated)
    }

    async fn sync_collections(
        &self,
        ctx: &CallContext,
        desired: &GroupSpec,
        observed: Group,
        _delta: &Delta,
    ) -> Applied<Group> {
        let syncer = MemberSync { cloud: &self.cloud };
        let progress = sync_collection(ctx, &syncer, &desired.members, &observed.spec.members).await;
        let mut updated = observed;
        updated.spec.members = progress.merge_into(&updated.spec.members, |m| m.clone());
        if let Some(count) = progress.aggregate {
            updated.member_count = count;
        }
        let changed = progress.changed();
        match progress.error {
            Some(e) => Applied::failed(updated, changed, e),
            None => Applied::ok(updated, changed),
        }
    }

    async fn update(
        &self,
        _ctx: &CallContext,
        desired: &GroupSpec,
        observed: &Group,
        _delta: &Delta,
    ) -> Result<Group> {
        self.cloud.call("update".into())?;
        let mut updated = observed.clone();
        updated.spec.size = desired.size;
        self.cloud.group.lock().unwrap().as_mut().unwrap().spec.size = desired.size;
        Ok(updated)
    }

    async fn delete(&self, _ctx: &CallContext, observed: &Group) -> Result<()> {
        if observed.id.is_none() {
            return Ok(());
        }
        self.cloud.call("delete".into())?;
        match self.cloud.group.lock().unwrap().take() {
            Some(_) => Ok(()),
            None => Err(Error::NotFound),
        }
    }

    fn needs_refresh(&self, changes: &Changes) -> bool {
        changes.collections
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn spec(members: &[&str], tags: &[(&str, &str)]) -> GroupSpec {
    GroupSpec {
        name: "edge".to_string(),
        size: 2,
        members: members.iter().map(|m| m.to_string()).collect(),
        tags: tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

fn setup() -> (Arc<Cloud>, Reconciler<GroupManager>) {
    let cloud = Arc::new(Cloud::default());
    let reconciler = Reconciler::new(GroupManager {
        cloud: Arc::clone(&cloud),
    });
    (cloud, reconciler)
}

async fn seed(reconciler: &Reconciler<GroupManager>, desired: &GroupSpec) -> Group {
    let result = reconciler
        .reconcile(&CallContext::new(), desired, None, &Conditions::new())
        .await;
    result.observed.unwrap()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_unobserved_resource_is_created_without_describe() {
    let (cloud, reconciler) = setup();
    let desired = spec(&["s1", "s2"], &[]);

    let result = reconciler
        .reconcile(&CallContext::new(), &desired, None, &Conditions::new())
        .await;

    assert_eq!(cloud.calls(), vec!["create:edge-1700000000000".to_string()]);
    assert_eq!(result.outcome, Outcome::Converged);
    assert!(result.changes.created);
    let observed = result.observed.unwrap();
    assert_eq!(observed.id.as_deref(), Some("grp-0"));
    assert!(result.conditions.is_true(ConditionType::Synced));
}

#[tokio::test]
async fn test_update_order_tags_collections_primary() {
    let (cloud, reconciler) = setup();
    let baseline = seed(&reconciler, &spec(&["s1", "s2"], &[("env", "dev"), ("team", "x")])).await;
    cloud.calls.lock().unwrap().clear();

    let mut desired = spec(&["s2", "s3"], &[("env", "prod")]);
    desired.size = 3;

    let result = reconciler
        .reconcile(&CallContext::new(), &desired, Some(&baseline), &Conditions::new())
        .await;

    assert_eq!(
        cloud.calls(),
        vec!["describe", "tag", "untag", "attach:s3", "detach:s1", "update"]
    );
    let observed = result.observed.unwrap();
    assert_eq!(observed.spec.members, vec!["s2", "s3"]);
    assert_eq!(observed.member_count, 2);
    assert_eq!(observed.spec.size, 3);
    // Membership changed, so the executor asks for a refresh pass.
    assert!(matches!(result.outcome, Outcome::Retry { after: Some(_), .. }));
    assert!(!result.conditions.is_true(ConditionType::Synced));
}

#[tokio::test]
async fn test_configured_refresh_delay_is_used() {
    let cloud = Arc::new(Cloud::default());
    let reconciler = Reconciler::with_config(
        GroupManager {
            cloud: Arc::clone(&cloud),
        },
        ReconcilerConfig {
            refresh_delay: Duration::from_millis(750),
            ..ReconcilerConfig::default()
        },
    );
    let baseline = seed(&reconciler, &spec(&["s1", "s2"], &[])).await;

    let result = reconciler
        .reconcile(
            &CallContext::new(),
            &spec(&["s1", "s2", "s3"], &[]),
            Some(&baseline),
            &Conditions::new(),
        )
        .await;

    assert_eq!(
        result.outcome,
        Outcome::retry_after(Duration::from_millis(750), "requeued to refresh resource status")
    );
}

#[tokio::test]
async fn test_converged_pass_makes_no_mutations() {
    let (cloud, reconciler) = setup();
    let desired = spec(&["s1", "s2"], &[("env", "prod")]);
    let baseline = seed(&reconciler, &desired).await;
    cloud.calls.lock().unwrap().clear();

    let result = reconciler
        .reconcile(&CallContext::new(), &desired, Some(&baseline), &Conditions::new())
        .await;

    assert_eq!(cloud.calls(), vec!["describe"]);
    assert_eq!(result.outcome, Outcome::Converged);
    assert!(!result.changes.any());
}

#[tokio::test]
async fn test_tags_only_skip_primary_update() {
    let (cloud, reconciler) = setup();
    let baseline = seed(&reconciler, &spec(&["s1", "s2"], &[])).await;
    cloud.calls.lock().unwrap().clear();

    let result = reconciler
        .reconcile(
            &CallContext::new(),
            &spec(&["s1", "s2"], &[("env", "prod")]),
            Some(&baseline),
            &Conditions::new(),
        )
        .await;

    assert_eq!(cloud.calls(), vec!["describe", "tag"]);
    assert_eq!(result.outcome, Outcome::Converged);
}

#[tokio::test]
async fn test_partial_attach_failure_keeps_progress() {
    let (cloud, reconciler) = setup();
    let baseline = seed(&reconciler, &spec(&["s1", "s2"], &[])).await;
    cloud.calls.lock().unwrap().clear();
    cloud.fail("attach:s4", "ThrottlingException");

    let result = reconciler
        .reconcile(
            &CallContext::new(),
            &spec(&["s1", "s2", "s3", "s4"], &[]),
            Some(&baseline),
            &Conditions::new(),
        )
        .await;

    assert_eq!(cloud.calls(), vec!["describe", "attach:s3", "attach:s4"]);
    let observed = result.observed.unwrap();
    assert_eq!(observed.spec.members, vec!["s1", "s2", "s3"]);
    assert_eq!(observed.member_count, 3);
    assert!(matches!(result.outcome, Outcome::Retry { after: None, .. }));
    assert!(result.conditions.is_true(ConditionType::Recoverable));
    assert!(result.changes.collections);
}

#[tokio::test]
async fn test_terminal_provider_code_is_fatal() {
    let (cloud, reconciler) = setup();
    let baseline = seed(&reconciler, &spec(&["s1", "s2"], &[])).await;
    cloud.fail("update", "InvalidParameterException");
    let mut desired = spec(&["s1", "s2"], &[]);
    desired.size = 5;

    let result = reconciler
        .reconcile(&CallContext::new(), &desired, Some(&baseline), &Conditions::new())
        .await;

    assert!(result.outcome.is_terminal());
    assert!(result.conditions.is_true(ConditionType::Terminal));
    assert!(result.conditions.get(ConditionType::Recoverable).is_none());
}

#[tokio::test]
async fn test_immutable_change_is_fatal_without_calls() {
    let (cloud, reconciler) = setup();
    let baseline = seed(&reconciler, &spec(&["s1", "s2"], &[])).await;
    cloud.calls.lock().unwrap().clear();
    let mut desired = spec(&["s1", "s2"], &[]);
    desired.size = 1;

    let result = reconciler
        .reconcile(&CallContext::new(), &desired, Some(&baseline), &Conditions::new())
        .await;

    assert_eq!(cloud.calls(), vec!["describe"]);
    assert!(result.outcome.is_terminal());
}

#[tokio::test]
async fn test_recoverable_condition_clears_on_success() {
    let (cloud, reconciler) = setup();
    let baseline = seed(&reconciler, &spec(&["s1", "s2"], &[])).await;
    cloud.fail("tag", "ThrottlingException");
    let desired = spec(&["s1", "s2"], &[("env", "prod")]);

    let failed = reconciler
        .reconcile(&CallContext::new(), &desired, Some(&baseline), &Conditions::new())
        .await;
    assert!(failed.conditions.is_true(ConditionType::Recoverable));

    cloud.faults.lock().unwrap().clear();
    let ok = reconciler
        .reconcile(
            &CallContext::new(),
            &desired,
            failed.observed.as_ref(),
            &failed.conditions,
        )
        .await;

    assert_eq!(ok.outcome, Outcome::Converged);
    let recoverable = ok.conditions.get(ConditionType::Recoverable).unwrap();
    assert!(!recoverable.status);
    assert!(recoverable.message.is_none());
    assert_eq!(ok.conditions.len(), 2);
}

#[tokio::test]
async fn test_lost_create_response_does_not_duplicate() {
    let (cloud, reconciler) = setup();
    *cloud.lose_create_response.lock().unwrap() = true;
    let desired = spec(&["s1", "s2"], &[]);

    let first = reconciler
        .reconcile(&CallContext::new(), &desired, None, &Conditions::new())
        .await;
    assert!(matches!(first.outcome, Outcome::Retry { .. }));
    assert!(first.observed.is_none());

    let second = reconciler
        .reconcile(&CallContext::new(), &desired, None, &Conditions::new())
        .await;

    assert_eq!(second.outcome, Outcome::Converged);
    assert_eq!(second.observed.unwrap().id.as_deref(), Some("grp-0"));
    assert_eq!(cloud.tokens.lock().unwrap().len(), 1);
    let calls = cloud.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], calls[1]);
}

#[tokio::test]
async fn test_finalize_tolerates_missing_resource() {
    let (cloud, reconciler) = setup();
    let observed = seed(&reconciler, &spec(&["s1", "s2"], &[])).await;
    let ctx = CallContext::new();

    reconciler.finalize(&ctx, Some(&observed)).await.unwrap();
    assert!(cloud.group.lock().unwrap().is_none());

    // Second delete hits NotFound and is still a success.
    reconciler.finalize(&ctx, Some(&observed)).await.unwrap();
    reconciler.finalize(&ctx, None).await.unwrap();
}
