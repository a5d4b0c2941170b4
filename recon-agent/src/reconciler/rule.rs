//! Resolver rule manager.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recon_core::{
    Applied, CallContext, Changes, Delta, Error, Page, PageSource, Pages, RequestToken,
    ResourceManager, Result, SubCollection, TAGS_PATH, Tag, fetch_tags, sync_collection,
    sync_tags,
};
use tracing::{debug, info};

use super::{TERMINAL_CODES, require};
use crate::clients::{CreateRuleInput, ResolverApi, RuleAssociationRecord, RuleRecord, RuleUpdate};
use crate::model::{
    AssociationKey, AssociationStatus, Rule, RuleAssociation, RuleSpec, RuleState, RuleStatus,
};

pub const ASSOCIATIONS_PATH: &str = "spec.associations";
pub const NAME_PATH: &str = "spec.name";
pub const TARGET_IPS_PATH: &str = "spec.target_ips";
pub const ENDPOINT_PATH: &str = "spec.resolver_endpoint_id";

struct AssociationPages<'a> {
    client: &'a dyn ResolverApi,
    rule_id: &'a str,
}

#[async_trait]
impl PageSource for AssociationPages<'_> {
    type Item = RuleAssociationRecord;

    async fn fetch_page(
        &self,
        ctx: &CallContext,
        token: Option<String>,
    ) -> Result<Page<RuleAssociationRecord>> {
        self.client
            .list_resolver_rule_associations(ctx, self.rule_id, token)
            .await
    }
}

/// Associates and disassociates a rule with its targets.
struct AssociationSync<'a> {
    client: &'a dyn ResolverApi,
    rule_id: String,
}

#[async_trait]
impl SubCollection for AssociationSync<'_> {
    type Item = RuleAssociation;
    type Key = AssociationKey;
    type Aggregate = ();

    fn name(&self) -> &'static str {
        "associations"
    }

    fn key_of(&self, item: &RuleAssociation) -> AssociationKey {
        item.key()
    }

    async fn attach(&self, ctx: &CallContext, item: &RuleAssociation) -> Result<Option<()>> {
        match item.key() {
            AssociationKey::Vpc(vpc_id) => {
                self.client
                    .associate_resolver_rule(ctx, &self.rule_id, &vpc_id)
                    .await?;
            }
        }
        Ok(None)
    }

    async fn detach(&self, ctx: &CallContext, key: &AssociationKey) -> Result<Option<()>> {
        match key {
            AssociationKey::Vpc(vpc_id) => {
                match self
                    .client
                    .disassociate_resolver_rule(ctx, &self.rule_id, vpc_id)
                    .await
                {
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {
                        debug!(rule = %self.rule_id, vpc_id, "Association already gone");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(None)
    }
}

fn status_from(record: &RuleRecord) -> RuleStatus {
    RuleStatus {
        id: Some(record.id.clone()),
        arn: Some(record.arn.clone()),
        creator_request_id: Some(record.creator_request_id.clone()),
        owner_id: Some(record.owner_id.clone()),
        share_status: Some(record.share_status.clone()),
        status: Some(record.status),
        status_message: record.status_message.clone(),
        creation_time: Some(record.creation_time),
        modification_time: Some(record.modification_time),
    }
}

/// Providers report domain names with or without the trailing dot.
fn same_domain(a: &str, b: &str) -> bool {
    a.trim_end_matches('.').eq_ignore_ascii_case(b.trim_end_matches('.'))
}

/// Manages resolver rules and their VPC associations.
pub struct RuleManager {
    client: Arc<dyn ResolverApi>,
}

impl RuleManager {
    pub fn new(client: Arc<dyn ResolverApi>) -> Self {
        Self { client }
    }

    async fn sync_associations(
        &self,
        ctx: &CallContext,
        desired: &RuleSpec,
        observed: Rule,
    ) -> Applied<Rule> {
        let rule_id = match require(observed.id(), "rule id") {
            Ok(id) => id.to_string(),
            Err(e) => return Applied::failed(observed, false, e),
        };
        let syncer = AssociationSync {
            client: self.client.as_ref(),
            rule_id,
        };

        let progress = sync_collection(
            ctx,
            &syncer,
            &desired.associations,
            &observed.spec.associations,
        )
        .await;

        let mut updated = observed;
        updated.spec.associations =
            progress.merge_into(&updated.spec.associations, RuleAssociation::key);

        let changed = progress.changed();
        match progress.error {
            Some(e) => Applied::failed(updated, changed, e),
            None => Applied::ok(updated, changed),
        }
    }
}

#[async_trait]
impl ResourceManager for RuleManager {
    type Desired = RuleSpec;
    type Observed = Rule;

    fn kind(&self) -> &'static str {
        "ResolverRule"
    }

    fn name<'a>(&self, desired: &'a RuleSpec) -> &'a str {
        &desired.name
    }

    fn created_at(&self, desired: &RuleSpec) -> Option<DateTime<Utc>> {
        desired.created_at
    }

    fn terminal_codes(&self) -> &'static [&'static str] {
        TERMINAL_CODES
    }

    fn collection_paths(&self) -> &'static [&'static str] {
        &[ASSOCIATIONS_PATH]
    }

    async fn observe(
        &self,
        ctx: &CallContext,
        desired: &RuleSpec,
        last: Option<&Rule>,
    ) -> Result<Option<Rule>> {
        let Some(id) = last.and_then(Rule::id) else {
            return Ok(None);
        };

        let record = match self.client.get_resolver_rule(ctx, id).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                debug!(id, "Rule no longer exists");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let source = AssociationPages {
            client: self.client.as_ref(),
            rule_id: id,
        };
        let associations = Pages::new(ctx, &source)
            .collect_all()
            .await?
            .into_iter()
            .filter(|a| a.status != AssociationStatus::Deleting)
            .map(|a| RuleAssociation::vpc(a.vpc_id))
            .collect();
        let tags = fetch_tags(ctx, self.client.as_ref(), &record.arn).await?;

        let spec = RuleSpec {
            name: record.name.clone(),
            created_at: desired.created_at,
            domain_name: record.domain_name.clone(),
            rule_type: record.rule_type,
            resolver_endpoint_id: record.resolver_endpoint_id.clone(),
            resolver_endpoint_ref: desired.resolver_endpoint_ref.clone(),
            target_ips: record.target_ips.clone(),
            associations,
            tags,
        };
        Ok(Some(Rule {
            spec,
            status: status_from(&record),
        }))
    }

    async fn create(
        &self,
        ctx: &CallContext,
        desired: &RuleSpec,
        token: &RequestToken,
    ) -> Result<Rule> {
        let input = CreateRuleInput {
            creator_request_id: token.to_string(),
            name: desired.name.clone(),
            domain_name: desired.domain_name.clone(),
            rule_type: desired.rule_type,
            resolver_endpoint_id: desired.resolver_endpoint_id.clone(),
            target_ips: desired.target_ips.clone(),
            tags: desired.tags.iter().map(|(k, v)| Tag::new(k, v)).collect(),
        };
        let record = self.client.create_resolver_rule(ctx, input).await?;

        let mut spec = desired.clone();
        spec.associations = Vec::new();
        Ok(Rule {
            spec,
            status: status_from(&record),
        })
    }

    /// Associations cannot be passed to create; attach them to the new rule.
    async fn after_create(
        &self,
        ctx: &CallContext,
        desired: &RuleSpec,
        created: Rule,
    ) -> Applied<Rule> {
        if desired.associations.is_empty() {
            return Applied::ok(created, false);
        }
        self.sync_associations(ctx, desired, created).await
    }

    fn check_immutable(&self, desired: &RuleSpec, observed: &Rule) -> Result<()> {
        if !same_domain(&desired.domain_name, &observed.spec.domain_name) {
            return Err(Error::Terminal(format!(
                "domain_name cannot change from {} to {}",
                observed.spec.domain_name, desired.domain_name
            )));
        }
        if desired.rule_type != observed.spec.rule_type {
            return Err(Error::Terminal(format!(
                "rule_type cannot change from {:?} to {:?}",
                observed.spec.rule_type, desired.rule_type
            )));
        }
        Ok(())
    }

    fn delta(&self, desired: &RuleSpec, observed: &Rule) -> Delta {
        Delta::builder()
            .compare(TAGS_PATH, &desired.tags, &observed.spec.tags)
            .compare_keys(
                ASSOCIATIONS_PATH,
                &desired.associations,
                &observed.spec.associations,
                RuleAssociation::key,
            )
            .compare(NAME_PATH, &desired.name, &observed.spec.name)
            .compare(TARGET_IPS_PATH, &desired.target_ips, &observed.spec.target_ips)
            .compare_if_set(
                ENDPOINT_PATH,
                &desired.resolver_endpoint_id,
                &observed.spec.resolver_endpoint_id,
            )
            .build()
    }

    async fn sync_tags(&self, ctx: &CallContext, desired: &RuleSpec, observed: &Rule) -> Result<Rule> {
        let arn = require(observed.status.arn.as_deref(), "rule ARN")?;
        sync_tags(ctx, self.client.as_ref(), arn, &desired.tags, &observed.spec.tags).await?;

        let mut updated = observed.clone();
        updated.spec.tags = desired.tags.clone();
        Ok(updated)
    }

    async fn sync_collections(
        &self,
        ctx: &CallContext,
        desired: &RuleSpec,
        observed: Rule,
        _delta: &Delta,
    ) -> Applied<Rule> {
        self.sync_associations(ctx, desired, observed).await
    }

    /// Sends the whole rule configuration, not just the changed fields.
    async fn update(
        &self,
        ctx: &CallContext,
        desired: &RuleSpec,
        observed: &Rule,
        _delta: &Delta,
    ) -> Result<Rule> {
        let id = require(observed.id(), "rule id")?;
        let update = RuleUpdate {
            name: Some(desired.name.clone()),
            resolver_endpoint_id: desired.resolver_endpoint_id.clone(),
            target_ips: Some(desired.target_ips.clone()),
        };
        let record = self.client.update_resolver_rule(ctx, id, update).await?;

        let mut updated = observed.clone();
        updated.spec.name = record.name.clone();
        updated.spec.resolver_endpoint_id = record.resolver_endpoint_id.clone();
        updated.spec.target_ips = record.target_ips.clone();
        updated.status = status_from(&record);
        Ok(updated)
    }

    /// A rule cannot be deleted while associated, so detach first.
    async fn delete(&self, ctx: &CallContext, observed: &Rule) -> Result<()> {
        let Some(id) = observed.id() else {
            return Ok(());
        };
        let syncer = AssociationSync {
            client: self.client.as_ref(),
            rule_id: id.to_string(),
        };
        for association in &observed.spec.associations {
            info!(rule = id, vpc_id = %association.vpc_id, "Disassociating before delete");
            syncer.detach(ctx, &association.key()).await?;
        }
        self.client.delete_resolver_rule(ctx, id).await
    }

    /// Rule status is eventually consistent after an update.
    fn needs_refresh(&self, changes: &Changes) -> bool {
        changes.primary
    }

    fn settled(&self, observed: &Rule) -> bool {
        !matches!(
            observed.status.status,
            Some(RuleState::Deleting | RuleState::Updating)
        )
    }
}
