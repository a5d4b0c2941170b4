//! In-process resolver provider.
//!
//! Keeps endpoints, rules, associations and tags in memory and behaves like
//! the remote control plane where the engine can tell the difference:
//! provider-assigned ids, create deduplication by request token, paginated
//! listings, idempotent attach/detach and the two-address minimum.
//!
//! Every call is recorded, and individual calls can be made to fail with a
//! chosen error code.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recon_core::{CallContext, Error, Page, Result, Tag, TagClient, Tags};
use tokio::sync::Mutex;
use tracing::debug;

use super::resolver::{
    CreateEndpointInput, CreateRuleInput, EndpointRecord, EndpointUpdate, ResolverApi,
    RuleAssociationRecord, RuleRecord, RuleUpdate, code, op,
};
use crate::model::{
    AssociationStatus, Direction, EndpointState, EndpointType, IpAddressRequest,
    IpAddressStatus, RuleState, RuleType,
};

/// An endpoint must keep at least this many addresses.
pub const MIN_ADDRESSES: usize = 2;

/// One recorded API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: &'static str,
    /// Resource id, ARN or name the call was about.
    pub subject: String,
}

struct Fault {
    op: &'static str,
    /// 1-based call number of `op` that fails.
    at: usize,
    code: String,
}

struct TokenEntry {
    id: String,
    name: String,
}

struct StoredEndpoint {
    record: EndpointRecord,
    addresses: Vec<IpAddressStatus>,
}

#[derive(Default)]
struct State {
    endpoints: BTreeMap<String, StoredEndpoint>,
    rules: BTreeMap<String, RuleRecord>,
    associations: Vec<RuleAssociationRecord>,
    tags: HashMap<String, Tags>,
    endpoint_tokens: HashMap<String, TokenEntry>,
    rule_tokens: HashMap<String, TokenEntry>,
    calls: Vec<Call>,
    counts: HashMap<&'static str, usize>,
    faults: Vec<Fault>,
    serial: u64,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.serial += 1;
        format!("{prefix}-{:017x}", self.serial)
    }

    fn endpoint(&self, id: &str) -> Result<&StoredEndpoint> {
        self.endpoints
            .get(id)
            .ok_or_else(|| not_found("resolver endpoint", id))
    }

    fn endpoint_mut(&mut self, id: &str) -> Result<&mut StoredEndpoint> {
        self.endpoints
            .get_mut(id)
            .ok_or_else(|| not_found("resolver endpoint", id))
    }

    fn rule_mut(&mut self, id: &str) -> Result<&mut RuleRecord> {
        self.rules
            .get_mut(id)
            .ok_or_else(|| not_found("resolver rule", id))
    }

    fn allocate(&mut self, request: &IpAddressRequest, now: DateTime<Utc>) -> IpAddressStatus {
        let ip_id = self.next_id("rni");
        let ip = request.ip.clone().or_else(|| {
            Some(format!(
                "10.0.{}.{}",
                (self.serial / 250) % 256,
                self.serial % 250 + 4
            ))
        });
        IpAddressStatus {
            ip_id,
            subnet_id: request.subnet_id.clone(),
            ip,
            ipv6: request.ipv6.clone(),
            status: "ATTACHED".to_string(),
            status_message: None,
            creation_time: Some(now),
            modification_time: Some(now),
        }
    }
}

fn not_found(kind: &str, id: &str) -> Error {
    Error::provider(code::RESOURCE_NOT_FOUND, format!("{kind} {id} does not exist"))
}

fn invalid_request(message: impl Into<String>) -> Error {
    Error::provider(code::INVALID_REQUEST, message)
}

fn invalid_parameter(message: impl Into<String>) -> Error {
    Error::provider(code::INVALID_PARAMETER, message)
}

fn paginate<T: Clone>(items: &[T], token: Option<String>, page_size: usize) -> Result<Page<T>> {
    let start = match token {
        None => 0,
        Some(t) => match t.parse::<usize>() {
            Ok(n) if n <= items.len() => n,
            _ => {
                return Err(Error::provider(
                    code::INVALID_NEXT_TOKEN,
                    format!("invalid next token {t}"),
                ));
            }
        },
    };
    let end = (start + page_size).min(items.len());
    Ok(Page {
        items: items[start..end].to_vec(),
        next_token: (end < items.len()).then(|| end.to_string()),
    })
}

fn tag_map(tags: &[Tag]) -> Tags {
    tags.iter()
        .map(|t| (t.key.clone(), t.value.clone()))
        .collect()
}

/// In-memory resolver control plane.
pub struct MemoryResolver {
    region: String,
    account_id: String,
    page_size: usize,
    latency: Duration,
    state: Mutex<State>,
}

impl Default for MemoryResolver {
    fn default() -> Self {
        Self::new("us-west-2", "000000000000")
    }
}

impl MemoryResolver {
    pub fn new(region: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            account_id: account_id.into(),
            page_size: 10,
            latency: Duration::ZERO,
            state: Mutex::new(State::default()),
        }
    }

    /// Items per page for list calls.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Simulated round-trip time of every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn arn(&self, kind: &str, id: &str) -> String {
        format!(
            "arn:aws:route53resolver:{}:{}:{kind}/{id}",
            self.region, self.account_id
        )
    }

    /// Record the call, apply injected faults and simulated latency.
    async fn enter(&self, ctx: &CallContext, op: &'static str, subject: &str) -> Result<()> {
        ctx.check()?;
        {
            let mut state = self.state.lock().await;
            state.calls.push(Call {
                op,
                subject: subject.to_string(),
            });
            let count = state.counts.entry(op).or_default();
            *count += 1;
            let n = *count;
            if let Some(pos) = state.faults.iter().position(|f| f.op == op && f.at == n) {
                let fault = state.faults.remove(pos);
                debug!(op, subject, code = %fault.code, "Injected fault");
                return Err(Error::provider(fault.code, format!("injected failure of {op}")));
            }
        }
        debug!(op, subject, "Resolver call");
        if !self.latency.is_zero() {
            let latency = self.latency;
            ctx.run(async move {
                tokio::time::sleep(latency).await;
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    // --- Test hooks ---

    /// Make the `n`-th call (1-based, counted since construction) of `op`
    /// fail with `code`.
    pub async fn fail_nth(&self, op: &'static str, n: usize, code: &str) {
        self.state.lock().await.faults.push(Fault {
            op,
            at: n,
            code: code.to_string(),
        });
    }

    pub async fn calls(&self) -> Vec<Call> {
        self.state.lock().await.calls.clone()
    }

    /// Operation names of every recorded call, in order.
    pub async fn ops(&self) -> Vec<&'static str> {
        self.state.lock().await.calls.iter().map(|c| c.op).collect()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    pub async fn endpoint_count(&self) -> usize {
        self.state.lock().await.endpoints.len()
    }

    pub async fn rule_count(&self) -> usize {
        self.state.lock().await.rules.len()
    }

    pub async fn tags_of(&self, arn: &str) -> Tags {
        self.state
            .lock()
            .await
            .tags
            .get(arn)
            .cloned()
            .unwrap_or_default()
    }

    /// Force the lifecycle status of an endpoint.
    pub async fn set_endpoint_status(&self, id: &str, status: EndpointState) -> Result<()> {
        let mut state = self.state.lock().await;
        state.endpoint_mut(id)?.record.status = status;
        Ok(())
    }

    /// Active (not deleting) VPC associations of a rule.
    pub async fn associated_vpcs(&self, rule_id: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .associations
            .iter()
            .filter(|a| a.rule_id == rule_id && a.status != AssociationStatus::Deleting)
            .map(|a| a.vpc_id.clone())
            .collect()
    }
}

#[async_trait]
impl TagClient for MemoryResolver {
    async fn list_tags(&self, ctx: &CallContext, arn: &str) -> Result<Vec<Tag>> {
        self.enter(ctx, op::LIST_TAGS, arn).await?;
        let state = self.state.lock().await;
        let tags = state
            .tags
            .get(arn)
            .ok_or_else(|| not_found("resource", arn))?;
        Ok(tags.iter().map(|(k, v)| Tag::new(k, v)).collect())
    }

    async fn tag_resource(&self, ctx: &CallContext, arn: &str, tags: Vec<Tag>) -> Result<()> {
        self.enter(ctx, op::TAG, arn).await?;
        let mut state = self.state.lock().await;
        let stored = state
            .tags
            .get_mut(arn)
            .ok_or_else(|| not_found("resource", arn))?;
        stored.extend(tags.into_iter().map(|t| (t.key, t.value)));
        Ok(())
    }

    async fn untag_resource(&self, ctx: &CallContext, arn: &str, keys: Vec<String>) -> Result<()> {
        self.enter(ctx, op::UNTAG, arn).await?;
        let mut state = self.state.lock().await;
        let stored = state
            .tags
            .get_mut(arn)
            .ok_or_else(|| not_found("resource", arn))?;
        for key in keys {
            stored.remove(&key);
        }
        Ok(())
    }
}

#[async_trait]
impl ResolverApi for MemoryResolver {
    async fn create_resolver_endpoint(
        &self,
        ctx: &CallContext,
        input: CreateEndpointInput,
    ) -> Result<EndpointRecord> {
        self.enter(ctx, op::CREATE_ENDPOINT, &input.name).await?;
        let mut state = self.state.lock().await;

        if let Some(entry) = state.endpoint_tokens.get(&input.creator_request_id) {
            if entry.name != input.name {
                return Err(Error::provider(
                    code::RESOURCE_EXISTS,
                    format!(
                        "creator request id {} was already used",
                        input.creator_request_id
                    ),
                ));
            }
            let id = entry.id.clone();
            return Ok(state.endpoint(&id)?.record.clone());
        }

        if input.ip_addresses.len() < MIN_ADDRESSES {
            return Err(invalid_request(format!(
                "an endpoint needs at least {MIN_ADDRESSES} ip addresses"
            )));
        }
        if input.security_group_ids.is_empty() {
            return Err(invalid_parameter("security_group_ids must not be empty"));
        }

        let prefix = match input.direction {
            Direction::Inbound => "rslvr-in",
            Direction::Outbound => "rslvr-out",
        };
        let id = state.next_id(prefix);
        let arn = self.arn("resolver-endpoint", &id);
        let now = Utc::now();
        let addresses: Vec<IpAddressStatus> = input
            .ip_addresses
            .iter()
            .map(|a| state.allocate(a, now))
            .collect();
        let host_vpc_id = format!(
            "vpc-{}",
            input.ip_addresses[0].subnet_id.trim_start_matches("subnet-")
        );

        let record = EndpointRecord {
            id: id.clone(),
            arn: arn.clone(),
            name: input.name.clone(),
            creator_request_id: input.creator_request_id.clone(),
            direction: input.direction,
            endpoint_type: input.endpoint_type.unwrap_or(EndpointType::Ipv4),
            security_group_ids: input.security_group_ids,
            host_vpc_id,
            ip_address_count: addresses.len() as u32,
            status: EndpointState::Operational,
            status_message: None,
            creation_time: now,
            modification_time: now,
        };

        state.tags.insert(arn, tag_map(&input.tags));
        state.endpoint_tokens.insert(
            input.creator_request_id,
            TokenEntry {
                id: id.clone(),
                name: input.name,
            },
        );
        state.endpoints.insert(
            id,
            StoredEndpoint {
                record: record.clone(),
                addresses,
            },
        );
        Ok(record)
    }

    async fn get_resolver_endpoint(&self, ctx: &CallContext, id: &str) -> Result<EndpointRecord> {
        self.enter(ctx, op::GET_ENDPOINT, id).await?;
        let state = self.state.lock().await;
        Ok(state.endpoint(id)?.record.clone())
    }

    async fn list_resolver_endpoint_ip_addresses(
        &self,
        ctx: &CallContext,
        id: &str,
        next_token: Option<String>,
    ) -> Result<Page<IpAddressStatus>> {
        self.enter(ctx, op::LIST_ENDPOINT_IPS, id).await?;
        let state = self.state.lock().await;
        paginate(&state.endpoint(id)?.addresses, next_token, self.page_size)
    }

    async fn update_resolver_endpoint(
        &self,
        ctx: &CallContext,
        id: &str,
        update: EndpointUpdate,
    ) -> Result<EndpointRecord> {
        self.enter(ctx, op::UPDATE_ENDPOINT, id).await?;
        let mut state = self.state.lock().await;
        let stored = state.endpoint_mut(id)?;
        if let Some(name) = update.name {
            stored.record.name = name;
        }
        if let Some(endpoint_type) = update.endpoint_type {
            stored.record.endpoint_type = endpoint_type;
        }
        stored.record.modification_time = Utc::now();
        Ok(stored.record.clone())
    }

    async fn delete_resolver_endpoint(&self, ctx: &CallContext, id: &str) -> Result<()> {
        self.enter(ctx, op::DELETE_ENDPOINT, id).await?;
        let mut state = self.state.lock().await;
        let stored = state
            .endpoints
            .remove(id)
            .ok_or_else(|| not_found("resolver endpoint", id))?;
        state.tags.remove(&stored.record.arn);
        state.endpoint_tokens.retain(|_, entry| entry.id != id);
        Ok(())
    }

    async fn associate_resolver_endpoint_ip_address(
        &self,
        ctx: &CallContext,
        id: &str,
        address: IpAddressRequest,
    ) -> Result<EndpointRecord> {
        self.enter(ctx, op::ASSOCIATE_IP, id).await?;
        let mut state = self.state.lock().await;
        let present = state
            .endpoint(id)?
            .addresses
            .iter()
            .any(|a| a.subnet_id == address.subnet_id);
        if !present {
            let now = Utc::now();
            let allocated = state.allocate(&address, now);
            let stored = state.endpoint_mut(id)?;
            stored.addresses.push(allocated);
            stored.record.ip_address_count = stored.addresses.len() as u32;
            stored.record.modification_time = now;
        }
        Ok(state.endpoint(id)?.record.clone())
    }

    async fn disassociate_resolver_endpoint_ip_address(
        &self,
        ctx: &CallContext,
        id: &str,
        ip_id: &str,
    ) -> Result<EndpointRecord> {
        self.enter(ctx, op::DISASSOCIATE_IP, id).await?;
        let mut state = self.state.lock().await;
        let stored = state.endpoint_mut(id)?;
        let Some(pos) = stored.addresses.iter().position(|a| a.ip_id == ip_id) else {
            return Ok(stored.record.clone());
        };
        if stored.addresses.len() <= MIN_ADDRESSES {
            return Err(invalid_request(format!(
                "an endpoint must keep at least {MIN_ADDRESSES} ip addresses"
            )));
        }
        stored.addresses.remove(pos);
        stored.record.ip_address_count = stored.addresses.len() as u32;
        stored.record.modification_time = Utc::now();
        Ok(stored.record.clone())
    }

    async fn create_resolver_rule(
        &self,
        ctx: &CallContext,
        input: CreateRuleInput,
    ) -> Result<RuleRecord> {
        self.enter(ctx, op::CREATE_RULE, &input.name).await?;
        let mut state = self.state.lock().await;

        if let Some(entry) = state.rule_tokens.get(&input.creator_request_id) {
            if entry.name != input.name {
                return Err(Error::provider(
                    code::RESOURCE_EXISTS,
                    format!(
                        "creator request id {} was already used",
                        input.creator_request_id
                    ),
                ));
            }
            let id = entry.id.clone();
            return state
                .rules
                .get(&id)
                .cloned()
                .ok_or_else(|| not_found("resolver rule", &id));
        }

        if input.domain_name.is_empty() {
            return Err(invalid_parameter("domain_name must not be empty"));
        }
        match input.rule_type {
            RuleType::Forward => {
                if input.target_ips.is_empty() {
                    return Err(invalid_request("a FORWARD rule needs target ips"));
                }
                let Some(endpoint_id) = &input.resolver_endpoint_id else {
                    return Err(invalid_request("a FORWARD rule needs a resolver endpoint"));
                };
                state.endpoint(endpoint_id)?;
            }
            RuleType::System | RuleType::Recursive => {
                if !input.target_ips.is_empty() {
                    return Err(invalid_request("only FORWARD rules take target ips"));
                }
            }
        }

        let id = state.next_id("rslvr-rr");
        let arn = self.arn("resolver-rule", &id);
        let now = Utc::now();
        let record = RuleRecord {
            id: id.clone(),
            arn: arn.clone(),
            name: input.name.clone(),
            creator_request_id: input.creator_request_id.clone(),
            domain_name: input.domain_name,
            rule_type: input.rule_type,
            resolver_endpoint_id: input.resolver_endpoint_id,
            target_ips: input.target_ips,
            owner_id: self.account_id.clone(),
            share_status: "NOT_SHARED".to_string(),
            status: RuleState::Complete,
            status_message: None,
            creation_time: now,
            modification_time: now,
        };

        state.tags.insert(arn, tag_map(&input.tags));
        state.rule_tokens.insert(
            input.creator_request_id,
            TokenEntry {
                id: id.clone(),
                name: input.name,
            },
        );
        state.rules.insert(id, record.clone());
        Ok(record)
    }

    async fn get_resolver_rule(&self, ctx: &CallContext, id: &str) -> Result<RuleRecord> {
        self.enter(ctx, op::GET_RULE, id).await?;
        let state = self.state.lock().await;
        state
            .rules
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("resolver rule", id))
    }

    async fn update_resolver_rule(
        &self,
        ctx: &CallContext,
        id: &str,
        update: RuleUpdate,
    ) -> Result<RuleRecord> {
        self.enter(ctx, op::UPDATE_RULE, id).await?;
        let mut state = self.state.lock().await;
        if let Some(endpoint_id) = &update.resolver_endpoint_id {
            state.endpoint(endpoint_id)?;
        }
        let rule = state.rule_mut(id)?;
        if rule.rule_type == RuleType::Forward
            && update.target_ips.as_ref().is_some_and(|t| t.is_empty())
        {
            return Err(invalid_request("a FORWARD rule needs target ips"));
        }
        if let Some(name) = update.name {
            rule.name = name;
        }
        if let Some(endpoint_id) = update.resolver_endpoint_id {
            rule.resolver_endpoint_id = Some(endpoint_id);
        }
        if let Some(target_ips) = update.target_ips {
            rule.target_ips = target_ips;
        }
        rule.modification_time = Utc::now();
        Ok(rule.clone())
    }

    async fn delete_resolver_rule(&self, ctx: &CallContext, id: &str) -> Result<()> {
        self.enter(ctx, op::DELETE_RULE, id).await?;
        let mut state = self.state.lock().await;
        let in_use = state
            .associations
            .iter()
            .any(|a| a.rule_id == id && a.status != AssociationStatus::Deleting);
        if in_use {
            return Err(Error::provider(
                code::RESOURCE_IN_USE,
                format!("resolver rule {id} is still associated"),
            ));
        }
        let rule = state
            .rules
            .remove(id)
            .ok_or_else(|| not_found("resolver rule", id))?;
        state.tags.remove(&rule.arn);
        state.associations.retain(|a| a.rule_id != id);
        state.rule_tokens.retain(|_, entry| entry.id != id);
        Ok(())
    }

    async fn associate_resolver_rule(
        &self,
        ctx: &CallContext,
        rule_id: &str,
        vpc_id: &str,
    ) -> Result<RuleAssociationRecord> {
        self.enter(ctx, op::ASSOCIATE_RULE, rule_id).await?;
        let mut state = self.state.lock().await;
        state.rule_mut(rule_id)?;

        let existing = state.associations.iter().find(|a| {
            a.rule_id == rule_id && a.vpc_id == vpc_id && a.status != AssociationStatus::Deleting
        });
        if let Some(existing) = existing {
            return Ok(existing.clone());
        }

        let record = RuleAssociationRecord {
            id: state.next_id("rslvr-rrassoc"),
            rule_id: rule_id.to_string(),
            vpc_id: vpc_id.to_string(),
            status: AssociationStatus::Complete,
            status_message: None,
        };
        state.associations.push(record.clone());
        Ok(record)
    }

    async fn disassociate_resolver_rule(
        &self,
        ctx: &CallContext,
        rule_id: &str,
        vpc_id: &str,
    ) -> Result<RuleAssociationRecord> {
        self.enter(ctx, op::DISASSOCIATE_RULE, rule_id).await?;
        let mut state = self.state.lock().await;
        // Disassociated records stay listed as DELETING.
        let record = state
            .associations
            .iter_mut()
            .rev()
            .find(|a| a.rule_id == rule_id && a.vpc_id == vpc_id)
            .ok_or_else(|| {
                not_found("resolver rule association", &format!("{rule_id}/{vpc_id}"))
            })?;
        record.status = AssociationStatus::Deleting;
        Ok(record.clone())
    }

    async fn list_resolver_rule_associations(
        &self,
        ctx: &CallContext,
        rule_id: &str,
        next_token: Option<String>,
    ) -> Result<Page<RuleAssociationRecord>> {
        self.enter(ctx, op::LIST_RULE_ASSOCIATIONS, rule_id).await?;
        let state = self.state.lock().await;
        let matching: Vec<RuleAssociationRecord> = state
            .associations
            .iter()
            .filter(|a| a.rule_id == rule_id)
            .cloned()
            .collect();
        paginate(&matching, next_token, self.page_size)
    }
}
