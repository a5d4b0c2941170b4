//! Resolver endpoint manager.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recon_core::{
    Applied, CallContext, Changes, Delta, Error, Page, PageSource, Pages, RequestToken,
    ResourceManager, Result, SubCollection, TAGS_PATH, Tag, Tags, fetch_tags, sync_collection,
    sync_tags,
};
use tracing::debug;

use super::{TERMINAL_CODES, require};
use crate::clients::{CreateEndpointInput, EndpointRecord, EndpointUpdate, ResolverApi};
use crate::model::{Endpoint, EndpointSpec, EndpointStatus, IpAddressRequest, IpAddressStatus};

pub const IP_ADDRESSES_PATH: &str = "spec.ip_addresses";
pub const NAME_PATH: &str = "spec.name";
pub const ENDPOINT_TYPE_PATH: &str = "spec.endpoint_type";

/// Pages of one endpoint's addresses.
struct AddressPages<'a> {
    client: &'a dyn ResolverApi,
    endpoint_id: &'a str,
}

#[async_trait]
impl PageSource for AddressPages<'_> {
    type Item = IpAddressStatus;

    async fn fetch_page(
        &self,
        ctx: &CallContext,
        token: Option<String>,
    ) -> Result<Page<IpAddressStatus>> {
        self.client
            .list_resolver_endpoint_ip_addresses(ctx, self.endpoint_id, token)
            .await
    }
}

/// Attaches and detaches endpoint addresses, keyed by subnet.
struct AddressSync<'a> {
    client: &'a dyn ResolverApi,
    endpoint_id: String,
    /// Observed endpoint; its status holds the provider id of each address.
    observed: &'a Endpoint,
}

#[async_trait]
impl SubCollection for AddressSync<'_> {
    type Item = IpAddressRequest;
    type Key = String;
    type Aggregate = u32;

    fn name(&self) -> &'static str {
        "ip_addresses"
    }

    fn key_of(&self, item: &IpAddressRequest) -> String {
        item.subnet_id.clone()
    }

    async fn attach(&self, ctx: &CallContext, item: &IpAddressRequest) -> Result<Option<u32>> {
        let record = self
            .client
            .associate_resolver_endpoint_ip_address(ctx, &self.endpoint_id, item.clone())
            .await?;
        Ok(Some(record.ip_address_count))
    }

    async fn detach(&self, ctx: &CallContext, subnet_id: &String) -> Result<Option<u32>> {
        let ip_id = self.observed.ip_id_for(subnet_id).ok_or_else(|| {
            Error::Validation(format!("no address id recorded for subnet {subnet_id}"))
        })?;
        let record = self
            .client
            .disassociate_resolver_endpoint_ip_address(ctx, &self.endpoint_id, ip_id)
            .await?;
        Ok(Some(record.ip_address_count))
    }
}

fn status_from(record: &EndpointRecord, addresses: Vec<IpAddressStatus>) -> EndpointStatus {
    EndpointStatus {
        id: Some(record.id.clone()),
        arn: Some(record.arn.clone()),
        creator_request_id: Some(record.creator_request_id.clone()),
        host_vpc_id: Some(record.host_vpc_id.clone()),
        ip_address_count: record.ip_address_count,
        status: Some(record.status),
        status_message: record.status_message.clone(),
        creation_time: Some(record.creation_time),
        modification_time: Some(record.modification_time),
        ip_addresses: addresses,
    }
}

/// Fold a provider record into an observed endpoint, keeping what the
/// record does not carry.
fn apply_record(observed: &mut Endpoint, record: &EndpointRecord) {
    let addresses = std::mem::take(&mut observed.status.ip_addresses);
    observed.status = status_from(record, addresses);
    observed.spec.name = record.name.clone();
    observed.spec.endpoint_type = Some(record.endpoint_type);
}

fn tag_list(tags: &Tags) -> Vec<Tag> {
    tags.iter().map(|(k, v)| Tag::new(k, v)).collect()
}

/// Manages resolver endpoints.
pub struct EndpointManager {
    client: Arc<dyn ResolverApi>,
}

impl EndpointManager {
    pub fn new(client: Arc<dyn ResolverApi>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResourceManager for EndpointManager {
    type Desired = EndpointSpec;
    type Observed = Endpoint;

    fn kind(&self) -> &'static str {
        "ResolverEndpoint"
    }

    fn name<'a>(&self, desired: &'a EndpointSpec) -> &'a str {
        &desired.name
    }

    fn created_at(&self, desired: &EndpointSpec) -> Option<DateTime<Utc>> {
        desired.created_at
    }

    fn terminal_codes(&self) -> &'static [&'static str] {
        TERMINAL_CODES
    }

    fn collection_paths(&self) -> &'static [&'static str] {
        &[IP_ADDRESSES_PATH]
    }

    async fn observe(
        &self,
        ctx: &CallContext,
        desired: &EndpointSpec,
        last: Option<&Endpoint>,
    ) -> Result<Option<Endpoint>> {
        let Some(id) = last.and_then(Endpoint::id) else {
            return Ok(None);
        };

        let record = match self.client.get_resolver_endpoint(ctx, id).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                debug!(id, "Endpoint no longer exists");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let source = AddressPages {
            client: self.client.as_ref(),
            endpoint_id: id,
        };
        let addresses = Pages::new(ctx, &source).collect_all().await?;
        let tags = fetch_tags(ctx, self.client.as_ref(), &record.arn).await?;

        let spec = EndpointSpec {
            name: record.name.clone(),
            created_at: desired.created_at,
            direction: record.direction,
            endpoint_type: Some(record.endpoint_type),
            security_group_ids: record.security_group_ids.clone(),
            ip_addresses: addresses.iter().map(IpAddressStatus::to_request).collect(),
            tags,
        };
        Ok(Some(Endpoint {
            spec,
            status: status_from(&record, addresses),
        }))
    }

    async fn create(
        &self,
        ctx: &CallContext,
        desired: &EndpointSpec,
        token: &RequestToken,
    ) -> Result<Endpoint> {
        let input = CreateEndpointInput {
            creator_request_id: token.to_string(),
            name: desired.name.clone(),
            direction: desired.direction,
            endpoint_type: desired.endpoint_type,
            security_group_ids: desired.security_group_ids.clone(),
            ip_addresses: desired.ip_addresses.clone(),
            tags: tag_list(&desired.tags),
        };
        let record = self.client.create_resolver_endpoint(ctx, input).await?;

        // Addresses are only listed by the next observe.
        let mut spec = desired.clone();
        spec.endpoint_type = Some(record.endpoint_type);
        Ok(Endpoint {
            spec,
            status: status_from(&record, Vec::new()),
        })
    }

    fn check_immutable(&self, desired: &EndpointSpec, observed: &Endpoint) -> Result<()> {
        if desired.direction != observed.spec.direction {
            return Err(Error::Terminal(format!(
                "direction cannot change from {:?} to {:?}",
                observed.spec.direction, desired.direction
            )));
        }
        let delta = Delta::builder()
            .compare_unordered(
                "spec.security_group_ids",
                &desired.security_group_ids,
                &observed.spec.security_group_ids,
            )
            .build();
        if !delta.is_empty() {
            return Err(Error::Terminal(
                "security_group_ids cannot change after creation".to_string(),
            ));
        }
        Ok(())
    }

    fn delta(&self, desired: &EndpointSpec, observed: &Endpoint) -> Delta {
        Delta::builder()
            .compare(TAGS_PATH, &desired.tags, &observed.spec.tags)
            .compare_keys(
                IP_ADDRESSES_PATH,
                &desired.ip_addresses,
                &observed.spec.ip_addresses,
                |a| a.subnet_id.clone(),
            )
            .compare(NAME_PATH, &desired.name, &observed.spec.name)
            .compare_if_set(
                ENDPOINT_TYPE_PATH,
                &desired.endpoint_type,
                &observed.spec.endpoint_type,
            )
            .build()
    }

    async fn sync_tags(
        &self,
        ctx: &CallContext,
        desired: &EndpointSpec,
        observed: &Endpoint,
    ) -> Result<Endpoint> {
        let arn = require(observed.status.arn.as_deref(), "endpoint ARN")?;
        sync_tags(ctx, self.client.as_ref(), arn, &desired.tags, &observed.spec.tags).await?;

        let mut updated = observed.clone();
        updated.spec.tags = desired.tags.clone();
        Ok(updated)
    }

    async fn sync_collections(
        &self,
        ctx: &CallContext,
        desired: &EndpointSpec,
        observed: Endpoint,
        _delta: &Delta,
    ) -> Applied<Endpoint> {
        let endpoint_id = match require(observed.id(), "endpoint id") {
            Ok(id) => id.to_string(),
            Err(e) => return Applied::failed(observed, false, e),
        };
        let syncer = AddressSync {
            client: self.client.as_ref(),
            endpoint_id,
            observed: &observed,
        };

        let progress = sync_collection(
            ctx,
            &syncer,
            &desired.ip_addresses,
            &observed.spec.ip_addresses,
        )
        .await;

        let mut updated = observed;
        updated.spec.ip_addresses =
            progress.merge_into(&updated.spec.ip_addresses, |a| a.subnet_id.clone());
        updated
            .status
            .ip_addresses
            .retain(|a| !progress.detached.contains(&a.subnet_id));
        if let Some(count) = progress.aggregate {
            updated.status.ip_address_count = count;
        }

        let changed = progress.changed();
        match progress.error {
            Some(e) => Applied::failed(updated, changed, e),
            None => Applied::ok(updated, changed),
        }
    }

    async fn update(
        &self,
        ctx: &CallContext,
        desired: &EndpointSpec,
        observed: &Endpoint,
        delta: &Delta,
    ) -> Result<Endpoint> {
        let id = require(observed.id(), "endpoint id")?;
        let update = EndpointUpdate {
            name: delta
                .different_at(NAME_PATH)
                .then(|| desired.name.clone()),
            endpoint_type: if delta.different_at(ENDPOINT_TYPE_PATH) {
                desired.endpoint_type
            } else {
                None
            },
        };
        let record = self.client.update_resolver_endpoint(ctx, id, update).await?;

        let mut updated = observed.clone();
        apply_record(&mut updated, &record);
        Ok(updated)
    }

    async fn delete(&self, ctx: &CallContext, observed: &Endpoint) -> Result<()> {
        let Some(id) = observed.id() else {
            return Ok(());
        };
        self.client.delete_resolver_endpoint(ctx, id).await
    }

    fn needs_refresh(&self, changes: &Changes) -> bool {
        changes.collections
    }

    fn settled(&self, observed: &Endpoint) -> bool {
        observed
            .status
            .status
            .is_none_or(|s| !s.is_transitional())
    }
}
