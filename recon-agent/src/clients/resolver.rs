//! Remote resolver API surface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recon_core::{CallContext, Page, Result, Tag, TagClient};

use crate::model::{
    AssociationStatus, Direction, EndpointState, EndpointType, IpAddressRequest,
    IpAddressStatus, RuleState, RuleType, TargetAddress,
};

/// Operation names, as recorded in call logs and used for fault injection.
pub mod op {
    pub const CREATE_ENDPOINT: &str = "CreateResolverEndpoint";
    pub const GET_ENDPOINT: &str = "GetResolverEndpoint";
    pub const LIST_ENDPOINT_IPS: &str = "ListResolverEndpointIpAddresses";
    pub const UPDATE_ENDPOINT: &str = "UpdateResolverEndpoint";
    pub const DELETE_ENDPOINT: &str = "DeleteResolverEndpoint";
    pub const ASSOCIATE_IP: &str = "AssociateResolverEndpointIpAddress";
    pub const DISASSOCIATE_IP: &str = "DisassociateResolverEndpointIpAddress";
    pub const CREATE_RULE: &str = "CreateResolverRule";
    pub const GET_RULE: &str = "GetResolverRule";
    pub const UPDATE_RULE: &str = "UpdateResolverRule";
    pub const DELETE_RULE: &str = "DeleteResolverRule";
    pub const ASSOCIATE_RULE: &str = "AssociateResolverRule";
    pub const DISASSOCIATE_RULE: &str = "DisassociateResolverRule";
    pub const LIST_RULE_ASSOCIATIONS: &str = "ListResolverRuleAssociations";
    pub const LIST_TAGS: &str = "ListTagsForResource";
    pub const TAG: &str = "TagResource";
    pub const UNTAG: &str = "UntagResource";
}

/// Provider error codes used by the resolver API.
pub mod code {
    pub const INVALID_PARAMETER: &str = "InvalidParameterException";
    pub const INVALID_REQUEST: &str = "InvalidRequestException";
    pub const INVALID_NEXT_TOKEN: &str = "InvalidNextTokenException";
    pub const RESOURCE_EXISTS: &str = "ResourceExistsException";
    pub const RESOURCE_IN_USE: &str = "ResourceInUseException";
    pub const THROTTLING: &str = "ThrottlingException";
    pub use recon_core::NOT_FOUND_CODE as RESOURCE_NOT_FOUND;
}

/// Endpoint as returned by get/create/update and the address calls.
/// Addresses are listed separately.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointRecord {
    pub id: String,
    pub arn: String,
    pub name: String,
    pub creator_request_id: String,
    pub direction: Direction,
    pub endpoint_type: EndpointType,
    pub security_group_ids: Vec<String>,
    pub host_vpc_id: String,
    pub ip_address_count: u32,
    pub status: EndpointState,
    pub status_message: Option<String>,
    pub creation_time: DateTime<Utc>,
    pub modification_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateEndpointInput {
    pub creator_request_id: String,
    pub name: String,
    pub direction: Direction,
    pub endpoint_type: Option<EndpointType>,
    pub security_group_ids: Vec<String>,
    pub ip_addresses: Vec<IpAddressRequest>,
    pub tags: Vec<Tag>,
}

/// Fields of an endpoint that can change after creation. `None` leaves a
/// field as it is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointUpdate {
    pub name: Option<String>,
    pub endpoint_type: Option<EndpointType>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleRecord {
    pub id: String,
    pub arn: String,
    pub name: String,
    pub creator_request_id: String,
    pub domain_name: String,
    pub rule_type: RuleType,
    pub resolver_endpoint_id: Option<String>,
    pub target_ips: Vec<TargetAddress>,
    pub owner_id: String,
    pub share_status: String,
    pub status: RuleState,
    pub status_message: Option<String>,
    pub creation_time: DateTime<Utc>,
    pub modification_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateRuleInput {
    pub creator_request_id: String,
    pub name: String,
    pub domain_name: String,
    pub rule_type: RuleType,
    pub resolver_endpoint_id: Option<String>,
    pub target_ips: Vec<TargetAddress>,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleUpdate {
    pub name: Option<String>,
    pub resolver_endpoint_id: Option<String>,
    pub target_ips: Option<Vec<TargetAddress>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleAssociationRecord {
    pub id: String,
    pub rule_id: String,
    pub vpc_id: String,
    pub status: AssociationStatus,
    pub status_message: Option<String>,
}

/// Resolver control-plane operations.
///
/// Every call takes the pass's [`CallContext`] and must honour its deadline
/// and cancellation. Errors carry the provider's error code; a missing
/// resource is reported with [`code::RESOURCE_NOT_FOUND`].
#[async_trait]
pub trait ResolverApi: TagClient {
    async fn create_resolver_endpoint(
        &self,
        ctx: &CallContext,
        input: CreateEndpointInput,
    ) -> Result<EndpointRecord>;

    async fn get_resolver_endpoint(&self, ctx: &CallContext, id: &str) -> Result<EndpointRecord>;

    async fn list_resolver_endpoint_ip_addresses(
        &self,
        ctx: &CallContext,
        id: &str,
        next_token: Option<String>,
    ) -> Result<Page<IpAddressStatus>>;

    async fn update_resolver_endpoint(
        &self,
        ctx: &CallContext,
        id: &str,
        update: EndpointUpdate,
    ) -> Result<EndpointRecord>;

    async fn delete_resolver_endpoint(&self, ctx: &CallContext, id: &str) -> Result<()>;

    /// Attach one address. Returns the endpoint with its new address count.
    async fn associate_resolver_endpoint_ip_address(
        &self,
        ctx: &CallContext,
        id: &str,
        address: IpAddressRequest,
    ) -> Result<EndpointRecord>;

    /// Detach one address by its provider id.
    async fn disassociate_resolver_endpoint_ip_address(
        &self,
        ctx: &CallContext,
        id: &str,
        ip_id: &str,
    ) -> Result<EndpointRecord>;

    async fn create_resolver_rule(
        &self,
        ctx: &CallContext,
        input: CreateRuleInput,
    ) -> Result<RuleRecord>;

    async fn get_resolver_rule(&self, ctx: &CallContext, id: &str) -> Result<RuleRecord>;

    async fn update_resolver_rule(
        &self,
        ctx: &CallContext,
        id: &str,
        update: RuleUpdate,
    ) -> Result<RuleRecord>;

    async fn delete_resolver_rule(&self, ctx: &CallContext, id: &str) -> Result<()>;

    async fn associate_resolver_rule(
        &self,
        ctx: &CallContext,
        rule_id: &str,
        vpc_id: &str,
    ) -> Result<RuleAssociationRecord>;

    async fn disassociate_resolver_rule(
        &self,
        ctx: &CallContext,
        rule_id: &str,
        vpc_id: &str,
    ) -> Result<RuleAssociationRecord>;

    /// Associations of one rule, one page at a time.
    async fn list_resolver_rule_associations(
        &self,
        ctx: &CallContext,
        rule_id: &str,
        next_token: Option<String>,
    ) -> Result<Page<RuleAssociationRecord>>;
}
