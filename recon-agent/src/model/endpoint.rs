//! Resolver endpoint records.

use chrono::{DateTime, Utc};
use recon_core::Tags;
use serde::{Deserialize, Serialize};

/// Direction of DNS traffic through the endpoint. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndpointType {
    Ipv4,
    Ipv6,
    Dualstack,
}

/// Provider-side lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndpointState {
    Creating,
    Operational,
    Updating,
    AutoRecovering,
    ActionNeeded,
    Deleting,
}

impl EndpointState {
    /// True while the provider is still working on the endpoint.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            EndpointState::Creating
                | EndpointState::Updating
                | EndpointState::AutoRecovering
                | EndpointState::Deleting
        )
    }
}

/// An address the endpoint should hold, one per subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddressRequest {
    pub subnet_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
}

impl IpAddressRequest {
    pub fn in_subnet(subnet_id: impl Into<String>) -> Self {
        Self {
            subnet_id: subnet_id.into(),
            ip: None,
            ipv6: None,
        }
    }
}

/// Provider record for one attached address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddressStatus {
    pub ip_id: String,
    pub subnet_id: String,
    pub ip: Option<String>,
    pub ipv6: Option<String>,
    pub status: String,
    pub status_message: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
    pub modification_time: Option<DateTime<Utc>>,
}

impl IpAddressStatus {
    /// The address as it would appear in a spec.
    pub fn to_request(&self) -> IpAddressRequest {
        IpAddressRequest {
            subnet_id: self.subnet_id.clone(),
            ip: self.ip.clone(),
            ipv6: self.ipv6.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub name: String,
    /// When the object was declared. Keeps the create request token stable
    /// across passes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_type: Option<EndpointType>,
    #[serde(default)]
    pub security_group_ids: Vec<String>,
    #[serde(default)]
    pub ip_addresses: Vec<IpAddressRequest>,
    #[serde(default)]
    pub tags: Tags,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub id: Option<String>,
    pub arn: Option<String>,
    pub creator_request_id: Option<String>,
    pub host_vpc_id: Option<String>,
    pub ip_address_count: u32,
    pub status: Option<EndpointState>,
    pub status_message: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
    pub modification_time: Option<DateTime<Utc>>,
    /// Per-address provider records, parallel to `spec.ip_addresses`.
    #[serde(default)]
    pub ip_addresses: Vec<IpAddressStatus>,
}

/// Observed resolver endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub spec: EndpointSpec,
    pub status: EndpointStatus,
}

impl Endpoint {
    pub fn id(&self) -> Option<&str> {
        self.status.id.as_deref()
    }

    /// Provider address id of the address held in `subnet_id`.
    pub fn ip_id_for(&self, subnet_id: &str) -> Option<&str> {
        self.status
            .ip_addresses
            .iter()
            .find(|a| a.subnet_id == subnet_id)
            .map(|a| a.ip_id.as_str())
    }
}
