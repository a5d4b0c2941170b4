//! Resolver rule records.

use chrono::{DateTime, Utc};
use recon_core::Tags;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    Forward,
    System,
    Recursive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleState {
    Complete,
    Deleting,
    Updating,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssociationStatus {
    Creating,
    Complete,
    Deleting,
    Failed,
    Overridden,
}

/// Upstream resolver a forward rule sends queries to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetAddress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Natural key of a rule association.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AssociationKey {
    Vpc(String),
}

/// Something the rule should be associated with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleAssociation {
    pub vpc_id: String,
}

impl RuleAssociation {
    pub fn vpc(vpc_id: impl Into<String>) -> Self {
        Self {
            vpc_id: vpc_id.into(),
        }
    }

    pub fn key(&self) -> AssociationKey {
        AssociationKey::Vpc(self.vpc_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub domain_name: String,
    pub rule_type: RuleType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver_endpoint_id: Option<String>,
    /// Name of an endpoint in the same manifest. Resolved to
    /// `resolver_endpoint_id` before each pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver_endpoint_ref: Option<String>,
    #[serde(default)]
    pub target_ips: Vec<TargetAddress>,
    #[serde(default)]
    pub associations: Vec<RuleAssociation>,
    #[serde(default)]
    pub tags: Tags,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleStatus {
    pub id: Option<String>,
    pub arn: Option<String>,
    pub creator_request_id: Option<String>,
    pub owner_id: Option<String>,
    pub share_status: Option<String>,
    pub status: Option<RuleState>,
    pub status_message: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
    pub modification_time: Option<DateTime<Utc>>,
}

/// Observed resolver rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub spec: RuleSpec,
    pub status: RuleStatus,
}

impl Rule {
    pub fn id(&self) -> Option<&str> {
        self.status.id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_from_json_defaults() {
        let spec: RuleSpec = serde_json::from_str(
            r#"{
                "name": "corp",
                "domain_name": "corp.example.com",
                "rule_type": "FORWARD",
                "target_ips": [{"ip": "10.0.0.53", "port": 53}],
                "associations": [{"vpc_id": "vpc-1"}]
            }"#,
        )
        .unwrap();

        assert_eq!(spec.rule_type, RuleType::Forward);
        assert!(spec.tags.is_empty());
        assert!(spec.resolver_endpoint_id.is_none());
        assert_eq!(spec.target_ips[0].port, Some(53));
        assert_eq!(spec.associations[0].key(), AssociationKey::Vpc("vpc-1".into()));
    }
}
