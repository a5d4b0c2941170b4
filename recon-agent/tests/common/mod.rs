//! Shared test utilities for recon-agent integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use recon_agent::clients::{MemoryResolver, ResolverApi};
use recon_agent::model::{
    Direction, Endpoint, EndpointSpec, IpAddressRequest, Rule, RuleAssociation, RuleSpec,
    RuleType, TargetAddress,
};
use recon_agent::reconciler::{EndpointManager, RuleManager};
use recon_core::{CallContext, Conditions, Outcome, Reconciled, Reconciler, Tags};

/// Fixed declaration time so request tokens are predictable.
pub fn stamp() -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap()
}

pub fn tags(pairs: &[(&str, &str)]) -> Tags {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn endpoint_spec(name: &str, subnets: &[&str]) -> EndpointSpec {
    EndpointSpec {
        name: name.to_string(),
        created_at: Some(stamp()),
        direction: Direction::Outbound,
        endpoint_type: None,
        security_group_ids: vec!["sg-1".to_string()],
        ip_addresses: subnets
            .iter()
            .map(|s| IpAddressRequest::in_subnet(*s))
            .collect(),
        tags: Tags::new(),
    }
}

pub fn rule_spec(name: &str, endpoint_id: &str, vpcs: &[&str]) -> RuleSpec {
    RuleSpec {
        name: name.to_string(),
        created_at: Some(stamp()),
        domain_name: "corp.example.com".to_string(),
        rule_type: RuleType::Forward,
        resolver_endpoint_id: Some(endpoint_id.to_string()),
        resolver_endpoint_ref: None,
        target_ips: vec![target("10.0.0.53")],
        associations: vpcs.iter().map(|v| RuleAssociation::vpc(*v)).collect(),
        tags: Tags::new(),
    }
}

pub fn target(ip: &str) -> TargetAddress {
    TargetAddress {
        ip: Some(ip.to_string()),
        ipv6: None,
        port: Some(53),
    }
}

/// Subnets of an observed endpoint, sorted.
pub fn subnets(endpoint: &Endpoint) -> Vec<String> {
    let mut subnets: Vec<String> = endpoint
        .spec
        .ip_addresses
        .iter()
        .map(|a| a.subnet_id.clone())
        .collect();
    subnets.sort();
    subnets
}

/// VPCs of an observed rule, sorted.
pub fn vpcs(rule: &Rule) -> Vec<String> {
    let mut vpcs: Vec<String> = rule
        .spec
        .associations
        .iter()
        .map(|a| a.vpc_id.clone())
        .collect();
    vpcs.sort();
    vpcs
}

/// Provider plus one reconciler per kind, with a persisted baseline the way
/// the agent keeps it.
pub struct Harness {
    pub provider: Arc<MemoryResolver>,
    pub endpoints: Reconciler<EndpointManager>,
    pub rules: Reconciler<RuleManager>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_provider(MemoryResolver::default())
    }

    pub fn with_provider(provider: MemoryResolver) -> Self {
        let provider = Arc::new(provider);
        let client: Arc<dyn ResolverApi> = provider.clone();
        Self {
            provider,
            endpoints: Reconciler::new(EndpointManager::new(Arc::clone(&client))),
            rules: Reconciler::new(RuleManager::new(client)),
        }
    }

    pub async fn endpoint_pass(
        &self,
        desired: &EndpointSpec,
        last: Option<&Endpoint>,
    ) -> Reconciled<Endpoint> {
        self.endpoints
            .reconcile(&CallContext::new(), desired, last, &Conditions::new())
            .await
    }

    pub async fn rule_pass(&self, desired: &RuleSpec, last: Option<&Rule>) -> Reconciled<Rule> {
        self.rules
            .reconcile(&CallContext::new(), desired, last, &Conditions::new())
            .await
    }

    /// Create the endpoint and run passes until it converges.
    pub async fn converged_endpoint(&self, desired: &EndpointSpec) -> Endpoint {
        let mut last: Option<Endpoint> = None;
        for _ in 0..5 {
            let result = self.endpoint_pass(desired, last.as_ref()).await;
            last = result.observed;
            if result.outcome == Outcome::Converged {
                // One more read so the baseline carries the listed addresses.
                let observed = self.endpoint_pass(desired, last.as_ref()).await;
                return observed.observed.unwrap();
            }
        }
        panic!("endpoint {} did not converge", desired.name);
    }

    /// Create the rule and run passes until it converges.
    pub async fn converged_rule(&self, desired: &RuleSpec) -> Rule {
        let mut last: Option<Rule> = None;
        for _ in 0..5 {
            let result = self.rule_pass(desired, last.as_ref()).await;
            last = result.observed;
            if result.outcome == Outcome::Converged {
                let observed = self.rule_pass(desired, last.as_ref()).await;
                return observed.observed.unwrap();
            }
        }
        panic!("rule {} did not converge", desired.name);
    }

    /// Operations recorded since the last [`clear`](Self::clear).
    pub async fn ops(&self) -> Vec<&'static str> {
        self.provider.ops().await
    }

    pub async fn clear(&self) {
        self.provider.clear_calls().await;
    }
}
