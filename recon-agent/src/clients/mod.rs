//! Clients for the resolver control plane.
//!
//! - [`resolver`]: the remote API surface the resource managers call
//! - [`memory`]: an in-process provider implementing that surface

pub mod memory;
pub mod resolver;

pub use memory::{Call, MemoryResolver};
pub use resolver::{
    CreateEndpointInput, CreateRuleInput, EndpointRecord, EndpointUpdate, ResolverApi,
    RuleAssociationRecord, RuleRecord, RuleUpdate, code, op,
};
