//! Desired and observed records for the resolver resource kinds.
//!
//! Each kind has a `*Spec` (user intent, loaded from the manifest) and an
//! observed record pairing the spec as the provider reports it with a
//! provider-owned status block.

pub mod endpoint;
pub mod rule;

pub use endpoint::{
    Direction, Endpoint, EndpointSpec, EndpointState, EndpointStatus, EndpointType,
    IpAddressRequest, IpAddressStatus,
};
pub use rule::{
    AssociationKey, AssociationStatus, Rule, RuleAssociation, RuleSpec, RuleState, RuleStatus,
    RuleType, TargetAddress,
};
