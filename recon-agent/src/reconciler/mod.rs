//! Resource managers for the resolver kinds.
//!
//! Each manager plugs one resource kind into [`recon_core::Reconciler`]: it
//! knows how to observe, create, diff, update and delete that kind through
//! the [`ResolverApi`](crate::clients::ResolverApi).

pub mod endpoint;
pub mod rule;

pub use endpoint::EndpointManager;
pub use rule::RuleManager;

use recon_core::{Error, Result};

use crate::clients::resolver::code;

/// Resolver error codes that retrying will not fix.
pub const TERMINAL_CODES: &[&str] = &[
    code::INVALID_PARAMETER,
    code::INVALID_REQUEST,
    code::RESOURCE_EXISTS,
];

/// Provider id of an observed resource, or a validation error if the
/// resource has not been created yet.
fn require<'a>(value: Option<&'a str>, what: &str) -> Result<&'a str> {
    value.ok_or_else(|| Error::Validation(format!("{what} is not known yet")))
}
