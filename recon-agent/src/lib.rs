//! recon-agent: keeps resolver endpoints and rules converged on a manifest.
//!
//! The agent loads a JSON manifest of desired resources, runs one
//! long-lived task per resource and drives each through
//! [`recon_core::Reconciler`] passes against a [`clients::ResolverApi`].

pub mod agent;
pub mod clients;
pub mod manifest;
pub mod model;
pub mod reconciler;

pub use agent::{Agent, AgentConfig, StatusTable, Summary};
pub use manifest::{Manifest, ManifestError};
