//! Manifest loading.
//!
//! A manifest is a JSON document listing the desired resolver resources:
//!
//! ```json
//! { "endpoints": [ ... ], "rules": [ ... ] }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{EndpointSpec, RuleSpec};

/// Errors that can occur while loading a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{kind} has an empty name")]
    EmptyName { kind: &'static str },

    #[error("duplicate {kind} name: {name}")]
    Duplicate { kind: &'static str, name: String },

    /// A rule references an endpoint that is not in the manifest.
    #[error("rule {rule} references unknown endpoint {endpoint}")]
    UnknownEndpoint { rule: String, endpoint: String },

    #[error("rule {0} sets both resolver_endpoint_id and resolver_endpoint_ref")]
    ConflictingEndpoint(String),
}

/// Desired state for every managed resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub endpoints: Vec<EndpointSpec>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest = serde_json::from_str(raw)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Give every resource that has no creation time the time `at`. Create
    /// tokens derive from it, so a stamped resource keeps one token for as
    /// long as this manifest is in use.
    pub fn stamp_creation(&mut self, at: DateTime<Utc>) {
        for endpoint in &mut self.endpoints {
            endpoint.created_at.get_or_insert(at);
        }
        for rule in &mut self.rules {
            rule.created_at.get_or_insert(at);
        }
    }

    /// Names must be unique within a kind, and endpoint references must
    /// point into the manifest.
    pub fn validate(&self) -> Result<(), ManifestError> {
        unique_names("endpoint", self.endpoints.iter().map(|e| e.name.as_str()))?;
        unique_names("rule", self.rules.iter().map(|r| r.name.as_str()))?;

        let endpoints: HashSet<&str> = self.endpoints.iter().map(|e| e.name.as_str()).collect();
        for rule in &self.rules {
            let Some(reference) = &rule.resolver_endpoint_ref else {
                continue;
            };
            if rule.resolver_endpoint_id.is_some() {
                return Err(ManifestError::ConflictingEndpoint(rule.name.clone()));
            }
            if !endpoints.contains(reference.as_str()) {
                return Err(ManifestError::UnknownEndpoint {
                    rule: rule.name.clone(),
                    endpoint: reference.clone(),
                });
            }
        }
        Ok(())
    }
}

fn unique_names<'a>(
    kind: &'static str,
    names: impl Iterator<Item = &'a str>,
) -> Result<(), ManifestError> {
    let mut seen = HashSet::new();
    for name in names {
        if name.is_empty() {
            return Err(ManifestError::EmptyName { kind });
        }
        if !seen.insert(name) {
            return Err(ManifestError::Duplicate {
                kind,
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "endpoints": [{
            "name": "outbound",
            "direction": "OUTBOUND",
            "security_group_ids": ["sg-1"],
            "ip_addresses": [{"subnet_id": "subnet-a"}, {"subnet_id": "subnet-b"}],
            "tags": {"env": "prod"}
        }],
        "rules": [{
            "name": "corp",
            "domain_name": "corp.example.com",
            "rule_type": "FORWARD",
            "resolver_endpoint_ref": "outbound",
            "target_ips": [{"ip": "10.0.0.53"}]
        }]
    }"#;

    #[test]
    fn test_parse_manifest() {
        let manifest = Manifest::from_json(MANIFEST).unwrap();
        assert_eq!(manifest.endpoints.len(), 1);
        assert_eq!(manifest.endpoints[0].ip_addresses.len(), 2);
        assert_eq!(manifest.rules[0].resolver_endpoint_ref.as_deref(), Some("outbound"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut manifest = Manifest::from_json(MANIFEST).unwrap();
        manifest.rules.push(manifest.rules[0].clone());

        let err = manifest.validate().unwrap_err();
        assert!(matches!(err, ManifestError::Duplicate { kind: "rule", .. }));
    }

    #[test]
    fn test_unknown_endpoint_reference_rejected() {
        let mut manifest = Manifest::from_json(MANIFEST).unwrap();
        manifest.rules[0].resolver_endpoint_ref = Some("inbound".to_string());

        let err = manifest.validate().unwrap_err();
        assert!(matches!(err, ManifestError::UnknownEndpoint { .. }));
    }

    #[test]
    fn test_reference_and_id_conflict() {
        let mut manifest = Manifest::from_json(MANIFEST).unwrap();
        manifest.rules[0].resolver_endpoint_id = Some("rslvr-out-1".to_string());

        let err = manifest.validate().unwrap_err();
        assert!(matches!(err, ManifestError::ConflictingEndpoint(_)));
    }

    #[test]
    fn test_stamp_keeps_declared_times() {
        use chrono::TimeZone;

        let declared = Utc.timestamp_millis_opt(1_600_000_000_000).unwrap();
        let now = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let mut manifest = Manifest::from_json(MANIFEST).unwrap();
        assert!(manifest.endpoints[0].created_at.is_none());
        manifest.rules[0].created_at = Some(declared);

        manifest.stamp_creation(now);

        assert_eq!(manifest.endpoints[0].created_at, Some(now));
        assert_eq!(manifest.rules[0].created_at, Some(declared));
    }

    #[test]
    fn test_missing_file() {
        let err = Manifest::load(Path::new("/nonexistent/manifest.json")).unwrap_err();
        assert!(matches!(err, ManifestError::Io { .. }));
    }
}
