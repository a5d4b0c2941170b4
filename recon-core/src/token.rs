//! Idempotency tokens for create calls.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Caller-supplied idempotency key attached to a create call. The provider
/// deduplicates creates carrying the same token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestToken(String);

impl RequestToken {
    /// `<name>-<unix millis>`.
    pub fn new(name: &str, stamp: DateTime<Utc>) -> Self {
        Self(format!("{}-{}", name, stamp.timestamp_millis()))
    }

    /// Token for a resource. Stable across passes when the resource carries
    /// its own creation timestamp; otherwise stamped with the current time,
    /// so it must be generated once per pass and reused within it.
    pub fn for_resource(name: &str, created_at: Option<DateTime<Utc>>) -> Self {
        Self::new(name, created_at.unwrap_or_else(Utc::now))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(
            RequestToken::new("edge-resolver", at).as_str(),
            "edge-resolver-1700000000123"
        );
    }

    #[test]
    fn test_stable_with_creation_time() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        assert_eq!(
            RequestToken::for_resource("r", Some(at)),
            RequestToken::for_resource("r", Some(at))
        );
    }
}
