//! Tag set synchronisation.
//!
//! Tags are diffed on the full `(key, value)` pair so a changed value shows up
//! as an addition. The provider's add call overwrites, so a key that is being
//! re-added is never also removed.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::CallContext;
use crate::diff::diff;
use crate::error::Result;

/// Key → value tag mapping.
pub type Tags = BTreeMap<String, String>;

/// Single tag as exchanged with the provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Operations needed to bring observed tags to the desired set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDiff {
    /// Tags to add or overwrite.
    pub added: Vec<Tag>,
    /// Keys to remove.
    pub removed: Vec<String>,
}

impl TagDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Remote tagging API for a resource ARN.
#[async_trait]
pub trait TagClient: Send + Sync {
    async fn list_tags(&self, ctx: &CallContext, arn: &str) -> Result<Vec<Tag>>;

    /// Add or overwrite tags in one call.
    async fn tag_resource(&self, ctx: &CallContext, arn: &str, tags: Vec<Tag>) -> Result<()>;

    /// Remove tag keys in one call.
    async fn untag_resource(&self, ctx: &CallContext, arn: &str, keys: Vec<String>) -> Result<()>;
}

fn to_list(tags: &Tags) -> Vec<Tag> {
    tags.iter().map(|(k, v)| Tag::new(k, v)).collect()
}

/// Compute the tag additions and removals.
pub fn tag_diff(desired: &Tags, observed: &Tags) -> TagDiff {
    let d = diff(&to_list(desired), &to_list(observed), |t| {
        (t.key.clone(), t.value.clone())
    });

    let re_added: HashSet<&str> = d.added.iter().map(|t| t.key.as_str()).collect();
    let removed = d
        .removed
        .into_iter()
        .map(|(key, _)| key)
        .filter(|key| !re_added.contains(key.as_str()))
        .collect();

    TagDiff {
        added: d.added,
        removed,
    }
}

/// Read the tag set of `arn` into a map.
pub async fn fetch_tags<C>(ctx: &CallContext, client: &C, arn: &str) -> Result<Tags>
where
    C: TagClient + ?Sized,
{
    let tags = client.list_tags(ctx, arn).await?;
    Ok(tags.into_iter().map(|t| (t.key, t.value)).collect())
}

/// Bring the tags on `arn` to `desired`.
///
/// Issues at most one add call followed by at most one remove call. The
/// first failure aborts; the remove call is not attempted after a failed add.
pub async fn sync_tags<C>(
    ctx: &CallContext,
    client: &C,
    arn: &str,
    desired: &Tags,
    observed: &Tags,
) -> Result<TagDiff>
where
    C: TagClient + ?Sized,
{
    let ops = tag_diff(desired, observed);

    if !ops.added.is_empty() {
        debug!(arn, count = ops.added.len(), "Adding tags");
        client.tag_resource(ctx, arn, ops.added.clone()).await?;
    }

    if !ops.removed.is_empty() {
        debug!(arn, keys = ?ops.removed, "Removing tags");
        client.untag_resource(ctx, arn, ops.removed.clone()).await?;
    }

    Ok(ops)
}
