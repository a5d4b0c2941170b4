//! Natural-key set difference.
//!
//! Sub-items are compared by a projection (their natural key), not by full
//! equality. An item whose key exists on both sides is left alone even if its
//! other fields differ.

use std::collections::HashSet;
use std::hash::Hash;

/// Partition of a sub-collection into what must be attached, detached, or
/// left in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionDiff<T, K> {
    /// Desired items whose key is absent from the observed side.
    pub added: Vec<T>,
    /// Observed keys absent from the desired side.
    pub removed: Vec<K>,
    /// Keys present on both sides.
    pub kept: Vec<K>,
}

impl<T, K> CollectionDiff<T, K> {
    /// True when no attach or detach is needed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl<T, K> Default for CollectionDiff<T, K> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            removed: Vec::new(),
            kept: Vec::new(),
        }
    }
}

/// Compute the natural-key difference between `desired` and `observed`.
///
/// Output order follows input order (`added` in desired order, `removed` and
/// `kept` in observed order). Duplicate keys on either side collapse to their
/// first occurrence.
pub fn diff<T, K, F>(desired: &[T], observed: &[T], key_of: F) -> CollectionDiff<T, K>
where
    T: Clone,
    K: Eq + Hash + Clone,
    F: Fn(&T) -> K,
{
    let desired_keys: HashSet<K> = desired.iter().map(&key_of).collect();
    let observed_keys: HashSet<K> = observed.iter().map(&key_of).collect();

    let mut out = CollectionDiff::default();

    let mut seen = HashSet::new();
    for item in desired {
        let key = key_of(item);
        if !observed_keys.contains(&key) && seen.insert(key) {
            out.added.push(item.clone());
        }
    }

    let mut seen = HashSet::new();
    for item in observed {
        let key = key_of(item);
        if !seen.insert(key.clone()) {
            continue;
        }
        if desired_keys.contains(&key) {
            out.kept.push(key);
        } else {
            out.removed.push(key);
        }
    }

    out
}
