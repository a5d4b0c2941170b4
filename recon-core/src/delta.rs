//! Field-level difference between a desired and an observed record.
//!
//! Paths are dotted (`spec.tags`, `spec.target_ips`). A query for a path
//! matches that path and everything below it.

use std::collections::BTreeSet;

/// Set of paths at which desired and observed differ.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    differences: Vec<&'static str>,
}

fn covers(prefix: &str, path: &str) -> bool {
    path == prefix
        || (path.len() > prefix.len()
            && path.starts_with(prefix)
            && path.as_bytes()[prefix.len()] == b'.')
}

impl Delta {
    pub fn builder() -> DeltaBuilder {
        DeltaBuilder::default()
    }

    pub fn is_empty(&self) -> bool {
        self.differences.is_empty()
    }

    /// Paths that differ, in the order they were compared.
    pub fn paths(&self) -> &[&'static str] {
        &self.differences
    }

    /// True if anything at or below `path` differs.
    pub fn different_at(&self, path: &str) -> bool {
        self.differences.iter().any(|d| covers(path, d))
    }

    /// True if anything differs outside of `paths`.
    pub fn different_except(&self, paths: &[&str]) -> bool {
        self.differences
            .iter()
            .any(|d| !paths.iter().any(|p| covers(p, d)))
    }
}

/// Accumulates comparisons into a [`Delta`].
#[derive(Debug, Default)]
pub struct DeltaBuilder {
    delta: Delta,
}

impl DeltaBuilder {
    fn record(mut self, path: &'static str, differs: bool) -> Self {
        if differs && !self.delta.differences.contains(&path) {
            self.delta.differences.push(path);
        }
        self
    }

    /// Plain equality.
    pub fn compare<T: PartialEq + ?Sized>(self, path: &'static str, desired: &T, observed: &T) -> Self {
        self.record(path, desired != observed)
    }

    /// Compare only when the desired side sets a value. Used for fields the
    /// provider defaults when the user leaves them out.
    pub fn compare_if_set<T: PartialEq>(
        self,
        path: &'static str,
        desired: &Option<T>,
        observed: &Option<T>,
    ) -> Self {
        let differs = desired.is_some() && desired != observed;
        self.record(path, differs)
    }

    /// Order-insensitive comparison of two lists.
    pub fn compare_unordered<T: Ord>(self, path: &'static str, desired: &[T], observed: &[T]) -> Self {
        let a: BTreeSet<&T> = desired.iter().collect();
        let b: BTreeSet<&T> = observed.iter().collect();
        self.record(path, a != b)
    }

    /// Compare two collections by the set of their natural keys.
    pub fn compare_keys<T, K, F>(self, path: &'static str, desired: &[T], observed: &[T], key_of: F) -> Self
    where
        K: Ord,
        F: Fn(&T) -> K,
    {
        let a: BTreeSet<K> = desired.iter().map(&key_of).collect();
        let b: BTreeSet<K> = observed.iter().map(&key_of).collect();
        self.record(path, a != b)
    }

    pub fn build(self) -> Delta {
        self.delta
    }
}
