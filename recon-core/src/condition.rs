//! Status conditions.
//!
//! A resource carries at most one condition per [`ConditionType`]. Conditions
//! are upserted in place, and a resolved failure is cleared (status false, no
//! message) rather than deleted, so the list records that it happened.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    /// Failure that needs a change to the desired state.
    Terminal,
    /// Transient failure; the scheduler retries.
    Recoverable,
    /// Observed state matches desired state.
    Synced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    pub status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Last time `status` flipped.
    pub last_transition_time: DateTime<Utc>,
}

/// Condition list of one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, kind: ConditionType) -> Option<&Condition> {
        self.0.iter().find(|c| c.kind == kind)
    }

    /// True if the condition exists and its status is set.
    pub fn is_true(&self, kind: ConditionType) -> bool {
        self.get(kind).is_some_and(|c| c.status)
    }

    /// Insert or update the condition of type `kind`.
    pub fn set(&mut self, kind: ConditionType, status: bool, message: Option<String>) {
        let now = Utc::now();
        match self.0.iter_mut().find(|c| c.kind == kind) {
            Some(existing) => {
                if existing.status != status {
                    existing.last_transition_time = now;
                }
                existing.status = status;
                existing.message = message;
            }
            None => self.0.push(Condition {
                kind,
                status,
                message,
                last_transition_time: now,
            }),
        }
    }

    /// Reset an existing condition to false. Absent conditions stay absent.
    pub fn clear(&mut self, kind: ConditionType) {
        if self.get(kind).is_some() {
            self.set(kind, false, None);
        }
    }

    /// Fold the result of a pass into the list.
    ///
    /// A terminal failure raises `Terminal`. A recoverable failure clears
    /// `Terminal` and raises `Recoverable`. Success clears both. `Synced` is
    /// always written.
    pub fn track(&mut self, failure: Option<(&Error, Severity)>, synced: bool, sync_message: Option<String>) {
        match failure {
            Some((err, Severity::Terminal)) => {
                self.set(ConditionType::Terminal, true, Some(err.to_string()));
            }
            Some((err, Severity::Recoverable)) => {
                self.clear(ConditionType::Terminal);
                self.set(ConditionType::Recoverable, true, Some(err.to_string()));
            }
            None => {
                self.clear(ConditionType::Terminal);
                self.clear(ConditionType::Recoverable);
            }
        }
        self.set(ConditionType::Synced, synced, sync_message);
    }
}
