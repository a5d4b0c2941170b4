//! Requeue signal handed back to the scheduler.

use std::time::Duration;

/// Result of one convergence pass, from the scheduler's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Observed state matches desired state. No requeue needed.
    Converged,
    /// Run another pass later. `after` is a hint; `None` means "use backoff".
    Retry {
        after: Option<Duration>,
        reason: String,
    },
    /// Stop retrying until the desired state changes.
    Fatal { reason: String },
}

impl Outcome {
    pub fn retry(reason: impl Into<String>) -> Self {
        Outcome::Retry {
            after: None,
            reason: reason.into(),
        }
    }

    pub fn retry_after(after: Duration, reason: impl Into<String>) -> Self {
        Outcome::Retry {
            after: Some(after),
            reason: reason.into(),
        }
    }

    pub fn is_converged(&self) -> bool {
        matches!(self, Outcome::Converged)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Outcome::Fatal { .. })
    }
}
