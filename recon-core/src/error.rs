//! Engine error types.

use thiserror::Error;

/// Provider error code meaning "the resource does not exist".
pub const NOT_FOUND_CODE: &str = "ResourceNotFoundException";

/// Errors that can occur during a convergence pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Resource does not exist remotely. Triggers the create path when
    /// returned by an observer.
    #[error("resource not found")]
    NotFound,

    /// Error returned by the remote provider.
    #[error("{code}: {message}")]
    Provider { code: String, message: String },

    /// A required field is missing before any remote call could be made.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The desired state can never be applied without user intervention.
    #[error("terminal: {0}")]
    Terminal(String),

    /// The caller's deadline expired while a remote call was in flight.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The caller cancelled the pass.
    #[error("cancelled")]
    Cancelled,
}

/// How the scheduler should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Retry later with backoff.
    Recoverable,
    /// Stop retrying until the desired state changes.
    Terminal,
}

impl Error {
    /// Build a provider error from a code and message.
    pub fn provider(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Provider {
            code: code.into(),
            message: message.into(),
        }
    }

    /// The provider error code, if this is a provider error.
    pub fn code(&self) -> Option<&str> {
        match self {
            Error::Provider { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Fold the provider's "does not exist" code into [`Error::NotFound`].
    pub fn normalize_not_found(self) -> Self {
        match self.code() {
            Some(NOT_FOUND_CODE) => Error::NotFound,
            _ => self,
        }
    }

    /// True if this error means the resource does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound) || self.code() == Some(NOT_FOUND_CODE)
    }

    /// Classify the error. `terminal_codes` lists the provider codes the
    /// resource kind considers unrecoverable.
    pub fn severity(&self, terminal_codes: &[&str]) -> Severity {
        match self {
            Error::Terminal(_) => Severity::Terminal,
            Error::Provider { code, .. } if terminal_codes.contains(&code.as_str()) => {
                Severity::Terminal
            }
            _ => Severity::Recoverable,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_code_is_normalized() {
        let err = Error::provider(NOT_FOUND_CODE, "no such endpoint").normalize_not_found();
        assert_eq!(err, Error::NotFound);

        let other = Error::provider("ThrottlingException", "slow down").normalize_not_found();
        assert_eq!(other.code(), Some("ThrottlingException"));
    }

    #[test]
    fn test_severity() {
        let codes = ["InvalidParameterException"];
        assert_eq!(
            Error::provider("InvalidParameterException", "bad").severity(&codes),
            Severity::Terminal
        );
        assert_eq!(
            Error::provider("ThrottlingException", "slow").severity(&codes),
            Severity::Recoverable
        );
        assert_eq!(
            Error::Terminal("immutable".into()).severity(&[]),
            Severity::Terminal
        );
        // Missing identity may resolve once create completes.
        assert_eq!(
            Error::Validation("id missing".into()).severity(&codes),
            Severity::Recoverable
        );
        assert_eq!(Error::DeadlineExceeded.severity(&codes), Severity::Recoverable);
    }

    #[test]
    fn test_display() {
        let err = Error::provider("ThrottlingException", "Rate exceeded");
        assert_eq!(err.to_string(), "ThrottlingException: Rate exceeded");
    }
}
