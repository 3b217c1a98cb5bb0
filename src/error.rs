// Error taxonomy for the engine
//
// Usage errors, generator errors, defer errors and cancellation all travel
// through the same result channel as ordinary values. The enum is `Clone` so a
// settled task result can be observed by any number of awaiters.

use std::fmt::{Debug, Display};
use std::sync::Arc;

use thiserror::Error;

/// Errors produced while driving generators
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("next: should be used only in handlers")]
    NextOutsideHandler,

    #[error("next: operation kind mismatch, expected \"{expected}\", got \"{got}\"")]
    NextKindMismatch { expected: String, got: String },

    #[error("unrecognized operation kind \"{0}\"")]
    UnrecognizedOperation(String),

    #[error("terminal: {0} operations cannot be terminal")]
    ForbiddenTerminal(String),

    #[error("{operation}: {message}")]
    Usage {
        operation: &'static str,
        message: String,
    },

    #[error("task was cancelled")]
    Cancelled,

    #[error("generator was interrupted by a forced return")]
    Interrupted,

    #[error("task did not cancel properly: {0}")]
    CancelFailed(Box<Error>),

    #[error("deferred operation failed: {error} (masking: {masked})")]
    Deferred { error: Box<Error>, masked: Box<Error> },

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Application(Arc<anyhow::Error>),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Application error from a message.
    pub fn msg(message: impl Display + Debug + Send + Sync + 'static) -> Self {
        Error::Application(Arc::new(anyhow::Error::msg(message)))
    }

    pub(crate) fn usage(operation: &'static str, message: impl Into<String>) -> Self {
        Error::Usage {
            operation,
            message: message.into(),
        }
    }

    /// Whether the error reports a task that settled because it was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Whether the error reports a misuse of the engine rather than a failure
    /// of application code.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Error::NextOutsideHandler
                | Error::NextKindMismatch { .. }
                | Error::UnrecognizedOperation(_)
                | Error::ForbiddenTerminal(_)
                | Error::Usage { .. }
        )
    }

    /// Borrow the application error, if any.
    pub fn as_application(&self) -> Option<&anyhow::Error> {
        match self {
            Error::Application(error) => Some(error.as_ref()),
            _ => None,
        }
    }

    /// Whether two errors are the same failure. Application errors are the
    /// same only when they share one underlying error; the engine's own
    /// variants compare by their fields.
    pub fn same(&self, other: &Error) -> bool {
        match (self, other) {
            (Error::Application(a), Error::Application(b)) => Arc::ptr_eq(a, b),
            (Error::CancelFailed(a), Error::CancelFailed(b)) => a.same(b),
            (
                Error::Deferred { error: a, masked: x },
                Error::Deferred { error: b, masked: y },
            ) => a.same(b) && x.same(y),
            (Error::Application(_) | Error::CancelFailed(_) | Error::Deferred { .. }, _) => false,
            (a, b) => {
                std::mem::discriminant(a) == std::mem::discriminant(b)
                    && a.to_string() == b.to_string()
            }
        }
    }

    /// Outgoing error of a frame whose deferred operation failed, given what
    /// the frame was about to deliver. A prior error is kept as `masked`.
    pub(crate) fn deferred<T>(error: Error, prior: std::result::Result<T, Error>) -> Self {
        match prior {
            Ok(_) => error,
            Err(masked) => Error::Deferred {
                error: Box::new(error),
                masked: Box::new(masked),
            },
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(error: anyhow::Error) -> Self {
        Error::Application(Arc::new(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferred_error_overrides_success() {
        let error = Error::deferred(Error::msg("cleanup"), Ok::<_, Error>(()));
        assert_eq!(error.to_string(), "cleanup");
    }

    #[test]
    fn deferred_error_chains_onto_failure() {
        let error = Error::deferred(Error::msg("cleanup"), Err::<(), _>(Error::msg("body")));
        match error {
            Error::Deferred { error, masked } => {
                assert_eq!(error.to_string(), "cleanup");
                assert_eq!(masked.to_string(), "body");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn classification() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::msg("x").is_cancelled());
        assert!(Error::UnrecognizedOperation("x".into()).is_usage());
        assert!(!Error::Interrupted.is_usage());
        assert!(Error::msg("boom").as_application().is_some());
    }
}
