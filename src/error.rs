// Error taxonomy of the runtime
//
// Every failure that crosses a frame boundary is an `Error`. Errors are
// cloneable because a single failure may be delivered to several awaiters
// (every caller enrolled in a batch, every clone of a task result).

use std::fmt::{Debug, Display};
use std::sync::Arc;
use thiserror::Error;

/// Errors produced while building or running a runtime
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A plugin is malformed. Raised synchronously while building the runtime.
    #[error("registration error: {0}")]
    Registration(String),

    /// An operation is structurally invalid (core or plugin validator).
    #[error("invalid operation: {0}")]
    Validation(String),

    /// Neither a plugin handler nor a core handler claims the operation kind.
    #[error("unrecognized operation \"{0}\"")]
    UnrecognizedOperation(String),

    /// A runtime primitive was misused.
    #[error("type error: {0}")]
    Type(String),

    /// The stack was canceled before it settled.
    #[error("stack canceled")]
    Cancelled,

    /// Raised by application or handler code.
    #[error("{0}")]
    Failed(Arc<anyhow::Error>),

    /// An error carrying the failures observed while unwinding: the sibling
    /// cancellations of an `all` rejection, or the defers of a canceled
    /// stack.
    #[error("{error} ({} more while unwinding)", .errors.len())]
    Aggregate {
        /// The triggering error.
        error: Box<Error>,
        /// Failures observed while unwinding, the triggering error excluded.
        errors: Vec<Error>,
    },
}

/// Result type for runtime operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Build a user error from a message.
    pub fn msg<M>(message: M) -> Self
    where
        M: Display + Debug + Send + Sync + 'static,
    {
        Error::Failed(Arc::new(anyhow::Error::msg(message)))
    }

    /// Whether this error is the cancellation marker.
    pub fn is_cancellation(&self) -> bool {
        matches!(self.primary(), Error::Cancelled)
    }

    /// The triggering error of an aggregate, `self` otherwise.
    pub fn primary(&self) -> &Error {
        match self {
            Error::Aggregate { error, .. } => error.primary(),
            other => other,
        }
    }

    /// Errors attached while unwinding, empty for non-aggregates.
    pub fn errors(&self) -> &[Error] {
        match self {
            Error::Aggregate { errors, .. } => errors,
            _ => &[],
        }
    }

    /// Identity comparison: two user errors are the same only if they share
    /// the same allocation, other variants compare by kind and message.
    pub fn same(&self, other: &Error) -> bool {
        match (self.primary(), other.primary()) {
            (Error::Failed(a), Error::Failed(b)) => Arc::ptr_eq(a, b),
            (Error::Cancelled, Error::Cancelled) => true,
            (a, b) => {
                std::mem::discriminant(a) == std::mem::discriminant(b)
                    && a.to_string() == b.to_string()
            }
        }
    }

    /// Downcast a user error to a concrete error type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: Display + Debug + Send + Sync + 'static,
    {
        match self.primary() {
            Error::Failed(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    pub(crate) fn with_errors(self, errors: Vec<Error>) -> Error {
        if errors.is_empty() {
            self
        } else {
            Error::Aggregate {
                error: Box::new(self),
                errors,
            }
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(error: anyhow::Error) -> Self {
        Error::Failed(Arc::new(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_errors_compare_by_identity() {
        let boom = Error::msg("boom");
        let other = Error::msg("boom");

        assert!(boom.same(&boom.clone()));
        assert!(!boom.same(&other));
    }

    #[test]
    fn aggregate_exposes_primary_and_errors() {
        let boom = Error::msg("boom");
        let aggregate = boom
            .clone()
            .with_errors(vec![Error::Type("late".into())]);

        assert!(aggregate.same(&boom));
        assert_eq!(aggregate.errors().len(), 1);
        assert!(boom.clone().with_errors(Vec::new()).errors().is_empty());
    }

    #[test]
    fn cancellation_marker_survives_aggregation() {
        let error = Error::Cancelled.with_errors(vec![Error::msg("cleanup")]);
        assert!(error.is_cancellation());
        assert!(!Error::msg("boom").is_cancellation());
    }
}
