//! Task outcomes and errors

use std::time::Duration;

use crate::data::{DataError, Envelope, Routing};
use crate::signal::SignalError;
use crate::spec::SpecError;
use crate::store::StoreError;

/// What a task body produced
///
/// Failures travel on the `Err` branch of [`super::BodyResult`]; these are
/// the successful shapes plus the upward control requests.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Normal completion; routing may narrow downstream propagation
    Success { output: Envelope, routing: Routing },

    /// Complete, then stop this DAG after recording the completion
    SuccessStopDag { output: Envelope },

    /// Complete, then request a co-operative stop of the whole run
    SuccessStopWorkflow { output: Envelope },

    /// Terminate the whole run immediately
    AbortWorkflow,
}

impl TaskOutcome {
    /// Success with output and default routing
    pub fn success(output: Envelope) -> Self {
        Self::Success {
            output,
            routing: Routing::all(),
        }
    }

    /// Success with no output
    pub fn empty() -> Self {
        Self::success(Envelope::new())
    }

    /// Success with output and explicit routing
    pub fn routed(output: Envelope, routing: Routing) -> Self {
        Self::Success { output, routing }
    }
}

/// Error type for the task runtime
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The user body failed
    #[error("task body error ({kind}): {message}")]
    Body {
        kind: String,
        message: String,
        recoverable: bool,
    },

    /// Script body names a handler the worker never registered
    #[error("unregistered script handler: {0}")]
    HandlerNotFound(String),

    /// Command body could not be spawned
    #[error("command spawn failed: {0}")]
    Spawn(String),

    /// The task's wall-clock deadline expired
    #[error("task deadline exceeded after {0:?}")]
    Deadline(Duration),

    /// Input selection failed (unknown alias, empty input)
    #[error("data routing error: {0}")]
    Data(#[from] DataError),

    /// Task definition could not be resolved from the worker's library
    #[error("definition error: {0}")]
    Spec(#[from] SpecError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Signal(#[from] SignalError),
}

impl TaskError {
    /// Body failure that retries per policy
    pub fn recoverable(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Body {
            kind: kind.into(),
            message: message.into(),
            recoverable: true,
        }
    }

    /// Body failure that fails immediately, ignoring remaining attempts
    pub fn fatal(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Body {
            kind: kind.into(),
            message: message.into(),
            recoverable: false,
        }
    }

    /// Error kind tag carried on `task-failed` signals
    pub fn kind(&self) -> &str {
        match self {
            Self::Body { kind, .. } => kind,
            Self::HandlerNotFound(_) => "handler_not_found",
            Self::Spawn(_) => "spawn",
            Self::Deadline(_) => "timeout",
            Self::Data(_) => "data_routing",
            Self::Spec(_) => "definition",
            Self::Store(_) => "store",
            Self::Signal(_) => "signal",
        }
    }

    /// Whether the retry policy applies
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Body { recoverable, .. } => *recoverable,
            Self::Deadline(_) | Self::Store(_) | Self::Signal(_) => true,
            Self::HandlerNotFound(_) | Self::Spawn(_) | Self::Data(_) | Self::Spec(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(TaskError::recoverable("io", "boom").kind(), "io");
        assert_eq!(
            TaskError::HandlerNotFound("h".to_string()).kind(),
            "handler_not_found"
        );
        assert_eq!(
            TaskError::Deadline(Duration::from_secs(1)).kind(),
            "timeout"
        );
    }

    #[test]
    fn test_recoverability() {
        assert!(TaskError::recoverable("io", "boom").is_recoverable());
        assert!(!TaskError::fatal("bug", "boom").is_recoverable());
        assert!(TaskError::Deadline(Duration::from_secs(1)).is_recoverable());
        assert!(!TaskError::Data(DataError::EmptyInput).is_recoverable());
    }
}
