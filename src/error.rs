//! Error types for command dispatch and scheduling.

use crate::types::Node;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for crate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Command dispatcher errors.
    #[error("dispatcher error: {0}")]
    Dispatcher(#[from] DispatcherError),

    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Metadata marshalling errors.
    #[error("marshal error: {0}")]
    Marshal(#[from] MarshalError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Dispatcher-level failures, returned synchronously from a dispatch call.
///
/// These never describe the outcome of a command; they mean the command was
/// not sent at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatcherError {
    /// The dispatcher (or its factory) has been closed.
    #[error("command dispatcher for service '{0}' is closed")]
    Closed(String),

    /// The target is not a member of the current view.
    #[error("unknown target {0}: not a member of the current view")]
    UnknownTarget(Node),

    /// The command could not be serialized.
    #[error("failed to serialize command: {0}")]
    Serialization(String),

    /// A dispatcher for this service id already exists on the factory.
    #[error("a command dispatcher is already registered for service '{0}'")]
    DuplicateService(String),

    /// Too many calls are awaiting a response (backpressure).
    #[error("dispatcher busy: too many pending calls ({pending})")]
    ServerBusy { pending: usize },
}

/// Failure of a single per-target response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// `Command::execute` failed on the target; carries the original error.
    #[error(transparent)]
    Execution(ExecutionError),

    /// The target left the view, the service is not deployed there, or the
    /// dispatcher was closed before a response arrived.
    #[error("command cancelled")]
    Cancelled,

    /// The transport failed to reach a target that is still a view member.
    #[error("target {node} unreachable: {reason}")]
    Unreachable { node: Node, reason: String },

    /// No response arrived within the configured call timeout.
    #[error("command timed out")]
    Timeout,
}

impl CommandError {
    /// Whether this outcome should be treated as "ignore" rather than "error".
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CommandError::Cancelled)
    }

    /// The original execution error, if the command itself failed.
    pub fn execution_error(&self) -> Option<&ExecutionError> {
        match self {
            CommandError::Execution(e) => Some(e),
            _ => None,
        }
    }
}

/// Error returned by `Command::execute`.
///
/// Serializable so that it crosses the wire unchanged: a caller receives the
/// same value whether the command ran locally or on a remote node. Causes are
/// captured once, when the error is built, and never re-wrapped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    message: String,
    cause: Option<Box<ExecutionError>>,
}

impl ExecutionError {
    /// Create an error with a message and no cause.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    /// Attach a cause.
    pub fn with_cause(mut self, cause: ExecutionError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Capture an error and its whole `source()` chain.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        Self {
            message: error.to_string(),
            cause: error.source().map(|source| Box::new(Self::from_error(source))),
        }
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The direct cause, if any.
    pub fn cause(&self) -> Option<&ExecutionError> {
        self.cause.as_deref()
    }

    /// The innermost cause (or `self` when there is none).
    pub fn root_cause(&self) -> &ExecutionError {
        let mut current = self;
        while let Some(cause) = current.cause() {
            current = cause;
        }
        current
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ExecutionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Failed to send message.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Failed to receive message.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The peer answered with an unexpected message.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Metadata wire-format errors.
#[derive(Error, Debug)]
pub enum MarshalError {
    /// Malformed protobuf input.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// A field value is outside its representable range.
    #[error("field {field} out of range: {reason}")]
    OutOfRange { field: u32, reason: String },
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}

impl From<protobuf::ProtobufError> for MarshalError {
    fn from(e: protobuf::ProtobufError) -> Self {
        MarshalError::Malformed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("outer failure")]
    struct Outer(#[source] io::Error);

    #[test]
    fn test_execution_error_captures_source_chain() {
        let err = Outer(io::Error::new(io::ErrorKind::NotFound, "entry missing"));
        let captured = ExecutionError::from_error(&err);

        assert_eq!(captured.message(), "outer failure");
        assert_eq!(captured.cause().map(|c| c.message()), Some("entry missing"));
        assert_eq!(captured.root_cause().message(), "entry missing");
    }

    #[test]
    fn test_execution_error_survives_bincode() {
        let err = ExecutionError::new("remove failed").with_cause(ExecutionError::new("locked"));
        let bytes = bincode::serialize(&err).unwrap();
        let decoded: ExecutionError = bincode::deserialize(&bytes).unwrap();
        assert_eq!(err, decoded);
    }

    #[test]
    fn test_command_error_helpers() {
        assert!(CommandError::Cancelled.is_cancelled());
        let failed = CommandError::Execution(ExecutionError::new("boom"));
        assert!(!failed.is_cancelled());
        assert_eq!(failed.execution_error().map(|e| e.message()), Some("boom"));
        assert_eq!(failed.to_string(), "boom");
    }
}
