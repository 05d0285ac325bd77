//! Error types for the interpreter bridge

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::schema::ArgumentError;

/// Category of a failed execution, carried by `RunError` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    /// Script failed to parse
    Syntax,
    /// Script referenced a variable or function that does not exist
    UndefinedReference,
    /// Engine error while evaluating
    Runtime,
    /// Value thrown by the script itself
    Thrown,
    /// Memory, stack depth or operation ceiling hit
    LimitExceeded,
    TimedOut,
    Cancelled,
    /// Script called a host function that is not registered
    UnknownFunction,
    /// Bridge is already executing and is not re-entrant
    Busy,
    Disposed,
    /// Interpreter worker panicked or the bridge lost it
    Internal,
}

impl RunErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunErrorKind::Syntax => "syntax",
            RunErrorKind::UndefinedReference => "undefined_reference",
            RunErrorKind::Runtime => "runtime",
            RunErrorKind::Thrown => "thrown",
            RunErrorKind::LimitExceeded => "limit_exceeded",
            RunErrorKind::TimedOut => "timed_out",
            RunErrorKind::Cancelled => "cancelled",
            RunErrorKind::UnknownFunction => "unknown_function",
            RunErrorKind::Busy => "busy",
            RunErrorKind::Disposed => "disposed",
            RunErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for RunErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed script execution
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ScriptError {
    pub kind: RunErrorKind,
    pub message: String,
}

impl ScriptError {
    pub fn new(kind: RunErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Why an execution was stopped from the outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    TimedOut,
    Cancelled,
    /// The host refused a call the script made
    HostRejected,
}

impl AbortReason {
    pub fn kind(&self) -> RunErrorKind {
        match self {
            AbortReason::TimedOut => RunErrorKind::TimedOut,
            AbortReason::Cancelled => RunErrorKind::Cancelled,
            AbortReason::HostRejected => RunErrorKind::UnknownFunction,
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::TimedOut => f.write_str("execution timed out"),
            AbortReason::Cancelled => f.write_str("execution cancelled"),
            AbortReason::HostRejected => f.write_str("host rejected the call"),
        }
    }
}

/// Raised inside an engine when a host call cannot be answered.
///
/// Engines propagate it as an opaque external error; the bridge recognises it
/// again when classifying the failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostAbort {
    #[error("unknown host function `{0}`")]
    UnknownFunction(String),
    #[error("{0}")]
    Aborted(AbortReason),
    #[error("bridge driver disconnected")]
    Disconnected,
}

impl From<HostAbort> for ScriptError {
    fn from(abort: HostAbort) -> Self {
        let kind = match &abort {
            HostAbort::UnknownFunction(_) => RunErrorKind::UnknownFunction,
            HostAbort::Aborted(reason) => reason.kind(),
            HostAbort::Disconnected => RunErrorKind::Internal,
        };
        ScriptError::new(kind, abort.to_string())
    }
}

/// Errors from a host function invoked outside a script
#[derive(Debug, Error)]
pub enum HostCallError {
    #[error("Invalid arguments for `{function}`: {source}")]
    InvalidArguments {
        function: String,
        #[source]
        source: ArgumentError,
    },

    #[error("Host function `{function}` failed: {source}")]
    Handler {
        function: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Errors from bridge and bridge cache operations
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Unknown host function: {0}")]
    UnknownHostFunction(String),

    #[error(transparent)]
    HostCall(#[from] HostCallError),

    #[error("Failed to create interpreter: {0}")]
    EngineInit(ScriptError),

    #[error("Bridge disposed")]
    Disposed,
}

pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_abort_classification() {
        let unknown: ScriptError = HostAbort::UnknownFunction("nope".into()).into();
        assert_eq!(unknown.kind, RunErrorKind::UnknownFunction);
        assert_eq!(unknown.message, "unknown host function `nope`");

        let timed_out: ScriptError = HostAbort::Aborted(AbortReason::TimedOut).into();
        assert_eq!(timed_out.kind, RunErrorKind::TimedOut);
    }

    #[test]
    fn test_script_error_display() {
        let err = ScriptError::new(RunErrorKind::Syntax, "unexpected symbol");
        assert_eq!(err.to_string(), "syntax: unexpected symbol");
    }
}
