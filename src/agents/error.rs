//! Error types for the agent layer

use thiserror::Error;

use super::domain::FailureReason;

/// Errors reported by an [`AgentBackend`](super::backend::AgentBackend)
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// Backend answered with an error status
    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },

    /// Credentials are no longer accepted
    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    /// Transport failure or dropped connection
    #[error("Network error: {0}")]
    Network(String),

    /// Rate limited
    #[error("Rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Backend sent something the protocol does not allow
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Thread does not exist on the backend
    #[error("Thread not found: {0}")]
    ThreadNotFound(String),
}

impl BackendError {
    /// Classify this error into the failure taxonomy surfaced to callers
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            BackendError::Server { .. } | BackendError::ThreadNotFound(_) => {
                FailureReason::ServerError
            }
            BackendError::AuthExpired(_) => FailureReason::AuthExpired,
            BackendError::Network(_) => FailureReason::NetworkLost,
            BackendError::RateLimited { .. } => FailureReason::RateLimited,
            BackendError::Protocol(_) => FailureReason::InternalError,
        }
    }
}

/// Errors returned by [`RunOrchestrator`](super::orchestrator::RunOrchestrator) operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    /// `start_run` was called while a run is already active or terminal
    #[error("Run already active in state {0}")]
    AlreadyActive(&'static str),

    /// `submit_tool_outputs` was called outside of `ToolYielding`
    #[error("No tool calls are awaiting outputs (state {0})")]
    NotYielding(&'static str),

    /// Some pending tool calls were not part of the submission
    #[error("Missing outputs for tool calls: {}", .0.join(", "))]
    MissingToolOutputs(Vec<String>),

    /// The orchestrator was disposed
    #[error("Orchestrator disposed")]
    Disposed,
}

/// Errors returned by the session and runtime layer
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Backend call failed while setting up a session
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Orchestrator rejected an operation
    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    /// The room's tool registry could not be resolved
    #[error("Failed to resolve tools for room {room_id}: {source}")]
    ToolResolution {
        room_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// The session was already started
    #[error("Session already started: {0}")]
    AlreadyStarted(String),

    /// The session already produced its result
    #[error("Session already finished: {0}")]
    SessionFinished(String),
}

/// Result type alias for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Result type alias for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Result type alias for session and runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;
