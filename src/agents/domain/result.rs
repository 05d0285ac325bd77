//! Terminal outcome of an agent session

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::domain::ThreadKey;

/// Why a run or session failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ServerError,
    AuthExpired,
    NetworkLost,
    RateLimited,
    ToolExecutionFailed,
    InternalError,
    Cancelled,
}

impl FailureReason {
    /// Classify the optional error code carried by a backend `RUN_ERROR` event.
    ///
    /// Unknown or missing codes are server errors.
    pub fn from_error_code(code: Option<&str>) -> Self {
        let Some(code) = code else {
            return FailureReason::ServerError;
        };
        match code.to_ascii_lowercase().as_str() {
            "auth_expired" | "unauthorized" | "unauthenticated" | "401" => {
                FailureReason::AuthExpired
            }
            "rate_limited" | "too_many_requests" | "429" => FailureReason::RateLimited,
            "network" | "network_lost" | "connection_lost" => FailureReason::NetworkLost,
            "tool_execution_failed" => FailureReason::ToolExecutionFailed,
            "internal" | "internal_error" => FailureReason::InternalError,
            "cancelled" | "canceled" => FailureReason::Cancelled,
            _ => FailureReason::ServerError,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::ServerError => "server_error",
            FailureReason::AuthExpired => "auth_expired",
            FailureReason::NetworkLost => "network_lost",
            FailureReason::RateLimited => "rate_limited",
            FailureReason::ToolExecutionFailed => "tool_execution_failed",
            FailureReason::InternalError => "internal_error",
            FailureReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single terminal result of an agent session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentResult {
    Success {
        thread_key: ThreadKey,
        output: String,
        run_id: String,
    },
    Failure {
        thread_key: ThreadKey,
        reason: FailureReason,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partial_output: Option<String>,
    },
    TimedOut {
        thread_key: ThreadKey,
        elapsed: Duration,
    },
}

impl AgentResult {
    pub fn thread_key(&self) -> &ThreadKey {
        match self {
            AgentResult::Success { thread_key, .. }
            | AgentResult::Failure { thread_key, .. }
            | AgentResult::TimedOut { thread_key, .. } => thread_key,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AgentResult::Success { .. })
    }

    /// Final output on success, partial output on failure
    pub fn output(&self) -> Option<&str> {
        match self {
            AgentResult::Success { output, .. } => Some(output),
            AgentResult::Failure { partial_output, .. } => partial_output.as_deref(),
            AgentResult::TimedOut { .. } => None,
        }
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            AgentResult::Failure { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}
