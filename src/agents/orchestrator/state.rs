use crate::agents::domain::{Conversation, FailureReason, ToolCallInfo};

/// Progress of an active run, republished as events are folded in
#[derive(Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    /// Empty until the backend has assigned a run id
    pub run_id: String,
    pub conversation: Conversation,
    /// Number of continuation runs issued so far
    pub continuation: u32,
}

/// State of a [`RunOrchestrator`](super::RunOrchestrator). Exactly one holds at a time.
#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    Idle,
    Running(RunSnapshot),
    /// The backend is waiting for these client-side tool calls
    ToolYielding(Vec<ToolCallInfo>),
    Completed {
        conversation: Conversation,
        run_id: String,
    },
    Failed {
        reason: FailureReason,
        error: String,
    },
    Cancelled {
        reason: String,
    },
}

impl RunState {
    /// Terminal states only leave through `reset()`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed { .. } | RunState::Failed { .. } | RunState::Cancelled { .. }
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, RunState::Running(_) | RunState::ToolYielding(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Running(_) => "running",
            RunState::ToolYielding(_) => "tool_yielding",
            RunState::Completed { .. } => "completed",
            RunState::Failed { .. } => "failed",
            RunState::Cancelled { .. } => "cancelled",
        }
    }
}
