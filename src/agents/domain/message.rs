//! Message and conversation types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ToolCallInfo;
use crate::domain::ThreadKey;

/// Message role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// User message
    User,
    /// Assistant (agent) message
    Assistant,
    /// Tool result message
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    /// Message content (text)
    pub content: String,
    /// Tool calls announced on this assistant message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallInfo>,
    /// ID of the tool call this message is responding to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn new(id: String, role: Role, content: String) -> Self {
        Self {
            id,
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn generate_id() -> String {
        format!("msg_{}", uuid::Uuid::new_v4().simple())
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Self::generate_id(), Role::User, content.into())
    }

    /// Create an empty assistant message with the backend's message id
    pub fn assistant(id: impl Into<String>) -> Self {
        Self::new(id.into(), Role::Assistant, String::new())
    }

    /// Create a tool result message for an executed call
    pub fn tool_result(call: &ToolCallInfo) -> Self {
        let mut message = Self::new(
            Self::generate_id(),
            Role::Tool,
            call.result.clone().unwrap_or_default(),
        );
        message.tool_call_id = Some(call.id.clone());
        message
    }
}

/// Conversation history of one thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub thread: ThreadKey,
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new(thread: ThreadKey) -> Self {
        Self {
            thread,
            messages: Vec::new(),
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn message_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Text of the most recent assistant message that has any
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
            .find(|c| !c.is_empty())
    }

    /// Tool calls still awaiting execution, in announcement order
    pub fn pending_tool_calls(&self) -> Vec<ToolCallInfo> {
        self.messages
            .iter()
            .flat_map(|m| m.tool_calls.iter())
            .filter(|c| c.is_pending())
            .cloned()
            .collect()
    }

    pub fn tool_call_mut(&mut self, id: &str) -> Option<&mut ToolCallInfo> {
        self.messages
            .iter_mut()
            .flat_map(|m| m.tool_calls.iter_mut())
            .find(|c| c.id == id)
    }
}
