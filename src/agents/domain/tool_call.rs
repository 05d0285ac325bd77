//! Tool call types for agent interactions

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of a tool call announced by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

/// A tool call requested by the backend, kept in conversation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallInfo {
    /// Identifier assigned by the backend
    pub id: String,
    /// Name of the tool being called
    pub name: String,
    /// Arguments passed to the tool (as JSON)
    pub arguments: Value,
    pub status: ToolCallStatus,
    /// Output on success, error message on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl ToolCallInfo {
    /// Create a pending tool call
    pub fn pending(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            status: ToolCallStatus::Pending,
            result: None,
        }
    }

    /// Generate a unique ID for a tool call
    pub fn generate_id() -> String {
        format!("call_{}", &uuid::Uuid::new_v4().simple().to_string()[..24])
    }

    pub fn is_pending(&self) -> bool {
        self.status == ToolCallStatus::Pending
    }

    pub fn is_settled(&self) -> bool {
        matches!(
            self.status,
            ToolCallStatus::Completed | ToolCallStatus::Failed
        )
    }

    pub fn mark_executing(&mut self) {
        self.status = ToolCallStatus::Executing;
    }

    pub fn complete(&mut self, output: impl Into<String>) {
        self.status = ToolCallStatus::Completed;
        self.result = Some(output.into());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = ToolCallStatus::Failed;
        self.result = Some(error.into());
    }
}

/// Definition of a tool advertised to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// JSON Schema defining the tool's parameters
    pub parameters: Value,
}

impl ToolDefinition {
    /// Create a new tool definition
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_transitions() {
        let mut call = ToolCallInfo::pending("c1", "get_time", json!({}));
        assert!(call.is_pending());
        assert!(!call.is_settled());

        call.mark_executing();
        assert_eq!(call.status, ToolCallStatus::Executing);
        assert!(!call.is_pending());

        call.complete("12:00");
        assert!(call.is_settled());
        assert_eq!(call.result.as_deref(), Some("12:00"));
    }

    #[test]
    fn test_fail_records_message() {
        let mut call = ToolCallInfo::pending("c1", "lookup", json!({"q": 1}));
        call.fail("not found");
        assert_eq!(call.status, ToolCallStatus::Failed);
        assert_eq!(call.result.as_deref(), Some("not found"));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = ToolCallInfo::generate_id();
        let b = ToolCallInfo::generate_id();
        assert!(a.starts_with("call_"));
        assert_eq!(a.len(), 29);
        assert_ne!(a, b);
    }
}
