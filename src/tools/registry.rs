use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::agents::domain::{ToolCallInfo, ToolDefinition};
use crate::domain::ThreadKey;

/// Errors returned by [`ToolRegistry::execute`]
#[derive(Debug, Error)]
pub enum ToolRegistryError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// Error returned by the tool's executor, unchanged
    #[error(transparent)]
    Executor(anyhow::Error),
}

pub type ToolRegistryResult<T> = Result<T, ToolRegistryError>;

/// Context handed to every tool execution
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Thread whose run requested the call
    pub thread_key: ThreadKey,
    /// Fires when the requesting run is cancelled; long-running executors stop on it
    pub cancellation: CancellationToken,
}

impl ToolContext {
    pub fn new(thread_key: ThreadKey) -> Self {
        Self {
            thread_key,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }
}

/// Executes one kind of client-side tool call
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: &ToolCallInfo, ctx: &ToolContext) -> anyhow::Result<String>;
}

struct FnExecutor<F>(F);

#[async_trait]
impl<F, Fut> ToolExecutor for FnExecutor<F>
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<String>> + Send,
{
    async fn execute(&self, call: &ToolCallInfo, ctx: &ToolContext) -> anyhow::Result<String> {
        (self.0)(call.arguments.clone(), ctx.clone()).await
    }
}

/// A tool definition paired with its executor
#[derive(Clone)]
pub struct ClientTool {
    pub definition: ToolDefinition,
    pub executor: Arc<dyn ToolExecutor>,
}

impl ClientTool {
    pub fn new(definition: ToolDefinition, executor: Arc<dyn ToolExecutor>) -> Self {
        Self {
            definition,
            executor,
        }
    }

    /// Build a tool from an async closure over the call arguments
    pub fn from_fn<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        f: F,
    ) -> Self
    where
        F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        Self::new(
            ToolDefinition::new(name, description, parameters),
            Arc::new(FnExecutor(f)),
        )
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

impl std::fmt::Debug for ClientTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTool")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

/// Immutable mapping of tool name to tool.
///
/// Registering returns a new registry; clones share their tools.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<BTreeMap<String, ClientTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with this tool added, replacing any tool of the same name
    pub fn register(&self, tool: ClientTool) -> Self {
        let mut tools = (*self.tools).clone();
        tools.insert(tool.name().to_string(), tool);
        Self {
            tools: Arc::new(tools),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&ClientTool> {
        self.tools.get(name)
    }

    pub async fn execute(&self, call: &ToolCallInfo, ctx: &ToolContext) -> ToolRegistryResult<String> {
        let tool = self
            .lookup(&call.name)
            .ok_or_else(|| ToolRegistryError::UnknownTool(call.name.clone()))?;
        tool.executor
            .execute(call, ctx)
            .await
            .map_err(ToolRegistryError::Executor)
    }

    /// Definitions advertised to the backend, ordered by name
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition.clone()).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ToolContext {
        ToolContext::new(ThreadKey::new("s", "r", "t"))
    }

    fn echo() -> ClientTool {
        ClientTool::from_fn("echo", "Echo input", json!({"type": "object"}), |args, _| async move {
            Ok(args["text"].as_str().unwrap_or_default().to_string())
        })
    }

    #[test]
    fn test_register_has_value_semantics() {
        let empty = ToolRegistry::new();
        let one = empty.register(echo());

        assert!(empty.is_empty());
        assert_eq!(one.len(), 1);
        assert!(one.lookup("echo").is_some());
        assert!(empty.lookup("echo").is_none());
    }

    #[test]
    fn test_register_replaces_same_name() {
        let registry = ToolRegistry::new().register(echo()).register(ClientTool::from_fn(
            "echo",
            "Second echo",
            json!({}),
            |_, _| async { Ok(String::new()) },
        ));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.tool_definitions()[0].description, "Second echo");
    }

    #[tokio::test]
    async fn test_execute_dispatches_by_name() {
        let registry = ToolRegistry::new().register(echo());
        let call = ToolCallInfo::pending("c1", "echo", json!({"text": "hi"}));
        assert_eq!(registry.execute(&call, &ctx()).await.unwrap(), "hi");
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let registry = ToolRegistry::new();
        let call = ToolCallInfo::pending("c1", "missing", json!({}));
        let err = registry.execute(&call, &ctx()).await.unwrap_err();
        assert!(matches!(err, ToolRegistryError::UnknownTool(name) if name == "missing"));
    }

    #[tokio::test]
    async fn test_executor_error_is_not_translated() {
        let registry = ToolRegistry::new().register(ClientTool::from_fn(
            "fail",
            "Always fails",
            json!({}),
            |_, _| async { Err(anyhow::anyhow!("disk full")) },
        ));
        let call = ToolCallInfo::pending("c1", "fail", json!({}));
        let err = registry.execute(&call, &ctx()).await.unwrap_err();
        assert_eq!(err.to_string(), "disk full");
        assert!(matches!(err, ToolRegistryError::Executor(_)));
    }

    #[tokio::test]
    async fn test_context_reaches_executor() {
        let registry = ToolRegistry::new().register(ClientTool::from_fn(
            "whoami",
            "Thread id",
            json!({}),
            |_, ctx: ToolContext| async move { Ok(ctx.thread_key.thread_id) },
        ));
        let call = ToolCallInfo::pending("c1", "whoami", json!({}));
        assert_eq!(registry.execute(&call, &ctx()).await.unwrap(), "t");
    }
}
