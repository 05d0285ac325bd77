use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use super::registry::{ClientTool, ToolContext, ToolExecutor};
use crate::agents::domain::{ToolCallInfo, ToolDefinition};
use crate::bridge::BridgeCache;

pub const RUN_CODE_TOOL: &str = "run_code";

/// Runs agent-written code in the calling thread's interpreter.
///
/// The result is the JSON summary `{result, output, error}`. A failed script
/// makes the tool call fail with the same summary as its message.
#[derive(Clone)]
pub struct RunCodeTool {
    cache: BridgeCache,
}

impl RunCodeTool {
    pub fn new(cache: BridgeCache) -> Self {
        Self { cache }
    }

    pub fn definition() -> ToolDefinition {
        ToolDefinition::new(
            RUN_CODE_TOOL,
            "Execute code in a sandboxed interpreter. State persists between calls in the same thread. \
             Set `result` or return a value to report it; printed output is captured.",
            json!({
                "type": "object",
                "properties": {
                    "code": {
                        "type": "string",
                        "description": "Source code to execute"
                    }
                },
                "required": ["code"]
            }),
        )
    }

    pub fn into_client_tool(self) -> ClientTool {
        ClientTool::new(Self::definition(), Arc::new(self))
    }
}

#[async_trait]
impl ToolExecutor for RunCodeTool {
    async fn execute(&self, call: &ToolCallInfo, ctx: &ToolContext) -> anyhow::Result<String> {
        let code = match &call.arguments {
            Value::String(code) => code.as_str(),
            arguments => arguments
                .get("code")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("missing required argument `code`"))?,
        };

        let lease = self.cache.acquire(&ctx.thread_key).await?;
        debug!(thread_id = %ctx.thread_key, tool_call_id = %call.id, "Running code");
        let outcome = lease
            .execute_with_cancel(code, ctx.cancellation.clone())
            .collect()
            .await;
        drop(lease);

        let summary = outcome.summary().to_string();
        if outcome.is_success() {
            Ok(summary)
        } else {
            Err(anyhow!(summary))
        }
    }
}
