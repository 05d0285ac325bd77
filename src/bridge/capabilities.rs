//! Host capabilities exposed to scripts as host functions

use anyhow::bail;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

use super::host::HostFunction;
use super::schema::{HostFunctionSchema, HostParam, ParamType};

/// Namespaced platform operations, such as `storage.get`
#[async_trait]
pub trait HostCapabilities: Send + Sync {
    fn operations(&self) -> Vec<String>;

    async fn invoke(&self, operation: &str, args: Map<String, Value>) -> anyhow::Result<Value>;
}

/// Spawns and supervises sub-agents on behalf of a script
#[async_trait]
pub trait SubAgentHost: Send + Sync {
    /// Start a sub-agent and return its handle
    async fn spawn(&self, prompt: String) -> anyhow::Result<String>;

    /// Wait for the sub-agent's result. A timeout leaves the sub-agent running.
    async fn wait(&self, handle: &str, timeout: Option<Duration>) -> anyhow::Result<Value>;

    /// Returns false when the handle is unknown
    async fn cancel(&self, handle: &str) -> anyhow::Result<bool>;
}

/// `host_call(operation, args?)`
pub fn host_call_function(capabilities: Arc<dyn HostCapabilities>) -> HostFunction {
    let schema = HostFunctionSchema::new("host_call", "Invoke a platform operation")
        .param(
            HostParam::required("operation", ParamType::String)
                .describe("Namespaced operation name"),
        )
        .param(HostParam::optional("args", ParamType::Map));

    HostFunction::from_fn(schema, move |args| {
        let capabilities = capabilities.clone();
        async move {
            let operation = string_arg(&args, "operation");
            if !capabilities.operations().iter().any(|op| *op == operation) {
                bail!("unsupported operation `{}`", operation);
            }
            let op_args = match args.get("args") {
                Some(Value::Object(map)) => map.clone(),
                _ => Map::new(),
            };
            capabilities.invoke(&operation, op_args).await
        }
    })
}

/// `spawn_agent(prompt)`, `await_agent(handle, timeout_ms?)` and `cancel_agent(handle)`
pub fn sub_agent_functions(host: Arc<dyn SubAgentHost>) -> Vec<HostFunction> {
    let spawn_host = host.clone();
    let spawn = HostFunction::from_fn(
        HostFunctionSchema::new("spawn_agent", "Start a sub-agent with a prompt")
            .param(HostParam::required("prompt", ParamType::String)),
        move |args| {
            let host = spawn_host.clone();
            async move {
                let handle = host.spawn(string_arg(&args, "prompt")).await?;
                Ok(Value::String(handle))
            }
        },
    );

    let wait_host = host.clone();
    let wait = HostFunction::from_fn(
        HostFunctionSchema::new("await_agent", "Wait for a sub-agent's result")
            .param(HostParam::required("handle", ParamType::String))
            .param(HostParam::optional("timeout_ms", ParamType::Integer)),
        move |args| {
            let host = wait_host.clone();
            async move {
                let timeout = args
                    .get("timeout_ms")
                    .and_then(Value::as_u64)
                    .map(Duration::from_millis);
                host.wait(&string_arg(&args, "handle"), timeout).await
            }
        },
    );

    let cancel = HostFunction::from_fn(
        HostFunctionSchema::new("cancel_agent", "Cancel a running sub-agent")
            .param(HostParam::required("handle", ParamType::String)),
        move |args| {
            let host = host.clone();
            async move {
                let cancelled = host.cancel(&string_arg(&args, "handle")).await?;
                Ok(Value::Bool(cancelled))
            }
        },
    );

    vec![spawn, wait, cancel]
}

fn string_arg(args: &Map<String, Value>, name: &str) -> String {
    args.get(name)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
