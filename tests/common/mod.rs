#![allow(dead_code)]

use agent_bridge::agents::{
    AgentRuntime, Role, RunContext, RuntimeConfig, ScriptedBackend, ScriptedRun,
};
use agent_bridge::bridge::{BridgeCache, BridgeConfig};
use agent_bridge::domain::PlatformConstraints;
use agent_bridge::tools::{RunCodeTool, ToolRegistry};
use std::sync::Arc;
use std::time::Duration;

pub fn runtime(backend: Arc<ScriptedBackend>, tools: ToolRegistry) -> AgentRuntime {
    runtime_with(backend, tools, RuntimeConfig::default())
}

pub fn runtime_with(
    backend: Arc<ScriptedBackend>,
    tools: ToolRegistry,
    config: RuntimeConfig,
) -> AgentRuntime {
    AgentRuntime::new(backend, Arc::new(tools), config, PlatformConstraints::default())
}

/// Registry holding only `run_code`, backed by a fresh cache
pub fn run_code_registry() -> (ToolRegistry, BridgeCache) {
    let cache = BridgeCache::new(BridgeConfig::default(), PlatformConstraints::default());
    let registry = ToolRegistry::new().register(RunCodeTool::new(cache.clone()).into_client_tool());
    (registry, cache)
}

/// Content of the newest tool result message the backend has seen
pub fn last_tool_output(ctx: &RunContext) -> Option<String> {
    ctx.messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Tool)
        .map(|m| m.content.clone())
}

/// Replies with the prompt text after a per-prompt delay in milliseconds
pub fn delayed_echo(delays: &'static [(&'static str, u64)]) -> ScriptedBackend {
    ScriptedBackend::new(move |ctx| {
        let prompt = ctx.prompt().unwrap_or_default().to_string();
        let delay = delays
            .iter()
            .find(|(p, _)| *p == prompt)
            .map(|(_, ms)| *ms)
            .unwrap_or(0);
        ScriptedRun::reply(prompt).with_delay(Duration::from_millis(delay))
    })
}

/// Poll `check` until it holds or a second has passed
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
