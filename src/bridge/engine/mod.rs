//! Script engines behind the bridge
//!
//! An engine evaluates code synchronously on a blocking worker thread. Host
//! calls and print output leave the engine through the [`HostPort`] in its
//! [`EvalContext`]; the bridge driver answers them asynchronously.

mod lua_engine;
mod rhai_engine;

pub use lua_engine::LuaEngine;
pub use rhai_engine::RhaiEngine;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::error::ScriptError;
use super::host::HostPort;
use super::limits::{AbortSignal, ResourceLimits};
use super::schema::HostFunctionSchema;

/// Supported interpreters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Lua,
    Rhai,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Lua => f.write_str("lua"),
            EngineKind::Rhai => f.write_str("rhai"),
        }
    }
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lua" => Ok(EngineKind::Lua),
            "rhai" => Ok(EngineKind::Rhai),
            other => Err(format!("unknown engine `{}` (expected lua or rhai)", other)),
        }
    }
}

/// What an engine can do, independent of platform constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineCapabilities {
    /// Evaluation can pause at a host call and resume with its result
    pub supports_pause: bool,
    pub enforces_memory_limit: bool,
    pub enforces_stack_depth: bool,
}

/// Everything an engine needs for one evaluation
pub struct EvalContext {
    pub host: HostPort,
    /// Host functions to expose, in registration order
    pub schemas: Vec<HostFunctionSchema>,
    pub limits: ResourceLimits,
    /// Checked from the engine's instruction hook or progress callback
    pub abort: AbortSignal,
}

/// A sandboxed interpreter with persistent state between evaluations
pub trait ScriptEngine: Send {
    fn kind(&self) -> EngineKind;

    fn capabilities(&self) -> EngineCapabilities;

    /// Evaluate `code` and return its final value.
    ///
    /// The value is what the script returns, or the `result` variable when it
    /// returns nothing.
    fn eval(&mut self, code: &str, ctx: &EvalContext) -> Result<Value, ScriptError>;
}

/// Instantiate an engine with the requested limits applied where supported
pub fn create_engine(
    kind: EngineKind,
    limits: &ResourceLimits,
) -> Result<Box<dyn ScriptEngine>, ScriptError> {
    Ok(match kind {
        EngineKind::Lua => Box::new(LuaEngine::new(limits)?),
        EngineKind::Rhai => Box::new(RhaiEngine::new(limits)),
    })
}
