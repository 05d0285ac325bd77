//! Client-side tools
//!
//! The [`ToolRegistry`] backs tool dispatch for agent sessions. [`RunCodeTool`]
//! is the built-in tool that runs agent-written code in the calling thread's
//! interpreter bridge.

mod registry;
mod run_code;

pub use registry::{
    ClientTool, ToolContext, ToolExecutor, ToolRegistry, ToolRegistryError, ToolRegistryResult,
};
pub use run_code::{RunCodeTool, RUN_CODE_TOOL};
