//! Agent layer
//!
//! Drives conversational runs against a remote [`AgentBackend`] and hides
//! client-side tool execution from callers.
//!
//! ## Architecture
//!
//! - `backend/` - Backend port, event vocabulary and the in-process [`ScriptedBackend`]
//! - `domain/` - Conversation, tool calls and [`AgentResult`]
//! - `orchestrator/` - One turn as a run state machine with continuations
//! - `session` - One turn driven to a single result, tools executed locally
//! - `runtime` - Spawns sessions and waits on groups of them
//! - `subagents` - Sub-agent host functions backed by the runtime

pub mod backend;
pub mod domain;
pub mod error;
pub mod orchestrator;
pub mod runtime;
pub mod session;
pub mod subagents;

pub use backend::{AgentBackend, BackendEvent, RunContext, ScriptedBackend, ScriptedRun};
pub use domain::*;
pub use error::*;
pub use orchestrator::{OrchestratorConfig, RunOrchestrator, RunSnapshot, RunState};
pub use runtime::{AgentRuntime, RuntimeConfig, SpawnOptions, ToolRegistryResolver};
pub use session::AgentSession;
pub use subagents::SubAgentPool;
