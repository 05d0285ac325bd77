//! # agent-bridge
//!
//! Client-side runtime for AI agents served by a remote backend, plus an
//! interpreter bridge that runs agent-written scripts under resource limits.
//!
//! ## Features
//!
//! - **Run orchestration**: streamed backend events folded into a conversation,
//!   tool-call yielding and bounded continuation runs
//! - **Agent sessions**: tool execution hidden from callers, one terminal
//!   [`agents::AgentResult`] per session, cancellation and timeouts
//! - **Interpreter bridge**: Lua and Rhai behind one event vocabulary, host
//!   functions with schema-checked arguments, timeouts and cancellation
//! - **Bridge cache**: one interpreter per conversation thread, bounded and
//!   evicted least recently used first
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use agent_bridge::bridge::{BridgeCache, BridgeConfig};
//! use agent_bridge::domain::{PlatformConstraints, ThreadKey};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = BridgeCache::new(BridgeConfig::default(), PlatformConstraints::default());
//!     let bridge = cache.acquire(&ThreadKey::new("local", "room", "thread")).await?;
//!
//!     let outcome = bridge.execute("result = 2 + 3").collect().await;
//!     assert_eq!(outcome.value, Some(serde_json::json!(5)));
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **Domain**: thread keys and platform constraints shared by every layer
//! - **Agents**: backend port, orchestrator, sessions and runtime
//! - **Bridge**: script engines, host functions and the event stream
//! - **Tools**: client-side tool registry and the `run_code` tool
//! - **Config**: layered settings and the CLI

pub mod agents;
pub mod bridge;
pub mod cli;
pub mod config;
pub mod domain;
pub mod tools;
