//! Domain types for the agent layer
//!
//! Conversation history, tool calls and the terminal [`AgentResult`].

mod message;
mod result;
mod tool_call;

pub use message::*;
pub use result::*;
pub use tool_call::*;
