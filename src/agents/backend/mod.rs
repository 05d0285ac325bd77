//! Port to the remote model-serving backend
//!
//! The backend is consumed as a typed event sequence modelled on the AG-UI
//! vocabulary. Transport and wire encoding live behind [`AgentBackend`].

mod scripted;

pub use scripted::{RunContext, ScriptedBackend, ScriptedRun};

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::agents::domain::{Message, ToolDefinition};
use crate::agents::error::{BackendError, BackendResult};
use crate::domain::ThreadKey;

/// An event streamed by the backend for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum BackendEvent {
    RunStarted {
        thread_id: String,
        run_id: String,
    },
    StepStarted {
        step_name: String,
    },
    StepFinished {
        step_name: String,
    },
    TextMessageStart {
        message_id: String,
    },
    TextMessageContent {
        message_id: String,
        delta: String,
    },
    TextMessageEnd {
        message_id: String,
    },
    ToolCallStart {
        tool_call_id: String,
        tool_call_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_message_id: Option<String>,
    },
    ToolCallArgs {
        tool_call_id: String,
        delta: String,
    },
    ToolCallEnd {
        tool_call_id: String,
    },
    /// Result of a tool call that was executed outside this client
    ToolCallResult {
        message_id: String,
        tool_call_id: String,
        content: String,
    },
    RunFinished {
        thread_id: String,
        run_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    RunError {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl BackendEvent {
    /// Whether this event ends the run's event sequence
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BackendEvent::RunFinished { .. } | BackendEvent::RunError { .. }
        )
    }
}

/// Request for a new run (initial or continuation)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    /// Reuse an existing run id instead of letting the backend mint one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Full conversation history, oldest first
    pub messages: Vec<Message>,
    /// Client-side tools the agent may call
    pub tools: Vec<ToolDefinition>,
}

/// Handle to a created run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHandle {
    pub run_id: String,
}

/// Port trait for the agent backend
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Create a new thread in a room and return its thread id
    async fn create_thread(&self, room_id: &str) -> BackendResult<String>;

    /// Create a run on a thread
    async fn create_run(&self, thread: &ThreadKey, request: RunRequest) -> BackendResult<RunHandle>;

    /// Subscribe to the event stream of a run
    async fn subscribe(&self, thread: &ThreadKey, run_id: &str) -> BackendResult<BackendEventStream>;

    /// Delete a thread and its history
    async fn delete_thread(&self, thread: &ThreadKey) -> BackendResult<()>;
}

/// Stream of backend events for one run
#[derive(Debug)]
pub struct BackendEventStream {
    receiver: mpsc::Receiver<Result<BackendEvent, BackendError>>,
}

impl BackendEventStream {
    /// Create a new event stream from a channel receiver
    pub fn new(receiver: mpsc::Receiver<Result<BackendEvent, BackendError>>) -> Self {
        Self { receiver }
    }

    /// Create a channel pair for building an event stream
    pub fn channel(buffer: usize) -> (BackendEventSender, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (BackendEventSender { sender: tx }, Self { receiver: rx })
    }

    /// Collect all events until the stream closes or yields an error
    pub async fn collect(mut self) -> BackendResult<Vec<BackendEvent>> {
        let mut events = Vec::new();
        while let Some(item) = self.receiver.recv().await {
            events.push(item?);
        }
        Ok(events)
    }
}

impl Stream for BackendEventStream {
    type Item = Result<BackendEvent, BackendError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_recv(cx)
    }
}

/// Sender half for building a backend event stream
#[derive(Clone)]
pub struct BackendEventSender {
    sender: mpsc::Sender<Result<BackendEvent, BackendError>>,
}

impl BackendEventSender {
    /// Send an event
    pub async fn send(
        &self,
        event: BackendEvent,
    ) -> Result<(), mpsc::error::SendError<Result<BackendEvent, BackendError>>> {
        self.sender.send(Ok(event)).await
    }

    /// Send an error
    pub async fn send_error(
        &self,
        error: BackendError,
    ) -> Result<(), mpsc::error::SendError<Result<BackendEvent, BackendError>>> {
        self.sender.send(Err(error)).await
    }

    /// Check if the receiver is closed
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Wait until the receiver is dropped
    pub async fn closed(&self) {
        self.sender.closed().await
    }
}
