//! Lifecycle events emitted by an execution

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use super::error::{RunErrorKind, ScriptError};
use crate::agents::backend::BackendEvent;

/// Uniform event vocabulary of the interpreter bridge.
///
/// Every stream starts with `RunStarted` and ends with exactly one of
/// `RunFinished`/`RunError`. Each host call is one `StepStarted`..`StepFinished`
/// block holding a `ToolCallStart`/`Args`/`End` triple and its `ToolCallResult`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    RunStarted {
        run_id: String,
    },
    RunFinished {
        run_id: String,
        result: Value,
    },
    RunError {
        run_id: String,
        message: String,
        kind: RunErrorKind,
    },
    StepStarted {
        step_name: String,
    },
    StepFinished {
        step_name: String,
    },
    ToolCallStart {
        tool_call_id: String,
        tool_call_name: String,
    },
    ToolCallArgs {
        tool_call_id: String,
        delta: String,
    },
    ToolCallEnd {
        tool_call_id: String,
    },
    ToolCallResult {
        tool_call_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    TextStart {
        message_id: String,
    },
    TextContent {
        message_id: String,
        delta: String,
    },
    TextEnd {
        message_id: String,
    },
}

impl BridgeEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BridgeEvent::RunFinished { .. } | BridgeEvent::RunError { .. }
        )
    }

    /// Short name of the variant, as used in logs and tests
    pub fn name(&self) -> &'static str {
        match self {
            BridgeEvent::RunStarted { .. } => "run_started",
            BridgeEvent::RunFinished { .. } => "run_finished",
            BridgeEvent::RunError { .. } => "run_error",
            BridgeEvent::StepStarted { .. } => "step_started",
            BridgeEvent::StepFinished { .. } => "step_finished",
            BridgeEvent::ToolCallStart { .. } => "tool_call_start",
            BridgeEvent::ToolCallArgs { .. } => "tool_call_args",
            BridgeEvent::ToolCallEnd { .. } => "tool_call_end",
            BridgeEvent::ToolCallResult { .. } => "tool_call_result",
            BridgeEvent::TextStart { .. } => "text_start",
            BridgeEvent::TextContent { .. } => "text_content",
            BridgeEvent::TextEnd { .. } => "text_end",
        }
    }

    /// Translate into the backend protocol's vocabulary
    pub fn to_backend_event(&self, thread_id: &str) -> BackendEvent {
        match self.clone() {
            BridgeEvent::RunStarted { run_id } => BackendEvent::RunStarted {
                thread_id: thread_id.to_string(),
                run_id,
            },
            BridgeEvent::RunFinished { run_id, result } => BackendEvent::RunFinished {
                thread_id: thread_id.to_string(),
                run_id,
                result: Some(result),
            },
            BridgeEvent::RunError { message, kind, .. } => BackendEvent::RunError {
                message,
                code: Some(kind.as_str().to_string()),
            },
            BridgeEvent::StepStarted { step_name } => BackendEvent::StepStarted { step_name },
            BridgeEvent::StepFinished { step_name } => BackendEvent::StepFinished { step_name },
            BridgeEvent::ToolCallStart {
                tool_call_id,
                tool_call_name,
            } => BackendEvent::ToolCallStart {
                tool_call_id,
                tool_call_name,
                parent_message_id: None,
            },
            BridgeEvent::ToolCallArgs {
                tool_call_id,
                delta,
            } => BackendEvent::ToolCallArgs {
                tool_call_id,
                delta,
            },
            BridgeEvent::ToolCallEnd { tool_call_id } => BackendEvent::ToolCallEnd { tool_call_id },
            BridgeEvent::ToolCallResult {
                tool_call_id,
                content,
                ..
            } => BackendEvent::ToolCallResult {
                message_id: format!("result_{}", tool_call_id),
                tool_call_id,
                content,
            },
            BridgeEvent::TextStart { message_id } => BackendEvent::TextMessageStart { message_id },
            BridgeEvent::TextContent { message_id, delta } => {
                BackendEvent::TextMessageContent { message_id, delta }
            }
            BridgeEvent::TextEnd { message_id } => BackendEvent::TextMessageEnd { message_id },
        }
    }
}

/// Everything an execution produced, gathered from its event stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutcome {
    pub events: Vec<BridgeEvent>,
    /// Final value on success
    pub value: Option<Value>,
    /// Concatenated print output
    pub output: String,
    pub error: Option<ScriptError>,
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.value.is_some()
    }

    /// `{result, output, error}` summary handed back to agents
    pub fn summary(&self) -> Value {
        serde_json::json!({
            "result": self.value.clone().unwrap_or(Value::Null),
            "output": self.output,
            "error": self.error.as_ref().map(|e| serde_json::json!({
                "kind": e.kind,
                "message": e.message,
            })),
        })
    }

    /// Variant names in emission order
    pub fn event_names(&self) -> Vec<&'static str> {
        self.events.iter().map(BridgeEvent::name).collect()
    }
}

/// Stream of events for one execution
pub struct BridgeEventStream {
    receiver: mpsc::Receiver<BridgeEvent>,
}

impl BridgeEventStream {
    /// Create a channel pair for building an event stream
    pub(crate) fn channel(buffer: usize) -> (mpsc::Sender<BridgeEvent>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { receiver: rx })
    }

    /// Collect all events into an [`ExecutionOutcome`]
    pub async fn collect(mut self) -> ExecutionOutcome {
        let mut outcome = ExecutionOutcome::default();
        while let Some(event) = self.receiver.recv().await {
            match &event {
                BridgeEvent::TextContent { delta, .. } => outcome.output.push_str(delta),
                BridgeEvent::RunFinished { result, .. } => outcome.value = Some(result.clone()),
                BridgeEvent::RunError { message, kind, .. } => {
                    outcome.error = Some(ScriptError::new(*kind, message.clone()))
                }
                _ => {}
            }
            outcome.events.push(event);
        }
        if outcome.value.is_none() && outcome.error.is_none() {
            outcome.error = Some(ScriptError::new(
                RunErrorKind::Internal,
                "event stream ended without a terminal event",
            ));
        }
        outcome
    }
}

impl Stream for BridgeEventStream {
    type Item = BridgeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_recv(cx)
    }
}
