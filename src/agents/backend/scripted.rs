//! In-process backend that replays programmed event sequences
//!
//! Used by the test suite, the CLI and offline embeddings. Each created run asks
//! the responder closure for a [`ScriptedRun`] and streams it on subscribe.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::{AgentBackend, BackendEvent, BackendEventStream, RunHandle, RunRequest};
use crate::agents::domain::{Message, ToolDefinition};
use crate::agents::error::{BackendError, BackendResult};
use crate::domain::ThreadKey;

/// What the responder sees when a run is created
#[derive(Debug, Clone)]
pub struct RunContext {
    pub thread: ThreadKey,
    pub run_id: String,
    /// Zero-based index of this run on its thread
    pub run_index: usize,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

impl RunContext {
    /// Content of the first user message of the thread
    pub fn prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == crate::agents::domain::Role::User)
            .map(|m| m.content.as_str())
    }
}

/// A programmed event sequence for one run.
///
/// `thread_id`/`run_id` fields left empty in lifecycle events are filled in
/// with the real identifiers when the run is streamed.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRun {
    events: Vec<Result<BackendEvent, BackendError>>,
    delay: Duration,
    hang: bool,
}

impl ScriptedRun {
    pub fn new() -> Self {
        Self::default()
    }

    /// A run that streams exactly these events
    pub fn events(events: Vec<BackendEvent>) -> Self {
        Self {
            events: events.into_iter().map(Ok).collect(),
            ..Self::default()
        }
    }

    /// A run that answers with one text message
    pub fn reply(text: impl Into<String>) -> Self {
        let message_id = Message::generate_id();
        Self::events(vec![
            run_started(),
            BackendEvent::TextMessageStart {
                message_id: message_id.clone(),
            },
            BackendEvent::TextMessageContent {
                message_id: message_id.clone(),
                delta: text.into(),
            },
            BackendEvent::TextMessageEnd { message_id },
            run_finished(),
        ])
    }

    /// A run that requests one client-side tool call
    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self::tool_calls(vec![(id.into(), name.into(), arguments)])
    }

    /// A run that requests several tool calls on one assistant message
    pub fn tool_calls(calls: Vec<(String, String, Value)>) -> Self {
        let message_id = Message::generate_id();
        let mut events = vec![
            run_started(),
            BackendEvent::TextMessageStart {
                message_id: message_id.clone(),
            },
            BackendEvent::TextMessageEnd {
                message_id: message_id.clone(),
            },
        ];
        for (id, name, arguments) in calls {
            events.push(BackendEvent::ToolCallStart {
                tool_call_id: id.clone(),
                tool_call_name: name,
                parent_message_id: Some(message_id.clone()),
            });
            events.push(BackendEvent::ToolCallArgs {
                tool_call_id: id.clone(),
                delta: arguments.to_string(),
            });
            events.push(BackendEvent::ToolCallEnd { tool_call_id: id });
        }
        events.push(run_finished());
        Self::events(events)
    }

    /// A run that fails with a `RUN_ERROR` event
    pub fn error(message: impl Into<String>, code: Option<&str>) -> Self {
        Self::events(vec![
            run_started(),
            BackendEvent::RunError {
                message: message.into(),
                code: code.map(str::to_string),
            },
        ])
    }

    /// A run whose stream breaks with a transport error
    pub fn stream_error(error: BackendError) -> Self {
        Self {
            events: vec![Ok(run_started()), Err(error)],
            ..Self::default()
        }
    }

    /// Drop the terminal event so the stream ends without one
    pub fn truncated(mut self) -> Self {
        if matches!(self.events.last(), Some(Ok(event)) if event.is_terminal()) {
            self.events.pop();
        }
        self
    }

    /// Wait before streaming the first event
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Keep the stream open after the last event until the subscriber goes away
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }
}

fn run_started() -> BackendEvent {
    BackendEvent::RunStarted {
        thread_id: String::new(),
        run_id: String::new(),
    }
}

fn run_finished() -> BackendEvent {
    BackendEvent::RunFinished {
        thread_id: String::new(),
        run_id: String::new(),
        result: None,
    }
}

type Responder = dyn Fn(&RunContext) -> ScriptedRun + Send + Sync;

#[derive(Default)]
struct ScriptedState {
    next_thread: u64,
    runs_per_thread: HashMap<ThreadKey, usize>,
    pending: HashMap<String, ScriptedRun>,
    history: Vec<RunContext>,
    deleted: Vec<ThreadKey>,
}

/// Backend double driven by a responder closure
pub struct ScriptedBackend {
    responder: Arc<Responder>,
    state: Mutex<ScriptedState>,
    fail_deletes: AtomicBool,
}

impl ScriptedBackend {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&RunContext) -> ScriptedRun + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            state: Mutex::new(ScriptedState::default()),
            fail_deletes: AtomicBool::new(false),
        }
    }

    /// Every run answers with the same text
    pub fn replying(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(move |_| ScriptedRun::reply(text.clone()))
    }

    /// Runs on each thread play the given sequence; the last entry repeats
    pub fn sequence(runs: Vec<ScriptedRun>) -> Self {
        Self::new(move |ctx| {
            runs.get(ctx.run_index)
                .or_else(|| runs.last())
                .cloned()
                .unwrap_or_default()
        })
    }

    /// Make `delete_thread` fail with a server error
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Contexts of every run created so far, in creation order
    pub fn runs(&self) -> Vec<RunContext> {
        self.lock().history.clone()
    }

    pub fn create_run_count(&self) -> usize {
        self.lock().history.len()
    }

    pub fn deleted_threads(&self) -> Vec<ThreadKey> {
        self.lock().deleted.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn create_thread(&self, room_id: &str) -> BackendResult<String> {
        let mut state = self.lock();
        state.next_thread += 1;
        let thread_id = format!("thread-{}", state.next_thread);
        debug!(room_id = %room_id, thread_id = %thread_id, "Scripted thread created");
        Ok(thread_id)
    }

    async fn create_run(&self, thread: &ThreadKey, request: RunRequest) -> BackendResult<RunHandle> {
        let run_id = request
            .run_id
            .unwrap_or_else(|| format!("run-{}", uuid::Uuid::new_v4().simple()));

        let context = {
            let mut state = self.lock();
            let index = state.runs_per_thread.entry(thread.clone()).or_insert(0);
            let run_index = *index;
            *index += 1;
            RunContext {
                thread: thread.clone(),
                run_id: run_id.clone(),
                run_index,
                messages: request.messages,
                tools: request.tools,
            }
        };

        // Responder runs outside the lock so it may inspect the backend
        let run = (self.responder)(&context);

        let mut state = self.lock();
        state.pending.insert(run_id.clone(), run);
        state.history.push(context);
        Ok(RunHandle { run_id })
    }

    async fn subscribe(&self, thread: &ThreadKey, run_id: &str) -> BackendResult<BackendEventStream> {
        let run = self
            .lock()
            .pending
            .remove(run_id)
            .ok_or_else(|| BackendError::Protocol(format!("Unknown run: {}", run_id)))?;

        let (tx, stream) = BackendEventStream::channel(32);
        let thread_id = thread.thread_id.clone();
        let run_id = run_id.to_string();

        tokio::spawn(async move {
            if !run.delay.is_zero() {
                tokio::time::sleep(run.delay).await;
            }
            for item in run.events {
                let sent = match item {
                    Ok(event) => tx.send(fill_ids(event, &thread_id, &run_id)).await,
                    Err(error) => tx.send_error(error).await,
                };
                if sent.is_err() {
                    return;
                }
            }
            if run.hang {
                tx.closed().await;
            }
        });

        Ok(stream)
    }

    async fn delete_thread(&self, thread: &ThreadKey) -> BackendResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(BackendError::Server {
                status: 500,
                message: format!("Failed to delete thread {}", thread.thread_id),
            });
        }
        self.lock().deleted.push(thread.clone());
        Ok(())
    }
}

fn fill_ids(event: BackendEvent, thread: &str, run: &str) -> BackendEvent {
    let fill = |value: String, actual: &str| {
        if value.is_empty() {
            actual.to_string()
        } else {
            value
        }
    };
    match event {
        BackendEvent::RunStarted { thread_id, run_id } => BackendEvent::RunStarted {
            thread_id: fill(thread_id, thread),
            run_id: fill(run_id, run),
        },
        BackendEvent::RunFinished {
            thread_id,
            run_id,
            result,
        } => BackendEvent::RunFinished {
            thread_id: fill(thread_id, thread),
            run_id: fill(run_id, run),
            result,
        },
        other => other,
    }
}
