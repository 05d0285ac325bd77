//! Run orchestration
//!
//! A [`RunOrchestrator`] drives one conversational turn against an
//! [`AgentBackend`]: it creates the run, folds the streamed events into the
//! conversation, yields when the backend asks for client-side tool calls and
//! resumes with a continuation run once their outputs are submitted.
//!
//! State is published through a `watch` channel. Every write happens under the
//! inner lock and is tagged with a generation, so a drive task that outlived a
//! cancel or reset can never overwrite the newer state.

mod fold;
mod state;

#[cfg(test)]
mod orchestrator_test;

pub use state::{RunSnapshot, RunState};

use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agents::backend::{AgentBackend, RunRequest};
use crate::agents::domain::{Conversation, FailureReason, Message, ToolCallInfo, ToolDefinition};
use crate::agents::error::{BackendError, OrchestratorError, OrchestratorResult};
use crate::domain::ThreadKey;
use fold::{EventFolder, FoldStep};

/// Default bound on continuation runs per turn
pub const DEFAULT_MAX_CONTINUATIONS: u32 = 10;

/// Orchestrator configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Continuation runs allowed after the initial run
    pub max_continuations: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_continuations: DEFAULT_MAX_CONTINUATIONS,
        }
    }
}

/// Drives one conversational turn to a terminal state
pub struct RunOrchestrator {
    shared: Arc<Shared>,
}

struct Shared {
    backend: Arc<dyn AgentBackend>,
    tools: Vec<ToolDefinition>,
    config: OrchestratorConfig,
    state: watch::Sender<RunState>,
    inner: Mutex<RunInner>,
}

#[derive(Default)]
struct RunInner {
    conversation: Option<Conversation>,
    run_id: Option<String>,
    continuations: u32,
    generation: u64,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    disposed: bool,
}

enum RunOutcome {
    Finished,
    Failed {
        reason: FailureReason,
        error: String,
    },
    /// The run was superseded by a cancel, reset or dispose
    Stale,
}

impl RunOutcome {
    fn from_error(error: &BackendError) -> Self {
        RunOutcome::Failed {
            reason: error.failure_reason(),
            error: error.to_string(),
        }
    }
}

impl RunOrchestrator {
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        tools: Vec<ToolDefinition>,
        config: OrchestratorConfig,
    ) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            shared: Arc::new(Shared {
                backend,
                tools,
                config,
                state,
                inner: Mutex::new(RunInner::default()),
            }),
        }
    }

    /// Submit a user message and start driving a run.
    ///
    /// Only valid from `Idle`. A conversation kept by `reset()` is reused when
    /// the thread matches.
    pub fn start_run(
        &self,
        thread: ThreadKey,
        user_message: impl Into<String>,
        existing_run_id: Option<String>,
    ) -> OrchestratorResult<()> {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if inner.disposed {
            return Err(OrchestratorError::Disposed);
        }
        let current = shared.state_name();
        if current != "idle" {
            return Err(OrchestratorError::AlreadyActive(current));
        }

        let mut conversation = match inner.conversation.take() {
            Some(conversation) if conversation.thread == thread => conversation,
            _ => Conversation::new(thread.clone()),
        };
        conversation.push(Message::user(user_message));
        inner.conversation = Some(conversation.clone());
        inner.run_id = existing_run_id.clone();
        inner.continuations = 0;
        inner.generation += 1;
        inner.cancel = CancellationToken::new();

        shared.state.send_replace(RunState::Running(RunSnapshot {
            run_id: existing_run_id.clone().unwrap_or_default(),
            conversation,
            continuation: 0,
        }));
        info!(thread_id = %thread, "Run started");

        inner.task = Some(tokio::spawn(drive(
            shared.clone(),
            inner.generation,
            inner.cancel.clone(),
            existing_run_id,
        )));
        Ok(())
    }

    /// Append the executed tool calls and resume with a continuation run.
    ///
    /// Every pending call must be present and settled. Once the continuation
    /// bound is reached the run fails with `InternalError` instead.
    pub fn submit_tool_outputs(&self, executed: Vec<ToolCallInfo>) -> OrchestratorResult<()> {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if inner.disposed {
            return Err(OrchestratorError::Disposed);
        }
        let pending = match &*shared.state.borrow() {
            RunState::ToolYielding(pending) => pending.clone(),
            other => return Err(OrchestratorError::NotYielding(other.name())),
        };

        let missing: Vec<String> = pending
            .iter()
            .filter(|p| !executed.iter().any(|c| c.id == p.id && c.is_settled()))
            .map(|p| p.id.clone())
            .collect();
        if !missing.is_empty() {
            return Err(OrchestratorError::MissingToolOutputs(missing));
        }

        let conversation = {
            let conversation = inner
                .conversation
                .as_mut()
                .ok_or(OrchestratorError::NotYielding("idle"))?;
            for call in pending
                .iter()
                .filter_map(|p| executed.iter().find(|c| c.id == p.id))
            {
                if let Some(slot) = conversation.tool_call_mut(&call.id) {
                    *slot = call.clone();
                }
                conversation.push(Message::tool_result(call));
            }
            conversation.clone()
        };

        let max = shared.config.max_continuations;
        if inner.continuations >= max {
            warn!(thread_id = %conversation.thread, max_continuations = max, "Continuation limit reached");
            shared.state.send_replace(RunState::Failed {
                reason: FailureReason::InternalError,
                error: format!("Continuation limit of {} reached", max),
            });
            return Ok(());
        }

        inner.continuations += 1;
        inner.generation += 1;
        debug!(
            thread_id = %conversation.thread,
            continuation = inner.continuations,
            "Submitting tool outputs"
        );
        shared.state.send_replace(RunState::Running(RunSnapshot {
            run_id: inner.run_id.clone().unwrap_or_default(),
            conversation,
            continuation: inner.continuations,
        }));
        inner.task = Some(tokio::spawn(drive(
            shared.clone(),
            inner.generation,
            inner.cancel.clone(),
            None,
        )));
        Ok(())
    }

    /// Cancel an active run. Returns false when there was nothing to cancel.
    pub fn cancel_run(&self) -> bool {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if !shared.is_active() {
            return false;
        }
        inner.cancel.cancel();
        inner.generation += 1;
        shared.state.send_replace(RunState::Cancelled {
            reason: "Run cancelled".to_string(),
        });
        info!(run_id = ?inner.run_id, "Run cancelled");
        true
    }

    /// Return to `Idle`, keeping the conversation history
    pub fn reset(&self) {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if inner.disposed {
            return;
        }
        inner.cancel.cancel();
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        inner.generation += 1;
        inner.continuations = 0;
        inner.run_id = None;
        shared.state.send_replace(RunState::Idle);
    }

    /// Stop any active run. Further operations fail with `Disposed`.
    pub fn dispose(&self) {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if inner.disposed {
            return;
        }
        inner.disposed = true;
        inner.cancel.cancel();
        inner.generation += 1;
        if shared.is_active() {
            shared.state.send_replace(RunState::Cancelled {
                reason: "Orchestrator disposed".to_string(),
            });
        }
    }

    /// Receiver for state changes; intermediate `Running` snapshots may be coalesced
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.shared.state.subscribe()
    }

    /// Stream of states, starting with the current one
    pub fn state_changes(&self) -> WatchStream<RunState> {
        WatchStream::new(self.subscribe())
    }

    pub fn current_state(&self) -> RunState {
        self.shared.state.borrow().clone()
    }

    pub fn conversation(&self) -> Option<Conversation> {
        self.shared.lock().conversation.clone()
    }

    pub fn continuations(&self) -> u32 {
        self.shared.lock().continuations
    }

    /// Token of the current run. Fires on cancel, reset or dispose.
    pub fn cancellation(&self) -> CancellationToken {
        self.shared.lock().cancel.clone()
    }
}

impl Drop for RunOrchestrator {
    fn drop(&mut self) {
        self.shared.lock().cancel.cancel();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RunInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_name(&self) -> &'static str {
        self.state.borrow().name()
    }

    fn is_active(&self) -> bool {
        self.state.borrow().is_active()
    }

    fn is_running(&self) -> bool {
        matches!(*self.state.borrow(), RunState::Running(_))
    }

    async fn run_once(&self, generation: u64, requested_run_id: Option<String>) -> RunOutcome {
        let Some((thread, messages)) = self.request_snapshot(generation) else {
            return RunOutcome::Stale;
        };
        let request = RunRequest {
            run_id: requested_run_id,
            messages,
            tools: self.tools.clone(),
        };

        let handle = match self.backend.create_run(&thread, request).await {
            Ok(handle) => handle,
            Err(e) => return RunOutcome::from_error(&e),
        };
        if !self.record_run_id(generation, &handle.run_id) {
            return RunOutcome::Stale;
        }

        let mut stream = match self.backend.subscribe(&thread, &handle.run_id).await {
            Ok(stream) => stream,
            Err(e) => return RunOutcome::from_error(&e),
        };

        let mut folder = EventFolder::new();
        while let Some(item) = stream.next().await {
            let event = match item {
                Ok(event) => event,
                Err(e) => return RunOutcome::from_error(&e),
            };
            match self.fold(generation, &mut folder, event) {
                None => return RunOutcome::Stale,
                Some(FoldStep::Continue) => {}
                Some(FoldStep::Finished) => return RunOutcome::Finished,
                Some(FoldStep::Errored { reason, message }) => {
                    return RunOutcome::Failed {
                        reason,
                        error: message,
                    }
                }
            }
        }

        RunOutcome::Failed {
            reason: FailureReason::NetworkLost,
            error: "Event stream closed before the run finished".to_string(),
        }
    }

    fn request_snapshot(&self, generation: u64) -> Option<(ThreadKey, Vec<Message>)> {
        let inner = self.lock();
        if inner.generation != generation {
            return None;
        }
        inner
            .conversation
            .as_ref()
            .map(|c| (c.thread.clone(), c.messages.clone()))
    }

    fn record_run_id(&self, generation: u64, run_id: &str) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation || !self.is_running() {
            return false;
        }
        inner.run_id = Some(run_id.to_string());
        self.state.send_modify(|state| {
            if let RunState::Running(snapshot) = state {
                snapshot.run_id = run_id.to_string();
            }
        });
        true
    }

    fn fold(
        &self,
        generation: u64,
        folder: &mut EventFolder,
        event: crate::agents::backend::BackendEvent,
    ) -> Option<FoldStep> {
        let mut inner = self.lock();
        if inner.generation != generation || !self.is_running() {
            return None;
        }
        let continuation = inner.continuations;
        let run_id = inner.run_id.clone().unwrap_or_default();
        let conversation = inner.conversation.as_mut()?;
        let step = folder.apply(conversation, event);
        if step == FoldStep::Continue {
            self.state.send_replace(RunState::Running(RunSnapshot {
                run_id,
                conversation: conversation.clone(),
                continuation,
            }));
        }
        Some(step)
    }

    fn settle(&self, generation: u64, outcome: RunOutcome) {
        let inner = self.lock();
        if inner.generation != generation || !self.is_running() {
            return;
        }
        let next = match outcome {
            RunOutcome::Stale => return,
            RunOutcome::Finished => {
                let Some(conversation) = inner.conversation.clone() else {
                    return;
                };
                let pending = conversation.pending_tool_calls();
                if pending.is_empty() {
                    info!(thread_id = %conversation.thread, "Run completed");
                    RunState::Completed {
                        conversation,
                        run_id: inner.run_id.clone().unwrap_or_default(),
                    }
                } else {
                    debug!(
                        thread_id = %conversation.thread,
                        pending = pending.len(),
                        "Run yielding for tool calls"
                    );
                    RunState::ToolYielding(pending)
                }
            }
            RunOutcome::Failed { reason, error } => {
                warn!(run_id = ?inner.run_id, reason = %reason, "Run failed: {}", error);
                RunState::Failed { reason, error }
            }
        };
        self.state.send_replace(next);
    }
}

async fn drive(
    shared: Arc<Shared>,
    generation: u64,
    cancel: CancellationToken,
    requested_run_id: Option<String>,
) {
    let outcome = tokio::select! {
        _ = cancel.cancelled() => return,
        outcome = shared.run_once(generation, requested_run_id) => outcome,
    };
    shared.settle(generation, outcome);
}
