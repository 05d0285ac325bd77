//! Agent sessions
//!
//! An [`AgentSession`] owns one [`RunOrchestrator`] and hides tool yielding from
//! its caller: pending tool calls are executed against the session's
//! [`ToolRegistry`] and submitted back, so the caller only ever sees text and
//! one final [`AgentResult`].

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use crate::agents::domain::{AgentResult, Conversation, FailureReason, Role, ToolCallInfo};
use crate::agents::error::{RuntimeError, RuntimeResult};
use crate::agents::orchestrator::{RunOrchestrator, RunState};
use crate::domain::ThreadKey;
use crate::tools::{ToolContext, ToolRegistry};

const TEXT_BUFFER: usize = 256;

/// Per-session policy set by the runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SessionOptions {
    /// Fail the session after this many tool failures in a row
    pub escalate_after: Option<u32>,
    /// Used by `await_result(None)`
    pub default_timeout: Option<Duration>,
}

/// One agent conversation turn, driven to a single result
pub struct AgentSession {
    shared: Arc<SessionShared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

struct SessionShared {
    key: ThreadKey,
    orchestrator: RunOrchestrator,
    tools: ToolRegistry,
    options: SessionOptions,
    result: watch::Sender<Option<AgentResult>>,
    text: Mutex<Option<broadcast::Sender<String>>>,
    started: AtomicBool,
}

impl AgentSession {
    pub(crate) fn new(
        key: ThreadKey,
        orchestrator: RunOrchestrator,
        tools: ToolRegistry,
        options: SessionOptions,
    ) -> Self {
        let (result, _) = watch::channel(None);
        let (text, _) = broadcast::channel(TEXT_BUFFER);
        Self {
            shared: Arc::new(SessionShared {
                key,
                orchestrator,
                tools,
                options,
                result,
                text: Mutex::new(Some(text)),
                started: AtomicBool::new(false),
            }),
            driver: Mutex::new(None),
        }
    }

    pub fn thread_key(&self) -> &ThreadKey {
        &self.shared.key
    }

    /// Send the user message and start driving the run
    pub fn start(
        &self,
        user_message: impl Into<String>,
        existing_run_id: Option<String>,
    ) -> RuntimeResult<()> {
        let shared = &self.shared;
        if shared.has_result() {
            return Err(RuntimeError::SessionFinished(shared.key.to_string()));
        }
        if shared.started.swap(true, Ordering::SeqCst) {
            return Err(RuntimeError::AlreadyStarted(shared.key.to_string()));
        }

        let states = shared.orchestrator.subscribe();
        shared
            .orchestrator
            .start_run(shared.key.clone(), user_message, existing_run_id)?;
        let driver = tokio::spawn(drive(shared.clone(), states));
        *self.driver.lock().unwrap_or_else(PoisonError::into_inner) = Some(driver);
        Ok(())
    }

    /// Cancel the run. Never blocks; calling it again has no effect.
    pub fn cancel(&self) {
        let shared = &self.shared;
        if shared.has_result() {
            return;
        }
        if shared.orchestrator.cancel_run() {
            debug!(thread_id = %shared.key, "Session cancel requested");
        } else if !shared.started.load(Ordering::SeqCst) {
            shared.finish(shared.failure(
                FailureReason::Cancelled,
                "Session cancelled before it started",
            ));
        }
    }

    /// Wait for the session's result
    pub async fn result(&self) -> AgentResult {
        let mut results = self.shared.result.subscribe();
        let result = match results.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        result.unwrap_or_else(|| {
            self.shared
                .failure(FailureReason::InternalError, "result channel closed")
        })
    }

    /// The result if it has already been produced
    pub fn try_result(&self) -> Option<AgentResult> {
        self.shared.result.borrow().clone()
    }

    /// Wait for the result for at most `timeout` (or the session's default).
    ///
    /// Expiry yields `TimedOut` and leaves the run going.
    pub async fn await_result(&self, timeout: Option<Duration>) -> AgentResult {
        let Some(timeout) = timeout.or(self.shared.options.default_timeout) else {
            return self.result().await;
        };
        let started = Instant::now();
        match tokio::time::timeout(timeout, self.result()).await {
            Ok(result) => result,
            Err(_) => {
                debug!(thread_id = %self.shared.key, timeout = ?timeout, "Timed out waiting for result");
                AgentResult::TimedOut {
                    thread_key: self.shared.key.clone(),
                    elapsed: started.elapsed(),
                }
            }
        }
    }

    /// Incremental assistant text from the moment of subscription.
    ///
    /// Ends once the session reaches its result.
    pub fn text_stream(&self) -> BoxStream<'static, String> {
        let text = self.shared.text.lock().unwrap_or_else(PoisonError::into_inner);
        match text.as_ref() {
            Some(sender) => BroadcastStream::new(sender.subscribe())
                .filter_map(|chunk| async move { chunk.ok() })
                .boxed(),
            None => stream::empty().boxed(),
        }
    }

    /// Stop driving the session and dispose its orchestrator.
    ///
    /// A session without a result resolves to `Failure(InternalError)`.
    pub fn dispose(&self) {
        if let Some(driver) = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            driver.abort();
        }
        let shared = &self.shared;
        shared.finish(shared.failure(
            FailureReason::InternalError,
            "disposed before completion",
        ));
        shared.orchestrator.dispose();
    }

    pub(crate) fn results(&self) -> watch::Receiver<Option<AgentResult>> {
        self.shared.result.subscribe()
    }
}

impl Drop for AgentSession {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("thread_key", &self.shared.key)
            .field("state", &self.shared.orchestrator.current_state().name())
            .finish_non_exhaustive()
    }
}

impl SessionShared {
    fn has_result(&self) -> bool {
        self.result.borrow().is_some()
    }

    fn partial_output(&self) -> Option<String> {
        self.orchestrator
            .conversation()
            .and_then(|c| c.last_assistant_text().map(str::to_string))
    }

    fn failure(&self, reason: FailureReason, error: impl Into<String>) -> AgentResult {
        AgentResult::Failure {
            thread_key: self.key.clone(),
            reason,
            error: error.into(),
            partial_output: self.partial_output(),
        }
    }

    /// Publish the result unless one exists. Closes the text stream.
    fn finish(&self, result: AgentResult) -> bool {
        let published = self.result.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        });
        if published {
            self.text
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            match self.result.borrow().as_ref() {
                Some(AgentResult::Failure { reason, error, .. }) => {
                    warn!(thread_id = %self.key, reason = %reason, "Session failed: {}", error)
                }
                Some(_) => info!(thread_id = %self.key, "Session finished"),
                None => {}
            }
        }
        published
    }

    /// Forward assistant text not yet seen by text subscribers
    fn forward_text(&self, conversation: &Conversation, cursor: &mut HashMap<String, usize>) {
        let text = self.text.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = text.as_ref() else {
            return;
        };
        for message in conversation
            .messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
        {
            let sent = cursor.entry(message.id.clone()).or_insert(0);
            if let Some(delta) = message.content.get(*sent..).filter(|d| !d.is_empty()) {
                let _ = sender.send(delta.to_string());
                *sent = message.content.len();
            }
        }
    }

    /// Execute a yielded batch in announcement order.
    ///
    /// Executor errors mark the call failed. With escalation enabled, too many
    /// failures in a row return the message to fail the session with. A
    /// cancelled run stops the batch at the call in flight.
    async fn execute_tools(
        &self,
        pending: Vec<ToolCallInfo>,
        consecutive_failures: &mut u32,
    ) -> Result<Vec<ToolCallInfo>, String> {
        let cancel = self.orchestrator.cancellation();
        let ctx = ToolContext::new(self.key.clone()).with_cancellation(cancel.clone());

        let mut executed = Vec::with_capacity(pending.len());
        for mut call in pending {
            call.mark_executing();
            debug!(thread_id = %self.key, tool = %call.name, tool_call_id = %call.id, "Executing tool call");
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(thread_id = %self.key, tool = %call.name, "Tool batch stopped by cancellation");
                    break;
                }
                outcome = self.tools.execute(&call, &ctx) => outcome,
            };
            match outcome {
                Ok(output) => {
                    *consecutive_failures = 0;
                    call.complete(output);
                }
                Err(error) => {
                    *consecutive_failures += 1;
                    warn!(thread_id = %self.key, tool = %call.name, "Tool call failed: {}", error);
                    if let Some(limit) = self.options.escalate_after {
                        if *consecutive_failures >= limit {
                            return Err(format!(
                                "{} consecutive tool failures, last from `{}`: {}",
                                consecutive_failures, call.name, error
                            ));
                        }
                    }
                    call.fail(error.to_string());
                }
            }
            executed.push(call);
        }
        Ok(executed)
    }
}

async fn drive(shared: Arc<SessionShared>, mut states: watch::Receiver<RunState>) {
    let mut cursor = HashMap::new();
    let mut consecutive_failures = 0;

    loop {
        let state = states.borrow_and_update().clone();
        match state {
            RunState::Idle => {}
            RunState::Running(snapshot) => shared.forward_text(&snapshot.conversation, &mut cursor),
            RunState::ToolYielding(pending) => {
                if let Some(conversation) = shared.orchestrator.conversation() {
                    shared.forward_text(&conversation, &mut cursor);
                }
                match shared.execute_tools(pending, &mut consecutive_failures).await {
                    Ok(executed) => {
                        if let Err(error) = shared.orchestrator.submit_tool_outputs(executed) {
                            debug!(thread_id = %shared.key, "Tool outputs not submitted: {}", error);
                        }
                    }
                    Err(message) => {
                        shared.finish(shared.failure(FailureReason::ToolExecutionFailed, message));
                        shared.orchestrator.cancel_run();
                        return;
                    }
                }
            }
            RunState::Completed {
                conversation,
                run_id,
            } => {
                shared.forward_text(&conversation, &mut cursor);
                let output = conversation
                    .last_assistant_text()
                    .unwrap_or_default()
                    .to_string();
                shared.finish(AgentResult::Success {
                    thread_key: shared.key.clone(),
                    output,
                    run_id,
                });
                return;
            }
            RunState::Failed { reason, error } => {
                shared.finish(shared.failure(reason, error));
                return;
            }
            RunState::Cancelled { reason } => {
                shared.finish(shared.failure(FailureReason::Cancelled, reason));
                return;
            }
        }

        if states.changed().await.is_err() {
            shared.finish(shared.failure(
                FailureReason::InternalError,
                "orchestrator state channel closed",
            ));
            return;
        }
    }
}
