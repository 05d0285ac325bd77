//! Agent runtime: spawns and supervises [`AgentSession`]s

use async_trait::async_trait;
use futures::future::{join_all, select_all};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::backend::AgentBackend;
use super::domain::AgentResult;
use super::error::{RuntimeError, RuntimeResult};
use super::orchestrator::{OrchestratorConfig, RunOrchestrator, DEFAULT_MAX_CONTINUATIONS};
use super::session::{AgentSession, SessionOptions};
use crate::domain::{PlatformConstraints, ThreadKey};
use crate::tools::ToolRegistry;

/// Runtime-wide session policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// First component of every minted [`ThreadKey`]
    pub server_id: String,
    pub max_continuations: u32,
    /// Applied by `await_result(None)` unless a spawn overrides it
    pub default_timeout: Option<Duration>,
    /// Off by default: tool failures are reported back to the agent
    pub escalate_after_consecutive_tool_failures: Option<u32>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            server_id: "local".to_string(),
            max_continuations: DEFAULT_MAX_CONTINUATIONS,
            default_timeout: None,
            escalate_after_consecutive_tool_failures: None,
        }
    }
}

/// Resolves the tools available to agents in a room
#[async_trait]
pub trait ToolRegistryResolver: Send + Sync {
    async fn resolve(&self, room_id: &str) -> anyhow::Result<ToolRegistry>;
}

/// Same registry for every room
#[async_trait]
impl ToolRegistryResolver for ToolRegistry {
    async fn resolve(&self, _room_id: &str) -> anyhow::Result<ToolRegistry> {
        Ok(self.clone())
    }
}

/// Options for one spawn
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnOptions {
    pub timeout: Option<Duration>,
    /// Delete the backend thread once the session has its result
    pub ephemeral: bool,
    /// Continue a run the backend already knows about
    pub existing_run_id: Option<String>,
}

impl SpawnOptions {
    pub fn ephemeral() -> Self {
        Self {
            ephemeral: true,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Factory and supervisor of agent sessions
pub struct AgentRuntime {
    backend: Arc<dyn AgentBackend>,
    resolver: Arc<dyn ToolRegistryResolver>,
    config: RuntimeConfig,
    constraints: PlatformConstraints,
}

impl AgentRuntime {
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        resolver: Arc<dyn ToolRegistryResolver>,
        config: RuntimeConfig,
        constraints: PlatformConstraints,
    ) -> Self {
        Self {
            backend,
            resolver,
            config,
            constraints,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn constraints(&self) -> PlatformConstraints {
        self.constraints
    }

    /// Start a session for `prompt` in a new backend thread of `room_id`
    pub async fn spawn(
        &self,
        room_id: &str,
        prompt: impl Into<String>,
        options: SpawnOptions,
    ) -> RuntimeResult<AgentSession> {
        let tools = self
            .resolver
            .resolve(room_id)
            .await
            .map_err(|source| RuntimeError::ToolResolution {
                room_id: room_id.to_string(),
                source,
            })?;
        let thread_id = self.backend.create_thread(room_id).await?;
        let key = ThreadKey::new(self.config.server_id.clone(), room_id, thread_id);

        let orchestrator = RunOrchestrator::new(
            self.backend.clone(),
            tools.tool_definitions(),
            OrchestratorConfig {
                max_continuations: self.config.max_continuations,
            },
        );
        let session = AgentSession::new(
            key.clone(),
            orchestrator,
            tools,
            SessionOptions {
                escalate_after: self.config.escalate_after_consecutive_tool_failures,
                default_timeout: options.timeout.or(self.config.default_timeout),
            },
        );
        if options.ephemeral {
            self.delete_when_finished(&session);
        }
        session.start(prompt, options.existing_run_id)?;

        info!(thread_id = %key, ephemeral = options.ephemeral, "Spawned agent session");
        Ok(session)
    }

    fn delete_when_finished(&self, session: &AgentSession) {
        let mut results = session.results();
        let backend = self.backend.clone();
        let key = session.thread_key().clone();
        tokio::spawn(async move {
            let _ = results.wait_for(Option::is_some).await;
            match backend.delete_thread(&key).await {
                Ok(()) => debug!(thread_id = %key, "Deleted ephemeral thread"),
                Err(error) => warn!(thread_id = %key, "Failed to delete ephemeral thread: {}", error),
            }
        });
    }

    /// Results of all sessions, in input order
    pub async fn wait_all(
        &self,
        sessions: &[AgentSession],
        timeout: Option<Duration>,
    ) -> Vec<AgentResult> {
        join_all(sessions.iter().map(|s| s.await_result(timeout))).await
    }

    /// Index and result of the first session to finish.
    ///
    /// `None` when there are no sessions or none finished within `timeout`.
    pub async fn wait_any(
        &self,
        sessions: &[AgentSession],
        timeout: Option<Duration>,
    ) -> Option<(usize, AgentResult)> {
        if sessions.is_empty() {
            return None;
        }
        let first = select_all(sessions.iter().map(|s| Box::pin(s.result())));
        let (result, index, _) = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, first).await.ok()?,
            None => first.await,
        };
        Some((index, result))
    }

    pub fn cancel_all(&self, sessions: &[AgentSession]) {
        for session in sessions {
            session.cancel();
        }
    }
}
