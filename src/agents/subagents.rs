use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::domain::AgentResult;
use super::runtime::{AgentRuntime, SpawnOptions};
use super::session::AgentSession;
use crate::bridge::SubAgentHost;

/// Sub-agents spawned from scripts running in one room.
///
/// Handles are backend thread ids. Sub-agent threads are ephemeral.
pub struct SubAgentPool {
    runtime: Arc<AgentRuntime>,
    room_id: String,
    sessions: Mutex<HashMap<String, Arc<AgentSession>>>,
}

impl SubAgentPool {
    pub fn new(runtime: Arc<AgentRuntime>, room_id: impl Into<String>) -> Self {
        Self {
            runtime,
            room_id: room_id.into(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AgentSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self, handle: &str) -> Option<Arc<AgentSession>> {
        self.sessions().get(handle).cloned()
    }
}

#[async_trait]
impl SubAgentHost for SubAgentPool {
    async fn spawn(&self, prompt: String) -> anyhow::Result<String> {
        let session = self
            .runtime
            .spawn(&self.room_id, prompt, SpawnOptions::ephemeral())
            .await
            .context("failed to spawn sub-agent")?;
        let handle = session.thread_key().thread_id.clone();
        self.sessions().insert(handle.clone(), Arc::new(session));
        Ok(handle)
    }

    async fn wait(&self, handle: &str, timeout: Option<Duration>) -> anyhow::Result<Value> {
        let session = self
            .session(handle)
            .ok_or_else(|| anyhow!("unknown sub-agent `{}`", handle))?;
        let result = session.await_result(timeout).await;
        if !matches!(result, AgentResult::TimedOut { .. }) {
            self.sessions().remove(handle);
        }
        Ok(serde_json::to_value(&result)?)
    }

    async fn cancel(&self, handle: &str) -> anyhow::Result<bool> {
        Ok(match self.session(handle) {
            Some(session) => {
                session.cancel();
                true
            }
            None => false,
        })
    }
}
