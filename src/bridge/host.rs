//! Host functions and the channel scripts use to reach them

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::error::{AbortReason, HostAbort};
use super::limits::AbortSignal;
use super::schema::{HostFunctionSchema, RawCallArgs};

/// Handles calls to one host function with already bound arguments
#[async_trait]
pub trait HostHandler: Send + Sync {
    async fn call(&self, args: Map<String, Value>) -> anyhow::Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> HostHandler for FnHandler<F>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn call(&self, args: Map<String, Value>) -> anyhow::Result<Value> {
        (self.0)(args).await
    }
}

/// A capability exposed to scripts
#[derive(Clone)]
pub struct HostFunction {
    pub schema: HostFunctionSchema,
    pub handler: Arc<dyn HostHandler>,
}

impl HostFunction {
    pub fn new(schema: HostFunctionSchema, handler: Arc<dyn HostHandler>) -> Self {
        Self { schema, handler }
    }

    pub fn from_fn<F, Fut>(schema: HostFunctionSchema, f: F) -> Self
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::new(schema, Arc::new(FnHandler(f)))
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }
}

impl std::fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFunction")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// Answer to a host call, handed back to the script
#[derive(Debug, Clone, PartialEq)]
pub enum HostReply {
    Value(Value),
    /// Validation or handler failure; the script keeps running
    Error(String),
}

impl HostReply {
    pub fn is_error(&self) -> bool {
        matches!(self, HostReply::Error(_))
    }

    /// Payload of the `ToolCallResult` event for this reply
    pub fn content(&self) -> String {
        match self {
            HostReply::Value(Value::String(s)) => s.clone(),
            HostReply::Value(value) => value.to_string(),
            HostReply::Error(message) => serde_json::json!({ "error": message }).to_string(),
        }
    }
}

pub(crate) enum HostRequest {
    Call {
        name: String,
        args: RawCallArgs,
        reply: oneshot::Sender<Result<HostReply, HostAbort>>,
    },
    Output(String),
}

/// Engine-side end of the bridge channel.
///
/// Calls block the interpreter worker until the async driver answers, which is
/// where the interpreter pauses at a host-call boundary.
#[derive(Clone)]
pub struct HostPort {
    requests: mpsc::UnboundedSender<HostRequest>,
    abort: AbortSignal,
}

impl HostPort {
    pub(crate) fn new(requests: mpsc::UnboundedSender<HostRequest>, abort: AbortSignal) -> Self {
        Self { requests, abort }
    }

    /// Call a host function and wait for the reply. Must run off the async runtime.
    pub fn call(&self, name: &str, args: RawCallArgs) -> Result<HostReply, HostAbort> {
        if let Some(reason) = self.abort.reason() {
            return Err(HostAbort::Aborted(reason));
        }
        let (reply, answer) = oneshot::channel();
        self.requests
            .send(HostRequest::Call {
                name: name.to_string(),
                args,
                reply,
            })
            .map_err(|_| HostAbort::Disconnected)?;
        match answer.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(self
                .abort
                .reason()
                .map(HostAbort::Aborted)
                .unwrap_or(HostAbort::Disconnected)),
        }
    }

    /// Forward captured print output
    pub fn output(&self, text: impl Into<String>) {
        if self.abort.is_triggered() {
            return;
        }
        let _ = self.requests.send(HostRequest::Output(text.into()));
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.abort.reason()
    }
}
