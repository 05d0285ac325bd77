//! Interpreter bridge
//!
//! An [`InterpreterBridge`] wraps one sandboxed interpreter and turns every
//! execution into a [`BridgeEventStream`]. The interpreter runs on a blocking
//! worker; host calls and print output reach the async driver over a channel
//! and are re-emitted as lifecycle events. Engines that can pause at a host
//! call stream events as they happen, the others are buffered until the
//! terminal event.

mod cache;
mod capabilities;
mod emitter;
mod engine;
mod error;
mod events;
mod host;
mod limits;
mod schema;


pub use cache::{BridgeCache, BridgeConfig, BridgeLease, HostInstaller};
pub use capabilities::{host_call_function, sub_agent_functions, HostCapabilities, SubAgentHost};
pub use engine::{
    create_engine, EngineCapabilities, EngineKind, EvalContext, LuaEngine, RhaiEngine,
    ScriptEngine,
};
pub use error::{
    AbortReason, BridgeError, BridgeResult, HostAbort, HostCallError, RunErrorKind, ScriptError,
};
pub use events::{BridgeEvent, BridgeEventStream, ExecutionOutcome};
pub use host::{HostFunction, HostHandler, HostPort, HostReply};
pub use limits::{AbortSignal, ResourceLimits, DEFAULT_TIMEOUT};
pub use schema::{ArgumentError, HostFunctionSchema, HostParam, ParamType, RawCallArgs};

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agents::domain::ToolCallInfo;
use crate::domain::PlatformConstraints;
use emitter::{BufferedSink, EventSink, IncrementalSink};
use host::HostRequest;

const EVENT_BUFFER: usize = 64;

/// How long an aborted interpreter gets to unwind before it is abandoned
const ABORT_GRACE: Duration = Duration::from_secs(1);

tokio::task_local! {
    /// Identity of the bridge whose host function runs on this task
    static HOST_CALL_OWNER: usize;
}

/// What a bridge enforces and how it emits events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BridgeCapabilities {
    pub engine: EngineKind,
    /// Events are emitted while the script runs rather than after it returns
    pub supports_incremental_events: bool,
    pub enforces_timeout: bool,
    pub enforces_memory_limit: bool,
    pub enforces_stack_depth: bool,
    /// Overlapping executions are queued instead of refused. Executions
    /// started from one of the bridge's own host calls are refused either way.
    pub reentrant: bool,
}

/// One sandboxed interpreter with its host functions
#[derive(Clone)]
pub struct InterpreterBridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    kind: EngineKind,
    engine_caps: EngineCapabilities,
    engine: Arc<Mutex<Box<dyn ScriptEngine>>>,
    functions: RwLock<Vec<HostFunction>>,
    limits: ResourceLimits,
    constraints: PlatformConstraints,
    exec_lock: Arc<tokio::sync::Mutex<()>>,
    /// Executions accepted and not yet terminated
    active: AtomicUsize,
    /// Set when an aborted interpreter failed to stop within the grace period
    abandoned: AtomicBool,
    disposed: AtomicBool,
    shutdown: CancellationToken,
}

impl InterpreterBridge {
    pub(crate) fn new(
        kind: EngineKind,
        limits: ResourceLimits,
        constraints: PlatformConstraints,
    ) -> BridgeResult<Self> {
        let engine = create_engine(kind, &limits).map_err(BridgeError::EngineInit)?;
        let engine_caps = engine.capabilities();

        if limits.memory_limit_bytes.is_some() && !engine_caps.enforces_memory_limit {
            warn!(engine = %kind, "Memory limit requested but not enforced by this engine");
        }
        if limits.max_stack_depth.is_some() && !engine_caps.enforces_stack_depth {
            warn!(engine = %kind, "Stack depth limit requested but not enforced by this engine");
        }
        debug!(engine = %kind, timeout = ?limits.timeout, "Created interpreter bridge");

        Ok(Self {
            inner: Arc::new(BridgeInner {
                kind,
                engine_caps,
                engine: Arc::new(Mutex::new(engine)),
                functions: RwLock::new(Vec::new()),
                limits,
                constraints,
                exec_lock: Arc::new(tokio::sync::Mutex::new(())),
                active: AtomicUsize::new(0),
                abandoned: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Register a host function, replacing one with the same name
    pub fn register(&self, function: HostFunction) {
        let mut functions = self
            .inner
            .functions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match functions.iter_mut().find(|f| f.name() == function.name()) {
            Some(existing) => *existing = function,
            None => functions.push(function),
        }
    }

    /// Remove a host function. Returns false if it was not registered.
    pub fn unregister(&self, name: &str) -> bool {
        let mut functions = self
            .inner
            .functions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = functions.len();
        functions.retain(|f| f.name() != name);
        functions.len() != before
    }

    /// Schemas of the registered host functions, in registration order
    pub fn schemas(&self) -> Vec<HostFunctionSchema> {
        self.functions()
            .into_iter()
            .map(|f| f.schema)
            .collect()
    }

    pub fn capabilities(&self) -> BridgeCapabilities {
        let caps = self.inner.engine_caps;
        BridgeCapabilities {
            engine: self.inner.kind,
            supports_incremental_events: self.streams_incrementally(),
            enforces_timeout: true,
            enforces_memory_limit: caps.enforces_memory_limit,
            enforces_stack_depth: caps.enforces_stack_depth,
            reentrant: self.inner.constraints.supports_reentrant_interpreter,
        }
    }

    pub fn is_executing(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst) > 0
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Stop accepting executions and abort the one in flight
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();
        info!(engine = %self.inner.kind, "Disposed interpreter bridge");
    }

    /// Call a host function directly, outside any script
    pub async fn invoke(&self, name: &str, args: RawCallArgs) -> BridgeResult<Value> {
        if self.is_disposed() {
            return Err(BridgeError::Disposed);
        }
        let function = self
            .functions()
            .into_iter()
            .find(|f| f.name() == name)
            .ok_or_else(|| BridgeError::UnknownHostFunction(name.to_string()))?;
        let bound = function
            .schema
            .bind(&args)
            .map_err(|source| HostCallError::InvalidArguments {
                function: name.to_string(),
                source,
            })?;
        let value = function
            .handler
            .call(bound)
            .await
            .map_err(|source| HostCallError::Handler {
                function: name.to_string(),
                source,
            })?;
        Ok(value)
    }

    /// Execute a script. The stream always ends with `RunFinished` or `RunError`.
    pub fn execute(&self, code: impl Into<String>) -> BridgeEventStream {
        self.execute_with_cancel(code, CancellationToken::new())
    }

    /// Execute a script that stops when `cancel` fires
    pub fn execute_with_cancel(
        &self,
        code: impl Into<String>,
        cancel: CancellationToken,
    ) -> BridgeEventStream {
        let (tx, stream) = BridgeEventStream::channel(EVENT_BUFFER);
        let run_id = format!("run_{}", Uuid::new_v4().simple());

        if self.is_disposed() {
            refuse(&tx, run_id, RunErrorKind::Disposed, "bridge has been disposed");
            return stream;
        }
        if self.in_own_host_call() {
            debug!(run_id = %run_id, "Refusing execution from inside a host call of the same bridge");
            refuse(&tx, run_id, RunErrorKind::Busy, "bridge is suspended in a host call");
            return stream;
        }

        let guard = if self.inner.constraints.supports_reentrant_interpreter {
            None
        } else {
            match self.inner.exec_lock.clone().try_lock_owned() {
                Ok(guard) => Some(guard),
                Err(_) => {
                    debug!(run_id = %run_id, "Refusing overlapping execution");
                    refuse(&tx, run_id, RunErrorKind::Busy, "bridge is already executing");
                    return stream;
                }
            }
        };

        self.inner.active.fetch_add(1, Ordering::SeqCst);
        let bridge = self.clone();
        let code = code.into();
        tokio::spawn(async move {
            let _guard = match guard {
                Some(guard) => guard,
                None => bridge.inner.exec_lock.clone().lock_owned().await,
            };
            bridge.run_execution(run_id, code, cancel, tx).await;
            bridge.inner.active.fetch_sub(1, Ordering::SeqCst);
        });
        stream
    }

    fn functions(&self) -> Vec<HostFunction> {
        self.inner
            .functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// The suspended execution would hold the locks a nested one waits on
    fn in_own_host_call(&self) -> bool {
        HOST_CALL_OWNER
            .try_with(|owner| *owner == self.id())
            .unwrap_or(false)
    }

    fn streams_incrementally(&self) -> bool {
        self.inner.engine_caps.supports_pause && self.inner.constraints.supports_async_mode
    }

    async fn run_execution(
        &self,
        run_id: String,
        code: String,
        cancel: CancellationToken,
        tx: mpsc::Sender<BridgeEvent>,
    ) {
        let mut sink: Box<dyn EventSink> = if self.streams_incrementally() {
            Box::new(IncrementalSink::new(tx))
        } else {
            Box::new(BufferedSink::new(tx))
        };
        sink.emit(BridgeEvent::RunStarted {
            run_id: run_id.clone(),
        })
        .await;

        let outcome = if self.is_disposed() {
            Err(ScriptError::new(
                RunErrorKind::Disposed,
                "bridge has been disposed",
            ))
        } else if self.inner.abandoned.load(Ordering::SeqCst) {
            Err(ScriptError::new(
                RunErrorKind::Internal,
                "interpreter was abandoned after failing to stop",
            ))
        } else {
            self.drive(&code, &cancel, sink.as_mut()).await
        };

        let terminal = match outcome {
            Ok(result) => {
                debug!(run_id = %run_id, "Execution finished");
                BridgeEvent::RunFinished { run_id, result }
            }
            Err(error) => {
                debug!(run_id = %run_id, kind = %error.kind, "Execution failed: {}", error.message);
                BridgeEvent::RunError {
                    run_id,
                    message: error.message,
                    kind: error.kind,
                }
            }
        };
        sink.finish(terminal).await;
    }

    async fn drive(
        &self,
        code: &str,
        cancel: &CancellationToken,
        sink: &mut dyn EventSink,
    ) -> Result<Value, ScriptError> {
        let (requests_tx, mut requests) = mpsc::unbounded_channel();
        let abort = AbortSignal::new();
        let _abort_on_drop = AbortOnDrop(abort.clone());
        let functions = self.functions();
        let ctx = EvalContext {
            host: HostPort::new(requests_tx, abort.clone()),
            schemas: functions.iter().map(|f| f.schema.clone()).collect(),
            limits: self.inner.limits,
            abort: abort.clone(),
        };

        let engine = Arc::clone(&self.inner.engine);
        let code = code.to_string();
        let mut worker: JoinHandle<Result<Value, ScriptError>> =
            tokio::task::spawn_blocking(move || {
                let mut engine = engine.lock().unwrap_or_else(PoisonError::into_inner);
                engine.eval(&code, &ctx)
            });

        let deadline = Instant::now() + self.inner.limits.timeout;
        let mut fault: Option<ScriptError> = None;

        let joined = loop {
            tokio::select! {
                biased;
                joined = &mut worker => break Some(joined),
                Some(request) = requests.recv() => match request {
                    HostRequest::Output(text) => sink.text(text).await,
                    HostRequest::Call { name, args, reply } => {
                        sink.end_text().await;
                        match functions.iter().find(|f| f.name() == name) {
                            Some(function) => {
                                let answer = self
                                    .dispatch(function, args, deadline, cancel, sink)
                                    .await
                                    .map_err(|reason| {
                                        abort.trigger(reason);
                                        HostAbort::Aborted(reason)
                                    });
                                let _ = reply.send(answer);
                            }
                            None => {
                                warn!(function = %name, "Script called an unregistered host function");
                                let rejection = HostAbort::UnknownFunction(name);
                                fault.get_or_insert_with(|| rejection.clone().into());
                                abort.trigger(AbortReason::HostRejected);
                                let _ = reply.send(Err(rejection));
                            }
                        }
                    }
                },
                _ = sleep_until(deadline) => {
                    abort.trigger(AbortReason::TimedOut);
                    break None;
                }
                _ = cancel.cancelled() => {
                    abort.trigger(AbortReason::Cancelled);
                    break None;
                }
                _ = self.inner.shutdown.cancelled() => {
                    abort.trigger(AbortReason::Cancelled);
                    break None;
                }
            }
        };

        let joined = match joined {
            Some(joined) => Some(joined),
            None => self.wind_down(&mut worker, &mut requests, &abort).await,
        };

        while let Ok(request) = requests.try_recv() {
            match request {
                HostRequest::Output(text) if !abort.is_triggered() => sink.text(text).await,
                HostRequest::Output(_) => {}
                HostRequest::Call { reply, .. } => {
                    let _ = reply.send(Err(HostAbort::Disconnected));
                }
            }
        }

        if let Some(fault) = fault {
            return Err(fault);
        }
        if let Some(reason) = abort.reason() {
            let mut message = reason.to_string();
            if joined.is_none() {
                message.push_str("; interpreter did not stop and was abandoned");
            }
            return Err(ScriptError::new(reason.kind(), message));
        }
        match joined {
            Some(Ok(result)) => result,
            Some(Err(join_error)) => {
                warn!("Interpreter worker failed: {}", join_error);
                Err(ScriptError::new(
                    RunErrorKind::Internal,
                    format!("interpreter worker failed: {}", join_error),
                ))
            }
            None => Err(ScriptError::new(
                RunErrorKind::Internal,
                "interpreter worker lost",
            )),
        }
    }

    /// Let an aborted interpreter unwind, refusing any calls it still makes
    async fn wind_down(
        &self,
        worker: &mut JoinHandle<Result<Value, ScriptError>>,
        requests: &mut mpsc::UnboundedReceiver<HostRequest>,
        abort: &AbortSignal,
    ) -> Option<Result<Result<Value, ScriptError>, tokio::task::JoinError>> {
        let grace = sleep(ABORT_GRACE);
        tokio::pin!(grace);
        loop {
            tokio::select! {
                biased;
                joined = &mut *worker => return Some(joined),
                Some(request) = requests.recv() => {
                    if let HostRequest::Call { reply, .. } = request {
                        let reason = abort.reason().unwrap_or(AbortReason::Cancelled);
                        let _ = reply.send(Err(HostAbort::Aborted(reason)));
                    }
                }
                _ = &mut grace => {
                    warn!(engine = %self.inner.kind, "Interpreter did not stop after abort; abandoning it");
                    self.inner.abandoned.store(true, Ordering::SeqCst);
                    return None;
                }
            }
        }
    }

    /// Run one host call as a step, returning the reply for the script
    async fn dispatch(
        &self,
        function: &HostFunction,
        args: RawCallArgs,
        deadline: Instant,
        cancel: &CancellationToken,
        sink: &mut dyn EventSink,
    ) -> Result<HostReply, AbortReason> {
        let name = function.name().to_string();
        let call_id = ToolCallInfo::generate_id();
        let bound = function.schema.bind(&args);
        let args_json = match &bound {
            Ok(map) => Value::Object(map.clone()),
            Err(_) => args.to_json(),
        };

        sink.emit(BridgeEvent::StepStarted {
            step_name: name.clone(),
        })
        .await;
        sink.emit(BridgeEvent::ToolCallStart {
            tool_call_id: call_id.clone(),
            tool_call_name: name.clone(),
        })
        .await;
        sink.emit(BridgeEvent::ToolCallArgs {
            tool_call_id: call_id.clone(),
            delta: args_json.to_string(),
        })
        .await;
        sink.emit(BridgeEvent::ToolCallEnd {
            tool_call_id: call_id.clone(),
        })
        .await;

        let answer = match bound {
            Err(source) => {
                let error = HostCallError::InvalidArguments {
                    function: name.clone(),
                    source,
                };
                debug!(function = %name, "{}", error);
                Ok(HostReply::Error(error.to_string()))
            }
            Ok(bound) => {
                let call = AssertUnwindSafe(HOST_CALL_OWNER.scope(self.id(), function.handler.call(bound)))
                    .catch_unwind();
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(AbortReason::Cancelled),
                    _ = self.inner.shutdown.cancelled() => Err(AbortReason::Cancelled),
                    _ = sleep_until(deadline) => Err(AbortReason::TimedOut),
                    outcome = call => Ok(match outcome {
                        Ok(Ok(value)) => HostReply::Value(value),
                        Ok(Err(error)) => {
                            debug!(function = %name, "Host function failed: {:#}", error);
                            HostReply::Error(error.to_string())
                        }
                        Err(_) => {
                            warn!(function = %name, "Host function panicked");
                            HostReply::Error(format!("host function `{}` panicked", name))
                        }
                    }),
                }
            }
        };

        let (content, is_error) = match &answer {
            Ok(reply) => (reply.content(), reply.is_error()),
            Err(reason) => (
                serde_json::json!({ "error": reason.to_string() }).to_string(),
                true,
            ),
        };
        sink.emit(BridgeEvent::ToolCallResult {
            tool_call_id: call_id,
            content,
            is_error,
        })
        .await;
        sink.emit(BridgeEvent::StepFinished { step_name: name })
            .await;
        answer
    }
}

impl std::fmt::Debug for InterpreterBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpreterBridge")
            .field("engine", &self.inner.kind)
            .field("executing", &self.is_executing())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

/// Stops the interpreter worker when the driver goes away before it finishes
struct AbortOnDrop(AbortSignal);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.trigger(AbortReason::Cancelled);
    }
}

/// Answer an execution that never starts
fn refuse(tx: &mpsc::Sender<BridgeEvent>, run_id: String, kind: RunErrorKind, message: &str) {
    let _ = tx.try_send(BridgeEvent::RunStarted {
        run_id: run_id.clone(),
    });
    let _ = tx.try_send(BridgeEvent::RunError {
        run_id,
        message: message.to_string(),
        kind,
    });
}
