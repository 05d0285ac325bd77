use rhai::{Dynamic, Engine, EvalAltResult, Position, Scope};
use serde_json::Value;

use super::{EngineCapabilities, EngineKind, EvalContext, ScriptEngine};
use crate::bridge::error::{AbortReason, RunErrorKind, ScriptError};
use crate::bridge::host::{HostPort, HostReply};
use crate::bridge::limits::ResourceLimits;
use crate::bridge::schema::{HostFunctionSchema, RawCallArgs};

/// Highest call arity exposed for a host function
const MAX_ARITY: usize = 6;

/// Rhai interpreter.
///
/// Evaluation runs to completion in one call, so the bridge buffers events.
/// Call depth is enforced; memory is not.
pub struct RhaiEngine {
    scope: Scope<'static>,
    max_call_levels: Option<usize>,
}

impl RhaiEngine {
    pub fn new(limits: &ResourceLimits) -> Self {
        Self {
            scope: Scope::new(),
            max_call_levels: limits.max_stack_depth,
        }
    }

    fn build_engine(&self, ctx: &EvalContext) -> Engine {
        let mut engine = Engine::new();
        if let Some(depth) = self.max_call_levels {
            engine.set_max_call_levels(depth);
        }

        let abort = ctx.abort.clone();
        engine.on_progress(move |_| abort.reason().map(|r| Dynamic::from(r.to_string())));

        let port = ctx.host.clone();
        engine.on_print(move |text| port.output(format!("{}\n", text)));

        for schema in &ctx.schemas {
            register_host_function(&mut engine, schema, &ctx.host);
        }
        engine
    }
}

impl ScriptEngine for RhaiEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Rhai
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            supports_pause: false,
            enforces_memory_limit: false,
            enforces_stack_depth: true,
        }
    }

    fn eval(&mut self, code: &str, ctx: &EvalContext) -> Result<Value, ScriptError> {
        let engine = self.build_engine(ctx);
        self.scope.set_value("result", Dynamic::UNIT);

        let returned = engine
            .eval_with_scope::<Dynamic>(&mut self.scope, code)
            .map_err(|e| classify(&e, ctx.abort.reason()))?;
        let value = if returned.is_unit() {
            self.scope
                .get_value::<Dynamic>("result")
                .unwrap_or(Dynamic::UNIT)
        } else {
            returned
        };

        rhai::serde::from_dynamic::<Value>(&value).map_err(|e| {
            ScriptError::new(
                RunErrorKind::Runtime,
                format!("result is not serializable: {}", e),
            )
        })
    }
}

#[derive(Clone)]
struct HostCall {
    name: String,
    port: HostPort,
}

impl HostCall {
    fn invoke(&self, args: Vec<Dynamic>) -> Result<Dynamic, Box<EvalAltResult>> {
        let positional = args
            .iter()
            .map(rhai::serde::from_dynamic::<Value>)
            .collect::<Result<Vec<_>, _>>()?;
        match self.port.call(&self.name, RawCallArgs::positional(positional)) {
            Ok(HostReply::Value(value)) => rhai::serde::to_dynamic(value),
            Ok(HostReply::Error(message)) => {
                rhai::serde::to_dynamic(serde_json::json!({ "error": message }))
            }
            Err(abort) => Err(Box::new(EvalAltResult::ErrorTerminated(
                Dynamic::from(abort.to_string()),
                Position::NONE,
            ))),
        }
    }
}

/// Every arity up to [`MAX_ARITY`] reaches the host, where binding reports
/// missing or surplus arguments.
fn register_host_function(engine: &mut Engine, schema: &HostFunctionSchema, port: &HostPort) {
    let name = schema.name.as_str();
    let call = HostCall {
        name: schema.name.clone(),
        port: port.clone(),
    };

    let c = call.clone();
    engine.register_fn(name, move || c.invoke(vec![]));
    let c = call.clone();
    engine.register_fn(name, move |a: Dynamic| c.invoke(vec![a]));
    let c = call.clone();
    engine.register_fn(name, move |a: Dynamic, b: Dynamic| c.invoke(vec![a, b]));
    let c = call.clone();
    engine.register_fn(name, move |a: Dynamic, b: Dynamic, d: Dynamic| {
        c.invoke(vec![a, b, d])
    });
    let c = call.clone();
    engine.register_fn(name, move |a: Dynamic, b: Dynamic, d: Dynamic, e: Dynamic| {
        c.invoke(vec![a, b, d, e])
    });
    let c = call.clone();
    engine.register_fn(
        name,
        move |a: Dynamic, b: Dynamic, d: Dynamic, e: Dynamic, f: Dynamic| {
            c.invoke(vec![a, b, d, e, f])
        },
    );
    let c = call;
    engine.register_fn(
        name,
        move |a: Dynamic, b: Dynamic, d: Dynamic, e: Dynamic, f: Dynamic, g: Dynamic| {
            c.invoke(vec![a, b, d, e, f, g])
        },
    );
    debug_assert_eq!(MAX_ARITY, 6);
}

fn classify(err: &EvalAltResult, abort: Option<AbortReason>) -> ScriptError {
    let kind = match err.unwrap_inner() {
        EvalAltResult::ErrorParsing(..) => RunErrorKind::Syntax,
        EvalAltResult::ErrorVariableNotFound(..) | EvalAltResult::ErrorFunctionNotFound(..) => {
            RunErrorKind::UndefinedReference
        }
        EvalAltResult::ErrorRuntime(..) => RunErrorKind::Thrown,
        EvalAltResult::ErrorTerminated(..) => abort
            .map(|reason| reason.kind())
            .unwrap_or(RunErrorKind::Internal),
        EvalAltResult::ErrorTooManyOperations(..)
        | EvalAltResult::ErrorStackOverflow(..)
        | EvalAltResult::ErrorDataTooLarge(..) => RunErrorKind::LimitExceeded,
        _ => RunErrorKind::Runtime,
    };
    ScriptError::new(kind, err.to_string())
}
