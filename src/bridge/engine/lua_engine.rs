use mlua::{
    HookTriggers, Lua, LuaOptions, LuaSerdeExt, MultiValue, SerializeOptions, StdLib,
    Value as LuaValue, VmState,
};
use serde_json::Value;

use super::{EngineCapabilities, EngineKind, EvalContext, ScriptEngine};
use crate::bridge::error::{HostAbort, RunErrorKind, ScriptError};
use crate::bridge::host::HostReply;
use crate::bridge::limits::ResourceLimits;
use crate::bridge::schema::RawCallArgs;

/// Instructions between abort checks
const ABORT_CHECK_INTERVAL: u32 = 1_000;

/// Lua 5.4 interpreter.
///
/// Host calls block the worker until the bridge answers, so evaluation pauses
/// at every call boundary. The memory ceiling is enforced by the allocator;
/// stack depth is left to Lua's own C-stack limit.
pub struct LuaEngine {
    lua: Lua,
    /// Host function globals installed by the previous evaluation
    exposed: Vec<String>,
}

impl LuaEngine {
    pub fn new(limits: &ResourceLimits) -> Result<Self, ScriptError> {
        let lua = Lua::new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE,
            LuaOptions::new(),
        )
        .map_err(|e| classify(&e))?;
        if let Some(bytes) = limits.memory_limit_bytes {
            lua.set_memory_limit(bytes).map_err(|e| classify(&e))?;
        }

        let globals = lua.globals();
        for name in ["dofile", "loadfile"] {
            globals.set(name, LuaValue::Nil).map_err(|e| classify(&e))?;
        }

        Ok(Self {
            lua,
            exposed: Vec::new(),
        })
    }

    fn prepare(&mut self, ctx: &EvalContext) -> mlua::Result<()> {
        let globals = self.lua.globals();
        for stale in self.exposed.drain(..) {
            globals.set(stale, LuaValue::Nil)?;
        }

        for schema in &ctx.schemas {
            let port = ctx.host.clone();
            let name = schema.name.clone();
            let function = self.lua.create_function(
                move |lua, args: MultiValue| -> mlua::Result<(LuaValue, Option<String>)> {
                    let positional = args
                        .into_iter()
                        .map(|arg| lua.from_value::<Value>(arg))
                        .collect::<mlua::Result<Vec<_>>>()?;
                    match port.call(&name, RawCallArgs::positional(positional)) {
                        Ok(HostReply::Value(value)) => Ok((to_lua(lua, &value)?, None)),
                        Ok(HostReply::Error(message)) => Ok((LuaValue::Nil, Some(message))),
                        Err(abort) => Err(mlua::Error::external(abort)),
                    }
                },
            )?;
            globals.set(schema.name.as_str(), function)?;
            self.exposed.push(schema.name.clone());
        }

        let port = ctx.host.clone();
        let print = self.lua.create_function(move |lua, args: MultiValue| {
            let tostring: mlua::Function = lua.globals().get("tostring")?;
            let parts = args
                .into_iter()
                .map(|arg| tostring.call::<String>(arg))
                .collect::<mlua::Result<Vec<_>>>()?;
            port.output(format!("{}\n", parts.join("\t")));
            Ok(())
        })?;
        globals.set("print", print)?;
        globals.set("result", LuaValue::Nil)?;

        let abort = ctx.abort.clone();
        self.lua.set_hook(
            HookTriggers::new().every_nth_instruction(ABORT_CHECK_INTERVAL),
            move |_, _| match abort.reason() {
                Some(reason) => Err(mlua::Error::external(HostAbort::Aborted(reason))),
                None => Ok(VmState::Continue),
            },
        );
        Ok(())
    }
}

impl ScriptEngine for LuaEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Lua
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            supports_pause: true,
            enforces_memory_limit: true,
            enforces_stack_depth: false,
        }
    }

    fn eval(&mut self, code: &str, ctx: &EvalContext) -> Result<Value, ScriptError> {
        self.prepare(ctx).map_err(|e| classify(&e))?;

        let returned: LuaValue = self
            .lua
            .load(code)
            .set_name("script")
            .eval()
            .map_err(|e| classify(&e))?;
        let value = if returned.is_nil() {
            self.lua
                .globals()
                .get::<LuaValue>("result")
                .map_err(|e| classify(&e))?
        } else {
            returned
        };

        self.lua.from_value::<Value>(value).map_err(|e| {
            ScriptError::new(
                RunErrorKind::Runtime,
                format!("result is not serializable: {}", e),
            )
        })
    }
}

fn to_lua(lua: &Lua, value: &Value) -> mlua::Result<LuaValue> {
    lua.to_value_with(
        value,
        SerializeOptions::new()
            .serialize_none_to_null(false)
            .serialize_unit_to_null(false),
    )
}

fn find_abort(err: &mlua::Error) -> Option<&HostAbort> {
    match err {
        mlua::Error::ExternalError(inner) => inner.downcast_ref::<HostAbort>(),
        mlua::Error::CallbackError { cause, .. } | mlua::Error::WithContext { cause, .. } => {
            find_abort(cause)
        }
        _ => None,
    }
}

fn root_cause(err: &mlua::Error) -> &mlua::Error {
    match err {
        mlua::Error::CallbackError { cause, .. } | mlua::Error::WithContext { cause, .. } => {
            root_cause(cause)
        }
        other => other,
    }
}

fn classify(err: &mlua::Error) -> ScriptError {
    if let Some(abort) = find_abort(err) {
        return abort.clone().into();
    }
    let kind = match root_cause(err) {
        mlua::Error::SyntaxError { .. } => RunErrorKind::Syntax,
        mlua::Error::MemoryError(_) => RunErrorKind::LimitExceeded,
        mlua::Error::RuntimeError(message) if message.contains("attempt to call a nil value") => {
            RunErrorKind::UndefinedReference
        }
        mlua::Error::RuntimeError(message) if message.contains("stack overflow") => {
            RunErrorKind::LimitExceeded
        }
        _ => RunErrorKind::Runtime,
    };
    ScriptError::new(kind, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::engine::testing::eval_with_replies;
    use crate::bridge::schema::{HostFunctionSchema, HostParam, ParamType};
    use serde_json::json;
    use std::collections::HashMap;

    fn engine() -> Box<dyn ScriptEngine> {
        Box::new(LuaEngine::new(&ResourceLimits::default()).unwrap())
    }

    async fn run(code: &str) -> Result<Value, ScriptError> {
        eval_with_replies(engine(), code, Vec::new(), HashMap::new())
            .await
            .0
    }

    fn get_time() -> (Vec<HostFunctionSchema>, HashMap<String, HostReply>) {
        let schemas = vec![HostFunctionSchema::new("get_time", "Current time")];
        let replies = HashMap::from([("get_time".to_string(), HostReply::Value(json!("12:00")))]);
        (schemas, replies)
    }

    #[tokio::test]
    async fn test_result_variable_is_final_value() {
        assert_eq!(run("result = 2+3").await, Ok(json!(5)));
    }

    #[tokio::test]
    async fn test_return_value_wins_over_result() {
        assert_eq!(run("result = 1\nreturn {a = 2}").await, Ok(json!({"a": 2})));
    }

    #[tokio::test]
    async fn test_print_and_host_call() {
        let (schemas, replies) = get_time();
        let (result, output) =
            eval_with_replies(engine(), "print(get_time())", schemas, replies).await;
        assert_eq!(result, Ok(Value::Null));
        assert_eq!(output, "12:00\n");
    }

    #[tokio::test]
    async fn test_host_error_returns_nil_and_message() {
        let schemas = vec![HostFunctionSchema::new("fetch", "Fetch")
            .param(HostParam::optional("url", ParamType::String))];
        let replies = HashMap::from([("fetch".to_string(), HostReply::Error("bad".into()))]);
        let (result, _) = eval_with_replies(
            engine(),
            "local v, err = fetch('x')\nreturn {v == nil, err}",
            schemas,
            replies,
        )
        .await;
        assert_eq!(result, Ok(json!([true, "bad"])));
    }

    #[tokio::test]
    async fn test_globals_persist_between_evaluations() {
        let mut lua = LuaEngine::new(&ResourceLimits::default()).unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let abort = crate::bridge::limits::AbortSignal::new();
        let ctx = EvalContext {
            host: crate::bridge::host::HostPort::new(tx, abort.clone()),
            schemas: Vec::new(),
            limits: ResourceLimits::default(),
            abort,
        };
        lua.eval("counter = 10", &ctx).unwrap();
        assert_eq!(lua.eval("return counter * 2", &ctx), Ok(json!(20)));
    }

    #[tokio::test]
    async fn test_error_classification() {
        assert_eq!(
            run("return 1 +").await.unwrap_err().kind,
            RunErrorKind::Syntax
        );
        assert_eq!(
            run("missing_function()").await.unwrap_err().kind,
            RunErrorKind::UndefinedReference
        );
        assert_eq!(
            run("error('boom')").await.unwrap_err().kind,
            RunErrorKind::Runtime
        );
    }

    #[tokio::test]
    async fn test_unknown_host_function_aborts() {
        let schemas = vec![HostFunctionSchema::new("ghost", "Not answered")];
        let (result, _) =
            eval_with_replies(engine(), "return ghost()", schemas, HashMap::new()).await;
        assert_eq!(result.unwrap_err().kind, RunErrorKind::UnknownFunction);
    }

    #[tokio::test]
    async fn test_memory_limit_enforced() {
        let limited = LuaEngine::new(&ResourceLimits {
            memory_limit_bytes: Some(1024 * 1024),
            ..ResourceLimits::default()
        })
        .unwrap();
        let (result, _) = eval_with_replies(
            Box::new(limited),
            "local t = {}\nfor i = 1, 1e7 do t[i] = string.rep('x', 64) .. i end",
            Vec::new(),
            HashMap::new(),
        )
        .await;
        assert_eq!(result.unwrap_err().kind, RunErrorKind::LimitExceeded);
    }

    #[tokio::test]
    async fn test_file_access_removed() {
        assert_eq!(run("return dofile == nil and loadfile == nil").await, Ok(json!(true)));
    }
}
