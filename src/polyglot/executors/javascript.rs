//! JavaScript Executor
//!
//! Embeds QuickJS through rquickjs. Each executor instance owns one runtime
//! and one context, so every scheduler worker gets a fresh context. The
//! deadline and the group cancellation flag are enforced through the
//! runtime's interrupt handler, which QuickJS polls periodically during
//! evaluation.
//!
//! Evaluation is expression-oriented: the eval result is the value of the
//! last expression. A fragment using top-level `return` is wrapped in an
//! immediately-invoked function so the return value becomes the eval result.

use std::collections::HashMap;
use std::time::Instant;

use rquickjs::{Array, Context, Ctx, Object, Persistent, Runtime, Type};

use crate::value::{ForeignValue, Value};

use crate::polyglot::block::Language;
use crate::polyglot::marshal::{check_outbound, MAX_MARSHAL_DEPTH};
use crate::polyglot::types::{ExecError, ExecJob, MarshalDirection};

use super::{next_executor_id, PreparedCode};

pub struct JsExecutor {
    id: u64,
    runtime: Runtime,
    context: Context,
    foreign: HashMap<u64, Persistent<rquickjs::Value<'static>>>,
    next_handle: u64,
}

impl JsExecutor {
    pub fn new() -> Result<Self, ExecError> {
        let runtime = Runtime::new().map_err(js_internal)?;
        let context = Context::full(&runtime).map_err(js_internal)?;
        Ok(Self {
            id: next_executor_id(),
            runtime,
            context,
            foreign: HashMap::new(),
            next_handle: 1,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn prepare(&mut self, source: &str) -> Result<PreparedCode, ExecError> {
        Ok(PreparedCode::JavaScript { source: wrap_js_source(source) })
    }

    pub fn execute(
        &mut self,
        prepared: &PreparedCode,
        inputs: &[(String, Value)],
        job: &ExecJob,
    ) -> Result<Value, ExecError> {
        let PreparedCode::JavaScript { source } = prepared else {
            return Err(ExecError::Internal {
                message: "javascript executor got foreign prepared code".to_string(),
            });
        };
        for (_, value) in inputs {
            check_outbound(value, Language::JavaScript)?;
        }

        let started = Instant::now();
        let interrupt_job = job.clone();
        self.runtime
            .set_interrupt_handler(Some(Box::new(move || interrupt_job.expired())));

        let id = self.id;
        let foreign = &mut self.foreign;
        let next_handle = &mut self.next_handle;
        let result = self.context.with(|ctx| -> Result<Value, ExecError> {
            let globals = ctx.globals();
            for (name, value) in inputs {
                let js = js_from_value(&ctx, value, id, foreign)?;
                globals
                    .set(name.as_str(), js)
                    .map_err(|e| js_runtime_error(&ctx, e))?;
            }
            match ctx.eval::<rquickjs::Value, _>(source.as_bytes()) {
                Ok(value) => js_to_value(&ctx, value, id, foreign, next_handle, 0),
                Err(e) => Err(js_runtime_error(&ctx, e)),
            }
        });
        self.runtime.set_interrupt_handler(None);

        // An interrupted evaluation surfaces as an exception; report it as
        // the timeout it is.
        if job.expired() {
            if let Err(ExecError::Runtime { .. }) = &result {
                return Err(job.timeout_error(Language::JavaScript, started));
            }
        }
        result
    }

    pub fn shutdown(&mut self) {
        self.foreign.clear();
        self.runtime.set_interrupt_handler(None);
    }
}

fn js_internal(e: rquickjs::Error) -> ExecError {
    ExecError::Internal { message: format!("quickjs: {}", e) }
}

fn js_runtime_error(ctx: &Ctx<'_>, e: rquickjs::Error) -> ExecError {
    if matches!(e, rquickjs::Error::Exception) {
        let exc = ctx.catch();
        let (message, stack) = describe_exception(&exc);
        return ExecError::Runtime {
            language: Language::JavaScript,
            message,
            foreign_trace: stack,
        };
    }
    ExecError::Runtime {
        language: Language::JavaScript,
        message: e.to_string(),
        foreign_trace: None,
    }
}

fn describe_exception(exc: &rquickjs::Value<'_>) -> (String, Option<String>) {
    if let Some(obj) = exc.as_object() {
        let message: Option<String> = obj.get("message").ok();
        let stack: Option<String> = obj.get("stack").ok();
        if let Some(message) = message {
            return (message, stack);
        }
    }
    (format!("{:?}", exc), None)
}

// =============================================================================
// VALUE CONVERSION
// =============================================================================

fn js_from_value<'js>(
    ctx: &Ctx<'js>,
    value: &Value,
    executor_id: u64,
    foreign: &HashMap<u64, Persistent<rquickjs::Value<'static>>>,
) -> Result<rquickjs::Value<'js>, ExecError> {
    Ok(match value {
        Value::Null => rquickjs::Value::new_null(ctx.clone()),
        Value::Bool(b) => rquickjs::Value::new_bool(ctx.clone(), *b),
        Value::Int(i) => {
            if let Ok(small) = i32::try_from(*i) {
                rquickjs::Value::new_int(ctx.clone(), small)
            } else {
                rquickjs::Value::new_float(ctx.clone(), *i as f64)
            }
        }
        Value::Float(f) => rquickjs::Value::new_float(ctx.clone(), *f),
        Value::String(s) => rquickjs::String::from_str(ctx.clone(), s)
            .map_err(js_internal)?
            .into_value(),
        Value::Array(items) => {
            let items = items.lock().expect("array lock poisoned");
            let arr = Array::new(ctx.clone()).map_err(js_internal)?;
            for (idx, item) in items.iter().enumerate() {
                let js = js_from_value(ctx, item, executor_id, foreign)?;
                arr.set(idx, js).map_err(js_internal)?;
            }
            arr.into_value()
        }
        Value::Dict(entries) => {
            let entries = entries.lock().expect("dict lock poisoned");
            let obj = Object::new(ctx.clone()).map_err(js_internal)?;
            for (k, v) in entries.iter() {
                let js = js_from_value(ctx, v, executor_id, foreign)?;
                obj.set(k.as_str(), js).map_err(js_internal)?;
            }
            obj.into_value()
        }
        Value::Struct(s) => {
            let fields = s.fields.lock().expect("struct lock poisoned");
            let obj = Object::new(ctx.clone()).map_err(js_internal)?;
            for (k, v) in fields.iter() {
                let js = js_from_value(ctx, v, executor_id, foreign)?;
                obj.set(k.as_str(), js).map_err(js_internal)?;
            }
            obj.into_value()
        }
        Value::Function(_) | Value::Native(_) => {
            return Err(ExecError::unmarshallable(MarshalDirection::HostToForeign, "function"));
        }
        Value::Foreign(fv) => {
            if fv.language != Language::JavaScript || fv.executor_id != executor_id {
                return Err(ExecError::unmarshallable(
                    MarshalDirection::HostToForeign,
                    format!("foreign {} value from another executor", fv.language),
                ));
            }
            let persistent = foreign.get(&fv.handle).ok_or_else(|| {
                ExecError::unmarshallable(MarshalDirection::HostToForeign, "stale foreign handle")
            })?;
            persistent.clone().restore(ctx).map_err(js_internal)?
        }
    })
}

fn js_to_value<'js>(
    ctx: &Ctx<'js>,
    value: rquickjs::Value<'js>,
    executor_id: u64,
    foreign: &mut HashMap<u64, Persistent<rquickjs::Value<'static>>>,
    next_handle: &mut u64,
    depth: usize,
) -> Result<Value, ExecError> {
    if depth > MAX_MARSHAL_DEPTH {
        return Err(ExecError::unmarshallable(
            MarshalDirection::ForeignToHost,
            format!("value nested deeper than {}", MAX_MARSHAL_DEPTH),
        ));
    }
    match value.type_of() {
        Type::Undefined | Type::Null | Type::Uninitialized => Ok(Value::Null),
        Type::Bool => Ok(Value::Bool(value.as_bool().unwrap_or_default())),
        Type::Int => Ok(Value::Int(i64::from(value.as_int().unwrap_or_default()))),
        Type::Float => Ok(Value::Float(value.as_float().unwrap_or_default())),
        Type::String => {
            let s = value
                .into_string()
                .expect("string value")
                .to_string()
                .map_err(js_internal)?;
            Ok(Value::string(&s))
        }
        Type::Array => {
            let arr = value.into_array().expect("array value");
            let mut out = Vec::with_capacity(arr.len());
            for idx in 0..arr.len() {
                let element: rquickjs::Value = arr.get(idx).map_err(js_internal)?;
                out.push(js_to_value(ctx, element, executor_id, foreign, next_handle, depth + 1)?);
            }
            Ok(Value::array(out))
        }
        Type::Object => {
            let obj = value.into_object().expect("object value");
            let mut out = indexmap::IndexMap::new();
            for prop in obj.props::<String, rquickjs::Value>() {
                let (key, element) = prop.map_err(js_internal)?;
                out.insert(
                    key,
                    js_to_value(ctx, element, executor_id, foreign, next_handle, depth + 1)?,
                );
            }
            Ok(Value::dict(out))
        }
        _ => {
            // Functions, symbols, and exotic objects stay inside this
            // executor as foreign handles.
            let repr = format!("<js {:?}>", value.type_of());
            let handle = *next_handle;
            *next_handle += 1;
            foreign.insert(handle, Persistent::save(ctx, value));
            Ok(Value::Foreign(std::sync::Arc::new(ForeignValue {
                language: Language::JavaScript,
                executor_id,
                handle,
                repr,
            })))
        }
    }
}

// =============================================================================
// SOURCE WRAPPING
// =============================================================================

/// Top-level `return` is invalid in a script; wrap such fragments in an
/// immediately-invoked function so the returned value becomes the eval
/// result. Everything else evaluates as-is (the eval result is already the
/// last expression).
pub fn wrap_js_source(source: &str) -> String {
    let has_top_level_return = source
        .lines()
        .any(|line| {
            let t = line.trim_start();
            !line.starts_with(char::is_whitespace)
                && (t == "return" || t.starts_with("return ") || t.starts_with("return;"))
        });
    if has_top_level_return {
        format!("(function() {{\n{}\n}})()", source)
    } else {
        source.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::polyglot::cache::CodeCache;
    use crate::polyglot::types::CancelToken;
    use crate::sandbox::{SandboxConfig, SandboxStack};
    use std::sync::Arc;
    use std::time::Duration;

    fn job(budget: Duration) -> ExecJob {
        let audit = Arc::new(AuditLog::ephemeral().unwrap());
        let stack = Arc::new(SandboxStack::new(SandboxConfig::standard(), audit));
        ExecJob {
            deadline: Instant::now() + budget,
            cancel: CancelToken::new(),
            sandbox: stack.handle(),
            cache: Arc::new(CodeCache::new(8).unwrap()),
        }
    }

    fn run(source: &str, inputs: &[(String, Value)]) -> Result<Value, ExecError> {
        let mut executor = JsExecutor::new().unwrap();
        let prepared = executor.prepare(source).unwrap();
        executor.execute(&prepared, inputs, &job(Duration::from_secs(5)))
    }

    #[test]
    fn test_wrap_js_source() {
        assert_eq!(wrap_js_source("1 + 1"), "1 + 1");
        assert!(wrap_js_source("return 1").starts_with("(function()"));
        assert_eq!(wrap_js_source("function f() {\n  return 1;\n}\nf()"), "function f() {\n  return 1;\n}\nf()");
    }

    #[test]
    fn test_last_expression_is_result() {
        assert_eq!(run("1 + 2", &[]).unwrap(), Value::Int(3));
        assert_eq!(run("return 4 * 10 + 2", &[]).unwrap(), Value::Int(42));
        assert_eq!(run("'a' + 'b'", &[]).unwrap(), Value::string("ab"));
    }

    #[test]
    fn test_bindings_installed_as_globals() {
        let inputs = vec![("n".to_string(), Value::Int(20))];
        assert_eq!(run("n * 2 + 2", &inputs).unwrap(), Value::Int(42));
    }

    #[test]
    fn test_array_round_trip() {
        let inputs = vec![(
            "xs".to_string(),
            Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
        )];
        let result = run("xs.map(function(x) { return x * 2; })", &inputs).unwrap();
        if let Value::Array(items) = result {
            let items = items.lock().unwrap();
            assert_eq!(*items, vec![Value::Int(2), Value::Int(4), Value::Int(6)]);
        } else {
            panic!("expected array result");
        }
    }

    #[test]
    fn test_runtime_error_carries_message() {
        let err = run("undefined_function()", &[]).unwrap_err();
        match err {
            ExecError::Runtime { language, message, .. } => {
                assert_eq!(language, Language::JavaScript);
                assert!(!message.is_empty());
            }
            other => panic!("expected runtime error, got {:?}", other),
        }
    }

    #[test]
    fn test_interrupt_handler_enforces_deadline() {
        let mut executor = JsExecutor::new().unwrap();
        let prepared = executor.prepare("while (true) {}").unwrap();
        let started = Instant::now();
        let err = executor
            .execute(&prepared, &[], &job(Duration::from_millis(150)))
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }), "got {:?}", err);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_function_value_rejected() {
        fn noop(
            _out: &mut crate::interpreter::types::HostOutput,
            _args: &[Value],
        ) -> Result<Value, crate::errors::RuntimeError> {
            Ok(Value::Null)
        }
        let native = Value::Native(crate::value::NativeFunction { name: "noop", func: noop });
        let err = run("1", &[("f".to_string(), native)]).unwrap_err();
        assert!(matches!(err, ExecError::Marshalling { .. }));
    }

    #[test]
    fn test_foreign_function_round_trips_same_executor() {
        let mut executor = JsExecutor::new().unwrap();
        let j = job(Duration::from_secs(5));

        let prepared = executor.prepare("(function(x) { return x + 1; })").unwrap();
        let func = executor.execute(&prepared, &[], &j).unwrap();
        assert!(matches!(func, Value::Foreign(_)));

        let prepared = executor.prepare("f(41)").unwrap();
        let result = executor
            .execute(&prepared, &[("f".to_string(), func.clone())], &j)
            .unwrap();
        assert_eq!(result, Value::Int(42));

        // The same handle into a different executor instance must fail.
        let mut other = JsExecutor::new().unwrap();
        let prepared = other.prepare("f(1)").unwrap();
        let err = other
            .execute(&prepared, &[("f".to_string(), func)], &j)
            .unwrap_err();
        assert!(matches!(err, ExecError::Marshalling { .. }));
    }
}
