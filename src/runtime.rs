//! The evaluation environment shared by every isolate.
//!
//! Scripts are Rhai. Each run gets a fresh [`rhai::Engine`] with no module
//! resolver, `eval` and `import` disabled, print/debug captured through the
//! [`Bridge`], and data-size quotas derived from the sandbox memory limit.
//! Scripts see two bindings:
//!
//! * `params`: the caller's parameter bag, as a constant
//! * `api`: the capability surface; `api.<namespace>.<method>(..)` is routed
//!   to [`Bridge::invoke`], which is where permissions are checked
//!
//! Both resolve through a variable resolver rather than the top-level scope,
//! so script functions see them too. A local of the same name shadows them.
//!
//! The same code runs on an in-process thread and inside the worker process,
//! so classification of interpreter failures lives here too.

use crate::analyzer;
use crate::capability::PermissionDenied;
use crate::config::SandboxConfig;
use crate::result::ExecutionError;
use parking_lot::Mutex;
use rhai::{Dynamic, Engine, EvalAltResult, ImmutableString, ParseError, Position};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Most positional arguments an `api.ns.method(..)` call accepts.
pub const MAX_API_ARGS: usize = 6;

/// Interpreter quotas for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptLimits {
    pub memory_limit_mb: u64,
    pub max_call_levels: usize,
    pub max_expr_depth: usize,
    pub max_function_expr_depth: usize,
}

impl ScriptLimits {
    pub fn for_config(config: &SandboxConfig) -> Self {
        Self {
            memory_limit_mb: config.memory_limit_mb,
            max_call_levels: 64,
            max_expr_depth: 128,
            max_function_expr_depth: 64,
        }
    }

    /// Largest string a script may build.
    pub fn max_string_bytes(&self) -> usize {
        usize::try_from(self.memory_limit_mb)
            .unwrap_or(usize::MAX)
            .saturating_mul(1024 * 1024)
    }

    /// Largest array or object map a script may build, at 32 bytes per slot.
    pub fn max_collection_len(&self) -> usize {
        (self.max_string_bytes() / 32).max(1)
    }
}

/// What a script run ended with, before timeout/cancel precedence is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ScriptOutcome {
    Completed { value: Value },
    Failed { error: ExecutionError },
    /// Stopped by the abort signal
    Aborted,
    /// The isolate itself broke (thread panic, worker spawn failure,
    /// protocol violation)
    Crashed { reason: String },
}

impl ScriptOutcome {
    pub fn failed(error: ExecutionError) -> Self {
        ScriptOutcome::Failed { error }
    }

    pub fn crashed(reason: impl Into<String>) -> Self {
        ScriptOutcome::Crashed {
            reason: reason.into(),
        }
    }
}

/// Why a host call through the bridge did not produce a value.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BridgeFault {
    #[error(transparent)]
    Denied(PermissionDenied),

    #[error("{0}")]
    Host(String),
}

/// Link from a running script to its host.
pub trait Bridge: Send + Sync {
    fn invoke(&self, namespace: &str, method: &str, args: Vec<Value>)
        -> Result<Value, BridgeFault>;

    fn print(&self, text: &str);
}

/// Everything one run needs besides the bridge.
#[derive(Debug, Clone, Copy)]
pub struct ScriptRequest<'a> {
    pub code: &'a str,
    pub params: &'a Value,
    /// Names to make callable on namespaces: the host catalog plus every
    /// method-position identifier in the code
    pub methods: &'a [String],
    pub limits: &'a ScriptLimits,
}

#[derive(Clone)]
struct ApiRoot;

#[derive(Clone)]
struct Namespace {
    name: ImmutableString,
}

type DeniedCell = Arc<Mutex<Option<PermissionDenied>>>;

/// Namespace most recently taken off `api`, for naming calls to methods
/// that were never registered.
type NamespaceCell = Arc<Mutex<Option<ImmutableString>>>;

#[derive(Clone)]
struct ApiCall {
    method: Arc<str>,
    bridge: Arc<dyn Bridge>,
    denied: DeniedCell,
}

impl ApiCall {
    fn invoke(&self, ns: &Namespace, args: Vec<Dynamic>) -> Result<Dynamic, Box<EvalAltResult>> {
        let args = args.iter().map(to_json).collect();
        match self.bridge.invoke(&ns.name, &self.method, args) {
            Ok(value) => rhai::serde::to_dynamic(value),
            Err(BridgeFault::Denied(denied)) => {
                *self.denied.lock() = Some(denied.clone());
                // ErrorSystem cannot be caught by script try/catch
                Err(EvalAltResult::ErrorSystem(denied.to_string(), Box::new(denied)).into())
            }
            Err(BridgeFault::Host(message)) => Err(EvalAltResult::ErrorRuntime(
                format!("{}.{}: {}", ns.name, self.method, message).into(),
                Position::NONE,
            )
            .into()),
        }
    }
}

fn register_api_method(engine: &mut Engine, call: ApiCall) {
    let name = call.method.to_string();
    let c = call.clone();
    engine.register_fn(name.as_str(), move |ns: &mut Namespace| {
        c.invoke(ns, Vec::new())
    });
    let c = call.clone();
    engine.register_fn(name.as_str(), move |ns: &mut Namespace, a: Dynamic| {
        c.invoke(ns, vec![a])
    });
    let c = call.clone();
    engine.register_fn(
        name.as_str(),
        move |ns: &mut Namespace, a: Dynamic, b: Dynamic| c.invoke(ns, vec![a, b]),
    );
    let c = call.clone();
    engine.register_fn(
        name.as_str(),
        move |ns: &mut Namespace, a: Dynamic, b: Dynamic, d: Dynamic| c.invoke(ns, vec![a, b, d]),
    );
    let c = call.clone();
    engine.register_fn(
        name.as_str(),
        move |ns: &mut Namespace, a: Dynamic, b: Dynamic, d: Dynamic, e: Dynamic| {
            c.invoke(ns, vec![a, b, d, e])
        },
    );
    let c = call.clone();
    engine.register_fn(
        name.as_str(),
        move |ns: &mut Namespace, a: Dynamic, b: Dynamic, d: Dynamic, e: Dynamic, f: Dynamic| {
            c.invoke(ns, vec![a, b, d, e, f])
        },
    );
    let c = call;
    engine.register_fn(
        name.as_str(),
        move |ns: &mut Namespace,
              a: Dynamic,
              b: Dynamic,
              d: Dynamic,
              e: Dynamic,
              f: Dynamic,
              g: Dynamic| c.invoke(ns, vec![a, b, d, e, f, g]),
    );
}

fn restricted_engine() -> Engine {
    let mut engine = Engine::new();
    engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());
    for symbol in analyzer::BANNED_IDENTIFIERS {
        engine.disable_symbol(*symbol);
    }
    engine
}

struct Bindings {
    params: Dynamic,
    denied: DeniedCell,
    last_namespace: NamespaceCell,
}

fn build_engine(
    limits: &ScriptLimits,
    methods: &[String],
    bridge: &Arc<dyn Bridge>,
    bindings: &Bindings,
    interrupt: Option<Arc<AtomicBool>>,
) -> Engine {
    let mut engine = restricted_engine();
    engine
        .set_max_call_levels(limits.max_call_levels)
        .set_max_expr_depths(limits.max_expr_depth, limits.max_function_expr_depth)
        .set_max_string_size(limits.max_string_bytes())
        .set_max_array_size(limits.max_collection_len())
        .set_max_map_size(limits.max_collection_len());

    let printer = Arc::clone(bridge);
    engine.on_print(move |text| printer.print(text));
    let debugger = Arc::clone(bridge);
    engine.on_debug(move |text, _source, _pos| debugger.print(&format!("[debug] {}", text)));

    // Checked on every operation, so even `while true {}` observes it.
    if let Some(flag) = interrupt {
        engine.on_progress(move |_ops| {
            if flag.load(Ordering::Relaxed) {
                Some(Dynamic::UNIT)
            } else {
                None
            }
        });
    }

    engine.register_type_with_name::<ApiRoot>("Api");
    engine.register_type_with_name::<Namespace>("ApiNamespace");
    let last_namespace = Arc::clone(&bindings.last_namespace);
    engine.register_indexer_get(move |_api: &mut ApiRoot, name: ImmutableString| {
        *last_namespace.lock() = Some(name.clone());
        Namespace { name }
    });

    let params = bindings.params.clone();
    engine.on_var(move |name, _index, context| {
        if context.scope().contains(name) {
            return Ok(None);
        }
        Ok(match name {
            "api" => Some(Dynamic::from(ApiRoot)),
            "params" => Some(params.clone()),
            _ => None,
        })
    });

    let mut seen = std::collections::BTreeSet::new();
    for method in methods {
        if !seen.insert(method.as_str()) {
            continue;
        }
        register_api_method(
            &mut engine,
            ApiCall {
                method: Arc::from(method.as_str()),
                bridge: Arc::clone(bridge),
                denied: Arc::clone(&bindings.denied),
            },
        );
    }

    engine
}

/// Parse-only check. Nothing is evaluated, not even constant folding.
pub fn check_syntax(code: &str) -> Result<(), ExecutionError> {
    let mut engine = restricted_engine();
    engine.set_optimization_level(rhai::OptimizationLevel::None);
    engine
        .compile(analyzer::normalize_quotes(code))
        .map(|_| ())
        .map_err(|e| syntax_error(&e))
}

/// Evaluate one script to completion, failure, or interruption.
///
/// `interrupt` is polled on every interpreter operation; once it reads true
/// the run ends with [`ScriptOutcome::Aborted`].
pub fn run_script(
    request: ScriptRequest<'_>,
    bridge: Arc<dyn Bridge>,
    interrupt: Option<Arc<AtomicBool>>,
) -> ScriptOutcome {
    let params = match rhai::serde::to_dynamic(request.params) {
        Ok(params) => params,
        Err(e) => {
            return ScriptOutcome::failed(ExecutionError::runtime(format!(
                "params could not be bound: {}",
                e
            )))
        }
    };
    let bindings = Bindings {
        params,
        denied: Arc::new(Mutex::new(None)),
        last_namespace: Arc::new(Mutex::new(None)),
    };
    let engine = build_engine(
        request.limits,
        request.methods,
        &bridge,
        &bindings,
        interrupt,
    );

    let ast = match engine.compile(analyzer::normalize_quotes(request.code)) {
        Ok(ast) => ast,
        Err(e) => return ScriptOutcome::failed(syntax_error(&e)),
    };

    let evaluated = engine.eval_ast::<Dynamic>(&ast);

    // A denial stays fatal even if the script managed to swallow it.
    if let Some(denied) = bindings.denied.lock().take() {
        return ScriptOutcome::failed(ExecutionError::permission(denied.to_string()));
    }

    match evaluated {
        Ok(value) => ScriptOutcome::Completed {
            value: to_json(&value),
        },
        Err(err) => {
            let namespace = bindings.last_namespace.lock().clone();
            classify(&err, namespace.as_ref().map(|ns| ns.as_str()))
        }
    }
}

/// Convert a script value to JSON; values with no JSON shape become their
/// string rendering.
pub fn to_json(value: &Dynamic) -> Value {
    rhai::serde::from_dynamic::<Value>(value).unwrap_or_else(|_| Value::String(value.to_string()))
}

fn syntax_error(err: &ParseError) -> ExecutionError {
    let pos = err.position();
    ExecutionError::syntax(err.err_type().to_string()).at(pos.line(), pos.position())
}

/// Method name of a `name (ApiNamespace, ..)` signature: a call on a
/// namespace that has no such method registered.
fn unregistered_api_method(signature: &str) -> Option<&str> {
    let (name, args) = signature.split_once(" (")?;
    args.trim_start_matches("&mut ")
        .starts_with("ApiNamespace")
        .then_some(name)
}

fn classify(err: &EvalAltResult, last_namespace: Option<&str>) -> ScriptOutcome {
    let mut frames = Vec::new();
    let mut current = err;
    while let EvalAltResult::ErrorInFunctionCall(name, .., inner, pos) = current {
        frames.push(format!("at {} ({})", name, pos));
        current = inner.as_ref();
    }
    let stack = frames.join("\n");
    let pos = current.position();

    let error = match current {
        EvalAltResult::ErrorTerminated(..) => return ScriptOutcome::Aborted,
        EvalAltResult::ErrorDataTooLarge(what, ..) => ExecutionError::memory(format!(
            "{} exceeds the sandbox memory limit",
            what
        )),
        EvalAltResult::ErrorStackOverflow(..) => {
            ExecutionError::memory("call depth limit exceeded")
        }
        EvalAltResult::ErrorSystem(message, source) => {
            match source.downcast_ref::<PermissionDenied>() {
                Some(denied) => ExecutionError::permission(denied.to_string()),
                None => ExecutionError::runtime(message.clone()),
            }
        }
        EvalAltResult::ErrorParsing(kind, ..) => ExecutionError::syntax(kind.to_string()),
        // Every catalog method is registered, so anything else reached on a
        // namespace (through a function pointer, say) is outside the grant.
        EvalAltResult::ErrorFunctionNotFound(signature, _) => {
            match unregistered_api_method(signature) {
                Some(method) => ExecutionError::permission(
                    PermissionDenied::new(last_namespace.unwrap_or("api"), method).to_string(),
                ),
                None => ExecutionError::runtime(current.to_string()),
            }
        }
        other => ExecutionError::runtime(other.to_string()),
    };

    ScriptOutcome::failed(
        error
            .at(pos.line(), pos.position())
            .with_stack(stack),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::ErrorKind;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingBridge {
        calls: Mutex<Vec<(String, String, Vec<Value>)>>,
        printed: Mutex<Vec<String>>,
    }

    impl Bridge for RecordingBridge {
        fn invoke(
            &self,
            namespace: &str,
            method: &str,
            args: Vec<Value>,
        ) -> Result<Value, BridgeFault> {
            self.calls
                .lock()
                .push((namespace.to_string(), method.to_string(), args.clone()));
            match (namespace, method) {
                ("utils", "log") => Ok(Value::Null),
                ("utils", "lerp") => Ok(json!(5.0)),
                ("timeline", "fail") => Err(BridgeFault::Host("no clip selected".into())),
                _ => Err(BridgeFault::Denied(PermissionDenied::new(namespace, method))),
            }
        }

        fn print(&self, text: &str) {
            self.printed.lock().push(text.to_string());
        }
    }

    fn run_with(
        code: &str,
        params: Value,
        memory_limit_mb: u64,
        interrupt: Option<Arc<AtomicBool>>,
    ) -> (ScriptOutcome, Arc<RecordingBridge>) {
        let bridge = Arc::new(RecordingBridge::default());
        let limits = ScriptLimits {
            memory_limit_mb,
            max_call_levels: 32,
            max_expr_depth: 64,
            max_function_expr_depth: 32,
        };
        let methods: Vec<String> = crate::analyzer::analyze(code)
            .method_names
            .into_iter()
            .collect();
        let outcome = run_script(
            ScriptRequest {
                code,
                params: &params,
                methods: &methods,
                limits: &limits,
            },
            bridge.clone(),
            interrupt,
        );
        (outcome, bridge)
    }

    fn run(code: &str) -> (ScriptOutcome, Arc<RecordingBridge>) {
        run_with(code, Value::Null, 16, None)
    }

    fn failure(outcome: ScriptOutcome) -> ExecutionError {
        match outcome {
            ScriptOutcome::Failed { error } => error,
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_returns_last_expression() {
        let (outcome, _) = run("let x = 40; x + 2");
        assert_eq!(outcome, ScriptOutcome::Completed { value: json!(42) });

        let (outcome, _) = run("#{ name: \"clip\", frames: [1, 2] }");
        assert_eq!(
            outcome,
            ScriptOutcome::Completed {
                value: json!({"name": "clip", "frames": [1, 2]})
            }
        );
    }

    #[test]
    fn test_params_are_bound() {
        let (outcome, _) = run_with("params.fps * 2", json!({"fps": 12}), 16, None);
        assert_eq!(outcome, ScriptOutcome::Completed { value: json!(24) });
    }

    #[test]
    fn test_bindings_visible_inside_functions() {
        let code = "fn greet(n) { api.utils.log(n) }\nfn twice() { params.x * 2 }\ngreet(\"hi\"); twice()";
        let (outcome, bridge) = run_with(code, json!({"x": 21}), 16, None);
        assert_eq!(outcome, ScriptOutcome::Completed { value: json!(42) });
        assert_eq!(bridge.calls.lock()[0].2, vec![json!("hi")]);

        let (outcome, _) = run("fn shadow(params) { params + 1 }\nshadow(1)");
        assert_eq!(outcome, ScriptOutcome::Completed { value: json!(2) });
    }

    #[test]
    fn test_denial_inside_function_is_permission() {
        let error = failure(run("fn make() { api.sceneGraph.createNode() }\nmake()").0);
        assert_eq!(error.kind, ErrorKind::Permission);
        assert!(error.message.contains("sceneGraph.createNode"));
    }

    #[test]
    fn test_unregistered_method_through_fn_pointer_is_permission() {
        let (outcome, bridge) = run("Fn(\"create\" + \"Node\").call(api.sceneGraph)");
        let error = failure(outcome);
        assert_eq!(error.kind, ErrorKind::Permission);
        assert!(error.message.contains("sceneGraph.createNode"));
        assert!(bridge.calls.lock().is_empty());

        assert_eq!(unregistered_api_method("play (ApiNamespace, i64)"), Some("play"));
        assert_eq!(unregistered_api_method("play (&mut ApiNamespace)"), Some("play"));
        assert_eq!(unregistered_api_method("missing (i64)"), None);
    }

    #[test]
    fn test_char_literal_next_to_single_quoted_string() {
        let (outcome, bridge) = run("let c = 'x'; api.utils.log('hi'); c");
        assert_eq!(outcome, ScriptOutcome::Completed { value: json!("x") });
        assert_eq!(bridge.calls.lock()[0].2, vec![json!("hi")]);
    }

    #[test]
    fn test_api_calls_reach_bridge() {
        let (outcome, bridge) = run("api.utils.log(\"hi\", 3); api.utils.lerp(0, 10, 0.5)");
        assert_eq!(outcome, ScriptOutcome::Completed { value: json!(5.0) });
        let calls = bridge.calls.lock();
        assert_eq!(calls[0], ("utils".into(), "log".into(), vec![json!("hi"), json!(3)]));
        assert_eq!(calls[1].1, "lerp");
    }

    #[test]
    fn test_api_arity_limit() {
        let args: Vec<String> = (0..MAX_API_ARGS).map(|i| i.to_string()).collect();
        let code = format!("api.utils.log({}); 1", args.join(", "));
        let (outcome, bridge) = run(&code);
        assert_eq!(outcome, ScriptOutcome::Completed { value: json!(1) });
        assert_eq!(bridge.calls.lock()[0].2.len(), MAX_API_ARGS);

        let too_many = format!("api.utils.log({}, 0)", args.join(", "));
        let (outcome, bridge) = run(&too_many);
        assert_eq!(failure(outcome).kind, ErrorKind::Runtime);
        assert!(bridge.calls.lock().is_empty());
    }

    #[test]
    fn test_print_is_captured() {
        let (_, bridge) = run("print(\"frame\"); debug(1)");
        let printed = bridge.printed.lock();
        assert_eq!(printed[0], "frame");
        assert!(printed[1].starts_with("[debug]"));
    }

    #[test]
    fn test_syntax_error_has_position() {
        let (outcome, bridge) = run("let x = ;\napi.utils.log(1)");
        let error = failure(outcome);
        assert_eq!(error.kind, ErrorKind::Syntax);
        assert_eq!(error.line, Some(1));
        assert!(error.column.is_some());
        assert!(bridge.calls.lock().is_empty());

        assert!(check_syntax("let x = ;").is_err());
        assert!(check_syntax("let x = 1; x").is_ok());
    }

    #[test]
    fn test_banned_symbols_do_not_parse() {
        assert_eq!(failure(run("eval(\"1\")").0).kind, ErrorKind::Syntax);
        assert_eq!(failure(run("import \"fs\" as fs;").0).kind, ErrorKind::Syntax);
        for symbol in analyzer::BANNED_IDENTIFIERS {
            assert!(check_syntax(&format!("{}(\"1\")", symbol)).is_err(), "{}", symbol);
        }
    }

    #[test]
    fn test_runtime_error_with_stack() {
        let error = failure(run("fn boom() { throw \"bad frame\"; }\nboom()").0);
        assert_eq!(error.kind, ErrorKind::Runtime);
        assert!(error.message.contains("bad frame"));
        assert!(error.stack.unwrap_or_default().contains("boom"));

        let error = failure(run("api.timeline.fail()").0);
        assert_eq!(error.kind, ErrorKind::Runtime);
        assert!(error.message.contains("no clip selected"));
    }

    #[test]
    fn test_permission_denial_cannot_be_caught() {
        let code = r#"
            try {
                api.sceneGraph.createNode();
            } catch (e) {
                "swallowed"
            }
        "#;
        let error = failure(run(code).0);
        assert_eq!(error.kind, ErrorKind::Permission);
        assert!(error.message.contains("sceneGraph.createNode"));
    }

    #[test]
    fn test_data_quota_is_memory_error() {
        let code = "let s = \"0123456789abcdef\"; for i in 0..20 { s = s + s; } s.len()";
        let error = failure(run_with(code, Value::Null, 1, None).0);
        assert_eq!(error.kind, ErrorKind::Memory);
    }

    #[test]
    fn test_deep_recursion_is_memory_error() {
        let error = failure(run("fn down(n) { down(n + 1) }\ndown(0)").0);
        assert_eq!(error.kind, ErrorKind::Memory);
    }

    #[test]
    fn test_interrupt_flag_aborts_tight_loop() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = flag.clone();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            setter.store(true, Ordering::Relaxed);
        });
        let (outcome, _) = run_with("while true {}", Value::Null, 16, Some(flag));
        assert_eq!(outcome, ScriptOutcome::Aborted);
    }

    #[test]
    fn test_outcome_wire_shape() {
        let value = serde_json::to_value(ScriptOutcome::Completed { value: json!(1) }).unwrap();
        assert_eq!(value, json!({"state": "completed", "value": 1}));
        let value = serde_json::to_value(ScriptOutcome::Aborted).unwrap();
        assert_eq!(value, json!({"state": "aborted"}));
    }
}
