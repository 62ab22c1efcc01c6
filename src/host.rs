//! Host-provided API namespaces.
//!
//! The sandbox never implements business logic behind a namespace. A host
//! application registers each namespace (scene graph, timeline, renderer,
//! ...) with a [`HostRegistry`]; sandboxes only see the subset their
//! configuration permits, through [`crate::CapabilityProxy`].

use crate::console::Console;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors a host namespace reports back to the calling script.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HostError {
    #[error("unknown method {0}")]
    UnknownMethod(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Failed(String),
}

/// Ambient resource a namespace needs; consulted against the sandbox's
/// `networkAccess` / `fileSystemAccess` flags before it is wired in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostRequirement {
    #[default]
    None,
    Network,
    FileSystem,
}

/// Per-call view of the running execution handed to host implementations.
pub struct CallContext<'a> {
    execution_id: &'a str,
    console: &'a Console,
}

impl<'a> CallContext<'a> {
    pub fn new(execution_id: &'a str, console: &'a Console) -> Self {
        Self {
            execution_id,
            console,
        }
    }

    pub fn execution_id(&self) -> &str {
        self.execution_id
    }

    /// Write a line into the execution's captured output.
    pub fn log(&self, line: &str) {
        self.console.write_line(line);
    }

    /// Attach a warning to the execution result.
    pub fn warn(&self, message: impl Into<String>) {
        self.console.warn(message);
    }
}

/// A host API namespace.
///
/// Implementations are owned by the host and may be shared by many sandboxes
/// at once; they must tolerate concurrent calls.
pub trait HostApi: Send + Sync {
    /// Method names this namespace answers.
    fn methods(&self) -> Vec<String>;

    fn requirement(&self) -> HostRequirement {
        HostRequirement::None
    }

    fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        ctx: &CallContext<'_>,
    ) -> std::result::Result<Value, HostError>;
}

/// Explicitly constructed table of every namespace a host offers.
#[derive(Clone, Default)]
pub struct HostRegistry {
    namespaces: BTreeMap<String, Arc<dyn HostApi>>,
}

impl HostRegistry {
    /// Empty registry; not even `utils` is present.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in `utils` namespace.
    pub fn with_builtins() -> Self {
        Self::new().with("utils", Arc::new(UtilsApi))
    }

    /// Register a namespace, replacing any previous one with the same name.
    pub fn register(&mut self, namespace: impl Into<String>, api: Arc<dyn HostApi>) {
        self.namespaces.insert(namespace.into(), api);
    }

    pub fn with(mut self, namespace: impl Into<String>, api: Arc<dyn HostApi>) -> Self {
        self.register(namespace, api);
        self
    }

    pub fn get(&self, namespace: &str) -> Option<&Arc<dyn HostApi>> {
        self.namespaces.get(namespace)
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.namespaces.contains_key(namespace)
    }

    pub fn has_method(&self, namespace: &str, method: &str) -> bool {
        self.get(namespace)
            .map(|api| api.methods().iter().any(|m| m == method))
            .unwrap_or(false)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.namespaces.keys().map(String::as_str)
    }

    /// Namespace name to method names, for every registered namespace.
    pub fn catalog(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.namespaces
            .iter()
            .map(|(name, api)| (name.clone(), api.methods().into_iter().collect()))
            .collect()
    }
}

impl fmt::Debug for HostRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRegistry")
            .field("namespaces", &self.namespaces.keys().collect::<Vec<_>>())
            .finish()
    }
}

type MethodFn =
    Box<dyn Fn(Vec<Value>, &CallContext<'_>) -> std::result::Result<Value, HostError> + Send + Sync>;

/// A namespace assembled from closures.
///
/// ```rust,ignore
/// let timeline = FnNamespace::new()
///     .method("play", |_args, _ctx| Ok(Value::Null))
///     .method("seek", |args, _ctx| Ok(args.into_iter().next().unwrap_or_default()));
/// registry.register("timeline", Arc::new(timeline));
/// ```
#[derive(Default)]
pub struct FnNamespace {
    requirement: HostRequirement,
    methods: BTreeMap<String, MethodFn>,
}

impl FnNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>, &CallContext<'_>) -> std::result::Result<Value, HostError>
            + Send
            + Sync
            + 'static,
    {
        self.methods.insert(name.into(), Box::new(f));
        self
    }

    pub fn requires(mut self, requirement: HostRequirement) -> Self {
        self.requirement = requirement;
        self
    }
}

impl HostApi for FnNamespace {
    fn methods(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    fn requirement(&self) -> HostRequirement {
        self.requirement
    }

    fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        ctx: &CallContext<'_>,
    ) -> std::result::Result<Value, HostError> {
        match self.methods.get(method) {
            Some(f) => f(args, ctx),
            None => Err(HostError::UnknownMethod(method.to_string())),
        }
    }
}

// ============================================================================
// Built-in `utils` namespace
// ============================================================================

const UTILS_METHODS: &[&str] = &["log", "warn", "error", "now", "clamp", "lerp"];

/// Small helpers every sandbox may be granted: logging into the captured
/// output, a wall clock, and numeric utilities.
pub struct UtilsApi;

impl UtilsApi {
    fn render(args: &[Value]) -> String {
        args.iter()
            .map(|arg| match arg {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn number(args: &[Value], index: usize) -> std::result::Result<f64, HostError> {
        args.get(index).and_then(Value::as_f64).ok_or_else(|| {
            HostError::InvalidArguments(format!("argument {} must be a number", index + 1))
        })
    }

    fn float(value: f64) -> Value {
        serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

impl HostApi for UtilsApi {
    fn methods(&self) -> Vec<String> {
        UTILS_METHODS.iter().map(|m| m.to_string()).collect()
    }

    fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        ctx: &CallContext<'_>,
    ) -> std::result::Result<Value, HostError> {
        match method {
            "log" => {
                ctx.log(&Self::render(&args));
                Ok(Value::Null)
            }
            "warn" => {
                ctx.warn(Self::render(&args));
                Ok(Value::Null)
            }
            "error" => {
                ctx.log(&format!("[error] {}", Self::render(&args)));
                Ok(Value::Null)
            }
            "now" => Ok(Value::from(chrono::Utc::now().timestamp_millis())),
            "clamp" => {
                let value = Self::number(&args, 0)?;
                let lo = Self::number(&args, 1)?;
                let hi = Self::number(&args, 2)?;
                if lo > hi {
                    return Err(HostError::InvalidArguments(format!(
                        "clamp bounds are inverted ({} > {})",
                        lo, hi
                    )));
                }
                Ok(Self::float(value.clamp(lo, hi)))
            }
            "lerp" => {
                let a = Self::number(&args, 0)?;
                let b = Self::number(&args, 1)?;
                let t = Self::number(&args, 2)?;
                Ok(Self::float(a + (b - a) * t))
            }
            other => Err(HostError::UnknownMethod(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(method: &str, args: Vec<Value>) -> (std::result::Result<Value, HostError>, String) {
        let console = Console::new(1024);
        let ctx = CallContext::new("exec-1", &console);
        let result = UtilsApi.call(method, args, &ctx);
        (result, console.take().0)
    }

    #[test]
    fn test_log_joins_arguments() {
        let (result, output) = call("log", vec![json!("frame"), json!(3), json!({"a": 1})]);
        assert_eq!(result, Ok(Value::Null));
        assert_eq!(output, "frame 3 {\"a\":1}\n");
    }

    #[test]
    fn test_numeric_helpers() {
        let (result, _) = call("clamp", vec![json!(12), json!(0), json!(10)]);
        assert_eq!(result, Ok(json!(10.0)));

        let (result, _) = call("lerp", vec![json!(0), json!(10), json!(0.25)]);
        assert_eq!(result, Ok(json!(2.5)));

        let (result, _) = call("clamp", vec![json!("x"), json!(0), json!(1)]);
        assert!(matches!(result, Err(HostError::InvalidArguments(_))));
    }

    #[test]
    fn test_unknown_method() {
        let (result, _) = call("explode", vec![]);
        assert_eq!(result, Err(HostError::UnknownMethod("explode".into())));
    }

    #[test]
    fn test_registry_catalog() {
        let registry = HostRegistry::with_builtins().with(
            "timeline",
            Arc::new(FnNamespace::new().method("play", |_, _| Ok(Value::Null))),
        );
        assert!(registry.has_method("utils", "log"));
        assert!(registry.has_method("timeline", "play"));
        assert!(!registry.has_method("timeline", "stop"));
        assert!(!registry.has_method("sceneGraph", "read"));
        assert_eq!(
            registry.namespaces().collect::<Vec<_>>(),
            vec!["timeline", "utils"]
        );
        assert!(registry.catalog()["utils"].contains("lerp"));
    }
}
