//! Sandboxed script execution for untrusted, user-authored automation.
//!
//! Scripts are Rhai programs. Each [`Sandbox`] owns a configuration (memory
//! and time limits, granted permissions) and evaluates scripts in an isolated
//! unit: a dedicated thread or a `scriptsandbox-worker` child process. Scripts
//! reach the host only through `api.<namespace>.<method>(...)`, which goes
//! through a [`CapabilityProxy`] that enforces the sandbox's permissions.
//!
//! Every script failure comes back inside an [`ExecutionResult`], classified
//! as one of the [`ErrorKind`]s. Lifecycle misuse (bad config, destroyed
//! sandbox) is a [`SandboxError`].
//!
//! # Example
//! ```no_run
//! use scriptsandbox::{HostRegistry, SandboxConfig, SandboxManager};
//! use serde_json::json;
//!
//! # async fn demo() -> scriptsandbox::Result<()> {
//! let manager = SandboxManager::new(HostRegistry::with_builtins());
//! let sandbox = manager.create_sandbox(SandboxConfig::default())?;
//!
//! let result = sandbox
//!     .execute("api.utils.log(\"hi\"); params.x * 2", json!({ "x": 21 }))
//!     .await?;
//! assert!(result.success);
//! assert_eq!(result.output, "hi\n");
//! assert_eq!(result.result, json!(42));
//!
//! manager.destroy_sandbox(sandbox.id()).await;
//! # Ok(())
//! # }
//! ```

pub mod analyzer;
pub mod capability;
pub mod config;
pub mod console;
pub mod engine;
pub mod errors;
pub mod host;
pub mod manager;
pub mod monitor;
pub mod native;
pub mod protocol;
pub mod result;
pub mod runtime;
pub mod sandbox;
pub mod sandboxed;

pub use capability::{CapabilityProxy, CapabilitySurface, NamespaceProxy, Permission, PermissionDenied};
pub use config::{IsolationMode, SandboxConfig, SandboxConfigBuilder};
pub use engine::{
    AbortReason, AbortSignal, EngineOptions, ExecutionEngine, Isolate, IsolateCapabilities,
};
pub use errors::{Result, SandboxError};
pub use host::{CallContext, FnNamespace, HostApi, HostError, HostRegistry, HostRequirement};
pub use manager::{ManagerOptions, ManagerStats, SandboxManager};
pub use monitor::{ResourceMonitor, Usage};
pub use native::NativeIsolate;
pub use result::{ErrorKind, ExecutionError, ExecutionResult, ValidationResult, Warning};
pub use sandbox::{Sandbox, SandboxInfo, SandboxStats, SandboxStatus};
pub use sandboxed::ProcessIsolate;
