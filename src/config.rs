use crate::capability::Permission;
use crate::errors::{Result, SandboxError};
use crate::host::HostRegistry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Default cap on captured output per execution.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Where an execution's script is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Dedicated OS thread inside the host process, terminated at the
    /// interpreter level on timeout
    #[default]
    Thread,
    /// Separate worker process under OS resource limits, killed on timeout
    Process,
}

/// Configuration a sandbox is created from. Immutable once the sandbox exists.
///
/// Serialized field names follow the camelCase wire shape UI layers send:
/// `{"memoryLimitMB": 50, "timeoutMs": 1000, "permissions": ["utils.log"], "apis": ["utils"]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    /// Display label only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Memory ceiling for one execution
    #[serde(rename = "memoryLimitMB")]
    pub memory_limit_mb: u64,
    /// Wall-clock budget for one execution
    pub timeout_ms: u64,
    /// `"namespace.method"` grants or `"namespace"` wildcards
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    /// Namespaces made visible at all
    #[serde(default)]
    pub apis: BTreeSet<String>,
    #[serde(default)]
    pub network_access: bool,
    #[serde(default)]
    pub file_system_access: bool,
    #[serde(default)]
    pub isolation: IsolationMode,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

fn default_max_output_bytes() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            name: None,
            memory_limit_mb: 64,
            timeout_ms: 5_000,
            permissions: BTreeSet::from(["utils".to_string()]),
            apis: BTreeSet::from(["utils".to_string()]),
            network_access: false,
            file_system_access: false,
            isolation: IsolationMode::Thread,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl SandboxConfig {
    /// Start from an empty grant set (no apis, no permissions).
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder {
            config: SandboxConfig {
                permissions: BTreeSet::new(),
                apis: BTreeSet::new(),
                ..SandboxConfig::default()
            },
        }
    }

    /// Parsed permission entries. Fails on the first malformed one.
    pub fn parsed_permissions(&self) -> Result<Vec<Permission>> {
        self.permissions.iter().map(|p| p.parse::<Permission>()).collect()
    }

    /// Check every constraint against the namespaces the host offers.
    pub fn validate(&self, registry: &HostRegistry) -> Result<()> {
        if self.memory_limit_mb == 0 {
            return Err(SandboxError::config("memoryLimitMB must be positive"));
        }
        if self.timeout_ms == 0 {
            return Err(SandboxError::config("timeoutMs must be positive"));
        }
        if self.max_output_bytes == 0 {
            return Err(SandboxError::config("maxOutputBytes must be positive"));
        }

        for api in &self.apis {
            if !registry.contains(api) {
                return Err(SandboxError::config(format!(
                    "api namespace '{}' is not provided by the host",
                    api
                )));
            }
        }

        for permission in self.parsed_permissions()? {
            let namespace = permission.namespace();
            if !self.apis.contains(namespace) {
                return Err(SandboxError::config(format!(
                    "permission '{}' references api '{}' which is not listed in apis",
                    permission, namespace
                )));
            }
            if let Some(method) = permission.method() {
                if !registry.has_method(namespace, method) {
                    return Err(SandboxError::config(format!(
                        "permission '{}' names a method the '{}' api does not provide",
                        permission, namespace
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Fluent construction of a [`SandboxConfig`].
#[derive(Debug, Clone)]
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
}

impl SandboxConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    pub fn memory_limit_mb(mut self, mb: u64) -> Self {
        self.config.memory_limit_mb = mb;
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.config.timeout_ms = ms;
        self
    }

    /// Make a namespace visible.
    pub fn api(mut self, namespace: impl Into<String>) -> Self {
        self.config.apis.insert(namespace.into());
        self
    }

    /// Grant `"namespace.method"` or a whole `"namespace"`.
    pub fn permit(mut self, permission: impl Into<String>) -> Self {
        self.config.permissions.insert(permission.into());
        self
    }

    /// Make a namespace visible and grant all of it.
    pub fn grant_api(self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        self.api(namespace.clone()).permit(namespace)
    }

    pub fn network_access(mut self, allowed: bool) -> Self {
        self.config.network_access = allowed;
        self
    }

    pub fn file_system_access(mut self, allowed: bool) -> Self {
        self.config.file_system_access = allowed;
        self
    }

    pub fn isolation(mut self, mode: IsolationMode) -> Self {
        self.config.isolation = mode;
        self
    }

    pub fn max_output_bytes(mut self, bytes: usize) -> Self {
        self.config.max_output_bytes = bytes;
        self
    }

    pub fn build(self) -> SandboxConfig {
        self.config
    }
}
