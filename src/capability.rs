//! Permission-checked dispatch from scripts to host namespaces.
//!
//! A sandbox's capability surface is an explicit table: namespace name to the
//! host implementation, built once from the sandbox's `apis` and `permissions`.
//! Every call is looked up in that table and checked against the permission
//! list before anything is forwarded; nothing is resolved by interception.

use crate::config::SandboxConfig;
use crate::errors::SandboxError;
use crate::host::{CallContext, HostApi, HostError, HostRegistry, HostRequirement};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// One entry of a sandbox's allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Permission {
    /// `"timeline"` or `"timeline.*"`: every method of the namespace
    Namespace(String),
    /// `"timeline.play"`
    Method { namespace: String, method: String },
}

impl Permission {
    pub fn namespace(&self) -> &str {
        match self {
            Permission::Namespace(namespace) => namespace,
            Permission::Method { namespace, .. } => namespace,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Permission::Namespace(_) => None,
            Permission::Method { method, .. } => Some(method),
        }
    }

    pub fn allows(&self, namespace: &str, method: &str) -> bool {
        match self {
            Permission::Namespace(ns) => ns == namespace,
            Permission::Method {
                namespace: ns,
                method: m,
            } => ns == namespace && m == method,
        }
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

impl FromStr for Permission {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || SandboxError::config(format!("malformed permission '{}'", s));
        let s = s.trim();
        match s.split_once('.') {
            None if is_identifier(s) => Ok(Permission::Namespace(s.to_string())),
            Some((namespace, "*")) if is_identifier(namespace) => {
                Ok(Permission::Namespace(namespace.to_string()))
            }
            Some((namespace, method)) if is_identifier(namespace) && is_identifier(method) => {
                Ok(Permission::Method {
                    namespace: namespace.to_string(),
                    method: method.to_string(),
                })
            }
            _ => Err(malformed()),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Namespace(namespace) => f.write_str(namespace),
            Permission::Method { namespace, method } => write!(f, "{}.{}", namespace, method),
        }
    }
}

/// A capability check failed.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("permission denied: {namespace}.{method} is not granted to this sandbox")]
pub struct PermissionDenied {
    pub namespace: String,
    pub method: String,
}

impl PermissionDenied {
    pub fn new(namespace: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            method: method.into(),
        }
    }
}

/// Why a forwarded call did not produce a value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallFailure {
    #[error(transparent)]
    Denied(#[from] PermissionDenied),

    #[error("{namespace}.{method} failed: {source}")]
    Host {
        namespace: String,
        method: String,
        source: HostError,
    },
}

/// The capability surface of one sandbox.
pub struct CapabilityProxy {
    permissions: BTreeSet<Permission>,
    wired: BTreeMap<String, Arc<dyn HostApi>>,
    catalog: BTreeMap<String, BTreeSet<String>>,
}

impl CapabilityProxy {
    /// Wire every namespace that is listed in `apis`, offered by the host,
    /// allowed by at least one permission and not gated off by the
    /// network/filesystem flags.
    pub fn new(config: &SandboxConfig, registry: &HostRegistry) -> Self {
        let permissions: BTreeSet<Permission> = config
            .permissions
            .iter()
            .filter_map(|p| p.parse::<Permission>().ok())
            .collect();

        let mut wired = BTreeMap::new();
        for namespace in &config.apis {
            let Some(api) = registry.get(namespace) else {
                continue;
            };
            let gated = match api.requirement() {
                HostRequirement::None => false,
                HostRequirement::Network => !config.network_access,
                HostRequirement::FileSystem => !config.file_system_access,
            };
            if gated {
                debug!(
                    namespace = %namespace,
                    requirement = ?api.requirement(),
                    "namespace not wired: access flag disabled"
                );
                continue;
            }
            if !permissions.iter().any(|p| p.namespace() == namespace) {
                continue;
            }
            wired.insert(namespace.clone(), Arc::clone(api));
        }

        Self {
            permissions,
            wired,
            catalog: registry.catalog(),
        }
    }

    /// The restricted view scripts see as `api`.
    pub fn get_proxy(&self) -> CapabilitySurface<'_> {
        CapabilitySurface { proxy: self }
    }

    pub fn is_permitted(&self, namespace: &str, method: &str) -> bool {
        self.wired.contains_key(namespace)
            && self.permissions.iter().any(|p| p.allows(namespace, method))
    }

    /// Whether the host offers this method at all, granted or not.
    pub fn is_known(&self, namespace: &str, method: &str) -> bool {
        self.catalog
            .get(namespace)
            .map(|methods| methods.contains(method))
            .unwrap_or(false)
    }

    pub fn is_visible(&self, namespace: &str) -> bool {
        self.wired.contains_key(namespace)
    }

    /// Every method name any host namespace offers.
    pub fn method_names(&self) -> BTreeSet<String> {
        self.catalog.values().flatten().cloned().collect()
    }

    /// Permission-checked dispatch of `namespace.method(args)`.
    pub fn call(
        &self,
        namespace: &str,
        method: &str,
        args: Vec<Value>,
        ctx: &CallContext<'_>,
    ) -> Result<Value, CallFailure> {
        match self.get_proxy().namespace(namespace) {
            Some(proxy) => proxy.call(method, args, ctx),
            None => Err(PermissionDenied::new(namespace, method).into()),
        }
    }
}

/// Borrowed view over the wired namespaces.
#[derive(Clone, Copy)]
pub struct CapabilitySurface<'a> {
    proxy: &'a CapabilityProxy,
}

impl<'a> CapabilitySurface<'a> {
    pub fn namespaces(&self) -> impl Iterator<Item = &'a str> {
        self.proxy.wired.keys().map(String::as_str)
    }

    pub fn namespace(&self, name: &str) -> Option<NamespaceProxy<'a>> {
        self.proxy
            .wired
            .get_key_value(name)
            .map(|(name, api)| NamespaceProxy {
                name,
                api,
                permissions: &self.proxy.permissions,
            })
    }

    /// Namespace name to the methods this sandbox may call on it.
    pub fn describe(&self) -> BTreeMap<String, Vec<String>> {
        self.proxy
            .wired
            .iter()
            .map(|(name, api)| {
                let methods = api
                    .methods()
                    .into_iter()
                    .filter(|m| self.proxy.is_permitted(name, m))
                    .collect();
                (name.clone(), methods)
            })
            .collect()
    }
}

/// One namespace of the surface; checks the method on every call.
pub struct NamespaceProxy<'a> {
    name: &'a str,
    api: &'a Arc<dyn HostApi>,
    permissions: &'a BTreeSet<Permission>,
}

impl NamespaceProxy<'_> {
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        ctx: &CallContext<'_>,
    ) -> Result<Value, CallFailure> {
        if !self.permissions.iter().any(|p| p.allows(self.name, method)) {
            return Err(PermissionDenied::new(self.name, method).into());
        }
        self.api
            .call(method, args, ctx)
            .map_err(|source| CallFailure::Host {
                namespace: self.name.to_string(),
                method: method.to_string(),
                source,
            })
    }
}
