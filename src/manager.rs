use crate::capability::CapabilityProxy;
use crate::config::SandboxConfig;
use crate::engine::{EngineOptions, ExecutionEngine};
use crate::errors::{Result, SandboxError};
use crate::host::HostRegistry;
use crate::sandbox::{Sandbox, SandboxStatus};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_SANDBOXES: usize = 256;

/// Manager-wide settings.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Worker binary for process isolation; looked up when unset
    pub worker_program: Option<PathBuf>,
    pub max_sandboxes: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            worker_program: None,
            max_sandboxes: DEFAULT_MAX_SANDBOXES,
        }
    }
}

/// Snapshot of the manager's population and lifetime execution totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStats {
    pub live: usize,
    pub active: usize,
    pub idle: usize,
    pub errored: usize,
    pub destroyed: u64,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
}

#[derive(Debug, Default)]
struct Retired {
    destroyed: u64,
    total: u64,
    successful: u64,
}

/// Creates, tracks and destroys sandboxes.
///
/// Safe to share across tasks; every method takes `&self`.
pub struct SandboxManager {
    registry: HostRegistry,
    options: ManagerOptions,
    sandboxes: RwLock<BTreeMap<String, Arc<Sandbox>>>,
    sequence: AtomicU64,
    retired: Mutex<Retired>,
}

impl SandboxManager {
    pub fn new(registry: HostRegistry) -> Self {
        Self::with_options(registry, ManagerOptions::default())
    }

    pub fn with_options(registry: HostRegistry, options: ManagerOptions) -> Self {
        Self {
            registry,
            options,
            sandboxes: RwLock::new(BTreeMap::new()),
            sequence: AtomicU64::new(0),
            retired: Mutex::new(Retired::default()),
        }
    }

    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    /// Validate `config`, wire its capabilities and register a new `Active`
    /// sandbox. Nothing is registered if any step fails.
    pub fn create_sandbox(&self, config: SandboxConfig) -> Result<Arc<Sandbox>> {
        config.validate(&self.registry)?;

        let live = self.sandboxes.read().len();
        if live >= self.options.max_sandboxes {
            warn!(live, "[SANDBOX] Refusing to create sandbox: limit reached");
            return Err(SandboxError::CapacityExceeded(live));
        }

        let config = Arc::new(config);
        let proxy = Arc::new(CapabilityProxy::new(&config, &self.registry));
        let engine = ExecutionEngine::for_config(
            Arc::clone(&config),
            Arc::clone(&proxy),
            &EngineOptions {
                worker_program: self.options.worker_program.clone(),
            },
        )?;

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("sbx-{}", seq);
        let sandbox = Arc::new(Sandbox::new(id.clone(), config, proxy, engine));

        {
            let mut sandboxes = self.sandboxes.write();
            // Re-checked under the write lock; the read above is only a fast path.
            if sandboxes.len() >= self.options.max_sandboxes {
                return Err(SandboxError::CapacityExceeded(sandboxes.len()));
            }
            sandboxes.insert(id.clone(), Arc::clone(&sandbox));
        }

        info!(
            sandbox_id = %id,
            name = %sandbox.name(),
            isolation = %sandbox.capabilities().name,
            timeout_ms = sandbox.config().timeout_ms,
            memory_limit_mb = sandbox.config().memory_limit_mb,
            "[SANDBOX] Created sandbox"
        );
        Ok(sandbox)
    }

    pub fn get_sandbox(&self, id: &str) -> Option<Arc<Sandbox>> {
        self.sandboxes.read().get(id).cloned()
    }

    /// Like [`get_sandbox`](Self::get_sandbox), for callers that treat an
    /// unknown id as an error.
    pub fn require_sandbox(&self, id: &str) -> Result<Arc<Sandbox>> {
        self.get_sandbox(id)
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))
    }

    /// Remove and destroy a sandbox, cancelling any in-flight execution.
    /// Returns false for unknown or already destroyed ids.
    pub async fn destroy_sandbox(&self, id: &str) -> bool {
        let Some(sandbox) = self.sandboxes.write().remove(id) else {
            debug!(sandbox_id = %id, "[SANDBOX] Destroy requested for unknown sandbox");
            return false;
        };

        if !sandbox.destroy().await {
            return false;
        }

        let stats = sandbox.stats();
        let mut retired = self.retired.lock();
        retired.destroyed += 1;
        retired.total += stats.total_executions;
        retired.successful += stats.successful_executions;
        true
    }

    /// Every live sandbox, in creation order.
    pub fn list_sandboxes(&self) -> Vec<Arc<Sandbox>> {
        let mut sandboxes: Vec<_> = self.sandboxes.read().values().cloned().collect();
        sandboxes.sort_by_key(|s| (s.created_at(), id_sequence(s.id())));
        sandboxes
    }

    /// Move sandboxes that have not executed for `unused_for` to `Idle`.
    /// Returns how many changed state.
    pub fn mark_idle(&self, unused_for: Duration) -> usize {
        let cutoff = match chrono::Duration::from_std(unused_for) {
            Ok(d) => chrono::Utc::now() - d,
            Err(_) => return 0,
        };
        let marked = self
            .sandboxes
            .read()
            .values()
            .filter(|s| s.mark_idle_if_unused_since(cutoff))
            .count();
        if marked > 0 {
            debug!(marked, "[SANDBOX] Marked sandboxes idle");
        }
        marked
    }

    pub fn stats(&self) -> ManagerStats {
        let retired = self.retired.lock();
        let mut stats = ManagerStats {
            destroyed: retired.destroyed,
            total_executions: retired.total,
            successful_executions: retired.successful,
            ..ManagerStats::default()
        };
        drop(retired);

        for sandbox in self.sandboxes.read().values() {
            stats.live += 1;
            match sandbox.status() {
                SandboxStatus::Active => stats.active += 1,
                SandboxStatus::Idle => stats.idle += 1,
                SandboxStatus::Error => stats.errored += 1,
                SandboxStatus::Destroyed => {}
            }
            let s = sandbox.stats();
            stats.total_executions += s.total_executions;
            stats.successful_executions += s.successful_executions;
        }
        stats.failed_executions = stats.total_executions - stats.successful_executions;
        stats
    }

    /// Destroy every live sandbox.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sandboxes.read().keys().cloned().collect();
        info!(count = ids.len(), "[SANDBOX] Shutting down manager");
        for id in ids {
            self.destroy_sandbox(&id).await;
        }
    }
}

fn id_sequence(id: &str) -> u64 {
    id.strip_prefix("sbx-")
        .and_then(|n| n.parse().ok())
        .unwrap_or(u64::MAX)
}

impl std::fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxManager")
            .field("registry", &self.registry)
            .field("options", &self.options)
            .field("live", &self.sandboxes.read().len())
            .finish()
    }
}
