use crate::capability::CapabilityProxy;
use crate::config::SandboxConfig;
use crate::engine::{validate_code, AbortReason, AbortSignal, ExecutionEngine, IsolateCapabilities};
use crate::errors::{Result, SandboxError};
use crate::result::{ExecutionError, ExecutionResult, ValidationResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info};

/// Lifecycle state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Active,
    Idle,
    /// Terminal
    Destroyed,
    /// Terminal; an isolate failure left the engine unusable
    Error,
}

impl SandboxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SandboxStatus::Destroyed | SandboxStatus::Error)
    }
}

/// Aggregates over a sandbox's recorded executions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStats {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub average_execution_time_ms: f64,
    /// Mean of [`ExecutionResult::memory_used_mb`]; process-wide in thread
    /// isolation, not per-sandbox accounting.
    #[serde(rename = "averageMemoryUsedMB")]
    pub average_memory_used_mb: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ExecutionError>,
}

/// Point-in-time record of a sandbox, for listings and UIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInfo {
    pub id: String,
    pub name: String,
    pub config: SandboxConfig,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub execution_count: u64,
    pub error_count: u64,
}

/// Running sums every stat is derived from.
#[derive(Debug, Default)]
struct ExecutionLedger {
    total: u64,
    successful: u64,
    total_time_ms: f64,
    total_memory_mb: f64,
    last_error: Option<ExecutionError>,
}

impl ExecutionLedger {
    fn record(&mut self, result: &ExecutionResult) {
        self.total += 1;
        if result.success {
            self.successful += 1;
        } else if let Some(error) = result.primary_error() {
            self.last_error = Some(error.clone());
        }
        self.total_time_ms += result.execution_time_ms;
        self.total_memory_mb += result.memory_used_mb;
    }

    fn stats(&self) -> SandboxStats {
        let average = |sum: f64| {
            if self.total == 0 {
                0.0
            } else {
                sum / self.total as f64
            }
        };
        SandboxStats {
            total_executions: self.total,
            successful_executions: self.successful,
            failed_executions: self.total - self.successful,
            average_execution_time_ms: average(self.total_time_ms),
            average_memory_used_mb: average(self.total_memory_mb),
            last_error: self.last_error.clone(),
        }
    }
}

struct SandboxState {
    status: SandboxStatus,
    last_used: DateTime<Utc>,
    in_flight: Option<Arc<AbortSignal>>,
}

/// A configured, isolated execution slot.
///
/// Executions on one sandbox are serialized: concurrent `execute` calls queue
/// in arrival order on the engine slot and complete in that order.
pub struct Sandbox {
    id: String,
    name: String,
    config: Arc<SandboxConfig>,
    created_at: DateTime<Utc>,
    proxy: Arc<CapabilityProxy>,
    capabilities: IsolateCapabilities,
    state: Mutex<SandboxState>,
    ledger: Mutex<ExecutionLedger>,
    engine: tokio::sync::Mutex<Option<ExecutionEngine>>,
}

impl Sandbox {
    pub(crate) fn new(
        id: String,
        config: Arc<SandboxConfig>,
        proxy: Arc<CapabilityProxy>,
        engine: ExecutionEngine,
    ) -> Self {
        let now = Utc::now();
        let name = config.name.clone().unwrap_or_else(|| id.clone());
        Self {
            name,
            capabilities: engine.capabilities(),
            config,
            created_at: now,
            proxy,
            state: Mutex::new(SandboxState {
                status: SandboxStatus::Active,
                last_used: now,
                in_flight: None,
            }),
            ledger: Mutex::new(ExecutionLedger::default()),
            engine: tokio::sync::Mutex::new(Some(engine)),
            id,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn status(&self) -> SandboxStatus {
        self.state.lock().status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_used(&self) -> DateTime<Utc> {
        self.state.lock().last_used
    }

    pub fn execution_count(&self) -> u64 {
        self.ledger.lock().total
    }

    pub fn error_count(&self) -> u64 {
        let ledger = self.ledger.lock();
        ledger.total - ledger.successful
    }

    /// What the isolation unit behind this sandbox can guarantee.
    pub fn capabilities(&self) -> &IsolateCapabilities {
        &self.capabilities
    }

    pub fn info(&self) -> SandboxInfo {
        let (status, last_used) = {
            let state = self.state.lock();
            (state.status, state.last_used)
        };
        SandboxInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            config: (*self.config).clone(),
            status,
            created_at: self.created_at,
            last_used,
            execution_count: self.execution_count(),
            error_count: self.error_count(),
        }
    }

    /// Run `code` with `params` bound, waiting behind any execution already
    /// in flight on this sandbox.
    ///
    /// Script failures are reported inside the [`ExecutionResult`]. `Err` is
    /// returned only when the sandbox can no longer execute: it was destroyed
    /// (before or while this call was queued) or is in the `Error` state.
    pub async fn execute(&self, code: &str, params: Value) -> Result<ExecutionResult> {
        let slot = self.engine.lock().await;
        let Some(engine) = slot.as_ref() else {
            return Err(SandboxError::Destroyed(self.id.clone()));
        };

        let signal = Arc::new(AbortSignal::new());
        {
            let mut state = self.state.lock();
            match state.status {
                SandboxStatus::Destroyed => return Err(SandboxError::Destroyed(self.id.clone())),
                SandboxStatus::Error => return Err(SandboxError::Faulted(self.id.clone())),
                SandboxStatus::Active | SandboxStatus::Idle => {}
            }
            state.status = SandboxStatus::Active;
            state.last_used = Utc::now();
            state.in_flight = Some(Arc::clone(&signal));
        }

        let result = engine.execute_with_signal(code, params, signal).await;

        {
            let mut state = self.state.lock();
            state.in_flight = None;
            state.last_used = Utc::now();
            if let Some(reason) = engine.fault() {
                if state.status != SandboxStatus::Destroyed {
                    error!(sandbox_id = %self.id, "[SANDBOX] Marking sandbox as errored: {}", reason);
                    state.status = SandboxStatus::Error;
                }
            }
        }
        self.ledger.lock().record(&result);

        Ok(result)
    }

    /// Static checks against this sandbox's permissions; never runs code and
    /// never fails.
    pub fn validate(&self, code: &str) -> ValidationResult {
        validate_code(code, &self.config, &self.proxy)
    }

    pub fn stats(&self) -> SandboxStats {
        self.ledger.lock().stats()
    }

    /// Move an idle-enough `Active` sandbox to `Idle`.
    pub(crate) fn mark_idle_if_unused_since(&self, cutoff: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        if state.status == SandboxStatus::Active && state.in_flight.is_none() && state.last_used <= cutoff {
            state.status = SandboxStatus::Idle;
            return true;
        }
        false
    }

    /// Cancel any in-flight execution, wait for it to settle, then release
    /// the engine. Returns false if the sandbox was already destroyed.
    pub(crate) async fn destroy(&self) -> bool {
        let in_flight = {
            let mut state = self.state.lock();
            if state.status == SandboxStatus::Destroyed {
                return false;
            }
            state.status = SandboxStatus::Destroyed;
            state.in_flight.take()
        };

        if let Some(signal) = in_flight {
            info!(sandbox_id = %self.id, "[SANDBOX] Cancelling in-flight execution");
            signal.abort(AbortReason::Cancelled);
        }

        let engine = self.engine.lock().await.take();
        drop(engine);
        info!(sandbox_id = %self.id, "[SANDBOX] Destroyed");
        true
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}
