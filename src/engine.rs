use crate::analyzer;
use crate::capability::{CallFailure, CapabilityProxy};
use crate::config::{IsolationMode, SandboxConfig};
use crate::console::Console;
use crate::errors::Result;
use crate::host::CallContext;
use crate::monitor::{MonitorGuard, ResourceMonitor};
use crate::native::NativeIsolate;
use crate::result::{ExecutionError, ExecutionResult, ValidationResult, Warning};
use crate::runtime::{self, BridgeFault, ScriptLimits, ScriptOutcome};
use crate::sandboxed::ProcessIsolate;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long an isolate gets to acknowledge an abort before it is abandoned.
const ABORT_GRACE: Duration = Duration::from_millis(500);

/// Why an execution was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    Timeout,
    Cancelled,
}

const REASON_NONE: u8 = 0;
const REASON_TIMEOUT: u8 = 1;
const REASON_CANCELLED: u8 = 2;

/// One-shot abort signal shared by the supervisor, the isolate and whoever
/// may cancel the execution. The first reason recorded wins.
#[derive(Debug, Default)]
pub struct AbortSignal {
    flag: Arc<AtomicBool>,
    reason: AtomicU8,
    notify: Notify,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the signal had already fired.
    pub fn abort(&self, reason: AbortReason) -> bool {
        let code = match reason {
            AbortReason::Timeout => REASON_TIMEOUT,
            AbortReason::Cancelled => REASON_CANCELLED,
        };
        let first = self
            .reason
            .compare_exchange(REASON_NONE, code, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if first {
            self.flag.store(true, Ordering::SeqCst);
            self.notify.notify_waiters();
        }
        first
    }

    pub fn reason(&self) -> Option<AbortReason> {
        match self.reason.load(Ordering::SeqCst) {
            REASON_TIMEOUT => Some(AbortReason::Timeout),
            REASON_CANCELLED => Some(AbortReason::Cancelled),
            _ => None,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// The raw flag interpreters poll.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    /// Resolves once the signal fires.
    pub async fn aborted(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

/// Aborts the signal if the execution future is dropped before it finishes.
struct CancelOnDrop {
    signal: Arc<AbortSignal>,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.signal.abort(AbortReason::Cancelled);
        }
    }
}

/// Owned inputs for one isolated run.
#[derive(Debug, Clone)]
pub struct IsolateJob {
    pub execution_id: String,
    pub code: String,
    pub params: Value,
    pub methods: Vec<String>,
    pub limits: ScriptLimits,
}

/// What an isolate hands back to the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct IsolateReport {
    pub outcome: ScriptOutcome,
    /// Peak memory the isolate measured for itself, when it can
    pub peak_memory_mb: Option<f64>,
}

impl IsolateReport {
    pub fn new(outcome: ScriptOutcome) -> Self {
        Self {
            outcome,
            peak_memory_mb: None,
        }
    }

    pub fn crashed(reason: impl Into<String>) -> Self {
        Self::new(ScriptOutcome::crashed(reason))
    }
}

/// Capabilities of an isolation unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolateCapabilities {
    /// Isolate name
    pub name: String,
    /// Evaluation can be stopped without the script's cooperation
    pub hard_cancel: bool,
    /// An OS-level memory ceiling backs the interpreter quotas
    pub os_memory_ceiling: bool,
    /// Security level (0-10, 10 being most secure)
    pub security_level: u8,
}

/// Host side of a running execution: permission-checked dispatch, output
/// capture and sample accounting.
#[derive(Clone)]
pub struct HostLink {
    proxy: Arc<CapabilityProxy>,
    console: Arc<Console>,
    monitor: Arc<ResourceMonitor>,
    execution_id: String,
}

impl HostLink {
    pub fn new(
        proxy: Arc<CapabilityProxy>,
        console: Arc<Console>,
        monitor: Arc<ResourceMonitor>,
        execution_id: impl Into<String>,
    ) -> Self {
        Self {
            proxy,
            console,
            monitor,
            execution_id: execution_id.into(),
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn call(
        &self,
        namespace: &str,
        method: &str,
        args: Vec<Value>,
    ) -> std::result::Result<Value, BridgeFault> {
        self.monitor.record_sample(&self.execution_id);
        let ctx = CallContext::new(&self.execution_id, &self.console);
        match self.proxy.call(namespace, method, args, &ctx) {
            Ok(value) => Ok(value),
            Err(CallFailure::Denied(denied)) => {
                warn!(
                    execution_id = %self.execution_id,
                    "[SANDBOX] Denied {}.{}", denied.namespace, denied.method
                );
                Err(BridgeFault::Denied(denied))
            }
            Err(CallFailure::Host { source, .. }) => Err(BridgeFault::Host(source.to_string())),
        }
    }

    pub fn print(&self, text: &str) {
        self.console.write_line(text);
    }
}

/// An independently schedulable unit that evaluates one script.
///
/// Implementations must honour `signal` promptly: once it fires, the run is
/// expected to end with [`ScriptOutcome::Aborted`] whether or not the script
/// ever yields.
#[async_trait]
pub trait Isolate: Send + Sync {
    async fn run(&self, job: IsolateJob, link: HostLink, signal: Arc<AbortSignal>)
        -> IsolateReport;

    fn capabilities(&self) -> IsolateCapabilities;
}

/// Knobs for building engines that are not part of a sandbox's config.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Explicit worker binary for [`IsolationMode::Process`]
    pub worker_program: Option<PathBuf>,
}

enum Race {
    Finished(IsolateReport),
    Deadline,
    Aborted,
}

/// Supervisor for one sandbox's executions.
///
/// Never fails towards its caller: every script failure, timeout and isolate
/// crash is classified into the returned [`ExecutionResult`].
pub struct ExecutionEngine {
    config: Arc<SandboxConfig>,
    proxy: Arc<CapabilityProxy>,
    monitor: Arc<ResourceMonitor>,
    isolate: Box<dyn Isolate>,
    limits: ScriptLimits,
    fault: Mutex<Option<String>>,
}

impl ExecutionEngine {
    pub fn new(
        config: Arc<SandboxConfig>,
        proxy: Arc<CapabilityProxy>,
        isolate: Box<dyn Isolate>,
    ) -> Self {
        let limits = ScriptLimits::for_config(&config);
        Self {
            config,
            proxy,
            monitor: Arc::new(ResourceMonitor::new()),
            isolate,
            limits,
            fault: Mutex::new(None),
        }
    }

    /// Build the engine with the isolate the config asks for.
    pub fn for_config(
        config: Arc<SandboxConfig>,
        proxy: Arc<CapabilityProxy>,
        options: &EngineOptions,
    ) -> Result<Self> {
        let isolate: Box<dyn Isolate> = match config.isolation {
            IsolationMode::Thread => Box::new(NativeIsolate::new()),
            IsolationMode::Process => {
                let program = ProcessIsolate::locate(options.worker_program.as_deref())?;
                Box::new(ProcessIsolate::new(program, &config)?)
            }
        };
        Ok(Self::new(config, proxy, isolate))
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    pub fn capabilities(&self) -> IsolateCapabilities {
        self.isolate.capabilities()
    }

    /// Set once an isolate crash has made this engine unusable.
    pub fn fault(&self) -> Option<String> {
        self.fault.lock().clone()
    }

    pub async fn execute(&self, code: &str, params: Value) -> ExecutionResult {
        self.execute_with_signal(code, params, Arc::new(AbortSignal::new()))
            .await
    }

    /// Execute under an externally held abort signal, so a caller can cancel.
    pub async fn execute_with_signal(
        &self,
        code: &str,
        params: Value,
        signal: Arc<AbortSignal>,
    ) -> ExecutionResult {
        let execution_id = Uuid::new_v4().to_string();
        let guard = MonitorGuard::start(Arc::clone(&self.monitor), &execution_id);
        let mut cancel_on_drop = CancelOnDrop {
            signal: Arc::clone(&signal),
            armed: true,
        };

        let console = Arc::new(Console::new(self.config.max_output_bytes));
        let link = HostLink::new(
            Arc::clone(&self.proxy),
            Arc::clone(&console),
            Arc::clone(&self.monitor),
            execution_id.clone(),
        );
        let job = IsolateJob {
            execution_id: execution_id.clone(),
            code: code.to_string(),
            params,
            methods: self.methods_for(code),
            limits: self.limits.clone(),
        };

        debug!(
            execution_id = %execution_id,
            isolate = %self.isolate.capabilities().name,
            "[SANDBOX] Starting execution"
        );

        let report = self.supervise(job, link, &signal).await;
        cancel_on_drop.armed = false;

        if let ScriptOutcome::Crashed { reason } = &report.outcome {
            error!(execution_id = %execution_id, "[SANDBOX] Isolate failure: {}", reason);
            *self.fault.lock() = Some(reason.clone());
        }

        let throughput = self.monitor.throughput(&execution_id).unwrap_or(0.0);
        let usage = guard.finish();
        let memory_used_mb = report.peak_memory_mb.unwrap_or(usage.memory_used_mb);
        let (output, warnings) = console.take();

        let result = match resolve_outcome(report.outcome, signal.reason(), self.config.timeout_ms)
        {
            Ok(value) => ExecutionResult::completed(
                value,
                usage.execution_time_ms,
                memory_used_mb,
                output,
                warnings,
            ),
            Err(error) => ExecutionResult::failed(
                error,
                usage.execution_time_ms,
                memory_used_mb,
                output,
                warnings,
            ),
        };

        info!(
            execution_id = %execution_id,
            success = result.success,
            elapsed_ms = usage.execution_time_ms,
            host_calls = usage.samples,
            calls_per_sec = throughput,
            "[SANDBOX] Execution finished"
        );
        result
    }

    /// Static checks only; the code is never evaluated.
    pub fn validate(&self, code: &str) -> ValidationResult {
        validate_code(code, &self.config, &self.proxy)
    }

    fn methods_for(&self, code: &str) -> Vec<String> {
        let mut methods = self.proxy.method_names();
        methods.extend(analyzer::analyze(code).method_names);
        methods.into_iter().collect()
    }

    /// Race the isolate against the deadline and external cancellation.
    async fn supervise(
        &self,
        job: IsolateJob,
        link: HostLink,
        signal: &Arc<AbortSignal>,
    ) -> IsolateReport {
        let budget = Duration::from_millis(self.config.timeout_ms);
        let run = self.isolate.run(job, link, Arc::clone(signal));
        tokio::pin!(run);

        let race = tokio::select! {
            biased;
            report = &mut run => Race::Finished(report),
            _ = signal.aborted() => Race::Aborted,
            _ = tokio::time::sleep(budget) => Race::Deadline,
        };

        match race {
            Race::Finished(report) => return report,
            Race::Deadline => {
                signal.abort(AbortReason::Timeout);
                warn!(
                    timeout_ms = self.config.timeout_ms,
                    "[SANDBOX] Timeout reached, aborting execution"
                );
            }
            Race::Aborted => info!("[SANDBOX] Execution cancelled"),
        }

        match tokio::time::timeout(ABORT_GRACE, &mut run).await {
            Ok(report) => report,
            Err(_) => {
                warn!("[SANDBOX] Isolate did not acknowledge abort; abandoning it");
                IsolateReport::new(ScriptOutcome::Aborted)
            }
        }
    }
}

/// Apply abort precedence: once the signal has fired, its reason decides
/// the result regardless of how the script itself ended.
pub(crate) fn resolve_outcome(
    outcome: ScriptOutcome,
    reason: Option<AbortReason>,
    timeout_ms: u64,
) -> std::result::Result<Value, ExecutionError> {
    match reason {
        Some(AbortReason::Timeout) => Err(ExecutionError::timeout(timeout_ms)),
        Some(AbortReason::Cancelled) => Err(ExecutionError::runtime(
            "execution cancelled: the sandbox was destroyed",
        )),
        None => match outcome {
            ScriptOutcome::Completed { value } => Ok(value),
            ScriptOutcome::Failed { error } => Err(error),
            ScriptOutcome::Aborted => Err(ExecutionError::runtime("execution aborted")),
            ScriptOutcome::Crashed { reason } => Err(ExecutionError::runtime(format!(
                "sandbox isolate failed: {}",
                reason
            ))),
        },
    }
}

/// Static validation of `code` against a sandbox's capability surface.
pub fn validate_code(
    code: &str,
    config: &SandboxConfig,
    proxy: &CapabilityProxy,
) -> ValidationResult {
    let mut report = ValidationResult::default();

    if let Err(error) = runtime::check_syntax(code) {
        report.errors.push(error);
    }

    let analysis = analyzer::analyze(code);

    for banned in &analysis.banned {
        report.errors.push(
            ExecutionError::syntax(format!(
                "`{}` is not available inside the sandbox",
                banned.identifier
            ))
            .at(Some(banned.line), Some(banned.column)),
        );
        report.suggestions.push(format!(
            "Remove `{}`; pass data through params or host apis instead",
            banned.identifier
        ));
    }

    for call in &analysis.api_calls {
        let target = format!("{}.{}", call.namespace, call.method);
        if !proxy.is_known(&call.namespace, &call.method) {
            report.warnings.push(
                Warning::new(format!("api.{} is not provided by the host", target))
                    .at(call.line, call.column),
            );
        } else if !proxy.is_permitted(&call.namespace, &call.method) {
            report.warnings.push(
                Warning::new(format!(
                    "api.{} is not permitted in this sandbox and will fail with a permission error",
                    target
                ))
                .at(call.line, call.column),
            );
            let suggestion = if config.apis.contains(&call.namespace) {
                format!("Grant the \"{}\" permission", target)
            } else {
                format!(
                    "Add \"{}\" to apis and grant the \"{}\" permission",
                    call.namespace, target
                )
            };
            if !report.suggestions.contains(&suggestion) {
                report.suggestions.push(suggestion);
            }
        }
    }

    for unbounded in &analysis.unbounded_loops {
        report.warnings.push(
            Warning::new(format!(
                "loop has no break and will run until the {} ms timeout",
                config.timeout_ms
            ))
            .at(unbounded.line, unbounded.column),
        );
        report
            .suggestions
            .push("Add a break condition so the loop can finish on its own".to_string());
    }

    report.valid = report.errors.is_empty();
    report
}
