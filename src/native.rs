use crate::engine::{AbortSignal, HostLink, Isolate, IsolateCapabilities, IsolateJob, IsolateReport};
use crate::runtime::{self, Bridge, BridgeFault, ScriptRequest};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// Stack for evaluation threads; recursion depth is capped separately.
const EVAL_THREAD_STACK: usize = 8 * 1024 * 1024;

/// In-process isolate: every execution gets its own OS thread.
///
/// The async runtime never runs script code. On timeout or cancel the
/// supervisor raises the abort flag, which the interpreter polls on every
/// operation, so the thread stops even inside a tight loop.
#[derive(Debug, Default)]
pub struct NativeIsolate;

impl NativeIsolate {
    pub fn new() -> Self {
        Self
    }
}

struct LocalBridge {
    link: HostLink,
}

impl Bridge for LocalBridge {
    fn invoke(&self, namespace: &str, method: &str, args: Vec<Value>) -> Result<Value, BridgeFault> {
        self.link.call(namespace, method, args)
    }

    fn print(&self, text: &str) {
        self.link.print(text);
    }
}

#[async_trait]
impl Isolate for NativeIsolate {
    async fn run(
        &self,
        job: IsolateJob,
        link: HostLink,
        signal: Arc<AbortSignal>,
    ) -> IsolateReport {
        let interrupt = signal.flag();
        let short_id: String = job.execution_id.chars().take(8).collect();
        let thread_name = format!("sandbox-eval-{}", short_id);
        let (tx, rx) = oneshot::channel();

        let spawned = std::thread::Builder::new()
            .name(thread_name)
            .stack_size(EVAL_THREAD_STACK)
            .spawn(move || {
                let bridge: Arc<dyn Bridge> = Arc::new(LocalBridge { link });
                let outcome = runtime::run_script(
                    ScriptRequest {
                        code: &job.code,
                        params: &job.params,
                        methods: &job.methods,
                        limits: &job.limits,
                    },
                    bridge,
                    Some(interrupt),
                );
                if tx.send(outcome).is_err() {
                    debug!(
                        execution_id = %job.execution_id,
                        "[SANDBOX] Supervisor gone before evaluation finished"
                    );
                }
            });

        if let Err(e) = spawned {
            return IsolateReport::crashed(format!("failed to spawn evaluation thread: {}", e));
        }

        match rx.await {
            Ok(outcome) => IsolateReport::new(outcome),
            Err(_) => IsolateReport::crashed("evaluation thread panicked"),
        }
    }

    fn capabilities(&self) -> IsolateCapabilities {
        IsolateCapabilities {
            name: "In-process thread".to_string(),
            hard_cancel: true,
            os_memory_ceiling: false,
            security_level: 6, // interpreter sandbox, shared address space
        }
    }
}
