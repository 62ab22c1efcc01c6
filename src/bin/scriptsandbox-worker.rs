//! Worker process for `IsolationMode::Process`.
//!
//! Reads one `run` request from stdin, evaluates it, and forwards host calls
//! and printed output to the supervisor over stdout. Logs go to stderr.

use anyhow::{bail, Context};
use parking_lot::Mutex;
use scriptsandbox::protocol::{self, CallReply, HostMessage, WorkerMessage};
use scriptsandbox::runtime::{self, Bridge, BridgeFault, ScriptRequest};
use scriptsandbox::sandboxed::WORKER_LOG_ENV;
use scriptsandbox::ResourceMonitor;
use serde_json::Value;
use std::io::{self, BufRead, BufReader, Stdin, Stdout, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

struct StdioBridge {
    input: Mutex<BufReader<Stdin>>,
    output: Mutex<Stdout>,
    next_id: AtomicU64,
}

impl StdioBridge {
    fn new() -> Self {
        Self {
            input: Mutex::new(BufReader::new(io::stdin())),
            output: Mutex::new(io::stdout()),
            next_id: AtomicU64::new(1),
        }
    }

    fn send(&self, message: &WorkerMessage) -> anyhow::Result<()> {
        let line = protocol::encode(message)?;
        let mut out = self.output.lock();
        out.write_all(line.as_bytes())?;
        out.flush()?;
        Ok(())
    }

    fn read_message(&self) -> anyhow::Result<HostMessage> {
        let mut line = String::new();
        if self.input.lock().read_line(&mut line)? == 0 {
            bail!("supervisor closed the channel");
        }
        Ok(protocol::decode(&line)?)
    }

    fn round_trip(
        &self,
        namespace: &str,
        method: &str,
        args: Vec<Value>,
    ) -> anyhow::Result<CallReply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.send(&WorkerMessage::Call {
            id,
            namespace: namespace.to_string(),
            method: method.to_string(),
            args,
        })?;
        match self.read_message()? {
            HostMessage::Reply { id: got, reply } if got == id => Ok(reply),
            HostMessage::Reply { id: got, .. } => {
                bail!("reply for call {} while waiting for {}", got, id)
            }
            HostMessage::Run { .. } => bail!("unexpected run request during a call"),
        }
    }
}

impl Bridge for StdioBridge {
    fn invoke(&self, namespace: &str, method: &str, args: Vec<Value>) -> Result<Value, BridgeFault> {
        match self.round_trip(namespace, method, args) {
            Ok(reply) => reply.into_result(),
            Err(e) => {
                warn!("host call {}.{} failed: {:#}", namespace, method, e);
                Err(BridgeFault::Host(format!("host channel failure: {}", e)))
            }
        }
    }

    fn print(&self, text: &str) {
        if let Err(e) = self.send(&WorkerMessage::Print {
            text: text.to_string(),
        }) {
            warn!("dropping output: {:#}", e);
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(WORKER_LOG_ENV)
                .unwrap_or_else(|_| EnvFilter::new("scriptsandbox=warn")),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let bridge = Arc::new(StdioBridge::new());
    let (execution_id, code, params, methods, limits) = match bridge
        .read_message()
        .context("reading run request")?
    {
        HostMessage::Run {
            execution_id,
            code,
            params,
            methods,
            limits,
        } => (execution_id, code, params, methods, limits),
        HostMessage::Reply { id, .. } => bail!("expected a run request, got reply {}", id),
    };
    debug!(execution_id = %execution_id, "worker evaluating script");

    let baseline_kb = ResourceMonitor::peak_memory_kb();
    let outcome = runtime::run_script(
        ScriptRequest {
            code: &code,
            params: &params,
            methods: &methods,
            limits: &limits,
        },
        Arc::clone(&bridge) as Arc<dyn Bridge>,
        None,
    );
    let peak_memory_kb = match (baseline_kb, ResourceMonitor::peak_memory_kb()) {
        (Some(before), Some(after)) => Some(after.saturating_sub(before)),
        _ => None,
    };

    bridge
        .send(&WorkerMessage::Done {
            outcome,
            peak_memory_kb,
        })
        .context("sending result")?;
    Ok(())
}
