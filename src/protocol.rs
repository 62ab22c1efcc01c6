//! JSON-lines protocol between the supervisor and `scriptsandbox-worker`.
//!
//! The supervisor writes one `run` request, then answers the worker's `call`
//! messages with `reply` messages until the worker sends `done`. Each
//! message is a single line of JSON.

use crate::capability::PermissionDenied;
use crate::errors::{Result, SandboxError};
use crate::runtime::{BridgeFault, ScriptLimits, ScriptOutcome};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Supervisor to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    Run {
        execution_id: String,
        code: String,
        params: Value,
        methods: Vec<String>,
        limits: ScriptLimits,
    },
    Reply {
        id: u64,
        reply: CallReply,
    },
}

/// Worker to supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Call {
        id: u64,
        namespace: String,
        method: String,
        args: Vec<Value>,
    },
    Print {
        text: String,
    },
    Done {
        outcome: ScriptOutcome,
        peak_memory_kb: Option<u64>,
    },
}

/// Result of a forwarded host call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallReply {
    Ok { value: Value },
    Denied { namespace: String, method: String },
    Failed { message: String },
}

impl From<std::result::Result<Value, BridgeFault>> for CallReply {
    fn from(result: std::result::Result<Value, BridgeFault>) -> Self {
        match result {
            Ok(value) => CallReply::Ok { value },
            Err(BridgeFault::Denied(denied)) => CallReply::Denied {
                namespace: denied.namespace,
                method: denied.method,
            },
            Err(BridgeFault::Host(message)) => CallReply::Failed { message },
        }
    }
}

impl CallReply {
    pub fn into_result(self) -> std::result::Result<Value, BridgeFault> {
        match self {
            CallReply::Ok { value } => Ok(value),
            CallReply::Denied { namespace, method } => {
                Err(BridgeFault::Denied(PermissionDenied { namespace, method }))
            }
            CallReply::Failed { message } => Err(BridgeFault::Host(message)),
        }
    }
}

/// Serialize a message as one protocol line, newline included.
pub fn encode<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parse one protocol line.
pub fn decode<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T> {
    serde_json::from_str(line.trim())
        .map_err(|e| SandboxError::Protocol(format!("{} in {:?}", e, truncate(line, 120))))
}

fn truncate(line: &str, max: usize) -> &str {
    if line.len() <= max {
        return line;
    }
    let mut end = max;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}
