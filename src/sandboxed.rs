use crate::config::SandboxConfig;
use crate::engine::{AbortSignal, HostLink, Isolate, IsolateCapabilities, IsolateJob, IsolateReport};
use crate::errors::{Result, SandboxError};
use crate::protocol::{self, CallReply, HostMessage, WorkerMessage};
use crate::result::ExecutionError;
use crate::runtime::ScriptOutcome;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};

/// File name of the worker binary.
pub const WORKER_BINARY: &str = "scriptsandbox-worker";
/// Environment variable naming an explicit worker binary.
pub const WORKER_PATH_ENV: &str = "SCRIPTSANDBOX_WORKER";
/// Environment variable forwarded to the worker as its log filter.
pub const WORKER_LOG_ENV: &str = "SCRIPTSANDBOX_LOG";

/// Address space the worker needs on top of the script's own budget
/// (interpreter, allocator arenas, thread stack).
const WORKER_BASELINE_MB: u64 = 256;
/// Worker stderr kept for diagnostics; the rest is drained and dropped.
const STDERR_CAPTURE_BYTES: u64 = 16 * 1024;
/// How long a finished worker gets to exit before it is killed.
const REAP_GRACE: Duration = Duration::from_millis(500);

/// Out-of-process isolate: one `scriptsandbox-worker` process per execution.
///
/// The worker runs in its own process group under `RLIMIT_AS`, `RLIMIT_CPU`
/// and `RLIMIT_CORE`, with a cleared environment. Host calls come back over
/// stdout and are answered on stdin, so permission checks and host objects
/// never leave this process. On timeout or cancel the whole process group
/// is killed.
pub struct ProcessIsolate {
    program: PathBuf,
    memory_limit_mb: u64,
    timeout_ms: u64,
}

impl ProcessIsolate {
    pub fn new(program: PathBuf, config: &SandboxConfig) -> Result<Self> {
        if !program.exists() {
            return Err(SandboxError::WorkerNotFound);
        }
        Ok(Self {
            program,
            memory_limit_mb: config.memory_limit_mb,
            timeout_ms: config.timeout_ms,
        })
    }

    /// Find the worker binary: explicit path, then `$SCRIPTSANDBOX_WORKER`,
    /// then next to the current executable, then `PATH`.
    pub fn locate(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return if path.exists() {
                Ok(path.to_path_buf())
            } else {
                Err(SandboxError::WorkerNotFound)
            };
        }

        if let Some(path) = std::env::var_os(WORKER_PATH_ENV).map(PathBuf::from) {
            if path.exists() {
                return Ok(path);
            }
            warn!(path = %path.display(), "{} points at a missing file", WORKER_PATH_ENV);
        }

        let file_name = format!("{}{}", WORKER_BINARY, std::env::consts::EXE_SUFFIX);
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                for candidate in [dir.join(&file_name), dir.join("..").join(&file_name)] {
                    if candidate.exists() {
                        return Ok(candidate);
                    }
                }
            }
        }

        which::which(WORKER_BINARY).map_err(|_| SandboxError::WorkerNotFound)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Apply resource limits to the command
    #[cfg(unix)]
    fn apply_resource_limits(&self, cmd: &mut Command) {
        let cpu_seconds = self.timeout_ms.div_ceil(1000) + 1;
        #[cfg(not(target_os = "macos"))]
        let memory_bytes = (self.memory_limit_mb + WORKER_BASELINE_MB) * 1024 * 1024;

        unsafe {
            cmd.pre_exec(move || {
                // Own process group so a timeout can kill everything at once
                libc::setpgid(0, 0);

                // macOS doesn't enforce RLIMIT_AS
                #[cfg(not(target_os = "macos"))]
                {
                    let rlimit = libc::rlimit {
                        rlim_cur: memory_bytes as libc::rlim_t,
                        rlim_max: memory_bytes as libc::rlim_t,
                    };
                    if libc::setrlimit(libc::RLIMIT_AS, &rlimit) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }

                let rlimit = libc::rlimit {
                    rlim_cur: cpu_seconds as libc::rlim_t,
                    rlim_max: cpu_seconds as libc::rlim_t,
                };
                if libc::setrlimit(libc::RLIMIT_CPU, &rlimit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }

                // An allocation failure aborts; don't leave core files behind
                let rlimit = libc::rlimit {
                    rlim_cur: 0,
                    rlim_max: 0,
                };
                if libc::setrlimit(libc::RLIMIT_CORE, &rlimit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
    }

    #[cfg(not(unix))]
    fn apply_resource_limits(&self, _cmd: &mut Command) {
        // Only the interpreter quotas apply here
    }

    fn spawn(&self) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .kill_on_drop(true);
        if let Ok(filter) = std::env::var(WORKER_LOG_ENV) {
            cmd.env(WORKER_LOG_ENV, filter);
        }
        self.apply_resource_limits(&mut cmd);
        cmd.spawn()
    }

    /// Kill the worker's process group, then reap it.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                let pgid = nix::unistd::Pid::from_raw(pid as i32);
                if let Err(e) = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL) {
                    debug!("killpg({}) failed: {}", pid, e);
                }
            }
        }
        if let Err(e) = child.kill().await {
            debug!("worker kill failed: {}", e);
        }
    }

    /// Classify a worker that went away without reporting an outcome.
    fn classify_exit(&self, status: Option<ExitStatus>, stderr: &str) -> ScriptOutcome {
        if stderr.contains("memory allocation of") || stderr.contains("out of memory") {
            return ScriptOutcome::failed(ExecutionError::memory(format!(
                "worker exceeded the {} MB memory ceiling",
                self.memory_limit_mb
            )));
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if status.and_then(|s| s.signal()) == Some(libc::SIGXCPU) {
                return ScriptOutcome::failed(ExecutionError::timeout(self.timeout_ms));
            }
        }

        let status = status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown status".to_string());
        let stderr = stderr.trim();
        ScriptOutcome::failed(ExecutionError::runtime(if stderr.is_empty() {
            format!("worker exited unexpectedly ({})", status)
        } else {
            format!("worker exited unexpectedly ({}): {}", status, stderr)
        }))
    }
}

async fn send(stdin: &mut ChildStdin, message: &HostMessage) -> Result<()> {
    let line = protocol::encode(message)?;
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

#[async_trait]
impl Isolate for ProcessIsolate {
    async fn run(
        &self,
        job: IsolateJob,
        link: HostLink,
        signal: std::sync::Arc<AbortSignal>,
    ) -> IsolateReport {
        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(e) => {
                return IsolateReport::crashed(format!(
                    "failed to spawn worker {}: {}",
                    self.program.display(),
                    e
                ))
            }
        };
        info!(
            execution_id = %job.execution_id,
            pid = ?child.id(),
            "[SANDBOX] Worker started"
        );

        let (Some(mut stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            self.terminate(&mut child).await;
            return IsolateReport::crashed("worker pipes unavailable");
        };

        let stderr_task = tokio::spawn(async move {
            let mut captured = String::new();
            let mut limited = stderr.take(STDERR_CAPTURE_BYTES);
            if let Err(e) = limited.read_to_string(&mut captured).await {
                debug!("worker stderr read failed: {}", e);
            }
            let _ = tokio::io::copy(&mut limited.into_inner(), &mut tokio::io::sink()).await;
            captured
        });

        let run = HostMessage::Run {
            execution_id: job.execution_id,
            code: job.code,
            params: job.params,
            methods: job.methods,
            limits: job.limits,
        };
        if let Err(e) = send(&mut stdin, &run).await {
            self.terminate(&mut child).await;
            return IsolateReport::crashed(format!("failed to send run request: {}", e));
        }

        let mut lines = BufReader::new(stdout).lines();
        let mut peak_memory_mb = None;
        let mut exited = false;

        let outcome = loop {
            tokio::select! {
                biased;
                _ = signal.aborted() => {
                    self.terminate(&mut child).await;
                    exited = true;
                    break ScriptOutcome::Aborted;
                }
                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) if line.trim().is_empty() => continue,
                        Ok(Some(line)) => line,
                        Ok(None) => {
                            let status = child.wait().await.ok();
                            exited = true;
                            let captured = stderr_task.await.unwrap_or_default();
                            break self.classify_exit(status, &captured);
                        }
                        Err(e) => {
                            self.terminate(&mut child).await;
                            exited = true;
                            break ScriptOutcome::crashed(format!("worker stdout failed: {}", e));
                        }
                    };

                    match protocol::decode::<WorkerMessage>(&line) {
                        Ok(WorkerMessage::Print { text }) => link.print(&text),
                        Ok(WorkerMessage::Call { id, namespace, method, args }) => {
                            let reply = CallReply::from(link.call(&namespace, &method, args));
                            if let Err(e) = send(&mut stdin, &HostMessage::Reply { id, reply }).await {
                                self.terminate(&mut child).await;
                                exited = true;
                                break ScriptOutcome::crashed(format!("failed to answer worker: {}", e));
                            }
                        }
                        Ok(WorkerMessage::Done { outcome, peak_memory_kb }) => {
                            peak_memory_mb = peak_memory_kb.map(|kb| kb as f64 / 1024.0);
                            break outcome;
                        }
                        Err(e) => {
                            self.terminate(&mut child).await;
                            exited = true;
                            break ScriptOutcome::crashed(e.to_string());
                        }
                    }
                }
            }
        };

        drop(stdin);
        if !exited {
            match tokio::time::timeout(REAP_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!("worker exited with {}", status),
                _ => self.terminate(&mut child).await,
            }
        }

        IsolateReport {
            outcome,
            peak_memory_mb,
        }
    }

    fn capabilities(&self) -> IsolateCapabilities {
        IsolateCapabilities {
            name: "Worker process".to_string(),
            hard_cancel: true,
            os_memory_ceiling: cfg!(all(unix, not(target_os = "macos"))),
            security_level: 8, // separate address space + rlimits
        }
    }
}
