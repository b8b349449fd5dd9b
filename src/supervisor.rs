use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio::time::{sleep, timeout, Instant};
use tracing::{error, info, warn};

use crate::config::{Settings, LOG_CAPACITY};
use crate::guardian::GuardianState;
use crate::launcher::{exit_info, kill_group, Launcher};
use crate::registry::{ExitInfo, LiveEntry, LogBuffer, LogSnapshot, Registry, RunStatus};
use crate::store::TaskStore;
use crate::task::{now_rfc3339, Task};

const DRAIN_GRACE_MS: u64 = 120;
const REPLACE_WAIT_MS: u64 = 1500;
const SHUTDOWN_WAIT_MS: u64 = 3000;

#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub id: String,
    pub start_command: String,
    pub working_directory: Option<String>,
    pub environment_variables: HashMap<String, String>,
    pub startup_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct StopRequest {
    pub id: String,
    pub stop_command: Option<String>,
    pub working_directory: Option<String>,
    pub environment_variables: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct RestartRequest {
    pub id: String,
    pub start_command: Option<String>,
    pub stop_command: Option<String>,
    pub working_directory: Option<String>,
    pub environment_variables: HashMap<String, String>,
    pub startup_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartSource {
    User,
    Guardian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Validation,
    Runtime,
}

#[derive(Debug)]
pub struct StartFailure {
    pub kind: FailureKind,
    pub error: String,
    pub code: Option<i32>,
    pub signal: Option<String>,
    pub logs: LogSnapshot,
}

impl StartFailure {
    fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Validation,
            error: message.into(),
            code: None,
            signal: None,
            logs: LogSnapshot::default(),
        }
    }

    fn runtime(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Runtime,
            error: message.into(),
            code: None,
            signal: None,
            logs: LogSnapshot::default(),
        }
    }
}

#[derive(Debug)]
pub enum StopOutcome {
    /// A live child was signalled and the entry flipped to stopped.
    Stopped,
    /// No live child and no stop command; nothing to do.
    NotRunning,
    /// The fallback stop command ran and exited cleanly.
    StopCommand {
        code: Option<i32>,
        logs: LogSnapshot,
    },
}

#[derive(Debug)]
pub struct StopFailure {
    pub error: String,
    pub logs: LogSnapshot,
}

/// Orchestrates the per-task lifecycle: spawn with a bounded startup
/// validation window, output capture into the registry's ring buffers, group
/// termination with a stop-command fallback, and the shutdown sweep.
pub struct Supervisor {
    settings: Settings,
    launcher: Launcher,
    store: Arc<TaskStore>,
    registry: Arc<Registry>,
    guardian: Arc<GuardianState>,
    op_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Supervisor {
    pub fn new(
        settings: Settings,
        store: Arc<TaskStore>,
        registry: Arc<Registry>,
        guardian: Arc<GuardianState>,
    ) -> Self {
        let launcher = Launcher::new(settings.login_shell);
        Self {
            settings,
            launcher,
            store,
            registry,
            guardian,
            op_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Start/stop/restart for one id serialize on this lock; distinct ids
    /// proceed in parallel.
    async fn op_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.op_locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn start(
        &self,
        req: StartRequest,
        source: StartSource,
    ) -> Result<i32, StartFailure> {
        let lock = self.op_lock(&req.id).await;
        let _guard = lock.lock().await;
        self.start_locked(req, source).await
    }

    async fn start_locked(
        &self,
        req: StartRequest,
        source: StartSource,
    ) -> Result<i32, StartFailure> {
        if req.id.trim().is_empty() {
            return Err(StartFailure::validation("id is required"));
        }
        if req.start_command.trim().is_empty() {
            return Err(StartFailure::validation("start_command is required"));
        }

        // A start on an already-running task replaces the previous child.
        if let Some(old_pid) = self.registry.running_pid(&req.id).await {
            if let Err(e) = kill_group(old_pid, "TERM") {
                warn!(id = %req.id, pid = old_pid, "failed to terminate previous child: {e}");
            }
            self.wait_until_stopped(&req.id, Duration::from_millis(REPLACE_WAIT_MS))
                .await;
        }

        let cwd = self.settings.resolve_workdir(req.working_directory.as_deref());
        let window = Duration::from_millis(
            req.startup_timeout_ms
                .unwrap_or(self.settings.startup_timeout_ms),
        );

        let mut command = self
            .launcher
            .command(&req.start_command, &cwd, &req.environment_variables);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(id = %req.id, "spawn failed: {e}");
                return Err(StartFailure::runtime(format!("spawn failed: {e}")));
            }
        };

        let pid = child.id().map(|p| p as i32).unwrap_or(0);
        let generation = self.registry.next_generation();
        let stdout_buf = Arc::new(Mutex::new(LogBuffer::new(LOG_CAPACITY)));
        let stderr_buf = Arc::new(Mutex::new(LogBuffer::new(LOG_CAPACITY)));

        self.registry
            .insert(
                &req.id,
                LiveEntry {
                    generation,
                    pid,
                    command: req.start_command.clone(),
                    cwd: cwd.clone(),
                    status: RunStatus::Running,
                    started_at: now_rfc3339(),
                    exit: None,
                    stdout: stdout_buf.clone(),
                    stderr: stderr_buf.clone(),
                },
            )
            .await;

        if let Some(out) = child.stdout.take() {
            tokio::spawn(drain_lines(out, stdout_buf.clone()));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(drain_lines(err, stderr_buf.clone()));
        }

        // The driver owns the child: it waits for exit, records it in the
        // registry (guarded by the generation), and wakes the startup window.
        let (exit_tx, exit_rx) = oneshot::channel();
        {
            let registry = self.registry.clone();
            let id = req.id.clone();
            tokio::spawn(async move {
                let exit = match child.wait().await {
                    Ok(status) => {
                        let (code, signal) = exit_info(&status);
                        ExitInfo { code, signal }
                    }
                    Err(e) => {
                        warn!(id = %id, "wait on child failed: {e}");
                        ExitInfo {
                            code: None,
                            signal: None,
                        }
                    }
                };
                registry.mark_exited(&id, generation, exit.clone()).await;
                let _ = exit_tx.send(exit);
            });
        }

        let outcome = match timeout(window, exit_rx).await {
            Err(_) => {
                // Window elapsed with the child still alive: success.
                info!(id = %req.id, pid, "task started");
                Ok(pid)
            }
            Ok(Ok(exit)) => {
                sleep(Duration::from_millis(DRAIN_GRACE_MS)).await;
                let logs = self.registry.logs(&req.id).await;
                Err(StartFailure {
                    kind: FailureKind::Runtime,
                    error: match (exit.code, &exit.signal) {
                        (Some(code), _) => {
                            format!("command exited with code {code} during startup window")
                        }
                        (None, Some(signal)) => {
                            format!("command was killed by SIG{signal} during startup window")
                        }
                        (None, None) => "command exited during startup window".to_string(),
                    },
                    code: exit.code,
                    signal: exit.signal,
                    logs,
                })
            }
            Ok(Err(_)) => {
                let logs = self.registry.logs(&req.id).await;
                let mut failure =
                    StartFailure::runtime("child monitor terminated unexpectedly");
                failure.logs = logs;
                Err(failure)
            }
        };

        if source == StartSource::User {
            // One store write per user action: the attempt flips the guardian
            // eligibility flags either way, a survived window also resets the
            // counter and stamps the start.
            let started = outcome.is_ok();
            let booked = self.store.update_flags(&req.id, |task: &mut Task| {
                task.was_running_before_shutdown = true;
                task.manual_stopped = false;
                if started {
                    task.restart_count = 0;
                    task.last_started = Some(now_rfc3339());
                }
            });
            if let Err(e) = booked {
                warn!(id = %req.id, "store bookkeeping after start failed: {e}");
            }
            self.guardian.clear(&req.id);
        }

        outcome
    }

    pub async fn stop(&self, req: StopRequest) -> Result<StopOutcome, StopFailure> {
        let lock = self.op_lock(&req.id).await;
        let _guard = lock.lock().await;
        let outcome = self.stop_locked(&req).await;
        if outcome.is_ok() {
            let booked = self.store.update_flags(&req.id, |task: &mut Task| {
                task.manual_stopped = true;
            });
            if let Err(e) = booked {
                warn!(id = %req.id, "store bookkeeping after stop failed: {e}");
            }
            self.guardian.clear(&req.id);
        }
        outcome
    }

    async fn stop_locked(&self, req: &StopRequest) -> Result<StopOutcome, StopFailure> {
        if req.id.trim().is_empty() {
            return Err(StopFailure {
                error: "id is required".to_string(),
                logs: LogSnapshot::default(),
            });
        }

        if let Some(pid) = self.registry.running_pid(&req.id).await {
            match kill_group(pid, "TERM") {
                Ok(()) => {
                    self.registry.mark_stopped(&req.id).await;
                    info!(id = %req.id, pid, "task stopped");
                    return Ok(StopOutcome::Stopped);
                }
                Err(e) => {
                    warn!(id = %req.id, pid, "tree kill failed, falling back to stop_command: {e}");
                }
            }
        }

        match req.stop_command.as_deref() {
            Some(command) if !command.trim().is_empty() => {
                self.run_stop_command(req, command).await
            }
            _ => Ok(StopOutcome::NotRunning),
        }
    }

    async fn run_stop_command(
        &self,
        req: &StopRequest,
        command: &str,
    ) -> Result<StopOutcome, StopFailure> {
        let cwd = self.settings.resolve_workdir(req.working_directory.as_deref());
        let mut cmd = self
            .launcher
            .command(command, &cwd, &req.environment_variables);
        let output = match cmd.output().await {
            Ok(output) => output,
            Err(e) => {
                return Err(StopFailure {
                    error: format!("stop command failed to spawn: {e}"),
                    logs: LogSnapshot::default(),
                });
            }
        };
        let logs = LogSnapshot {
            stdout: lines_of(&output.stdout),
            stderr: lines_of(&output.stderr),
        };
        if output.status.success() {
            self.registry.mark_stopped(&req.id).await;
            Ok(StopOutcome::StopCommand {
                code: output.status.code(),
                logs,
            })
        } else {
            Err(StopFailure {
                error: format!(
                    "stop command exited with code {:?}",
                    output.status.code()
                ),
                logs,
            })
        }
    }

    pub async fn restart(&self, req: RestartRequest) -> Result<i32, StartFailure> {
        let lock = self.op_lock(&req.id).await;
        let _guard = lock.lock().await;

        if req.id.trim().is_empty() {
            return Err(StartFailure::validation("id is required"));
        }
        let command = match req
            .start_command
            .clone()
            .filter(|c| !c.trim().is_empty())
        {
            Some(command) => Some(command),
            None => self.registry.command_of(&req.id).await,
        };
        let Some(command) = command else {
            return Err(StartFailure::validation(
                "start_command is required and no previous command is known",
            ));
        };

        // Internal stop: a restart is not a manual stop, so the store flags
        // and guardian state stay in the start path's hands.
        let stop_req = StopRequest {
            id: req.id.clone(),
            stop_command: req.stop_command.clone(),
            working_directory: req.working_directory.clone(),
            environment_variables: req.environment_variables.clone(),
        };
        if let Err(e) = self.stop_locked(&stop_req).await {
            warn!(id = %req.id, "stop before restart failed: {}", e.error);
        }
        self.wait_until_stopped(&req.id, Duration::from_millis(REPLACE_WAIT_MS))
            .await;

        self.start_locked(
            StartRequest {
                id: req.id.clone(),
                start_command: command,
                working_directory: req.working_directory.clone(),
                environment_variables: req.environment_variables.clone(),
                startup_timeout_ms: req.startup_timeout_ms,
            },
            StartSource::User,
        )
        .await
    }

    pub async fn logs(&self, id: &str) -> LogSnapshot {
        self.registry.logs(id).await
    }

    pub async fn clear_logs(&self, id: &str) {
        self.registry.clear_logs(id).await;
    }

    /// Terminate every live child on server shutdown and wait, bounded, for
    /// the drivers to observe the exits.
    pub async fn shutdown_all(&self) {
        let running = self.registry.running_ids().await;
        for (id, pid) in &running {
            info!(id = %id, pid, "terminating on shutdown");
            if let Err(e) = kill_group(*pid, "TERM") {
                warn!(id = %id, pid, "shutdown kill failed: {e}");
            }
        }
        let deadline = Instant::now() + Duration::from_millis(SHUTDOWN_WAIT_MS);
        while Instant::now() < deadline {
            if self.registry.running_ids().await.is_empty() {
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    async fn wait_until_stopped(&self, id: &str, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !self.registry.is_running(id).await {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    }
}

async fn drain_lines<R>(reader: R, buffer: Arc<Mutex<LogBuffer>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        buffer.lock().await.push(line);
    }
}

fn lines_of(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::to_string)
        .collect()
}
