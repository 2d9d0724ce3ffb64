//! Process executor
//!
//! Runs one external command per pipeline stage, streams its output into the
//! deployment log and keeps the child reachable for cancellation.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::deploy::fsm::DeploymentState;
use crate::deploy::recorder::Recorder;
use crate::errors::DeployerError;
use crate::models::deployment::{DeploymentLog, LogSeverity, LogSource};

/// How long to wait for output readers once the child has exited
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shorter drain after a kill, when grandchildren may still hold the pipes
const KILLED_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// A running child registered for a deployment
#[derive(Debug)]
struct TrackedProcess {
    token: u64,
    command: String,
    pid: Option<u32>,
    kill_tx: oneshot::Sender<()>,
}

/// Snapshot of a tracked process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub command: String,
    pub pid: Option<u32>,
}

/// The active child process of each deployment
#[derive(Debug, Default)]
pub struct ProcessTable {
    processes: Mutex<HashMap<String, TrackedProcess>>,
    next_token: AtomicU64,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a child, replacing any previous entry for the deployment
    fn register(
        &self,
        deployment_id: &str,
        command: String,
        pid: Option<u32>,
        kill_tx: oneshot::Sender<()>,
    ) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut processes = self.processes.lock().unwrap_or_else(|e| e.into_inner());
        processes.insert(
            deployment_id.to_string(),
            TrackedProcess {
                token,
                command,
                pid,
                kill_tx,
            },
        );
        token
    }

    /// Remove an entry if it still belongs to the registration `token`
    fn deregister(&self, deployment_id: &str, token: u64) {
        let mut processes = self.processes.lock().unwrap_or_else(|e| e.into_inner());
        if processes.get(deployment_id).map(|p| p.token) == Some(token) {
            processes.remove(deployment_id);
        }
    }

    /// Signal the tracked process of a deployment and stop tracking it.
    ///
    /// Returns false if no process was tracked.
    pub fn kill(&self, deployment_id: &str) -> bool {
        let tracked = {
            let mut processes = self.processes.lock().unwrap_or_else(|e| e.into_inner());
            processes.remove(deployment_id)
        };

        match tracked {
            Some(process) => {
                info!(
                    deployment_id,
                    command = %process.command,
                    pid = ?process.pid,
                    "Terminating process"
                );
                let _ = process.kill_tx.send(());
                true
            }
            None => false,
        }
    }

    pub fn get(&self, deployment_id: &str) -> Option<ProcessInfo> {
        let processes = self.processes.lock().unwrap_or_else(|e| e.into_inner());
        processes.get(deployment_id).map(|p| ProcessInfo {
            command: p.command.clone(),
            pid: p.pid,
        })
    }

    pub fn is_tracked(&self, deployment_id: &str) -> bool {
        let processes = self.processes.lock().unwrap_or_else(|e| e.into_inner());
        processes.contains_key(deployment_id)
    }

    pub fn len(&self) -> usize {
        let processes = self.processes.lock().unwrap_or_else(|e| e.into_inner());
        processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Deregisters a child when the stage finishes or its future is dropped
struct Registration<'a> {
    table: &'a ProcessTable,
    deployment_id: &'a str,
    token: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.table.deregister(self.deployment_id, self.token);
    }
}

/// Spawns and supervises stage processes
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    recorder: Recorder,
    processes: std::sync::Arc<ProcessTable>,
}

impl ProcessExecutor {
    pub fn new(recorder: Recorder, processes: std::sync::Arc<ProcessTable>) -> Self {
        Self {
            recorder,
            processes,
        }
    }

    pub fn processes(&self) -> &std::sync::Arc<ProcessTable> {
        &self.processes
    }

    /// Run `program` with `args` in `cwd` and wait for it to exit.
    ///
    /// stdout lines are logged as `info`, stderr lines as `warn`; only the
    /// exit code decides success.
    pub async fn run(
        &self,
        deployment_id: &str,
        program: &str,
        args: &[String],
        cwd: &Path,
        envs: &HashMap<String, String>,
    ) -> Result<(), DeployerError> {
        let command_line = std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");

        debug!(deployment_id, command = %command_line, cwd = %cwd.display(), "Spawning process");

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(cwd)
            .envs(envs)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a kill also reaches the command's children
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| DeployerError::ProcessError {
            command: command_line.clone(),
            reason: format!("failed to start: {}", e),
        })?;
        let mut group = ProcessGroup { pid: child.id() };

        let (kill_tx, mut kill_rx) = oneshot::channel();
        let token = self
            .processes
            .register(deployment_id, command_line.clone(), child.id(), kill_tx);
        let _registration = Registration {
            table: &self.processes,
            deployment_id,
            token,
        };

        let stdout_task = child
            .stdout
            .take()
            .map(|out| self.spawn_reader(deployment_id, out, LogSeverity::Info));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| self.spawn_reader(deployment_id, err, LogSeverity::Warn));

        // A cancel that landed before registration found nothing to kill
        let cancelled = self.recorder.store().state(deployment_id) == Some(DeploymentState::Cancelled);

        let exited = if cancelled {
            None
        } else {
            tokio::select! {
                status = child.wait() => Some(status),
                Ok(()) = &mut kill_rx => None,
            }
        };

        let (status, killed) = match exited {
            Some(status) => {
                group.release();
                (status?, false)
            }
            None => {
                debug!(deployment_id, command = %command_line, "Kill requested");
                group.kill();
                let _ = child.start_kill();
                (child.wait().await?, true)
            }
        };

        let drain = if killed {
            KILLED_DRAIN_TIMEOUT
        } else {
            DRAIN_TIMEOUT
        };
        for task in [stdout_task, stderr_task].into_iter().flatten() {
            drain_reader(task, drain).await;
        }

        if killed {
            return Err(DeployerError::Cancelled(deployment_id.to_string()));
        }

        match status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(DeployerError::exit_code(command_line, code)),
            None => Err(DeployerError::ProcessError {
                command: command_line,
                reason: "terminated by signal".to_string(),
            }),
        }
    }

    fn spawn_reader<R>(&self, deployment_id: &str, reader: R, level: LogSeverity) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let recorder = self.recorder.clone();
        let deployment_id = deployment_id.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        let line = line.trim_end();
                        if !line.is_empty() {
                            recorder.log(
                                &deployment_id,
                                DeploymentLog::new(level, LogSource::Build, line),
                            );
                        }
                    }
                    Err(e) => {
                        warn!(deployment_id = %deployment_id, "Output read error: {}", e);
                        break;
                    }
                }
            }
        })
    }
}

/// Process group led by a spawned child, killed unless released after a
/// normal exit. Dropping a running stage kills the whole group.
struct ProcessGroup {
    pid: Option<u32>,
}

impl ProcessGroup {
    fn kill(&mut self) {
        if let Some(pid) = self.pid.take() {
            signal_group(pid);
        }
    }

    fn release(&mut self) {
        self.pid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn signal_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) only sends a signal; a negative pid addresses the group.
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32) {}

async fn drain_reader(task: JoinHandle<()>, limit: Duration) {
    let abort = task.abort_handle();
    if tokio::time::timeout(limit, task).await.is_err() {
        debug!("Output reader still open after {:?}, aborting", limit);
        abort.abort();
    }
}
