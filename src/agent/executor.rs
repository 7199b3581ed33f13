use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::scheduler::task::TaskPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
    /// Killed at the assignment deadline
    TimedOut,
    /// Killed on server request or agent shutdown
    Cancelled,
}

/// Result of one attempt on this agent
#[derive(Debug)]
pub struct ExecutionResult {
    pub task_id: Uuid,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    /// Tail of combined stdout and stderr
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn failed(task_id: Uuid, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            task_id,
            status: ExecutionStatus::Failed,
            exit_code: None,
            output: None,
            error: Some(error.into()),
            duration,
        }
    }
}

/// Runs task payloads as child processes.
///
/// A payload without arguments is a shell line run through `<shell> -c`;
/// with arguments, `command` is executed directly. Each task runs in its
/// own process group, and the whole group is killed when the deadline
/// passes or the cancel token fires. Only the last `max_output_bytes` of
/// each output stream are held in memory.
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    config: ExecutorConfig,
}

impl TaskExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub async fn execute(
        &self,
        task_id: Uuid,
        payload: &TaskPayload,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        tracing::info!(task_id = %task_id, command = %payload.command, "Executing task");
        let started = Instant::now();

        let mut command = if payload.args.is_empty() {
            let mut command = Command::new(&self.config.shell);
            command.arg("-c").arg(&payload.command);
            command
        } else {
            let mut command = Command::new(&payload.command);
            command.args(&payload.args);
            command
        };
        command
            .envs(&payload.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a kill reaches everything the task started
        #[cfg(unix)]
        command.process_group(0);
        if let Some(dir) = &self.config.work_dir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "Failed to spawn task");
                return ExecutionResult::failed(task_id, format!("spawn failed: {}", e), started.elapsed());
            }
        };
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let max_bytes = self.config.max_output_bytes;

        let stop = tokio::select! {
            finished = async {
                let (stdout, stderr, status) =
                    tokio::join!(read_tail(stdout, max_bytes), read_tail(stderr, max_bytes), child.wait());
                Ok::<_, std::io::Error>((status?, stdout?, stderr?))
            } => Stop::Exited(finished),
            _ = tokio::time::sleep(timeout) => Stop::TimedOut,
            _ = cancel.cancelled() => Stop::Cancelled,
        };

        match stop {
            Stop::Exited(finished) => self.process_output(task_id, finished, started.elapsed()),
            Stop::TimedOut => {
                kill_process_tree(task_id, &mut child).await;
                tracing::warn!(task_id = %task_id, timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX), "Task deadline passed, killed");
                ExecutionResult {
                    task_id,
                    status: ExecutionStatus::TimedOut,
                    exit_code: None,
                    output: None,
                    error: Some(format!("killed after {}ms", timeout.as_millis())),
                    duration: started.elapsed(),
                }
            }
            Stop::Cancelled => {
                kill_process_tree(task_id, &mut child).await;
                tracing::info!(task_id = %task_id, "Task cancelled, killed");
                ExecutionResult {
                    task_id,
                    status: ExecutionStatus::Cancelled,
                    exit_code: None,
                    output: None,
                    error: Some("cancelled".to_string()),
                    duration: started.elapsed(),
                }
            }
        }
    }

    fn process_output(
        &self,
        task_id: Uuid,
        result: std::io::Result<(ExitStatus, Vec<u8>, Vec<u8>)>,
        duration: Duration,
    ) -> ExecutionResult {
        let (exit_status, stdout, stderr) = match result {
            Ok(finished) => finished,
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "Task execution failed");
                return ExecutionResult::failed(task_id, e.to_string(), duration);
            }
        };

        let stdout = String::from_utf8_lossy(&stdout);
        let stderr = String::from_utf8_lossy(&stderr);
        let exit_code = exit_status.code();
        let combined = format!("{}{}", stdout, stderr);

        let (status, error) = if exit_status.success() {
            (ExecutionStatus::Succeeded, None)
        } else if stderr.trim().is_empty() {
            let reason = match exit_code {
                Some(code) => format!("exit code {}", code),
                None => "terminated by signal".to_string(),
            };
            (ExecutionStatus::Failed, Some(reason))
        } else {
            (
                ExecutionStatus::Failed,
                Some(tail(stderr.trim_end(), self.config.max_output_bytes)),
            )
        };

        tracing::info!(
            task_id = %task_id,
            status = ?status,
            exit_code = ?exit_code,
            duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            "Task finished"
        );

        ExecutionResult {
            task_id,
            status,
            exit_code,
            output: (!combined.is_empty()).then(|| tail(&combined, self.config.max_output_bytes)),
            error,
            duration,
        }
    }
}

enum Stop {
    Exited(std::io::Result<(ExitStatus, Vec<u8>, Vec<u8>)>),
    TimedOut,
    Cancelled,
}

/// Drain `reader` to EOF, keeping only the last `max_bytes`.
async fn read_tail<R>(reader: Option<R>, max_bytes: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(Vec::new());
    };
    let mut kept = Vec::with_capacity(max_bytes.min(64 * 1024));
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(kept);
        }
        kept.extend_from_slice(&chunk[..n]);
        if kept.len() > max_bytes {
            let excess = kept.len() - max_bytes;
            kept.drain(..excess);
        }
    }
}

/// Kill the child's whole process group, then reap the child.
async fn kill_process_tree(task_id: Uuid, child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::warn!(task_id = %task_id, error = %e, "Failed to kill task process group"),
        }
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!(task_id = %task_id, error = %e, "Task child already gone");
    }
    if let Err(e) = child.wait().await {
        tracing::warn!(task_id = %task_id, error = %e, "Failed to reap task child");
    }
}

/// Last `max_bytes` of `text`, cut on a char boundary.
pub fn tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
