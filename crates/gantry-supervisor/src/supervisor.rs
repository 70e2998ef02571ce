use std::{
    process::{ExitStatus, Stdio},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use gantry_core::CancellationToken;
use tokio::{
    io::AsyncReadExt,
    process::{Child, Command},
};
use tracing::{debug, warn};

use crate::{backoff::retry_delay, ExecError, ExecErrorKind, ExecOptions, KillSignal};

const READ_CHUNK_BYTES: usize = 8192;
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Captured result of a successful supervised call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub retry_count: u32,
    pub elapsed: Duration,
}

/// Runs an argv vector to completion.
///
/// Implementations never pass argv through a shell. `cancel` must end the
/// call promptly with [`ExecErrorKind::Cancelled`], including during retry
/// backoff.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(
        &self,
        argv: &[String],
        options: &ExecOptions,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, ExecError>;
}

/// Child process supervisor backed by `tokio::process`.
#[derive(Debug, Default)]
pub struct ProcessSupervisor {
    spawn_count: AtomicU64,
}

struct AttemptOutput {
    stdout: String,
    stderr: String,
    exit_code: i32,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of spawn attempts made over the supervisor's lifetime.
    pub fn spawn_count(&self) -> u64 {
        self.spawn_count.load(Ordering::SeqCst)
    }

    /// Runs `argv` with the long-running profile.
    pub async fn execute_long_running(
        &self,
        argv: &[String],
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, ExecError> {
        self.execute(argv, &ExecOptions::long_running(), cancel)
            .await
    }

    async fn run_attempt(
        &self,
        argv: &[String],
        options: &ExecOptions,
        cancel: &CancellationToken,
    ) -> Result<AttemptOutput, ExecError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(ExecError::new(ExecErrorKind::Spawn, "argv must not be empty"));
        };

        let mut command = Command::new(program);
        command.args(args);
        if let Some(cwd) = options.cwd.as_ref() {
            command.current_dir(cwd);
        }
        for (key, value) in &options.env {
            command.env(key, value);
        }
        command.kill_on_drop(true);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        #[cfg(unix)]
        command.process_group(0);

        self.spawn_count.fetch_add(1, Ordering::SeqCst);
        let mut child = command.spawn().map_err(|error| {
            ExecError::new(
                ExecErrorKind::Spawn,
                format!("failed to spawn '{program}': {error}"),
            )
        })?;
        debug!(pid = child.id(), program = %program, "spawned child process");

        let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take())
        else {
            terminate_child(&mut child, KillSignal::Kill, Duration::ZERO).await;
            return Err(ExecError::new(
                ExecErrorKind::Spawn,
                "child process pipes were not captured",
            ));
        };

        let mut stdout_buffer = Vec::new();
        let mut stderr_buffer = Vec::new();
        let mut stdout_chunk = [0_u8; READ_CHUNK_BYTES];
        let mut stderr_chunk = [0_u8; READ_CHUNK_BYTES];
        let mut stdout_open = true;
        let mut stderr_open = true;

        let deadline = options
            .timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);
        let timeout_reached = sleep_until_deadline(deadline);
        tokio::pin!(timeout_reached);

        // The child may exit while a descendant still holds the pipes open;
        // output is drained for at most PIPE_DRAIN_GRACE after exit.
        let mut exit_status: Option<ExitStatus> = None;
        let mut drain_deadline: Option<tokio::time::Instant> = None;
        let status = loop {
            if let Some(status) = exit_status {
                if !stdout_open && !stderr_open {
                    break status;
                }
            }
            tokio::select! {
                read = stdout.read(&mut stdout_chunk), if stdout_open => match read {
                    Ok(0) | Err(_) => stdout_open = false,
                    Ok(read) => {
                        stdout_buffer.extend_from_slice(&stdout_chunk[..read]);
                        if stdout_buffer.len() > options.max_buffer_size {
                            terminate_child(&mut child, KillSignal::Kill, Duration::ZERO).await;
                            return Err(overflow_error("stdout", options.max_buffer_size, &stderr_buffer));
                        }
                    }
                },
                read = stderr.read(&mut stderr_chunk), if stderr_open => match read {
                    Ok(0) | Err(_) => stderr_open = false,
                    Ok(read) => {
                        stderr_buffer.extend_from_slice(&stderr_chunk[..read]);
                        if stderr_buffer.len() > options.max_buffer_size {
                            terminate_child(&mut child, KillSignal::Kill, Duration::ZERO).await;
                            return Err(overflow_error("stderr", options.max_buffer_size, &stderr_buffer));
                        }
                    }
                },
                waited = child.wait(), if exit_status.is_none() => {
                    let status = waited.map_err(|error| {
                        ExecError::new(
                            ExecErrorKind::Process,
                            format!("failed to wait for '{program}': {error}"),
                        )
                    })?;
                    exit_status = Some(status);
                    drain_deadline = Some(tokio::time::Instant::now() + PIPE_DRAIN_GRACE);
                }
                _ = sleep_until_deadline(drain_deadline), if exit_status.is_some() => {
                    debug!(program = %program, "output pipes still open after exit; leaving them to descendants");
                    if let Some(status) = exit_status {
                        break status;
                    }
                }
                _ = &mut timeout_reached, if exit_status.is_none() => {
                    terminate_child(&mut child, options.kill_signal, options.kill_grace).await;
                    let timeout_ms = options.timeout.map(|timeout| timeout.as_millis()).unwrap_or_default();
                    return Err(ExecError::new(
                        ExecErrorKind::Timeout,
                        format!("process exceeded timeout of {timeout_ms}ms"),
                    )
                    .with_stderr(lossy(&stderr_buffer)));
                }
                _ = cancel.cancelled(), if exit_status.is_none() => {
                    terminate_child(&mut child, options.kill_signal, options.kill_grace).await;
                    return Err(ExecError::new(ExecErrorKind::Cancelled, "process cancelled")
                        .with_stderr(lossy(&stderr_buffer)));
                }
            }
        };

        let stdout = lossy(&stdout_buffer);
        let stderr = lossy(&stderr_buffer);
        if status.success() {
            return Ok(AttemptOutput {
                stdout,
                stderr,
                exit_code: status.code().unwrap_or(0),
            });
        }

        let exit_code = status.code();
        let signal = exit_signal(&status);
        let message = match (exit_code, signal) {
            (Some(code), _) => format!("process exited with status {code}"),
            (None, Some(signal)) => format!("process terminated by signal {signal}"),
            (None, None) => "process exited unsuccessfully".to_string(),
        };
        Err(ExecError::new(ExecErrorKind::Process, message)
            .with_exit(exit_code, signal)
            .with_stderr(stderr))
    }
}

#[async_trait]
impl CommandExecutor for ProcessSupervisor {
    #[tracing::instrument(
        level = "debug",
        skip(self, argv, options, cancel),
        fields(program = argv.first().map(String::as_str).unwrap_or_default())
    )]
    async fn execute(
        &self,
        argv: &[String],
        options: &ExecOptions,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, ExecError> {
        let started = Instant::now();
        let seed = argv.join(" ");
        let mut retry_count = 0_u32;

        loop {
            if cancel.is_cancelled() {
                return Err(
                    ExecError::new(ExecErrorKind::Cancelled, "cancelled before spawn")
                        .finish(started.elapsed(), retry_count),
                );
            }

            let failure = match self.run_attempt(argv, options, cancel).await {
                Ok(output) => {
                    return Ok(ExecOutput {
                        stdout: output.stdout,
                        stderr: output.stderr,
                        exit_code: output.exit_code,
                        retry_count,
                        elapsed: started.elapsed(),
                    });
                }
                Err(failure) => failure,
            };

            if !failure.kind.is_retryable() || retry_count >= options.max_retries {
                if retry_count > 0 {
                    warn!(
                        retry_count,
                        code = failure.code(),
                        "process attempts exhausted"
                    );
                }
                return Err(failure.finish(started.elapsed(), retry_count));
            }

            retry_count = retry_count.saturating_add(1);
            let delay = retry_delay(options.retry_delay, options.retry_jitter, retry_count, &seed);
            warn!(
                attempt = retry_count,
                max_retries = options.max_retries,
                code = failure.code(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %failure.message,
                "process attempt failed; retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return Err(
                        ExecError::new(ExecErrorKind::Cancelled, "cancelled during retry backoff")
                            .with_stderr(failure.stderr)
                            .finish(started.elapsed(), retry_count),
                    );
                }
            }
        }
    }
}

fn overflow_error(stream: &str, limit: usize, stderr_buffer: &[u8]) -> ExecError {
    ExecError::new(
        ExecErrorKind::BufferOverflow,
        format!("{stream} exceeded buffer limit of {limit} bytes"),
    )
    .with_stderr(lossy(&stderr_buffer[..stderr_buffer.len().min(limit)]))
}

async fn sleep_until_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Signals the child's process group, escalating to SIGKILL after `grace`.
#[cfg(unix)]
async fn terminate_child(child: &mut Child, signal: KillSignal, grace: Duration) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        let _ = child.wait().await;
        return;
    };
    let Ok(raw_pid) = i32::try_from(pid) else {
        let _ = child.kill().await;
        return;
    };
    let process_group = Pid::from_raw(raw_pid);
    let _ = killpg(process_group, signal.as_nix());
    if signal != KillSignal::Kill {
        tokio::select! {
            _ = tokio::time::sleep(grace) => {
                warn!(pid, signal = signal.as_str(), "process ignored graceful signal; sending SIGKILL");
                let _ = killpg(process_group, Signal::SIGKILL);
            }
            _ = child.wait() => return,
        }
    }
    let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn terminate_child(child: &mut Child, _signal: KillSignal, _grace: Duration) {
    let _ = child.kill().await;
}

#[cfg(all(test, unix))]
mod tests {
    use super::{CommandExecutor, ProcessSupervisor};
    use crate::{ExecErrorKind, ExecOptions, KillSignal};
    use gantry_core::CancellationToken;
    use std::time::{Duration, Instant};

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn fast_options() -> ExecOptions {
        ExecOptions::standard()
            .with_timeout(Some(Duration::from_secs(10)))
            .with_max_retries(0)
            .with_retry_delay(Duration::from_millis(5), Duration::ZERO)
    }

    #[tokio::test]
    async fn functional_execute_captures_stdout_and_stderr_separately() {
        let supervisor = ProcessSupervisor::new();
        let output = supervisor
            .execute(
                &sh("printf '{\"ok\":true}'; printf 'warning' >&2"),
                &fast_options(),
                &CancellationToken::new(),
            )
            .await
            .expect("execute");
        assert_eq!(output.stdout, "{\"ok\":true}");
        assert_eq!(output.stderr, "warning");
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.retry_count, 0);
        assert_eq!(supervisor.spawn_count(), 1);
    }

    #[tokio::test]
    async fn functional_execute_passes_arguments_without_shell_interpretation() {
        let supervisor = ProcessSupervisor::new();
        let argv = vec![
            "printf".to_string(),
            "%s".to_string(),
            "$(echo nope); echo".to_string(),
        ];
        let output = supervisor
            .execute(&argv, &fast_options(), &CancellationToken::new())
            .await
            .expect("execute");
        assert_eq!(output.stdout, "$(echo nope); echo");
    }

    #[tokio::test]
    async fn integration_execute_retries_until_success() {
        let temp = tempfile::tempdir().expect("tempdir");
        let counter = temp.path().join("attempts");
        let script = format!(
            "n=$(cat '{path}' 2>/dev/null || echo 0); n=$((n+1)); echo $n > '{path}'; \
             if [ $n -lt 3 ]; then echo \"attempt $n failed\" >&2; exit 7; fi; printf done",
            path = counter.display()
        );
        let supervisor = ProcessSupervisor::new();
        let output = supervisor
            .execute(
                &sh(&script),
                &fast_options().with_max_retries(3),
                &CancellationToken::new(),
            )
            .await
            .expect("third attempt succeeds");
        assert_eq!(output.stdout, "done");
        assert_eq!(output.retry_count, 2);
        assert_eq!(supervisor.spawn_count(), 3);
    }

    #[tokio::test]
    async fn functional_execute_reports_process_error_after_exhausting_retries() {
        let supervisor = ProcessSupervisor::new();
        let error = supervisor
            .execute(
                &sh("echo broken >&2; exit 3"),
                &fast_options().with_max_retries(1),
                &CancellationToken::new(),
            )
            .await
            .expect_err("non-zero exit");
        assert_eq!(error.kind, ExecErrorKind::Process);
        assert_eq!(error.code(), "PROCESS_ERROR");
        assert_eq!(error.exit_code, Some(3));
        assert_eq!(error.stderr.trim(), "broken");
        assert_eq!(error.retry_count, 1);
        assert_eq!(supervisor.spawn_count(), 2);
    }

    #[tokio::test]
    async fn functional_execute_kills_process_on_buffer_overflow() {
        let supervisor = ProcessSupervisor::new();
        let started = Instant::now();
        let error = supervisor
            .execute(
                &sh("while true; do echo 0123456789abcdef; done"),
                &fast_options().with_max_buffer_size(4096),
                &CancellationToken::new(),
            )
            .await
            .expect_err("overflow");
        assert_eq!(error.kind, ExecErrorKind::BufferOverflow);
        assert!(error.message.contains("stdout"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn functional_execute_times_out_with_graceful_signal() {
        let supervisor = ProcessSupervisor::new();
        let started = Instant::now();
        let error = supervisor
            .execute(
                &sh("echo starting up >&2; sleep 30"),
                &fast_options()
                    .with_timeout(Some(Duration::from_millis(300)))
                    .with_kill(KillSignal::Terminate, Duration::from_secs(5)),
                &CancellationToken::new(),
            )
            .await
            .expect_err("timeout");
        assert_eq!(error.kind, ExecErrorKind::Timeout);
        assert_eq!(error.stderr.trim(), "starting up");
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn regression_execute_kills_process_on_stderr_overflow() {
        let supervisor = ProcessSupervisor::new();
        let started = Instant::now();
        let error = supervisor
            .execute(
                &sh("while true; do echo x >&2; done"),
                &fast_options().with_max_buffer_size(2048),
                &CancellationToken::new(),
            )
            .await
            .expect_err("overflow");
        assert_eq!(error.kind, ExecErrorKind::BufferOverflow);
        assert!(error.message.contains("stderr"));
        assert!(!error.stderr.is_empty());
        assert!(error.stderr.len() <= 2048);
        assert_eq!(supervisor.spawn_count(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn regression_zero_exit_with_background_child_holding_pipes_succeeds() {
        let supervisor = ProcessSupervisor::new();
        let started = Instant::now();
        let output = supervisor
            .execute(
                &sh("sleep 3 & printf ok"),
                &fast_options()
                    .with_timeout(Some(Duration::from_secs(1)))
                    .with_max_retries(2),
                &CancellationToken::new(),
            )
            .await
            .expect("exit status decides the outcome");
        assert_eq!(output.stdout, "ok");
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.retry_count, 0);
        assert_eq!(supervisor.spawn_count(), 1);
        assert!(started.elapsed() < Duration::from_millis(900));
    }

    #[tokio::test]
    async fn regression_nonzero_exit_with_background_child_is_process_error() {
        let supervisor = ProcessSupervisor::new();
        let started = Instant::now();
        let error = supervisor
            .execute(
                &sh("sleep 3 & echo gone >&2; exit 4"),
                &fast_options().with_timeout(Some(Duration::from_secs(1))),
                &CancellationToken::new(),
            )
            .await
            .expect_err("non-zero exit");
        assert_eq!(error.kind, ExecErrorKind::Process);
        assert_eq!(error.exit_code, Some(4));
        assert_eq!(error.stderr.trim(), "gone");
        assert!(started.elapsed() < Duration::from_millis(900));
    }

    #[tokio::test]
    async fn regression_timeout_escalates_to_sigkill_when_signal_is_ignored() {
        let supervisor = ProcessSupervisor::new();
        let started = Instant::now();
        let error = supervisor
            .execute(
                &sh("trap '' TERM; sleep 30"),
                &fast_options()
                    .with_timeout(Some(Duration::from_millis(200)))
                    .with_kill(KillSignal::Terminate, Duration::from_millis(300)),
                &CancellationToken::new(),
            )
            .await
            .expect_err("timeout");
        assert_eq!(error.kind, ExecErrorKind::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(450));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn functional_execute_reports_spawn_error_for_missing_binary() {
        let supervisor = ProcessSupervisor::new();
        let error = supervisor
            .execute(
                &["/nonexistent/gantry-missing-binary".to_string()],
                &fast_options(),
                &CancellationToken::new(),
            )
            .await
            .expect_err("spawn error");
        assert_eq!(error.kind, ExecErrorKind::Spawn);
        assert_eq!(error.code(), "SPAWN_ERROR");
    }

    #[tokio::test]
    async fn unit_execute_rejects_empty_argv() {
        let supervisor = ProcessSupervisor::new();
        let error = supervisor
            .execute(&[], &fast_options(), &CancellationToken::new())
            .await
            .expect_err("empty argv");
        assert_eq!(error.kind, ExecErrorKind::Spawn);
    }

    #[tokio::test]
    async fn regression_pre_cancelled_call_never_spawns() {
        let supervisor = ProcessSupervisor::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let error = supervisor
            .execute(&sh("echo hi"), &fast_options(), &cancel)
            .await
            .expect_err("cancelled");
        assert_eq!(error.kind, ExecErrorKind::Cancelled);
        assert_eq!(supervisor.spawn_count(), 0);
    }

    #[tokio::test]
    async fn integration_cancel_terminates_running_process_without_retry() {
        let supervisor = std::sync::Arc::new(ProcessSupervisor::new());
        let cancel = CancellationToken::new();
        let task = {
            let supervisor = supervisor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                supervisor
                    .execute(
                        &sh("sleep 30"),
                        &fast_options()
                            .with_max_retries(3)
                            .with_kill(KillSignal::Terminate, Duration::from_secs(2)),
                        &cancel,
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        let error = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("cancel completes promptly")
            .expect("join")
            .expect_err("cancelled");
        assert_eq!(error.kind, ExecErrorKind::Cancelled);
        assert_eq!(error.retry_count, 0);
        assert_eq!(supervisor.spawn_count(), 1);
    }
}
