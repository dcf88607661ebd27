// src/supervisor.rs

use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Command as StdCommand, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command as TokioCommand};
use tokio::time::sleep_until;
use tracing::{debug, warn};

use crate::error::{ErrorKind, ExecutionError};
use crate::resolver::resolve;
use crate::sink::OutputSink;
use crate::tailer::LineTailer;
use crate::{CommandSpec, Response};

/// How the child's run ended, before exit code classification.
#[derive(Debug, Clone, Copy)]
enum Outcome {
    Completed(ExitStatus),
    TimedOut(ExitStatus),
}

/// Owns one child process and its output for the duration of a single run.
pub(crate) struct ProcessSupervisor {
    spec: CommandSpec,
}

impl ProcessSupervisor {
    pub(crate) fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }

    pub(crate) async fn run(self) -> Result<Response, ExecutionError> {
        let program = self.spec.argv.first().map(String::as_str).unwrap_or("");
        let executable = resolve(program, &self.spec.env)?;

        let sink = OutputSink::new().map_err(|e| {
            ExecutionError::io(ErrorKind::Io, format!("command failed: {}", e), e)
        })?;

        let start_time = Instant::now();
        let mut child = self.spawn(&executable, &sink)?;
        let pid = child.id();
        debug!(pid, executable = %executable.display(), "Process spawned successfully");

        let tailer = self
            .spec
            .on_line
            .clone()
            .map(|on_line| LineTailer::spawn(sink.view(), on_line));

        let deadline = self.spec.timeout.map(|limit| start_time + limit);
        let outcome = self.supervise(&mut child, deadline).await;
        if outcome.is_err() {
            // Leave nothing of the group behind when supervision itself failed.
            if let Some(pid) = pid {
                let _ = signal_group(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        }

        if let Some(tailer) = tailer {
            tailer.stop().await;
        }
        let duration = start_time.elapsed();

        let captured = sink.snapshot();
        drop(sink);

        let outcome = outcome?;
        let output = match captured {
            Ok(bytes) => String::from_utf8_lossy(&bytes).trim().to_string(),
            Err(e) => {
                return Err(ExecutionError::io(
                    ErrorKind::Io,
                    format!("Failed to read captured output: {}", e),
                    e,
                ))
            }
        };

        debug!(
            duration = ?duration,
            outcome = ?outcome,
            output_len = output.len(),
            "Command execution finished."
        );
        self.finish(outcome, output, duration)
    }

    /// Spawns the child in its own process group with stdout and stderr both
    /// writing into `sink`.
    fn spawn(&self, executable: &Path, sink: &OutputSink) -> Result<Child, ExecutionError> {
        // No exit code exists for a process that never started; keep the default of 1.
        let spawn_error = |e: std::io::Error| {
            warn!(error = %e, "Failed to spawn command");
            ExecutionError::io(ErrorKind::SpawnError, format!("command failed: {}", e), e)
        };

        let mut command = StdCommand::new(executable);
        if let Some(arg0) = self.spec.argv.first() {
            // The child sees the name it was invoked as, not the resolved path.
            command.arg0(arg0);
        }
        command
            .args(self.spec.argv.iter().skip(1))
            .envs(&self.spec.env)
            .stdin(Stdio::null())
            .stdout(sink.child_stdio().map_err(spawn_error)?)
            .stderr(sink.child_stdio().map_err(spawn_error)?)
            // Leader of a fresh group, so a timeout can take its descendants down too.
            .process_group(0);
        if let Some(dir) = &self.spec.current_dir {
            command.current_dir(dir);
        }

        TokioCommand::from(command)
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)
    }

    /// Races the child against the watchdog deadline, if any.
    async fn supervise(
        &self,
        child: &mut Child,
        deadline: Option<Instant>,
    ) -> Result<Outcome, ExecutionError> {
        let watchdog = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline.into()).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased; // Prioritize checking exit status

            result = child.wait() => {
                let status = result.map_err(wait_error)?;
                debug!(status = %status, "Process exited naturally");
                Ok(Outcome::Completed(status))
            }

            _ = watchdog => {
                let status = self.terminate_group(child).await?;
                Ok(Outcome::TimedOut(status))
            }
        }
    }

    /// SIGTERM to the group, a grace period for the leader, then SIGKILL to
    /// whatever is left of the group.
    async fn terminate_group(&self, child: &mut Child) -> Result<ExitStatus, ExecutionError> {
        let Some(pid) = child.id() else {
            // Already reaped; nothing left to signal.
            return child.wait().await.map_err(wait_error);
        };
        let pgid = Pid::from_raw(pid as i32);
        let grace = self.spec.grace_period;

        warn!(
            pid,
            timeout = ?self.spec.timeout,
            "Terminating process group due to timeout"
        );
        signal_group(pgid, Signal::SIGTERM)?;

        let status = match tokio::time::timeout(grace, child.wait()).await {
            Ok(result) => Some(result.map_err(wait_error)?),
            Err(_) => {
                warn!(pid, grace = ?grace, "Process still running after grace period");
                None
            }
        };

        // Descendants may have outlived the leader or ignored SIGTERM.
        signal_group(pgid, Signal::SIGKILL)?;

        match status {
            Some(status) => Ok(status),
            None => {
                let status = child.wait().await.map_err(wait_error)?;
                debug!(pid, status = %status, "Process exited after kill");
                Ok(status)
            }
        }
    }

    fn finish(
        self,
        outcome: Outcome,
        output: String,
        duration: Duration,
    ) -> Result<Response, ExecutionError> {
        let command_line = self.spec.argv.join(" ");
        match outcome {
            Outcome::TimedOut(status) => Err(ExecutionError::new(
                ErrorKind::Timeout,
                format!(
                    "command ('{}') timed out after {:?}",
                    command_line,
                    self.spec.timeout.unwrap_or_default()
                ),
            )
            .with_exit_code(exit_code(status))
            .with_output(output)),
            Outcome::Completed(status) => {
                let code = exit_code(status);
                if code < 0 {
                    Err(ExecutionError::new(
                        ErrorKind::SignalTerminated,
                        format!(
                            "command ('{}') was terminated by signal: {}",
                            command_line, -code
                        ),
                    )
                    .with_exit_code(code)
                    .with_output(output))
                } else if code > 0 {
                    Err(ExecutionError::new(
                        ErrorKind::NonZeroExit,
                        format!(
                            "command ('{}') exited with value: {}\n\n{}",
                            command_line, code, output
                        ),
                    )
                    .with_exit_code(code)
                    .with_output(output))
                } else {
                    Ok(Response {
                        exit_code: code,
                        output,
                        command: self.spec.argv,
                        duration,
                    })
                }
            }
        }
    }
}

/// Exit code, with death by signal N encoded as -N.
fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => -signal,
        (None, None) => 1,
    }
}

/// Signals every process in the group. A group that no longer exists is not
/// an error.
fn signal_group(pgid: Pid, signal: Signal) -> Result<(), ExecutionError> {
    match killpg(pgid, signal) {
        Ok(()) => {
            debug!(pgid = pgid.as_raw(), signal = ?signal, "Signal sent to process group");
            Ok(())
        }
        Err(Errno::ESRCH) => {
            debug!(pgid = pgid.as_raw(), signal = ?signal, "Process group already exited");
            Ok(())
        }
        Err(e) => {
            warn!(pgid = pgid.as_raw(), signal = ?signal, error = %e, "Failed to signal process group");
            Err(ExecutionError::io(
                ErrorKind::Io,
                format!("Failed to signal process group {}: {}", pgid, e),
                std::io::Error::from(e),
            ))
        }
    }
}

fn wait_error(e: std::io::Error) -> ExecutionError {
    warn!(error = %e, "Error waiting for process exit");
    ExecutionError::io(
        ErrorKind::Io,
        format!("Failed to wait for command exit: {}", e),
        e,
    )
}
