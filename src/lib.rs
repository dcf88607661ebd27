// src/lib.rs

//! Run an external program with an optional timeout, capture its combined
//! stdout and stderr, and optionally watch that output line by line while the
//! program is still running.
//!
//! ```no_run
//! use command_supervisor::{run, CommandSpec};
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), command_supervisor::ExecutionError> {
//! let spec = CommandSpec::new(["git", "status"])
//!     .timeout(Duration::from_secs(10))
//!     .on_line(|line| println!("git: {}", line));
//! let response = run(spec).await?;
//! assert_eq!(response.exit_code, 0);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

mod error;
mod resolver;
mod sink;
mod supervisor;
mod tailer;

pub use error::{ErrorKind, ExecutionError};
pub use resolver::{resolve, resolve_in};
pub use sink::{OutputSink, SinkView};
pub use tailer::{LineCallback, LineTailer};

use supervisor::ProcessSupervisor;

/// Time between the graceful and the forceful signal when a run times out.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(500);

// --- Structs ---

/// Everything needed to run one command. Built with the chained setters and
/// consumed by [`run`].
#[derive(Clone)]
pub struct CommandSpec {
    pub(crate) argv: Vec<String>,
    pub(crate) current_dir: Option<PathBuf>,
    pub(crate) env: BTreeMap<String, String>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) grace_period: Duration,
    pub(crate) on_line: Option<LineCallback>,
}

impl CommandSpec {
    /// `argv[0]` is the program, the rest are passed as-is (no shell).
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            current_dir: None,
            env: BTreeMap::new(),
            timeout: None,
            grace_period: DEFAULT_GRACE_PERIOD,
            on_line: None,
        }
    }

    /// Kill the command (and its descendants) if it runs longer than `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Working directory of the child. It is not used to locate the program.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Sets one environment variable on top of the inherited environment.
    /// A `PATH` set here is also used to find the program.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Called with each completed output line, in order, while the command runs.
    pub fn on_line<F>(mut self, on_line: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_line = Some(Arc::new(on_line));
        self
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    fn validate(&self) -> Result<(), ExecutionError> {
        match self.argv.first() {
            Some(program) if !program.is_empty() => Ok(()),
            _ => Err(ExecutionError::new(
                ErrorKind::InvalidArgument,
                "Invalid program name passed",
            )),
        }
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("argv", &self.argv)
            .field("current_dir", &self.current_dir)
            .field("env", &self.env)
            .field("timeout", &self.timeout)
            .field("grace_period", &self.grace_period)
            .field("on_line", &self.on_line.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

/// Result of a command that exited with status 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Always 0 for a returned response; failures surface as [`ExecutionError`].
    pub exit_code: i32,
    /// Combined stdout and stderr, lossily decoded and trimmed.
    pub output: String,
    /// The argv that was run.
    pub command: Vec<String>,
    /// Time from spawn until the process was reaped.
    pub duration: Duration,
}

// --- Public API Function ---

/// Runs a command to completion or until its timeout elapses.
///
/// The program is looked up on `PATH` (or the `PATH` override in the spec)
/// unless it contains a `/`. Its stdout and stderr go to a single temporary
/// file, so output size is not bounded by pipe buffers. On timeout the whole
/// process group receives `SIGTERM`, then `SIGKILL` after the grace period.
///
/// Exit status 0 returns a [`Response`]; anything else, including a spawn
/// failure, returns an [`ExecutionError`] carrying the output captured so far.
#[instrument(skip(spec), fields(command = ?spec.argv, timeout = ?spec.timeout))]
pub async fn run(spec: CommandSpec) -> Result<Response, ExecutionError> {
    spec.validate()?;
    ProcessSupervisor::new(spec).run().await
}
