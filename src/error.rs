// src/error.rs

use std::fmt;
use thiserror::Error;

/// The category of a failed `run` or `resolve` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The program name was empty, or no command was given at all.
    InvalidArgument,
    /// The executable could not be located, either as a literal path or on `PATH`.
    NotFound,
    /// The OS refused to create the process.
    SpawnError,
    /// The child exited because a signal was delivered to it.
    SignalTerminated,
    /// The child ran to completion with a positive exit code.
    NonZeroExit,
    /// The deadline elapsed and the child's process group was terminated.
    Timeout,
    /// An OS error on the supervisor side (scratch file, wait, or signalling).
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::NotFound => "not found",
            ErrorKind::SpawnError => "spawn error",
            ErrorKind::SignalTerminated => "terminated by signal",
            ErrorKind::NonZeroExit => "non-zero exit",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Io => "i/o error",
        };
        f.write_str(name)
    }
}

/// A failed command execution.
///
/// `output` is always populated: it holds the captured process output when
/// there is any, and falls back to the message otherwise.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct ExecutionError {
    kind: ErrorKind,
    message: String,
    exit_code: i32,
    output: String,
    #[source]
    source: Option<std::io::Error>,
}

impl ExecutionError {
    /// Creates an error with the default exit code of 1 and no captured output.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind,
            output: message.clone(),
            message,
            exit_code: 1,
            source: None,
        }
    }

    pub(crate) fn io(kind: ErrorKind, message: impl Into<String>, source: std::io::Error) -> Self {
        let mut err = Self::new(kind, message);
        err.source = Some(source);
        err
    }

    pub(crate) fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// Attaches captured output. Empty output keeps the message as the output.
    pub(crate) fn with_output(mut self, output: impl Into<String>) -> Self {
        let output = output.into();
        if !output.is_empty() {
            self.output = output;
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Exit code of the failed program, or 1 when none is known.
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn output(&self) -> &str {
        &self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_output_defaults_to_message() {
        let err = ExecutionError::new(ErrorKind::NotFound, "Could not find foo");
        assert_eq!(err.output(), "Could not find foo");
        assert_eq!(err.exit_code(), 1);
        assert_eq!(err.to_string(), "Could not find foo");
    }

    #[test]
    fn test_empty_output_keeps_message() {
        let err = ExecutionError::new(ErrorKind::Timeout, "timed out").with_output("");
        assert_eq!(err.output(), "timed out");

        let err = err.with_output("partial");
        assert_eq!(err.output(), "partial");
    }

    #[test]
    fn test_io_source_is_exposed() {
        let os = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        let err = ExecutionError::io(ErrorKind::SpawnError, "command failed", os).with_exit_code(126);
        assert_eq!(err.kind(), ErrorKind::SpawnError);
        assert_eq!(err.exit_code(), 126);
        assert!(err.source().is_some());
    }
}
