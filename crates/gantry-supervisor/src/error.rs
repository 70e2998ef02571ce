use std::{fmt, time::Duration};

use thiserror::Error;

/// Failure categories surfaced by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecErrorKind {
    Spawn,
    Timeout,
    BufferOverflow,
    Process,
    Cancelled,
}

impl ExecErrorKind {
    /// Returns the stable machine-readable error code.
    pub fn code(self) -> &'static str {
        match self {
            Self::Spawn => "SPAWN_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::BufferOverflow => "BUFFER_OVERFLOW",
            Self::Process => "PROCESS_ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Returns true when a later attempt may succeed.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

impl fmt::Display for ExecErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Final failure of a supervised call, after any retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ExecError {
    pub kind: ExecErrorKind,
    pub message: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stderr: String,
    pub elapsed: Duration,
    pub retry_count: u32,
}

impl ExecError {
    pub fn new(kind: ExecErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code: None,
            signal: None,
            stderr: String::new(),
            elapsed: Duration::ZERO,
            retry_count: 0,
        }
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn with_exit(mut self, exit_code: Option<i32>, signal: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self.signal = signal;
        self
    }

    pub fn finish(mut self, elapsed: Duration, retry_count: u32) -> Self {
        self.elapsed = elapsed;
        self.retry_count = retry_count;
        self
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }
}
