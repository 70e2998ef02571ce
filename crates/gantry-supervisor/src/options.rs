use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use anyhow::{bail, Result};

const STANDARD_TIMEOUT: Duration = Duration::from_secs(30);
const STANDARD_MAX_RETRIES: u32 = 2;
const STANDARD_RETRY_DELAY: Duration = Duration::from_secs(1);
const STANDARD_RETRY_JITTER: Duration = Duration::from_millis(250);
const STANDARD_MAX_BUFFER_SIZE: usize = 1024 * 1024;

const LONG_RUNNING_TIMEOUT: Duration = Duration::from_secs(300);
const LONG_RUNNING_MAX_RETRIES: u32 = 3;
const LONG_RUNNING_RETRY_DELAY: Duration = Duration::from_secs(2);
const LONG_RUNNING_RETRY_JITTER: Duration = Duration::from_millis(500);
const LONG_RUNNING_MAX_BUFFER_SIZE: usize = 10 * 1024 * 1024;

const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Signal delivered to the child process group on timeout or cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KillSignal {
    #[default]
    Terminate,
    Interrupt,
    Hangup,
    Kill,
}

impl KillSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Terminate => "SIGTERM",
            Self::Interrupt => "SIGINT",
            Self::Hangup => "SIGHUP",
            Self::Kill => "SIGKILL",
        }
    }

    #[cfg(unix)]
    pub(crate) fn as_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            Self::Terminate => Signal::SIGTERM,
            Self::Interrupt => Signal::SIGINT,
            Self::Hangup => Signal::SIGHUP,
            Self::Kill => Signal::SIGKILL,
        }
    }
}

/// Per-call execution limits.
///
/// `max_buffer_size` applies to stdout and stderr independently. A `timeout`
/// of `None` disables the deadline entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOptions {
    pub timeout: Option<Duration>,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub retry_jitter: Duration,
    pub max_buffer_size: usize,
    pub kill_signal: KillSignal,
    pub kill_grace: Duration,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self::standard()
    }
}

impl ExecOptions {
    pub fn standard() -> Self {
        Self {
            timeout: Some(STANDARD_TIMEOUT),
            max_retries: STANDARD_MAX_RETRIES,
            retry_delay: STANDARD_RETRY_DELAY,
            retry_jitter: STANDARD_RETRY_JITTER,
            max_buffer_size: STANDARD_MAX_BUFFER_SIZE,
            kill_signal: KillSignal::Terminate,
            kill_grace: DEFAULT_KILL_GRACE,
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    /// Profile for installs and tests, which may pull images or run suites.
    pub fn long_running() -> Self {
        Self {
            timeout: Some(LONG_RUNNING_TIMEOUT),
            max_retries: LONG_RUNNING_MAX_RETRIES,
            retry_delay: LONG_RUNNING_RETRY_DELAY,
            retry_jitter: LONG_RUNNING_RETRY_JITTER,
            max_buffer_size: LONG_RUNNING_MAX_BUFFER_SIZE,
            ..Self::standard()
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration, retry_jitter: Duration) -> Self {
        self.retry_delay = retry_delay;
        self.retry_jitter = retry_jitter;
        self
    }

    pub fn with_max_buffer_size(mut self, max_buffer_size: usize) -> Self {
        self.max_buffer_size = max_buffer_size;
        self
    }

    pub fn with_kill(mut self, kill_signal: KillSignal, kill_grace: Duration) -> Self {
        self.kill_signal = kill_signal;
        self.kill_grace = kill_grace;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_some_and(|timeout| timeout.is_zero()) {
            bail!("exec timeout must be greater than 0 when set");
        }
        if self.max_buffer_size == 0 {
            bail!("exec max_buffer_size must be greater than 0");
        }
        if self.env.keys().any(|key| key.trim().is_empty() || key.contains('=')) {
            bail!("exec env keys must be non-empty and must not contain '='");
        }
        Ok(())
    }
}
