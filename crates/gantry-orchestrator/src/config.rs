use std::time::Duration;

use anyhow::{bail, Context, Result};
use gantry_job_types::OperationType;
use gantry_supervisor::ExecOptions;

const DEFAULT_BASE_COMMAND: &str = "docker-mcp";
const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const DEFAULT_STDERR_EXCERPT_BYTES: usize = 4 * 1024;
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Runtime configuration for [`crate::JobOrchestrator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOrchestratorConfig {
    /// External tool binary every job invokes.
    pub base_command: String,
    pub standard_options: ExecOptions,
    /// Used for `install` and `test`.
    pub long_running_options: ExecOptions,
    pub idempotency_ttl: Duration,
    /// Age after which terminal jobs are eligible for the retention sweep.
    pub job_retention: Duration,
    pub stderr_excerpt_bytes: usize,
    pub event_capacity: usize,
}

impl Default for JobOrchestratorConfig {
    fn default() -> Self {
        Self {
            base_command: DEFAULT_BASE_COMMAND.to_string(),
            standard_options: ExecOptions::standard(),
            long_running_options: ExecOptions::long_running(),
            idempotency_ttl: DEFAULT_IDEMPOTENCY_TTL,
            job_retention: DEFAULT_JOB_RETENTION,
            stderr_excerpt_bytes: DEFAULT_STDERR_EXCERPT_BYTES,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl JobOrchestratorConfig {
    pub fn options_for(&self, operation: OperationType) -> &ExecOptions {
        if operation.is_long_running() {
            &self.long_running_options
        } else {
            &self.standard_options
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_command.trim().is_empty() || self.base_command.trim() != self.base_command {
            bail!("orchestrator base_command must be non-empty without surrounding whitespace");
        }
        self.standard_options
            .validate()
            .context("invalid standard exec options")?;
        self.long_running_options
            .validate()
            .context("invalid long-running exec options")?;
        if self.idempotency_ttl.is_zero() {
            bail!("orchestrator idempotency_ttl must be greater than 0");
        }
        chrono::Duration::from_std(self.idempotency_ttl)
            .context("orchestrator idempotency_ttl is out of range")?;
        if self.job_retention.is_zero() {
            bail!("orchestrator job_retention must be greater than 0");
        }
        chrono::Duration::from_std(self.job_retention)
            .context("orchestrator job_retention is out of range")?;
        if self.stderr_excerpt_bytes == 0 {
            bail!("orchestrator stderr_excerpt_bytes must be greater than 0");
        }
        if self.event_capacity == 0 {
            bail!("orchestrator event_capacity must be greater than 0");
        }
        Ok(())
    }

    pub(crate) fn idempotency_ttl_delta(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.idempotency_ttl).unwrap_or(chrono::Duration::MAX)
    }

    pub(crate) fn job_retention_delta(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.job_retention).unwrap_or(chrono::Duration::MAX)
    }
}
