use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use gantry_job_types::{JobStatus, OperationType, TargetKind};

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "gantry",
    about = "Run sanitized external tool operations as tracked asynchronous jobs",
    version
)]
pub struct Cli {
    #[arg(
        long = "state-db",
        env = "GANTRY_STATE_DB",
        default_value = ".gantry/jobs.sqlite",
        help = "SQLite database holding job and idempotency records"
    )]
    pub state_db: PathBuf,

    #[arg(
        long = "base-command",
        env = "GANTRY_BASE_COMMAND",
        default_value = "docker-mcp",
        help = "External tool binary invoked for every job"
    )]
    pub base_command: String,

    #[arg(
        long = "timeout-ms",
        env = "GANTRY_TIMEOUT_MS",
        default_value_t = 30_000,
        help = "Per-attempt timeout for standard operations; 0 disables the timeout"
    )]
    pub timeout_ms: u64,

    #[arg(
        long = "long-running-timeout-ms",
        env = "GANTRY_LONG_RUNNING_TIMEOUT_MS",
        default_value_t = 300_000,
        help = "Per-attempt timeout for install and test operations; 0 disables the timeout"
    )]
    pub long_running_timeout_ms: u64,

    #[arg(
        long = "max-retries",
        env = "GANTRY_MAX_RETRIES",
        default_value_t = 2,
        help = "Retries after a failed attempt for standard operations"
    )]
    pub max_retries: u32,

    #[arg(
        long = "retry-delay-ms",
        env = "GANTRY_RETRY_DELAY_MS",
        default_value_t = 1_000,
        help = "Base retry delay for standard operations, multiplied by the attempt number"
    )]
    pub retry_delay_ms: u64,

    #[arg(
        long = "long-running-max-retries",
        env = "GANTRY_LONG_RUNNING_MAX_RETRIES",
        default_value_t = 3,
        help = "Retries after a failed attempt for install and test operations"
    )]
    pub long_running_max_retries: u32,

    #[arg(
        long = "long-running-retry-delay-ms",
        env = "GANTRY_LONG_RUNNING_RETRY_DELAY_MS",
        default_value_t = 2_000,
        help = "Base retry delay for install and test operations, multiplied by the attempt number"
    )]
    pub long_running_retry_delay_ms: u64,

    #[arg(
        long = "max-buffer-bytes",
        env = "GANTRY_MAX_BUFFER_BYTES",
        default_value_t = 1024 * 1024,
        value_parser = parse_positive_usize,
        help = "Maximum captured bytes per output stream for standard operations"
    )]
    pub max_buffer_bytes: usize,

    #[arg(
        long = "kill-grace-ms",
        env = "GANTRY_KILL_GRACE_MS",
        default_value_t = 5_000,
        help = "Wait between the graceful signal and SIGKILL"
    )]
    pub kill_grace_ms: u64,

    #[arg(
        long = "idempotency-ttl-secs",
        env = "GANTRY_IDEMPOTENCY_TTL_SECS",
        default_value_t = 86_400,
        value_parser = parse_positive_u64,
        help = "Lifetime of idempotency records"
    )]
    pub idempotency_ttl_secs: u64,

    #[arg(
        long = "job-retention-days",
        env = "GANTRY_JOB_RETENTION_DAYS",
        default_value_t = 30,
        value_parser = parse_positive_u64,
        help = "Age after which terminal jobs are purged by the sweep command"
    )]
    pub job_retention_days: u64,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Submit an operation and wait for it to finish.
    Submit(SubmitArgs),
    /// Print one job as JSON.
    Status { job_id: String },
    /// Cancel a pending or running job.
    Cancel { job_id: String },
    /// List jobs, oldest first.
    List(ListArgs),
    /// Purge old terminal jobs and expired idempotency records.
    Sweep,
    /// Settle jobs left pending or running by a process that exited.
    Recover,
}

#[derive(Debug, clap::Args)]
pub struct SubmitArgs {
    #[arg(long, value_enum)]
    pub operation: CliOperation,

    #[arg(long = "target-kind", value_enum, default_value_t = CliTargetKind::Server)]
    pub target_kind: CliTargetKind,

    #[arg(long = "target-id")]
    pub target_id: String,

    #[arg(
        long = "arg",
        allow_hyphen_values = true,
        help = "Extra argument passed after the target id; repeatable"
    )]
    pub args: Vec<String>,

    #[arg(long, help = "Structured JSON payload passed as `--input <json>`")]
    pub input: Option<String>,

    #[arg(long = "idempotency-key", requires = "scope")]
    pub idempotency_key: Option<String>,

    #[arg(long, requires = "idempotency_key")]
    pub scope: Option<String>,

    #[arg(
        long = "poll-interval-ms",
        default_value_t = 250,
        value_parser = parse_positive_u64
    )]
    pub poll_interval_ms: u64,
}

#[derive(Debug, clap::Args)]
pub struct ListArgs {
    #[arg(long, value_enum)]
    pub status: Vec<CliJobStatus>,

    #[arg(long = "target-kind", value_enum, requires = "target_id")]
    pub target_kind: Option<CliTargetKind>,

    #[arg(long = "target-id")]
    pub target_id: Option<String>,

    #[arg(long, default_value_t = 50, value_parser = parse_positive_usize)]
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliOperation {
    Install,
    Start,
    Stop,
    Test,
    Enable,
    Disable,
    Delete,
}

impl From<CliOperation> for OperationType {
    fn from(value: CliOperation) -> Self {
        match value {
            CliOperation::Install => Self::Install,
            CliOperation::Start => Self::Start,
            CliOperation::Stop => Self::Stop,
            CliOperation::Test => Self::Test,
            CliOperation::Enable => Self::Enable,
            CliOperation::Disable => Self::Disable,
            CliOperation::Delete => Self::Delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliTargetKind {
    Server,
    CatalogEntry,
    Gateway,
}

impl From<CliTargetKind> for TargetKind {
    fn from(value: CliTargetKind) -> Self {
        match value {
            CliTargetKind::Server => Self::Server,
            CliTargetKind::CatalogEntry => Self::CatalogEntry,
            CliTargetKind::Gateway => Self::Gateway,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliJobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl From<CliJobStatus> for JobStatus {
    fn from(value: CliJobStatus) -> Self {
        match value {
            CliJobStatus::Pending => Self::Pending,
            CliJobStatus::Running => Self::Running,
            CliJobStatus::Completed => Self::Completed,
            CliJobStatus::Failed => Self::Failed,
            CliJobStatus::Cancelled => Self::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Cli, CliCommand, CliOperation, CliTargetKind};
    use clap::Parser;

    #[test]
    fn unit_cli_defaults_match_engine_profiles() {
        let cli = Cli::try_parse_from(["gantry", "sweep"]).expect("parse");
        assert_eq!(cli.base_command, "docker-mcp");
        assert_eq!(cli.timeout_ms, 30_000);
        assert_eq!(cli.long_running_timeout_ms, 300_000);
        assert_eq!(cli.max_retries, 2);
        assert_eq!(cli.retry_delay_ms, 1_000);
        assert_eq!(cli.long_running_max_retries, 3);
        assert_eq!(cli.long_running_retry_delay_ms, 2_000);
        assert_eq!(cli.max_buffer_bytes, 1024 * 1024);
        assert_eq!(cli.idempotency_ttl_secs, 86_400);
        assert_eq!(cli.job_retention_days, 30);
        assert!(matches!(cli.command, CliCommand::Sweep));
    }

    #[test]
    fn functional_submit_parses_repeated_args_and_idempotency_pair() {
        let cli = Cli::try_parse_from([
            "gantry",
            "--timeout-ms",
            "0",
            "submit",
            "--operation",
            "install",
            "--target-kind",
            "catalog-entry",
            "--target-id",
            "github",
            "--arg",
            "--force",
            "--arg",
            "--quiet",
            "--idempotency-key",
            "req-1",
            "--scope",
            "install-server",
        ])
        .expect("parse submit");
        assert_eq!(cli.timeout_ms, 0);
        let CliCommand::Submit(submit) = cli.command else {
            panic!("expected submit command");
        };
        assert_eq!(submit.operation, CliOperation::Install);
        assert_eq!(submit.target_kind, CliTargetKind::CatalogEntry);
        assert_eq!(submit.args, vec!["--force", "--quiet"]);
        assert_eq!(submit.idempotency_key.as_deref(), Some("req-1"));
    }

    #[test]
    fn regression_idempotency_key_requires_scope_and_zero_limits_are_rejected() {
        assert!(Cli::try_parse_from([
            "gantry",
            "submit",
            "--operation",
            "enable",
            "--target-id",
            "srv-1",
            "--idempotency-key",
            "req-1",
        ])
        .is_err());
        assert!(Cli::try_parse_from(["gantry", "--max-buffer-bytes", "0", "sweep"]).is_err());
        assert!(Cli::try_parse_from(["gantry", "list", "--limit", "0"]).is_err());
        assert!(Cli::try_parse_from([
            "gantry",
            "submit",
            "--operation",
            "reboot",
            "--target-id",
            "srv-1"
        ])
        .is_err());
    }
}
