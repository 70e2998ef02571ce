use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use gantry_job_store::SqliteJobStore;
use gantry_job_types::{Job, JobQuery, JobTarget, TargetKind};
use gantry_orchestrator::{JobOrchestrator, JobOrchestratorConfig, SubmitRequest};
use gantry_sanitizer::{CommandArg, CommandSanitizer, SanitizerPolicy};
use gantry_supervisor::{ExecOptions, ProcessSupervisor};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::cli_args::{Cli, CliCommand, ListArgs, SubmitArgs};

const INPUT_FLAG: &str = "--input";

pub(crate) async fn run(cli: Cli) -> Result<()> {
    let orchestrator = build_orchestrator(&cli)?;
    match cli.command {
        CliCommand::Submit(args) => run_submit(&orchestrator, args).await,
        CliCommand::Status { job_id } => {
            let job = orchestrator
                .get_status(&job_id)
                .await
                .with_context(|| format!("failed to load job '{job_id}'"))?;
            print_json(&job)
        }
        CliCommand::Cancel { job_id } => {
            let job = orchestrator
                .cancel(&job_id)
                .await
                .with_context(|| format!("failed to cancel job '{job_id}'"))?;
            print_json(&job)
        }
        CliCommand::List(args) => {
            let jobs = orchestrator
                .list_jobs(list_query(args))
                .await
                .context("failed to list jobs")?;
            print_json(&jobs)
        }
        CliCommand::Sweep => {
            let report = orchestrator
                .run_retention_sweep()
                .await
                .context("retention sweep failed")?;
            print_json(&report)
        }
        CliCommand::Recover => {
            let report = orchestrator
                .recover_interrupted_jobs()
                .await
                .context("job recovery failed")?;
            print_json(&report)
        }
    }
}

pub(crate) fn build_orchestrator(cli: &Cli) -> Result<JobOrchestrator> {
    let store = Arc::new(
        SqliteJobStore::new(&cli.state_db)
            .with_context(|| format!("failed to open job store {}", cli.state_db.display()))?,
    );
    let mut policy = SanitizerPolicy::default();
    policy.allow_command(cli.base_command.clone());
    let sanitizer = CommandSanitizer::new(policy).context("invalid sanitizer policy")?;
    JobOrchestrator::with_store(
        store,
        Arc::new(ProcessSupervisor::new()),
        sanitizer,
        orchestrator_config(cli),
    )
    .context("invalid orchestrator configuration")
}

pub(crate) fn orchestrator_config(cli: &Cli) -> JobOrchestratorConfig {
    let kill_grace = Duration::from_millis(cli.kill_grace_ms);
    let standard_options = ExecOptions::standard()
        .with_timeout(optional_timeout(cli.timeout_ms))
        .with_max_retries(cli.max_retries)
        .with_retry_delay(
            Duration::from_millis(cli.retry_delay_ms),
            ExecOptions::standard().retry_jitter,
        )
        .with_max_buffer_size(cli.max_buffer_bytes)
        .with_kill(ExecOptions::standard().kill_signal, kill_grace);
    let long_running = ExecOptions::long_running();
    let long_running_options = long_running
        .clone()
        .with_timeout(optional_timeout(cli.long_running_timeout_ms))
        .with_max_retries(cli.long_running_max_retries)
        .with_retry_delay(
            Duration::from_millis(cli.long_running_retry_delay_ms),
            long_running.retry_jitter,
        )
        .with_max_buffer_size(long_running.max_buffer_size.max(cli.max_buffer_bytes))
        .with_kill(long_running.kill_signal, kill_grace);

    JobOrchestratorConfig {
        base_command: cli.base_command.clone(),
        standard_options,
        long_running_options,
        idempotency_ttl: Duration::from_secs(cli.idempotency_ttl_secs),
        job_retention: Duration::from_secs(cli.job_retention_days.saturating_mul(24 * 60 * 60)),
        ..JobOrchestratorConfig::default()
    }
}

fn optional_timeout(timeout_ms: u64) -> Option<Duration> {
    (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms))
}

pub(crate) fn submit_request(args: &SubmitArgs) -> Result<SubmitRequest> {
    let mut request = SubmitRequest::new(
        args.operation.into(),
        JobTarget::new(args.target_kind.into(), args.target_id.clone()),
    );
    for arg in &args.args {
        request = request.with_arg(arg.as_str());
    }
    if let Some(raw) = args.input.as_deref() {
        let value = serde_json::from_str::<Value>(raw).context("--input must be valid JSON")?;
        request = request.with_arg(CommandArg::structured(INPUT_FLAG, value));
    }
    Ok(request)
}

async fn run_submit(orchestrator: &JobOrchestrator, args: SubmitArgs) -> Result<()> {
    let request = submit_request(&args)?;
    let job_id = match (args.idempotency_key.as_deref(), args.scope.as_deref()) {
        (Some(key), Some(scope)) => {
            let hash = request.request_hash();
            let receipt = orchestrator
                .submit_idempotent(key, scope, &hash, request)
                .await
                .context("job submission rejected")?;
            if receipt.replayed {
                info!(job_id = %receipt.job_id, "replaying existing job for idempotency key");
            }
            receipt.job_id
        }
        _ => {
            orchestrator
                .submit(request)
                .await
                .context("job submission rejected")?
                .job_id
        }
    };

    let poll_interval = Duration::from_millis(args.poll_interval_ms);
    let job = tokio::select! {
        job = wait_for_terminal(orchestrator, &job_id, poll_interval) => job?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            warn!(job_id = %job_id, "interrupted; cancelling job");
            if let Err(error) = orchestrator.cancel(&job_id).await {
                warn!(job_id = %job_id, error = %error, "failed to cancel job");
            }
            orchestrator.get_status(&job_id).await?
        }
    };
    orchestrator.shutdown().await;
    print_json(&job)?;
    if let Some(error) = job.error.as_ref() {
        bail!("job '{}' failed with {}: {}", job.id, error.code, error.message);
    }
    Ok(())
}

async fn wait_for_terminal(
    orchestrator: &JobOrchestrator,
    job_id: &str,
    poll_interval: Duration,
) -> Result<Job> {
    loop {
        let job = orchestrator
            .get_status(job_id)
            .await
            .with_context(|| format!("failed to poll job '{job_id}'"))?;
        if job.is_terminal() {
            return Ok(job);
        }
        tokio::time::sleep(poll_interval).await;
    }
}

fn list_query(args: ListArgs) -> JobQuery {
    let kind = args
        .target_kind
        .map(TargetKind::from)
        .unwrap_or(TargetKind::Server);
    JobQuery {
        statuses: args.status.into_iter().map(Into::into).collect(),
        operation_type: None,
        target: args.target_id.map(|id| JobTarget::new(kind, id)),
        limit: Some(args.limit),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render JSON output")?
    );
    Ok(())
}
