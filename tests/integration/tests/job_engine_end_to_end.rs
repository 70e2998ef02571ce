#![cfg(unix)]

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use gantry_job_store::{JobStore, JobTransition, SqliteJobStore};
use gantry_job_types::{Job, JobStatus, JobTarget, OperationType, TargetKind};
use gantry_orchestrator::{JobOrchestrator, JobOrchestratorConfig, SubmitRequest};
use gantry_sanitizer::{CommandArg, CommandSanitizer, SanitizerPolicy};
use gantry_supervisor::{ExecOptions, KillSignal, ProcessSupervisor};
use serde_json::json;
use tempfile::TempDir;

const FAKE_TOOL: &str = r#"#!/bin/sh
op="$1"
kind="$2"
id="$3"
case "$op" in
  enable)
    printf '{"enabled":"%s","kind":"%s"}\n' "$id" "$kind"
    ;;
  disable)
    echo "refusing to disable $id" >&2
    exit 3
    ;;
  start)
    exec sleep 30
    ;;
  install)
    shift 3
    printf '%s\n' "$@"
    ;;
  *)
    echo "unknown operation $op" >&2
    exit 64
    ;;
esac
"#;

struct Harness {
    _root: TempDir,
    db_path: PathBuf,
    tool_path: String,
}

impl Harness {
    fn new() -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let tool = root.path().join("fake-mcp");
        fs::write(&tool, FAKE_TOOL).expect("write fake tool");
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).expect("chmod fake tool");
        Self {
            db_path: root.path().join("state").join("jobs.sqlite"),
            tool_path: tool.to_str().expect("utf8 tool path").to_string(),
            _root: root,
        }
    }

    fn store(&self) -> Arc<SqliteJobStore> {
        Arc::new(SqliteJobStore::new(&self.db_path).expect("open sqlite store"))
    }

    fn orchestrator(&self) -> JobOrchestrator {
        let mut policy = SanitizerPolicy::default();
        policy.allow_command(self.tool_path.clone());
        let sanitizer = CommandSanitizer::new(policy).expect("sanitizer");
        let fast = |options: ExecOptions| {
            options
                .with_max_retries(2)
                .with_retry_delay(Duration::from_millis(10), Duration::ZERO)
                .with_kill(KillSignal::Terminate, Duration::from_millis(200))
        };
        let config = JobOrchestratorConfig {
            base_command: self.tool_path.clone(),
            standard_options: fast(ExecOptions::standard()),
            long_running_options: fast(ExecOptions::long_running()),
            ..JobOrchestratorConfig::default()
        };
        JobOrchestrator::with_store(
            self.store(),
            Arc::new(ProcessSupervisor::new()),
            sanitizer,
            config,
        )
        .expect("orchestrator")
    }
}

async fn wait_for_status(
    orchestrator: &JobOrchestrator,
    job_id: &str,
    wanted: impl Fn(&Job) -> bool,
) -> Job {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let job = orchestrator.get_status(job_id).await.expect("job status");
        if wanted(&job) {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} stuck in {:?}",
            job.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_until_idle(orchestrator: &JobOrchestrator) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while orchestrator.in_flight() > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "job tasks still running"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn integration_completed_job_result_persists_across_store_instances() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator();
    assert!(harness.db_path.exists());

    let receipt = orchestrator
        .submit(SubmitRequest::new(
            OperationType::Enable,
            JobTarget::server("srv-1"),
        ))
        .await
        .expect("submit");
    assert_eq!(receipt.status, JobStatus::Pending);

    let job = wait_for_status(&orchestrator, &receipt.job_id, Job::is_terminal).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(
        job.result,
        Some(json!({ "enabled": "srv-1", "kind": "server" }))
    );
    wait_until_idle(&orchestrator).await;

    let reopened = harness
        .store()
        .get_job(&receipt.job_id)
        .await
        .expect("load")
        .expect("job persisted");
    assert_eq!(reopened.status, JobStatus::Completed);
    assert!(reopened.completed_at.is_some());
    assert_eq!(reopened.result, job.result);
}

#[tokio::test]
async fn integration_failed_job_records_exit_code_stderr_and_retries() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator();

    let receipt = orchestrator
        .submit(SubmitRequest::new(
            OperationType::Disable,
            JobTarget::server("srv-2"),
        ))
        .await
        .expect("submit");
    let job = wait_for_status(&orchestrator, &receipt.job_id, Job::is_terminal).await;

    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.expect("job error");
    assert_eq!(error.code, "PROCESS_ERROR");
    assert_eq!(error.details["exit_code"], json!(3));
    assert_eq!(error.details["retry_count"], json!(2));
    assert!(error.details["stderr"]
        .as_str()
        .expect("stderr excerpt")
        .contains("refusing to disable srv-2"));
}

#[tokio::test]
async fn integration_structured_input_reaches_tool_as_single_argv_token() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator();

    let request = SubmitRequest::new(
        OperationType::Install,
        JobTarget::new(TargetKind::CatalogEntry, "github"),
    )
    .with_arg(CommandArg::structured(
        "--input",
        json!({ "owner": "octo cat" }),
    ));
    let receipt = orchestrator.submit(request).await.expect("submit");
    let job = wait_for_status(&orchestrator, &receipt.job_id, Job::is_terminal).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(
        job.result,
        Some(json!({ "stdout": "--input\n{\"owner\":\"octo cat\"}\n" }))
    );
}

#[tokio::test]
async fn integration_cancel_kills_running_tool_process() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator();

    let receipt = orchestrator
        .submit(SubmitRequest::new(
            OperationType::Start,
            JobTarget::server("srv-3"),
        ))
        .await
        .expect("submit");
    wait_for_status(&orchestrator, &receipt.job_id, |job| {
        job.status == JobStatus::Running
    })
    .await;

    let cancelled = orchestrator.cancel(&receipt.job_id).await.expect("cancel");
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    // The tool sleeps for 30s; finishing well before that means it was killed.
    wait_until_idle(&orchestrator).await;
    let job = orchestrator
        .get_status(&receipt.job_id)
        .await
        .expect("status");
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.error.is_none());

    let busy_again = orchestrator
        .submit(SubmitRequest::new(
            OperationType::Enable,
            JobTarget::server("srv-3"),
        ))
        .await
        .expect("target free after cancel");
    let job = wait_for_status(&orchestrator, &busy_again.job_id, Job::is_terminal).await;
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn integration_injection_attempt_never_reaches_the_tool() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator();

    let error = orchestrator
        .submit(
            SubmitRequest::new(OperationType::Enable, JobTarget::server("srv-4"))
                .with_arg("--name=x; rm -rf /"),
        )
        .await
        .expect_err("injection rejected");
    assert!(error.is_validation());
    assert!(orchestrator
        .list_jobs(Default::default())
        .await
        .expect("list")
        .is_empty());
}

#[tokio::test]
async fn integration_restart_recovers_jobs_left_by_previous_process() {
    let harness = Harness::new();
    let store = harness.store();
    let now = Utc::now();
    store
        .create_job(Job::pending(
            "job-left-running",
            OperationType::Start,
            JobTarget::server("srv-5"),
            now,
        ))
        .await
        .expect("seed running job");
    store
        .apply_transition("job-left-running", JobTransition::Start)
        .await
        .expect("start");
    store
        .create_job(Job::pending(
            "job-left-pending",
            OperationType::Enable,
            JobTarget::server("srv-6"),
            now,
        ))
        .await
        .expect("seed pending job");

    let orchestrator = harness.orchestrator();
    let report = orchestrator
        .recover_interrupted_jobs()
        .await
        .expect("recover");
    assert_eq!(report.failed, 1);
    assert_eq!(report.cancelled, 1);

    let interrupted = orchestrator
        .get_status("job-left-running")
        .await
        .expect("status");
    assert_eq!(interrupted.status, JobStatus::Failed);
    assert_eq!(
        interrupted.error.map(|error| error.code),
        Some("INTERRUPTED".to_string())
    );
    assert_eq!(
        orchestrator
            .get_status("job-left-pending")
            .await
            .expect("status")
            .status,
        JobStatus::Cancelled
    );
}

#[tokio::test]
async fn integration_idempotent_submit_replays_across_orchestrator_restart() {
    let harness = Harness::new();
    let request = SubmitRequest::new(OperationType::Enable, JobTarget::server("srv-7"));
    let hash = request.request_hash();

    let original = harness.orchestrator();
    let first = original
        .submit_idempotent("req-7", "enable-server", &hash, request.clone())
        .await
        .expect("first submit");
    assert!(!first.replayed);

    let restarted = harness.orchestrator();
    let replay = restarted
        .submit_idempotent("req-7", "enable-server", &hash, request)
        .await
        .expect("replayed submit");
    assert!(replay.replayed);
    assert_eq!(replay.job_id, first.job_id);
    original.shutdown().await;
}
