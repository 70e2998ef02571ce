use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use gantry_core::{current_unix_timestamp_ms, truncate_utf8, CancellationToken};
use gantry_job_store::{
    IdempotencyInsert, IdempotencyStore, JobStore, JobStoreError, JobTransition, StoreResult,
};
use gantry_job_types::{
    IdempotencyRecord, Job, JobError, JobProgress, JobQuery, JobStatus, JobTarget, OperationType,
};
use gantry_sanitizer::{CommandArg, CommandSanitizer};
use gantry_supervisor::{CommandExecutor, ExecError, ExecErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{sync::broadcast, task::JoinSet};
use tracing::{debug, info, warn};

use crate::{
    idempotency::request_hash, IdempotentSubmitReceipt, JobEvent, JobOrchestratorConfig,
    OrchestratorError,
};

const JOB_ID_PREFIX: &str = "job";
const PROGRESS_TOTAL: u32 = 100;
const PROGRESS_DISPATCHING: u32 = 10;
const PROGRESS_FINALIZING: u32 = 80;
const CANCEL_REQUESTED_MESSAGE: &str = "cancellation requested";
const SHUTDOWN_MESSAGE: &str = "cancelled by orchestrator shutdown";
const INTERRUPTED_CODE: &str = "INTERRUPTED";
const STORE_ERROR_CODE: &str = "STORE_ERROR";
const TERMINAL_WRITE_ATTEMPTS: u32 = 3;
const TERMINAL_WRITE_BACKOFF: Duration = Duration::from_millis(50);
const IDEMPOTENCY_ROUNDS: usize = 3;

static JOB_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Operation request accepted by [`JobOrchestrator::submit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub operation: OperationType,
    pub target: JobTarget,
    #[serde(default)]
    pub args: Vec<CommandArg>,
}

impl SubmitRequest {
    pub fn new(operation: OperationType, target: JobTarget) -> Self {
        Self {
            operation,
            target,
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<CommandArg>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Hash of the normalized request, suitable for `submit_idempotent`.
    pub fn request_hash(&self) -> String {
        request_hash(&json!({
            "operation": self.operation.as_str(),
            "target": { "kind": self.target.kind.as_str(), "id": self.target.id },
            "args": self.args,
        }))
    }
}

/// Handle returned synchronously from a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    pub job_id: String,
    pub status: JobStatus,
    pub estimated_duration_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub jobs_purged: usize,
    pub records_purged: usize,
}

struct JobOrchestratorInner {
    store: Arc<dyn JobStore>,
    idempotency: Arc<dyn IdempotencyStore>,
    executor: Arc<dyn CommandExecutor>,
    sanitizer: CommandSanitizer,
    config: JobOrchestratorConfig,
    cancellations: Mutex<HashMap<String, CancellationToken>>,
    tasks: Mutex<JoinSet<()>>,
    events: broadcast::Sender<JobEvent>,
    shutting_down: AtomicBool,
}

/// Creates jobs, runs them in background tasks and records their outcome.
///
/// Cloning is cheap; every clone drives the same set of jobs. Each job has
/// exactly one background task, which is the only writer of its row apart
/// from `cancel`, `shutdown` and `recover_interrupted_jobs`.
#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<JobOrchestratorInner>,
}

impl fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("config", &self.inner.config)
            .field(
                "in_flight",
                &lock_unpoisoned(&self.inner.cancellations).len(),
            )
            .finish_non_exhaustive()
    }
}

impl JobOrchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        executor: Arc<dyn CommandExecutor>,
        sanitizer: CommandSanitizer,
        config: JobOrchestratorConfig,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        if !sanitizer
            .policy()
            .allowed_commands
            .iter()
            .any(|allowed| allowed == &config.base_command)
        {
            anyhow::bail!(
                "base command '{}' is not allowed by the sanitizer policy",
                config.base_command
            );
        }
        let (events, _) = broadcast::channel(config.event_capacity);
        Ok(Self {
            inner: Arc::new(JobOrchestratorInner {
                store,
                idempotency,
                executor,
                sanitizer,
                config,
                cancellations: Mutex::new(HashMap::new()),
                tasks: Mutex::new(JoinSet::new()),
                events,
                shutting_down: AtomicBool::new(false),
            }),
        })
    }

    /// Builds an orchestrator whose jobs and idempotency records share one backend.
    pub fn with_store<S>(
        store: Arc<S>,
        executor: Arc<dyn CommandExecutor>,
        sanitizer: CommandSanitizer,
        config: JobOrchestratorConfig,
    ) -> anyhow::Result<Self>
    where
        S: JobStore + IdempotencyStore + 'static,
    {
        Self::new(store.clone(), store, executor, sanitizer, config)
    }

    pub fn config(&self) -> &JobOrchestratorConfig {
        &self.inner.config
    }

    /// Validates `request`, persists a pending job and schedules it.
    ///
    /// Returns without waiting on the external process. Validation failures
    /// return an error and create no job.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, OrchestratorError> {
        self.ensure_accepting()?;
        let argv = self.sanitize_request(&request)?;
        self.start_job(next_job_id(), &request, argv).await
    }

    /// Submits at most one job per live `(key, scope)` pair.
    ///
    /// A repeat with the same `request_hash` replays the original job id; a
    /// repeat with a different hash fails with `IdempotencyConflict`.
    pub async fn submit_idempotent(
        &self,
        key: &str,
        scope: &str,
        request_hash: &str,
        request: SubmitRequest,
    ) -> Result<IdempotentSubmitReceipt, OrchestratorError> {
        self.ensure_accepting()?;
        if key.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "idempotency key must be non-empty".to_string(),
            ));
        }
        if scope.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "idempotency scope must be non-empty".to_string(),
            ));
        }
        if request_hash.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "request hash must be non-empty".to_string(),
            ));
        }
        let argv = self.sanitize_request(&request)?;

        for _ in 0..IDEMPOTENCY_ROUNDS {
            let now = Utc::now();
            if let Some(existing) = self.inner.idempotency.get_record(key, scope).await? {
                if !existing.is_expired(now) {
                    match self.replay(existing, request_hash, request.operation).await? {
                        Some(receipt) => return Ok(receipt),
                        None => continue,
                    }
                }
            }

            let job_id = next_job_id();
            let record = IdempotencyRecord {
                key: key.to_string(),
                scope: scope.to_string(),
                request_hash: request_hash.to_string(),
                job_id: job_id.clone(),
                created_at: now,
                expires_at: now
                    .checked_add_signed(self.inner.config.idempotency_ttl_delta())
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            };
            if let IdempotencyInsert::Existing(existing) =
                self.inner.idempotency.insert_record_if_absent(record).await?
            {
                match self.replay(existing, request_hash, request.operation).await? {
                    Some(receipt) => return Ok(receipt),
                    None => continue,
                }
            }

            return match self.start_job(job_id, &request, argv).await {
                Ok(receipt) => Ok(IdempotentSubmitReceipt {
                    job_id: receipt.job_id,
                    status: receipt.status,
                    estimated_duration_ms: receipt.estimated_duration_ms,
                    replayed: false,
                }),
                Err(error) => {
                    if let Err(cleanup) = self.inner.idempotency.delete_record(key, scope).await {
                        warn!(key, scope, error = %cleanup, "failed to release idempotency reservation");
                    }
                    Err(error)
                }
            };
        }
        Err(OrchestratorError::InvalidRequest(format!(
            "idempotency reservation for key '{key}' in scope '{scope}' kept changing; retry the request"
        )))
    }

    /// Returns the current projection of a job.
    pub async fn get_status(&self, job_id: &str) -> Result<Job, OrchestratorError> {
        self.inner
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(job_id.to_string()))
    }

    /// Marks a pending or running job cancelled and signals its process call.
    ///
    /// No later state change is recorded for the job, although side effects
    /// of an external call already in flight are not undone.
    pub async fn cancel(&self, job_id: &str) -> Result<Job, OrchestratorError> {
        let job = self.get_status(job_id).await?;
        if job.is_terminal() {
            return Err(OrchestratorError::InvalidState {
                job_id: job.id,
                status: job.status,
            });
        }

        let cancelled = self
            .inner
            .store
            .apply_transition(
                job_id,
                JobTransition::Cancel {
                    message: CANCEL_REQUESTED_MESSAGE.to_string(),
                },
            )
            .await?;
        self.inner.publish(&cancelled);
        if let Some(token) = lock_unpoisoned(&self.inner.cancellations).get(job_id) {
            token.cancel();
        }
        info!(job_id, "job cancelled");
        Ok(cancelled)
    }

    pub async fn list_jobs(&self, query: JobQuery) -> Result<Vec<Job>, OrchestratorError> {
        Ok(self.inner.store.query_jobs(query).await?)
    }

    pub async fn active_jobs_for_target(
        &self,
        target: &JobTarget,
    ) -> Result<Vec<Job>, OrchestratorError> {
        Ok(self.inner.store.active_jobs_for_target(target).await?)
    }

    /// Subscribes to job change events. Slow receivers observe `Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Number of jobs whose background task has not finished.
    pub fn in_flight(&self) -> usize {
        lock_unpoisoned(&self.inner.cancellations).len()
    }

    /// Settles jobs left non-terminal by a previous process.
    ///
    /// Running jobs fail with `INTERRUPTED`; pending jobs are cancelled.
    /// Jobs owned by this orchestrator are left alone.
    pub async fn recover_interrupted_jobs(&self) -> Result<RecoveryReport, OrchestratorError> {
        let owned = lock_unpoisoned(&self.inner.cancellations)
            .keys()
            .cloned()
            .collect::<HashSet<_>>();
        let mut report = RecoveryReport::default();

        for job in self.inner.store.query_jobs(JobQuery::active()).await? {
            if owned.contains(&job.id) {
                continue;
            }
            let transition = match job.status {
                JobStatus::Running => JobTransition::Fail(JobError::new(
                    INTERRUPTED_CODE,
                    "job was running when the previous orchestrator process exited",
                )),
                JobStatus::Pending => JobTransition::Cancel {
                    message: "job never started before the previous orchestrator process exited"
                        .to_string(),
                },
                _ => continue,
            };
            match self.inner.transition(&job.id, transition).await? {
                Some(updated) if updated.status == JobStatus::Failed => report.failed += 1,
                Some(updated) if updated.status == JobStatus::Cancelled => report.cancelled += 1,
                _ => {}
            }
        }

        if report != RecoveryReport::default() {
            warn!(
                failed = report.failed,
                cancelled = report.cancelled,
                "recovered interrupted jobs"
            );
        }
        Ok(report)
    }

    /// Purges terminal jobs older than the retention horizon and expired
    /// idempotency records.
    pub async fn run_retention_sweep(&self) -> Result<SweepReport, OrchestratorError> {
        let now = Utc::now();
        let horizon = now
            .checked_sub_signed(self.inner.config.job_retention_delta())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let report = SweepReport {
            jobs_purged: self.inner.store.purge_terminal_jobs(horizon).await?,
            records_purged: self.inner.idempotency.purge_expired_records(now).await?,
        };
        info!(
            jobs_purged = report.jobs_purged,
            records_purged = report.records_purged,
            "retention sweep finished"
        );
        Ok(report)
    }

    /// Cancels in-flight jobs, waits for their tasks and refuses new work.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let in_flight = lock_unpoisoned(&self.inner.cancellations)
            .iter()
            .map(|(job_id, token)| (job_id.clone(), token.clone()))
            .collect::<Vec<_>>();
        for (job_id, token) in in_flight {
            let transition = JobTransition::Cancel {
                message: SHUTDOWN_MESSAGE.to_string(),
            };
            if let Err(error) = self.inner.transition(&job_id, transition).await {
                warn!(job_id = %job_id, error = %error, "failed to cancel job during shutdown");
            }
            token.cancel();
        }

        let mut tasks = std::mem::take(&mut *lock_unpoisoned(&self.inner.tasks));
        while let Some(joined) = tasks.join_next().await {
            if let Err(error) = joined {
                warn!(error = %error, "job task ended abnormally");
            }
        }
        info!("job orchestrator shut down");
    }

    fn ensure_accepting(&self) -> Result<(), OrchestratorError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(OrchestratorError::InvalidRequest(
                "orchestrator is shutting down".to_string(),
            ));
        }
        Ok(())
    }

    fn sanitize_request(&self, request: &SubmitRequest) -> Result<Vec<String>, OrchestratorError> {
        let mut args = Vec::with_capacity(request.args.len() + 2);
        args.push(CommandArg::plain(request.target.kind.command_noun()));
        args.push(CommandArg::plain(request.target.id.clone()));
        args.extend(request.args.iter().cloned());

        self.inner
            .sanitizer
            .sanitize(
                &self.inner.config.base_command,
                request.operation.as_str(),
                &args,
            )
            .map_err(|error| {
                warn!(
                    operation = request.operation.as_str(),
                    target = %request.target,
                    code = error.code(),
                    error = %error,
                    "rejected job request"
                );
                OrchestratorError::from(error)
            })
    }

    async fn start_job(
        &self,
        job_id: String,
        request: &SubmitRequest,
        argv: Vec<String>,
    ) -> Result<SubmitReceipt, OrchestratorError> {
        let job = Job::pending(
            job_id.clone(),
            request.operation,
            request.target.clone(),
            Utc::now(),
        );
        self.inner.store.create_job(job.clone()).await?;
        self.inner.publish(&job);

        let cancel = CancellationToken::new();
        lock_unpoisoned(&self.inner.cancellations).insert(job_id.clone(), cancel.clone());
        {
            let inner = self.inner.clone();
            let task_job_id = job_id.clone();
            let operation = request.operation;
            let mut tasks = lock_unpoisoned(&self.inner.tasks);
            while tasks.try_join_next().is_some() {}
            tasks.spawn(async move {
                run_job(inner, task_job_id, operation, argv, cancel).await;
            });
        }

        info!(
            job_id = %job_id,
            operation = request.operation.as_str(),
            target = %request.target,
            "job submitted"
        );
        Ok(SubmitReceipt {
            job_id,
            status: JobStatus::Pending,
            estimated_duration_ms: request.operation.estimated_duration_ms(),
        })
    }

    async fn replay(
        &self,
        record: IdempotencyRecord,
        request_hash: &str,
        operation: OperationType,
    ) -> Result<Option<IdempotentSubmitReceipt>, OrchestratorError> {
        if record.request_hash != request_hash {
            warn!(
                key = %record.key,
                scope = %record.scope,
                job_id = %record.job_id,
                "idempotency key reused with a different request"
            );
            return Err(OrchestratorError::IdempotencyConflict {
                key: record.key,
                scope: record.scope,
                job_id: record.job_id,
            });
        }

        let job = match self.inner.store.get_job(&record.job_id).await? {
            Some(job) => Some(job),
            None => {
                // A reservation whose job row is missing is either still being
                // created or was released after a failed start.
                let current = self
                    .inner
                    .idempotency
                    .get_record(&record.key, &record.scope)
                    .await?;
                if current.as_ref().map(|current| current.job_id.as_str())
                    != Some(record.job_id.as_str())
                {
                    debug!(job_id = %record.job_id, "idempotency reservation released during replay");
                    return Ok(None);
                }
                None
            }
        };
        let status = job.as_ref().map_or(JobStatus::Pending, |job| job.status);
        let operation = job.as_ref().map_or(operation, |job| job.operation_type);
        debug!(job_id = %record.job_id, "replayed idempotent submission");
        Ok(Some(IdempotentSubmitReceipt {
            job_id: record.job_id,
            status,
            estimated_duration_ms: operation.estimated_duration_ms(),
            replayed: true,
        }))
    }
}

impl JobOrchestratorInner {
    /// Applies a transition, returning `None` when the job already left the
    /// state the transition expects.
    async fn transition(&self, job_id: &str, transition: JobTransition) -> StoreResult<Option<Job>> {
        match self.store.apply_transition(job_id, transition).await {
            Ok(job) => {
                self.publish(&job);
                Ok(Some(job))
            }
            Err(JobStoreError::InvalidJobTransition { from, to, .. }) => {
                debug!(job_id, from = from.as_str(), to = to.as_str(), "skipped stale job transition");
                Ok(None)
            }
            Err(JobStoreError::InvalidProgressUpdate { status, .. }) => {
                debug!(job_id, status = status.as_str(), "skipped stale progress update");
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    fn publish(&self, job: &Job) {
        let _ = self.events.send(JobEvent::from(job));
    }
}

async fn run_job(
    inner: Arc<JobOrchestratorInner>,
    job_id: String,
    operation: OperationType,
    argv: Vec<String>,
    cancel: CancellationToken,
) {
    let outcome = match drive_job(&inner, &job_id, operation, &argv, &cancel).await {
        Ok(outcome) => outcome,
        Err(error) => {
            warn!(job_id = %job_id, error = %error, "failed to record job progress");
            Some(store_failure(&error))
        }
    };
    if let Some(transition) = outcome {
        settle_job(&inner, &job_id, transition).await;
    }
    lock_unpoisoned(&inner.cancellations).remove(&job_id);
}

/// Runs the command and returns the terminal transition to record, or `None`
/// when the job was settled elsewhere before it started.
async fn drive_job(
    inner: &JobOrchestratorInner,
    job_id: &str,
    operation: OperationType,
    argv: &[String],
    cancel: &CancellationToken,
) -> StoreResult<Option<JobTransition>> {
    if cancel.is_cancelled() || inner.transition(job_id, JobTransition::Start).await?.is_none() {
        debug!(job_id, "job cancelled before start");
        return Ok(None);
    }
    inner
        .transition(
            job_id,
            JobTransition::Progress(JobProgress::new(
                PROGRESS_DISPATCHING,
                PROGRESS_TOTAL,
                "dispatching",
            )),
        )
        .await?;

    let options = inner.config.options_for(operation);
    let transition = match inner.executor.execute(argv, options, cancel).await {
        Ok(output) => {
            inner
                .transition(
                    job_id,
                    JobTransition::Progress(JobProgress::new(
                        PROGRESS_FINALIZING,
                        PROGRESS_TOTAL,
                        "finalizing",
                    )),
                )
                .await?;
            info!(
                job_id,
                operation = operation.as_str(),
                retry_count = output.retry_count,
                elapsed_ms = u64::try_from(output.elapsed.as_millis()).unwrap_or(u64::MAX),
                "job command succeeded"
            );
            JobTransition::Complete(parse_command_output(&output.stdout))
        }
        Err(error) if error.kind == ExecErrorKind::Cancelled => JobTransition::Cancel {
            message: CANCEL_REQUESTED_MESSAGE.to_string(),
        },
        Err(error) => {
            warn!(
                job_id,
                operation = operation.as_str(),
                code = error.code(),
                exit_code = error.exit_code,
                retry_count = error.retry_count,
                error = %error,
                "job command failed"
            );
            JobTransition::Fail(job_error_from_exec(&error, inner.config.stderr_excerpt_bytes))
        }
    };
    Ok(Some(transition))
}

/// Records the job's terminal state so its target is released.
///
/// If `transition` cannot be written, the job is failed with `STORE_ERROR`
/// instead. A job that still cannot be written stays non-terminal for
/// `recover_interrupted_jobs`.
async fn settle_job(inner: &JobOrchestratorInner, job_id: &str, transition: JobTransition) {
    let is_store_failure =
        matches!(&transition, JobTransition::Fail(error) if error.code == STORE_ERROR_CODE);
    let error = match write_terminal(inner, job_id, transition).await {
        Ok(()) => return,
        Err(error) => error,
    };
    if !is_store_failure && write_terminal(inner, job_id, store_failure(&error)).await.is_ok() {
        return;
    }
    warn!(
        job_id,
        error = %error,
        "job left non-terminal after store failures; recovery will settle it"
    );
}

async fn write_terminal(
    inner: &JobOrchestratorInner,
    job_id: &str,
    transition: JobTransition,
) -> StoreResult<()> {
    let mut attempt = 1_u32;
    loop {
        match inner.transition(job_id, transition.clone()).await {
            Ok(_) => return Ok(()),
            Err(error) if attempt >= TERMINAL_WRITE_ATTEMPTS => return Err(error),
            Err(error) => {
                warn!(job_id, attempt, error = %error, "retrying terminal job write");
                tokio::time::sleep(TERMINAL_WRITE_BACKOFF * attempt).await;
                attempt += 1;
            }
        }
    }
}

fn store_failure(error: &JobStoreError) -> JobTransition {
    JobTransition::Fail(JobError::new(
        STORE_ERROR_CODE,
        format!("failed to record job outcome: {error}"),
    ))
}

/// JSON stdout is kept as-is; anything else is wrapped as `{"stdout": ...}`.
fn parse_command_output(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    if !trimmed.is_empty() {
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            return value;
        }
    }
    json!({ "stdout": stdout })
}

fn job_error_from_exec(error: &ExecError, stderr_limit: usize) -> JobError {
    JobError::new(error.code(), error.message.clone()).with_details(json!({
        "exit_code": error.exit_code,
        "signal": error.signal,
        "stderr": truncate_utf8(&error.stderr, stderr_limit),
        "elapsed_ms": u64::try_from(error.elapsed.as_millis()).unwrap_or(u64::MAX),
        "retry_count": error.retry_count,
    }))
}

fn next_job_id() -> String {
    let now = current_unix_timestamp_ms();
    let suffix = JOB_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{JOB_ID_PREFIX}-{now}-{suffix:04}")
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
