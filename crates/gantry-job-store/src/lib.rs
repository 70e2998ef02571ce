//! Job store abstractions and in-memory backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

mod sqlite;

pub use gantry_job_types::{
    IdempotencyRecord, Job, JobError, JobProgress, JobQuery, JobStatus, JobTarget, OperationType,
    TargetKind,
};
pub use sqlite::SqliteJobStore;

/// Result type for job store operations.
pub type StoreResult<T> = Result<T, JobStoreError>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job '{0}' already exists")]
    JobAlreadyExists(String),
    #[error("job '{0}' not found")]
    JobNotFound(String),
    #[error("invalid transition for job '{job_id}': {from} -> {to}")]
    InvalidJobTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("job '{job_id}' is {status}; progress is only accepted while running")]
    InvalidProgressUpdate { job_id: String, status: JobStatus },
    #[error("target {target} already has active job '{job_id}'")]
    TargetBusy { target: JobTarget, job_id: String },
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Single-row mutation applied atomically to a stored job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobTransition {
    Start,
    Progress(JobProgress),
    Complete(Value),
    Fail(JobError),
    Cancel { message: String },
}

impl JobTransition {
    /// Status the transition moves to, `None` for progress updates.
    pub fn target_status(&self) -> Option<JobStatus> {
        match self {
            Self::Start => Some(JobStatus::Running),
            Self::Progress(_) => None,
            Self::Complete(_) => Some(JobStatus::Completed),
            Self::Fail(_) => Some(JobStatus::Failed),
            Self::Cancel { .. } => Some(JobStatus::Cancelled),
        }
    }

    /// Validates and applies the transition to `job` in place.
    pub fn apply_to(self, job: &mut Job, now: DateTime<Utc>) -> StoreResult<()> {
        match self.target_status() {
            Some(next) => {
                if !job.status.can_transition_to(next) {
                    return Err(JobStoreError::InvalidJobTransition {
                        job_id: job.id.clone(),
                        from: job.status,
                        to: next,
                    });
                }
                job.status = next;
            }
            None if job.status != JobStatus::Running => {
                return Err(JobStoreError::InvalidProgressUpdate {
                    job_id: job.id.clone(),
                    status: job.status,
                });
            }
            None => {}
        }

        match self {
            Self::Start => {}
            Self::Progress(progress) => job.progress = Some(progress),
            Self::Complete(result) => {
                job.progress = Some(finished_progress(job.progress.as_ref(), "completed"));
                job.result = Some(result);
            }
            Self::Fail(error) => job.error = Some(error),
            Self::Cancel { message } => {
                let total = job.progress.as_ref().map_or(100, |progress| progress.total);
                let current = job.progress.as_ref().map_or(0, |progress| progress.current);
                job.progress = Some(JobProgress::new(current, total, message));
            }
        }
        job.updated_at = now;
        if job.status.is_terminal() {
            job.completed_at = Some(now);
        }
        Ok(())
    }
}

fn finished_progress(previous: Option<&JobProgress>, message: &str) -> JobProgress {
    let total = previous.map_or(100, |progress| progress.total);
    JobProgress::new(total, total, message)
}

/// Outcome of [`IdempotencyStore::insert_record_if_absent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyInsert {
    Inserted,
    /// A live record already holds the `(key, scope)` pair.
    Existing(IdempotencyRecord),
}

/// Async job persistence contract used by the orchestrator.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists a new pending job. Fails with `TargetBusy` while another
    /// pending or running job holds the same target.
    async fn create_job(&self, job: Job) -> StoreResult<()>;
    async fn get_job(&self, job_id: &str) -> StoreResult<Option<Job>>;
    async fn apply_transition(&self, job_id: &str, transition: JobTransition) -> StoreResult<Job>;
    async fn query_jobs(&self, query: JobQuery) -> StoreResult<Vec<Job>>;
    async fn active_jobs_for_target(&self, target: &JobTarget) -> StoreResult<Vec<Job>> {
        self.query_jobs(JobQuery::active().with_target(target.clone()))
            .await
    }
    /// Deletes terminal jobs completed strictly before `before`.
    async fn purge_terminal_jobs(&self, before: DateTime<Utc>) -> StoreResult<usize>;
}

/// Async idempotency-key index.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get_record(&self, key: &str, scope: &str) -> StoreResult<Option<IdempotencyRecord>>;
    /// Atomically inserts `record` unless a live record holds its key.
    /// Records expired as of `record.created_at` are replaced.
    async fn insert_record_if_absent(
        &self,
        record: IdempotencyRecord,
    ) -> StoreResult<IdempotencyInsert>;
    async fn delete_record(&self, key: &str, scope: &str) -> StoreResult<bool>;
    async fn purge_expired_records(&self, now: DateTime<Utc>) -> StoreResult<usize>;
}

/// In-memory implementation for tests and local experimentation.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    jobs: HashMap<String, Job>,
    records: HashMap<(String, String), IdempotencyRecord>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, job: Job) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.jobs.contains_key(&job.id) {
            return Err(JobStoreError::JobAlreadyExists(job.id));
        }
        if let Some(active) = inner
            .jobs
            .values()
            .find(|existing| existing.status.is_active() && existing.target == job.target)
        {
            return Err(JobStoreError::TargetBusy {
                target: job.target,
                job_id: active.id.clone(),
            });
        }
        inner.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> StoreResult<Option<Job>> {
        let inner = self.inner.read().await;
        Ok(inner.jobs.get(job_id).cloned())
    }

    async fn apply_transition(&self, job_id: &str, transition: JobTransition) -> StoreResult<Job> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| JobStoreError::JobNotFound(job_id.to_string()))?;
        let mut updated = job.clone();
        transition.apply_to(&mut updated, Utc::now())?;
        *job = updated.clone();
        Ok(updated)
    }

    async fn query_jobs(&self, query: JobQuery) -> StoreResult<Vec<Job>> {
        let inner = self.inner.read().await;
        let mut jobs = inner
            .jobs
            .values()
            .filter(|job| query.matches(job))
            .cloned()
            .collect::<Vec<_>>();
        jobs.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.id.cmp(&right.id))
        });
        if let Some(limit) = query.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn purge_terminal_jobs(&self, before: DateTime<Utc>) -> StoreResult<usize> {
        let mut inner = self.inner.write().await;
        let initial = inner.jobs.len();
        inner.jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.completed_at.is_some_and(|at| at < before))
        });
        Ok(initial - inner.jobs.len())
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryJobStore {
    async fn get_record(&self, key: &str, scope: &str) -> StoreResult<Option<IdempotencyRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .get(&(key.to_string(), scope.to_string()))
            .cloned())
    }

    async fn insert_record_if_absent(
        &self,
        record: IdempotencyRecord,
    ) -> StoreResult<IdempotencyInsert> {
        let mut inner = self.inner.write().await;
        let record_key = (record.key.clone(), record.scope.clone());
        if let Some(existing) = inner.records.get(&record_key) {
            if !existing.is_expired(record.created_at) {
                return Ok(IdempotencyInsert::Existing(existing.clone()));
            }
        }
        inner.records.insert(record_key, record);
        Ok(IdempotencyInsert::Inserted)
    }

    async fn delete_record(&self, key: &str, scope: &str) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .records
            .remove(&(key.to_string(), scope.to_string()))
            .is_some())
    }

    async fn purge_expired_records(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut inner = self.inner.write().await;
        let initial = inner.records.len();
        inner.records.retain(|_, record| !record.is_expired(now));
        Ok(initial - inner.records.len())
    }
}
