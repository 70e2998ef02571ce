use gantry_job_store::JobStoreError;
use gantry_job_types::{JobStatus, JobTarget};
use gantry_sanitizer::SanitizeError;
use thiserror::Error;

/// Synchronous failures surfaced to orchestrator callers.
///
/// Execution failures never appear here; they are recorded on the job.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Sanitize(#[from] SanitizeError),
    #[error("job '{0}' not found")]
    NotFound(String),
    #[error("job '{job_id}' is already {status}")]
    InvalidState { job_id: String, status: JobStatus },
    #[error("idempotency key '{key}' in scope '{scope}' was already used for a different request (job '{job_id}')")]
    IdempotencyConflict {
        key: String,
        scope: String,
        job_id: String,
    },
    #[error("target {target} already has active job '{job_id}'")]
    TargetBusy { target: JobTarget, job_id: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Store(JobStoreError),
}

impl OrchestratorError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Sanitize(error) => error.code(),
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::IdempotencyConflict { .. } => "IDEMPOTENCY_CONFLICT",
            Self::TargetBusy { .. } => "TARGET_BUSY",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Store(_) => "STORE_ERROR",
        }
    }

    /// Returns true for errors produced before any job was created.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Sanitize(_) | Self::InvalidRequest(_))
    }
}

impl From<JobStoreError> for OrchestratorError {
    fn from(error: JobStoreError) -> Self {
        match error {
            JobStoreError::JobNotFound(job_id) => Self::NotFound(job_id),
            JobStoreError::TargetBusy { target, job_id } => Self::TargetBusy { target, job_id },
            JobStoreError::InvalidJobTransition { job_id, from, .. } => Self::InvalidState {
                job_id,
                status: from,
            },
            other => Self::Store(other),
        }
    }
}
