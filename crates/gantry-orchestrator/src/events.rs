use chrono::{DateTime, Utc};
use gantry_job_types::{Job, JobProgress, JobStatus, OperationType};
use serde::Serialize;

pub const JOB_EVENT_SCHEMA_VERSION: u32 = 1;

/// Snapshot broadcast to subscribers whenever a job row changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEvent {
    pub schema_version: u32,
    pub job_id: String,
    pub operation_type: OperationType,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<JobProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for JobEvent {
    fn from(job: &Job) -> Self {
        Self {
            schema_version: JOB_EVENT_SCHEMA_VERSION,
            job_id: job.id.clone(),
            operation_type: job.operation_type,
            status: job.status,
            progress: job.progress.clone(),
            error_code: job.error.as_ref().map(|error| error.code.clone()),
            updated_at: job.updated_at,
        }
    }
}
