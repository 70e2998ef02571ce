//! Job records, lifecycle states and idempotency records shared by the store and orchestrator.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Closed set of operations that can be submitted as jobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Install,
    Start,
    Stop,
    Test,
    Enable,
    Disable,
    Delete,
}

impl OperationType {
    pub const ALL: [Self; 7] = [
        Self::Install,
        Self::Start,
        Self::Stop,
        Self::Test,
        Self::Enable,
        Self::Disable,
        Self::Delete,
    ];

    /// Returns the stable wire token, also used as the external sub-command.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Test => "test",
            Self::Enable => "enable",
            Self::Disable => "disable",
            Self::Delete => "delete",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|operation| operation.as_str() == normalized)
    }

    /// Install and test calls run under the long-running execution profile.
    pub fn is_long_running(self) -> bool {
        matches!(self, Self::Install | Self::Test)
    }

    /// Rough duration hint returned to callers at submit time.
    pub fn estimated_duration_ms(self) -> u64 {
        match self {
            Self::Install => 120_000,
            Self::Test => 30_000,
            Self::Start | Self::Stop | Self::Enable | Self::Disable | Self::Delete => 15_000,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle states for a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created and waiting for its background task.
    Pending,
    /// External call in flight.
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Returns true when the job cannot transition any further.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true when the job still holds its target.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }

    pub fn ensure_transition(self, next: Self) -> Result<(), StatusTransitionError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(StatusTransitionError {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid job transition from {from} to {to}")]
pub struct StatusTransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Kind of resource a job acts on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum TargetKind {
    Server,
    CatalogEntry,
    Gateway,
}

impl TargetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::CatalogEntry => "catalogEntry",
            Self::Gateway => "gateway",
        }
    }

    /// Noun passed to the external tool after the operation.
    pub fn command_noun(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::CatalogEntry => "catalog",
            Self::Gateway => "gateway",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "server" => Some(Self::Server),
            "catalogentry" | "catalog_entry" | "catalog-entry" | "catalog" => {
                Some(Self::CatalogEntry)
            }
            "gateway" => Some(Self::Gateway),
            _ => None,
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobTarget {
    pub kind: TargetKind,
    pub id: String,
}

impl JobTarget {
    pub fn new(kind: TargetKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn server(id: impl Into<String>) -> Self {
        Self::new(TargetKind::Server, id)
    }
}

impl fmt::Display for JobTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobProgress {
    pub current: u32,
    pub total: u32,
    pub message: String,
}

impl JobProgress {
    pub fn new(current: u32, total: u32, message: impl Into<String>) -> Self {
        Self {
            current: current.min(total),
            total,
            message: message.into(),
        }
    }
}

/// Failure payload recorded on a failed job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

impl JobError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Unit of asynchronous work.
///
/// `result` is only set on `completed` and `error` only on `failed`;
/// `completed_at` is set exactly when the status is terminal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub operation_type: OperationType,
    pub status: JobStatus,
    pub target: JobTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<JobProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Builds a fresh pending job.
    pub fn pending(
        id: impl Into<String>,
        operation_type: OperationType,
        target: JobTarget,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            operation_type,
            status: JobStatus::Pending,
            target,
            progress: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Maps a caller key within a scope to the job it produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub key: String,
    pub scope: String,
    pub request_hash: String,
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Filter for job listings. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobQuery {
    pub statuses: Vec<JobStatus>,
    pub operation_type: Option<OperationType>,
    pub target: Option<JobTarget>,
    pub limit: Option<usize>,
}

impl JobQuery {
    pub fn active() -> Self {
        Self {
            statuses: vec![JobStatus::Pending, JobStatus::Running],
            ..Self::default()
        }
    }

    pub fn with_target(mut self, target: JobTarget) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && self
                .operation_type
                .is_none_or(|operation| operation == job.operation_type)
            && self
                .target
                .as_ref()
                .is_none_or(|target| target == &job.target)
    }
}
