//! Asynchronous job orchestration over the sanitizer, supervisor and job store.

mod config;
mod error;
mod events;
mod idempotency;
mod orchestrator;

pub use config::JobOrchestratorConfig;
pub use error::OrchestratorError;
pub use events::{JobEvent, JOB_EVENT_SCHEMA_VERSION};
pub use idempotency::{canonical_json, request_hash, IdempotentSubmitReceipt};
pub use orchestrator::{
    JobOrchestrator, RecoveryReport, SubmitReceipt, SubmitRequest, SweepReport,
};
