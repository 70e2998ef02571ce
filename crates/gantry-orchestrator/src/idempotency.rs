use gantry_job_types::JobStatus;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Result of `JobOrchestrator::submit_idempotent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdempotentSubmitReceipt {
    pub job_id: String,
    pub status: JobStatus,
    pub estimated_duration_ms: u64,
    /// True when an earlier submission with the same key produced the job.
    pub replayed: bool,
}

/// Serializes `value` with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut output = String::new();
    write_canonical(value, &mut output);
    output
}

/// SHA-256 hex digest of the canonical encoding of a request body.
pub fn request_hash(value: &Value) -> String {
    let digest = Sha256::digest(canonical_json(value).as_bytes());
    format!("{digest:x}")
}

fn write_canonical(value: &Value, output: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by(|left, right| left.0.cmp(right.0));
            output.push('{');
            for (index, (key, item)) in entries.into_iter().enumerate() {
                if index > 0 {
                    output.push(',');
                }
                output.push_str(&Value::String(key.clone()).to_string());
                output.push(':');
                write_canonical(item, output);
            }
            output.push('}');
        }
        Value::Array(items) => {
            output.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    output.push(',');
                }
                write_canonical(item, output);
            }
            output.push(']');
        }
        scalar => output.push_str(&scalar.to_string()),
    }
}
