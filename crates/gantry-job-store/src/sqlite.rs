//! SQLite-backed `JobStore` and `IdempotencyStore` with durable persistence.

use crate::{
    IdempotencyInsert, IdempotencyRecord, IdempotencyStore, Job, JobError, JobProgress, JobQuery,
    JobStatus, JobStore, JobStoreError, JobTarget, JobTransition, OperationType, StoreResult,
    TargetKind,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{
    params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension, Row,
    TransactionBehavior,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const JOB_COLUMNS: &str = "job_id, operation_type, status, target_kind, target_id, \
    progress_json, result_json, error_json, created_at, updated_at, completed_at";

/// Persistent SQLite job store shared by the orchestrator and the CLI.
#[derive(Debug)]
pub struct SqliteJobStore {
    db_path: PathBuf,
}

impl SqliteJobStore {
    /// Creates a SQLite-backed store at `path`, creating schema if needed.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self { db_path };
        let connection = store.open_connection()?;
        store.initialize_schema(&connection)?;
        debug!(db_path = %store.db_path.display(), "opened sqlite job store");
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        Ok(connection)
    }

    fn initialize_schema(&self, connection: &Connection) -> StoreResult<()> {
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                operation_type TEXT NOT NULL,
                status TEXT NOT NULL,
                target_kind TEXT NOT NULL,
                target_id TEXT NOT NULL,
                progress_json TEXT NULL,
                result_json TEXT NULL,
                error_json TEXT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs (created_at, job_id);
            CREATE INDEX IF NOT EXISTS idx_jobs_status_completed ON jobs (status, completed_at);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_active_target
                ON jobs (target_kind, target_id)
                WHERE status IN ('pending', 'running');
            CREATE INDEX IF NOT EXISTS idx_jobs_target
                ON jobs (target_kind, target_id, created_at);

            CREATE TABLE IF NOT EXISTS idempotency_records (
                idempotency_key TEXT NOT NULL,
                scope TEXT NOT NULL,
                request_hash TEXT NOT NULL,
                job_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                PRIMARY KEY (idempotency_key, scope)
            );

            CREATE INDEX IF NOT EXISTS idx_idempotency_expires ON idempotency_records (expires_at);
            "#,
        )?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create_job(&self, job: Job) -> StoreResult<()> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists = transaction
            .query_row(
                "SELECT 1 FROM jobs WHERE job_id = ?1",
                params![job.id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(JobStoreError::JobAlreadyExists(job.id));
        }

        let active: Option<String> = transaction
            .query_row(
                r#"
                SELECT job_id FROM jobs
                WHERE target_kind = ?1 AND target_id = ?2 AND status IN ('pending', 'running')
                LIMIT 1
                "#,
                params![job.target.kind.as_str(), job.target.id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(job_id) = active {
            return Err(JobStoreError::TargetBusy {
                target: job.target,
                job_id,
            });
        }

        transaction.execute(
            &format!(
                "INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                job.id,
                job.operation_type.as_str(),
                job.status.as_str(),
                job.target.kind.as_str(),
                job.target.id,
                option_json_to_db(job.progress.as_ref())?,
                option_json_to_db(job.result.as_ref())?,
                option_json_to_db(job.error.as_ref())?,
                timestamp_to_db(job.created_at),
                timestamp_to_db(job.updated_at),
                option_timestamp_to_db(job.completed_at),
            ],
        )?;
        transaction.commit()?;
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> StoreResult<Option<Job>> {
        let connection = self.open_connection()?;
        load_job(&connection, job_id)
    }

    async fn apply_transition(&self, job_id: &str, transition: JobTransition) -> StoreResult<Job> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut job = load_job(&transaction, job_id)?
            .ok_or_else(|| JobStoreError::JobNotFound(job_id.to_string()))?;
        transition.apply_to(&mut job, Utc::now())?;

        transaction.execute(
            r#"
            UPDATE jobs
            SET status = ?2, progress_json = ?3, result_json = ?4, error_json = ?5,
                updated_at = ?6, completed_at = ?7
            WHERE job_id = ?1
            "#,
            params![
                job.id,
                job.status.as_str(),
                option_json_to_db(job.progress.as_ref())?,
                option_json_to_db(job.result.as_ref())?,
                option_json_to_db(job.error.as_ref())?,
                timestamp_to_db(job.updated_at),
                option_timestamp_to_db(job.completed_at),
            ],
        )?;
        transaction.commit()?;
        Ok(job)
    }

    async fn query_jobs(&self, query: JobQuery) -> StoreResult<Vec<Job>> {
        let (sql, bindings) = job_query_sql(&query);
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&sql)?;
        let mut rows = statement.query(params_from_iter(bindings.iter()))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next()? {
            jobs.push(job_from_row(row)?);
        }
        Ok(jobs)
    }

    async fn purge_terminal_jobs(&self, before: DateTime<Utc>) -> StoreResult<usize> {
        let connection = self.open_connection()?;
        let purged = connection.execute(
            r#"
            DELETE FROM jobs
            WHERE status IN ('completed', 'failed', 'cancelled')
              AND completed_at IS NOT NULL
              AND completed_at < ?1
            "#,
            params![timestamp_to_db(before)],
        )?;
        debug!(purged, "purged terminal jobs");
        Ok(purged)
    }
}

#[async_trait]
impl IdempotencyStore for SqliteJobStore {
    async fn get_record(&self, key: &str, scope: &str) -> StoreResult<Option<IdempotencyRecord>> {
        let connection = self.open_connection()?;
        load_record(&connection, key, scope)
    }

    async fn insert_record_if_absent(
        &self,
        record: IdempotencyRecord,
    ) -> StoreResult<IdempotencyInsert> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = load_record(&transaction, &record.key, &record.scope)? {
            if !existing.is_expired(record.created_at) {
                transaction.commit()?;
                return Ok(IdempotencyInsert::Existing(existing));
            }
        }

        transaction.execute(
            r#"
            INSERT OR REPLACE INTO idempotency_records (
                idempotency_key, scope, request_hash, job_id, created_at, expires_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.key,
                record.scope,
                record.request_hash,
                record.job_id,
                timestamp_to_db(record.created_at),
                timestamp_to_db(record.expires_at),
            ],
        )?;
        transaction.commit()?;
        Ok(IdempotencyInsert::Inserted)
    }

    async fn delete_record(&self, key: &str, scope: &str) -> StoreResult<bool> {
        let connection = self.open_connection()?;
        let deleted = connection.execute(
            "DELETE FROM idempotency_records WHERE idempotency_key = ?1 AND scope = ?2",
            params![key, scope],
        )?;
        Ok(deleted > 0)
    }

    async fn purge_expired_records(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let connection = self.open_connection()?;
        let purged = connection.execute(
            "DELETE FROM idempotency_records WHERE expires_at <= ?1",
            params![timestamp_to_db(now)],
        )?;
        debug!(purged, "purged expired idempotency records");
        Ok(purged)
    }
}

/// Builds the filtered, ordered job listing with positional bindings.
fn job_query_sql(query: &JobQuery) -> (String, Vec<SqlValue>) {
    let mut clauses = Vec::new();
    let mut bindings = Vec::new();

    if !query.statuses.is_empty() {
        let placeholders = query
            .statuses
            .iter()
            .map(|status| {
                bindings.push(SqlValue::Text(status.as_str().to_string()));
                format!("?{}", bindings.len())
            })
            .collect::<Vec<_>>()
            .join(", ");
        clauses.push(format!("status IN ({placeholders})"));
    }
    if let Some(operation) = query.operation_type {
        bindings.push(SqlValue::Text(operation.as_str().to_string()));
        clauses.push(format!("operation_type = ?{}", bindings.len()));
    }
    if let Some(target) = query.target.as_ref() {
        bindings.push(SqlValue::Text(target.kind.as_str().to_string()));
        let kind_index = bindings.len();
        bindings.push(SqlValue::Text(target.id.clone()));
        clauses.push(format!(
            "target_kind = ?{kind_index} AND target_id = ?{}",
            bindings.len()
        ));
    }

    let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY created_at ASC, job_id ASC");
    if let Some(limit) = query.limit {
        bindings.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        sql.push_str(&format!(" LIMIT ?{}", bindings.len()));
    }
    (sql, bindings)
}

fn load_job(connection: &Connection, job_id: &str) -> StoreResult<Option<Job>> {
    let mut statement =
        connection.prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"))?;
    let mut rows = statement.query(params![job_id])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };
    job_from_row(row).map(Some)
}

fn job_from_row(row: &Row<'_>) -> StoreResult<Job> {
    Ok(Job {
        id: row.get(0)?,
        operation_type: operation_from_db(&row.get::<_, String>(1)?)?,
        status: status_from_db(&row.get::<_, String>(2)?)?,
        target: JobTarget {
            kind: target_kind_from_db(&row.get::<_, String>(3)?)?,
            id: row.get(4)?,
        },
        progress: option_json_from_db::<JobProgress>(row.get(5)?)?,
        result: option_json_from_db::<Value>(row.get(6)?)?,
        error: option_json_from_db::<JobError>(row.get(7)?)?,
        created_at: timestamp_from_db(&row.get::<_, String>(8)?)?,
        updated_at: timestamp_from_db(&row.get::<_, String>(9)?)?,
        completed_at: option_timestamp_from_db(row.get(10)?)?,
    })
}

fn load_record(
    connection: &Connection,
    key: &str,
    scope: &str,
) -> StoreResult<Option<IdempotencyRecord>> {
    let row = connection
        .query_row(
            r#"
            SELECT idempotency_key, scope, request_hash, job_id, created_at, expires_at
            FROM idempotency_records
            WHERE idempotency_key = ?1 AND scope = ?2
            "#,
            params![key, scope],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?;

    row.map(
        |(key, scope, request_hash, job_id, created_at, expires_at)| -> StoreResult<_> {
            Ok(IdempotencyRecord {
                key,
                scope,
                request_hash,
                job_id,
                created_at: timestamp_from_db(&created_at)?,
                expires_at: timestamp_from_db(&expires_at)?,
            })
        },
    )
    .transpose()
}

fn option_json_to_db<T: Serialize>(value: Option<&T>) -> StoreResult<Option<String>> {
    value
        .map(|item| serde_json::to_string(item).map_err(JobStoreError::from))
        .transpose()
}

fn option_json_from_db<T: DeserializeOwned>(value: Option<String>) -> StoreResult<Option<T>> {
    value
        .as_deref()
        .map(|item| serde_json::from_str(item).map_err(JobStoreError::from))
        .transpose()
}

/// Fixed-width UTC form so text comparison in SQL matches time order.
fn timestamp_to_db(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn option_timestamp_to_db(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(timestamp_to_db)
}

fn timestamp_from_db(value: &str) -> StoreResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn option_timestamp_from_db(value: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    value.as_deref().map(timestamp_from_db).transpose()
}

fn status_from_db(value: &str) -> StoreResult<JobStatus> {
    JobStatus::parse(value).ok_or_else(|| JobStoreError::InvalidPersistedValue {
        field: "status",
        value: value.to_string(),
    })
}

fn operation_from_db(value: &str) -> StoreResult<OperationType> {
    OperationType::parse(value).ok_or_else(|| JobStoreError::InvalidPersistedValue {
        field: "operation_type",
        value: value.to_string(),
    })
}

fn target_kind_from_db(value: &str) -> StoreResult<TargetKind> {
    TargetKind::parse(value).ok_or_else(|| JobStoreError::InvalidPersistedValue {
        field: "target_kind",
        value: value.to_string(),
    })
}
