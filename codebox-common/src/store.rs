//! Durable persistence for jobs, consolidated logs, and metric snapshots.
//!
//! The engine only talks to storage through the [`JobStore`] trait so tests
//! (and alternative backends) can swap the implementation.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use uuid::Uuid;

use crate::job::{JobRequest, JobSnapshot, JobStatus, StreamKind};
use crate::pgqueue::QueueCounts;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("stored payload for job {job_id} could not be deserialized: {error}")]
    CorruptPayload {
        job_id: Uuid,
        error: serde_json::Error,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Extra fields written together with a status transition.
#[derive(Debug, Default, Clone)]
pub struct StatusFields {
    pub attempts_made: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

/// One persisted consolidated log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLogRecord {
    pub job_id: Uuid,
    pub kind: StreamKind,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Aggregate statistics over the jobs table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStatistics {
    pub total: i64,
    pub completed: i64,
    pub failed_permanently: i64,
    pub active: i64,
    pub avg_duration_ms: Option<f64>,
}

/// A point-in-time view of engine load, persisted and published periodically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMetricSnapshot {
    pub waiting: i64,
    pub delayed: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead: i64,
    pub active_containers: u32,
    pub max_concurrent: u32,
    pub memory_reserved_mb: u64,
    pub memory_budget_mb: u64,
    /// Estimated, not measured: the share of container slots in use.
    pub estimated_cpu_share: f64,
    pub timestamp: DateTime<Utc>,
}

impl SystemMetricSnapshot {
    pub fn from_counts(
        counts: QueueCounts,
        active_containers: u32,
        max_concurrent: u32,
        memory_per_container_mb: u64,
        memory_budget_mb: u64,
    ) -> Self {
        let estimated_cpu_share = if max_concurrent == 0 {
            0.0
        } else {
            f64::from(active_containers) / f64::from(max_concurrent)
        };
        Self {
            waiting: counts.waiting,
            delayed: counts.delayed,
            active: counts.active,
            completed: counts.completed,
            failed: counts.failed,
            dead: counts.dead,
            active_containers,
            max_concurrent,
            memory_reserved_mb: u64::from(active_containers) * memory_per_container_mb,
            memory_budget_mb,
            estimated_cpu_share,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a newly submitted job with its immutable payload.
    async fn save_job(&self, job_id: Uuid, request: &JobRequest) -> StoreResult<()>;

    /// Apply a status transition plus any lifecycle fields that changed.
    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        fields: StatusFields,
    ) -> StoreResult<()>;

    /// Persist one consolidated log record for a stream.
    async fn save_job_log(&self, job_id: Uuid, kind: StreamKind, content: &str) -> StoreResult<()>;

    async fn save_system_metrics(&self, snapshot: &SystemMetricSnapshot) -> StoreResult<()>;

    async fn get_job(&self, job_id: Uuid) -> StoreResult<Option<JobSnapshot>>;

    async fn list_jobs(&self, statuses: &[JobStatus]) -> StoreResult<Vec<JobSnapshot>>;

    async fn get_job_logs(&self, job_id: Uuid) -> StoreResult<Vec<JobLogRecord>>;

    async fn get_job_statistics(&self) -> StoreResult<JobStatistics>;
}

/// Create the application database if it does not exist yet. Called by the
/// bootstrapper before migrations run; failures here are fatal.
pub async fn ensure_database(url: &str) -> StoreResult<()> {
    use sqlx::migrate::MigrateDatabase;

    let exists = sqlx::Postgres::database_exists(url)
        .await
        .map_err(|error| StoreError::ConnectionError { error })?;
    if !exists {
        sqlx::Postgres::create_database(url)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;
    }

    Ok(())
}

/// The production store, backed by the `jobs`, `job_logs`, `dead_letter_jobs`
/// and `system_metrics` tables.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub async fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self::new_from_pool(pool))
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn snapshot_from_row(row: JobRow) -> StoreResult<JobSnapshot> {
        let request: JobRequest = serde_json::from_value(row.payload)
            .map_err(|error| StoreError::CorruptPayload {
                job_id: row.job_id,
                error,
            })?;
        let status = JobStatus::from_str(&row.status).unwrap_or(JobStatus::Waiting);

        Ok(JobSnapshot {
            job_id: row.job_id,
            status,
            request,
            attempts_made: row.attempts_made.max(0) as u32,
            start_time: row.start_time,
            end_time: row.end_time,
            duration_ms: row.duration_ms,
            exit_code: row.exit_code,
            error: row.error,
        })
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    job_id: Uuid,
    payload: serde_json::Value,
    status: String,
    attempts_made: i32,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    exit_code: Option<i32>,
    error: Option<String>,
}

const JOB_COLUMNS: &str =
    "job_id, payload, status, attempts_made, start_time, end_time, duration_ms, exit_code, error";

#[async_trait]
impl JobStore for PgJobStore {
    async fn save_job(&self, job_id: Uuid, request: &JobRequest) -> StoreResult<()> {
        sqlx::query(
            r#"
INSERT INTO jobs (job_id, submission_type, payload, status, submitted_at)
VALUES ($1, $2, $3, 'waiting', $4)
ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(request.submission.kind())
        .bind(sqlx::types::Json(request))
        .bind(request.submitted_at)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "INSERT".to_owned(),
            error,
        })?;

        Ok(())
    }

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        fields: StatusFields,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
UPDATE jobs
SET status = $2,
    attempts_made = COALESCE($3, attempts_made),
    start_time = COALESCE($4, start_time),
    end_time = COALESCE($5, end_time),
    duration_ms = CASE
        WHEN $5::timestamptz IS NOT NULL AND COALESCE($4, start_time) IS NOT NULL
        THEN (EXTRACT(EPOCH FROM ($5::timestamptz - COALESCE($4, start_time))) * 1000)::bigint
        ELSE duration_ms
    END,
    exit_code = COALESCE($6, exit_code),
    error = COALESCE($7, error),
    updated_at = NOW()
WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(status.to_string())
        .bind(fields.attempts_made.map(|a| a as i32))
        .bind(fields.start_time)
        .bind(fields.end_time)
        .bind(fields.exit_code)
        .bind(fields.error)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        Ok(())
    }

    async fn save_job_log(&self, job_id: Uuid, kind: StreamKind, content: &str) -> StoreResult<()> {
        sqlx::query("INSERT INTO job_logs (job_id, log_type, content) VALUES ($1, $2, $3)")
            .bind(job_id)
            .bind(kind.to_string())
            .bind(content)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }

    async fn save_system_metrics(&self, snapshot: &SystemMetricSnapshot) -> StoreResult<()> {
        sqlx::query("INSERT INTO system_metrics (snapshot) VALUES ($1)")
            .bind(sqlx::types::Json(snapshot))
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> StoreResult<Option<JobSnapshot>> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1"))
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|error| StoreError::QueryError {
                    command: "SELECT".to_owned(),
                    error,
                })?;

        row.map(Self::snapshot_from_row).transpose()
    }

    async fn list_jobs(&self, statuses: &[JobStatus]) -> StoreResult<Vec<JobSnapshot>> {
        let rows: Vec<JobRow> = if statuses.is_empty() {
            sqlx::query_as(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs ORDER BY submitted_at DESC"
            ))
            .fetch_all(&self.pool)
            .await
        } else {
            let statuses: Vec<String> = statuses.iter().map(|s| s.to_string()).collect();
            sqlx::query_as(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ANY($1) ORDER BY submitted_at DESC"
            ))
            .bind(statuses)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })?;

        rows.into_iter().map(Self::snapshot_from_row).collect()
    }

    async fn get_job_logs(&self, job_id: Uuid) -> StoreResult<Vec<JobLogRecord>> {
        let rows: Vec<(Uuid, String, String, DateTime<Utc>)> = sqlx::query_as(
            r#"
SELECT job_id, log_type, content, created_at
FROM job_logs
WHERE job_id = $1
ORDER BY id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })?;

        Ok(rows
            .into_iter()
            .filter_map(|(job_id, kind, content, created_at)| {
                // Rows with unknown log types are skipped rather than failing the read.
                StreamKind::from_str(&kind).ok().map(|kind| JobLogRecord {
                    job_id,
                    kind,
                    content,
                    created_at,
                })
            })
            .collect())
    }

    async fn get_job_statistics(&self) -> StoreResult<JobStatistics> {
        let row: (i64, i64, i64, i64, Option<f64>) = sqlx::query_as(
            r#"
SELECT
    COUNT(*),
    COUNT(*) FILTER (WHERE status = 'completed'),
    COUNT(*) FILTER (WHERE status = 'failed_permanently'),
    COUNT(*) FILTER (WHERE status = 'active'),
    AVG(duration_ms) FILTER (WHERE duration_ms IS NOT NULL)
FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })?;

        Ok(JobStatistics {
            total: row.0,
            completed: row.1,
            failed_permanently: row.2,
            active: row.3,
            avg_duration_ms: row.4,
        })
    }
}

/// In-memory store for tests. Records every write and can be told to fail a
/// number of status updates to exercise retry paths.
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

#[derive(Default)]
struct MemoryStoreInner {
    jobs: HashMap<Uuid, JobSnapshot>,
    logs: Vec<JobLogRecord>,
    metrics: Vec<SystemMetricSnapshot>,
    status_history: Vec<(Uuid, JobStatus)>,
    fail_status_updates: u32,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `update_job_status` fail.
    pub fn fail_next_status_updates(&self, n: u32) {
        self.lock().fail_status_updates = n;
    }

    /// Every status ever applied, in application order.
    pub fn status_history(&self) -> Vec<(Uuid, JobStatus)> {
        self.lock().status_history.clone()
    }

    pub fn logs(&self) -> Vec<JobLogRecord> {
        self.lock().logs.clone()
    }

    pub fn metrics(&self) -> Vec<SystemMetricSnapshot> {
        self.lock().metrics.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStoreInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save_job(&self, job_id: Uuid, request: &JobRequest) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.jobs.entry(job_id).or_insert_with(|| JobSnapshot {
            job_id,
            status: JobStatus::Waiting,
            request: request.clone(),
            attempts_made: 0,
            start_time: None,
            end_time: None,
            duration_ms: None,
            exit_code: None,
            error: None,
        });
        Ok(())
    }

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        fields: StatusFields,
    ) -> StoreResult<()> {
        let mut inner = self.lock();
        if inner.fail_status_updates > 0 {
            inner.fail_status_updates -= 1;
            return Err(StoreError::Unavailable("injected failure".to_owned()));
        }

        inner.status_history.push((job_id, status));
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            job.status = status;
            if let Some(attempts) = fields.attempts_made {
                job.attempts_made = attempts;
            }
            if let Some(start) = fields.start_time {
                job.start_time = Some(start);
            }
            if let Some(end) = fields.end_time {
                job.end_time = Some(end);
                if let Some(start) = job.start_time {
                    job.duration_ms = Some((end - start).num_milliseconds());
                }
            }
            if let Some(code) = fields.exit_code {
                job.exit_code = Some(code);
            }
            if let Some(error) = fields.error {
                job.error = Some(error);
            }
        }
        Ok(())
    }

    async fn save_job_log(&self, job_id: Uuid, kind: StreamKind, content: &str) -> StoreResult<()> {
        self.lock().logs.push(JobLogRecord {
            job_id,
            kind,
            content: content.to_owned(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn save_system_metrics(&self, snapshot: &SystemMetricSnapshot) -> StoreResult<()> {
        self.lock().metrics.push(snapshot.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> StoreResult<Option<JobSnapshot>> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    async fn list_jobs(&self, statuses: &[JobStatus]) -> StoreResult<Vec<JobSnapshot>> {
        let inner = self.lock();
        Ok(inner
            .jobs
            .values()
            .filter(|job| statuses.is_empty() || statuses.contains(&job.status))
            .cloned()
            .collect())
    }

    async fn get_job_logs(&self, job_id: Uuid) -> StoreResult<Vec<JobLogRecord>> {
        Ok(self
            .lock()
            .logs
            .iter()
            .filter(|record| record.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn get_job_statistics(&self) -> StoreResult<JobStatistics> {
        let inner = self.lock();
        let durations: Vec<i64> = inner
            .jobs
            .values()
            .filter_map(|job| job.duration_ms)
            .collect();
        Ok(JobStatistics {
            total: inner.jobs.len() as i64,
            completed: inner
                .jobs
                .values()
                .filter(|j| j.status == JobStatus::Completed)
                .count() as i64,
            failed_permanently: inner
                .jobs
                .values()
                .filter(|j| j.status == JobStatus::FailedPermanently)
                .count() as i64,
            active: inner
                .jobs
                .values()
                .filter(|j| j.status == JobStatus::Active)
                .count() as i64,
            avg_duration_ms: if durations.is_empty() {
                None
            } else {
                Some(durations.iter().sum::<i64>() as f64 / durations.len() as f64)
            },
        })
    }
}
