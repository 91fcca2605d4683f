//! # PgQueue
//!
//! A durable work queue for container jobs, backed by a PostgreSQL table.

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Queue-level status of a job record. Application-level statuses are richer;
/// this is only what the queue needs to schedule work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "queue_status")]
#[sqlx(rename_all = "lowercase")]
pub enum QueueStatus {
    /// Ready to be claimed by a worker.
    Waiting,
    /// Claimed and owned by a worker.
    Active,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully with no further retries at queue level.
    Failed,
    /// Scheduled for a later point, either by submission delay, admission
    /// denial, or a retry backoff.
    Delayed,
    /// Moved to the dead-letter queue; never claimed again.
    Dead,
}

/// Row counts per queue status.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
    pub delayed: i64,
    pub dead: i64,
}

impl QueueCounts {
    /// Backlog relevant for scaling decisions.
    pub fn pending(&self) -> i64 {
        self.waiting + self.delayed
    }
}

/// A job record as read from the queue table. `parameters` is an opaque JSON
/// payload owned by the caller.
#[derive(sqlx::FromRow, Debug)]
pub struct QueueRecord<J> {
    pub id: i64,
    pub job_id: Uuid,
    pub attempt: i32,
    pub attempted_at: Option<DateTime<Utc>>,
    pub attempted_by: Vec<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub status: QueueStatus,
    pub parameters: sqlx::types::Json<J>,
}

/// A new job to insert. We take ownership on enqueue so a specific NewQueuedJob
/// is only enqueued once.
pub struct NewQueuedJob<J> {
    pub job_id: Uuid,
    pub parameters: sqlx::types::Json<J>,
    pub delay: Option<Duration>,
}

impl<J> NewQueuedJob<J> {
    pub fn new(job_id: Uuid, parameters: J) -> Self {
        Self {
            job_id,
            parameters: sqlx::types::Json(parameters),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// An exclusively claimed job. The worker owning this value owns the record
/// until one of the consuming methods returns it to the queue.
pub struct ClaimedJob<J> {
    pub record: QueueRecord<J>,
    pool: PgPool,
    table: String,
    queue: String,
}

impl<J> ClaimedJob<J> {
    /// Mark this job as completed.
    pub async fn complete(self) -> QueueResult<()> {
        let base_query = format!(
            r#"
UPDATE "{0}"
SET finished_at = NOW(), status = 'completed'::queue_status
WHERE "{0}".id = $2 AND queue = $1
            "#,
            &self.table
        );

        sqlx::query(&base_query)
            .bind(&self.queue)
            .bind(self.record.id)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(())
    }

    /// Mark this job as failed. Failed records remain in the table for
    /// inspection but are never claimed again.
    pub async fn fail<E: Serialize + Send + Sync>(self, error: E) -> QueueResult<()> {
        let base_query = format!(
            r#"
UPDATE "{0}"
SET finished_at = NOW(), status = 'failed'::queue_status,
    errors = errors || $3::jsonb
WHERE "{0}".id = $2 AND queue = $1
            "#,
            &self.table
        );

        sqlx::query(&base_query)
            .bind(&self.queue)
            .bind(self.record.id)
            .bind(sqlx::types::Json(error))
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(())
    }

    /// Return this job to the queue as delayed, without consuming the attempt
    /// the claim charged. Used when admission is denied.
    pub async fn delay_until(self, until: DateTime<Utc>) -> QueueResult<()> {
        let base_query = format!(
            r#"
UPDATE "{0}"
SET status = 'delayed'::queue_status, scheduled_at = $3,
    attempt = GREATEST("{0}".attempt - 1, 0)
WHERE "{0}".id = $2 AND queue = $1
            "#,
            &self.table
        );

        sqlx::query(&base_query)
            .bind(&self.queue)
            .bind(self.record.id)
            .bind(until)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(())
    }

    /// Re-enqueue this job to run again after a retry backoff. The payload is
    /// preserved; only the schedule changes.
    pub async fn retry<E: Serialize + Send + Sync>(
        self,
        after: Duration,
        error: E,
    ) -> QueueResult<()> {
        let base_query = format!(
            r#"
UPDATE "{0}"
SET status = 'delayed'::queue_status, scheduled_at = $3,
    errors = errors || $4::jsonb
WHERE "{0}".id = $2 AND queue = $1
            "#,
            &self.table
        );

        sqlx::query(&base_query)
            .bind(&self.queue)
            .bind(self.record.id)
            .bind(Utc::now() + after)
            .bind(sqlx::types::Json(error))
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(())
    }

    /// Move this job to the dead-letter queue, preserving the original payload.
    pub async fn dead(self, reason: &str) -> QueueResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| QueueError::QueryError {
                command: "BEGIN".to_owned(),
                error,
            })?;

        let insert_query = format!(
            r#"
INSERT INTO dead_letter_jobs (job_id, payload, reason)
SELECT job_id, parameters, $3 FROM "{0}" WHERE "{0}".id = $2 AND queue = $1
            "#,
            &self.table
        );

        sqlx::query(&insert_query)
            .bind(&self.queue)
            .bind(self.record.id)
            .bind(reason)
            .execute(&mut *tx)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        let update_query = format!(
            r#"
UPDATE "{0}"
SET finished_at = NOW(), status = 'dead'::queue_status
WHERE "{0}".id = $2 AND queue = $1
            "#,
            &self.table
        );

        sqlx::query(&update_query)
            .bind(&self.queue)
            .bind(self.record.id)
            .execute(&mut *tx)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        tx.commit().await.map_err(|error| QueueError::QueryError {
            command: "COMMIT".to_owned(),
            error,
        })?;

        Ok(())
    }

    /// Whether a cancel has been requested for this job since we claimed it.
    pub async fn cancel_requested(&self) -> QueueResult<bool> {
        let base_query = format!(
            r#"SELECT cancel_requested FROM "{0}" WHERE id = $1"#,
            &self.table
        );

        let requested: bool = sqlx::query_scalar(&base_query)
            .bind(self.record.id)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        Ok(requested)
    }
}

/// A durable queue implemented on top of a PostgreSQL table.
#[derive(Clone)]
pub struct PgQueue {
    /// A name to identify this queue as multiple may share a table.
    name: String,
    /// A connection pool used to connect to the PostgreSQL database.
    pool: PgPool,
    /// The identifier of the PostgreSQL table this queue runs on.
    table: String,
}

pub const DEFAULT_QUEUE_TABLE: &str = "job_queue";

impl PgQueue {
    /// Initialize a new PgQueue backed by a table in PostgreSQL.
    pub async fn new(name: &str, url: &str, max_connections: u32) -> QueueResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)
            .map_err(|error| QueueError::ConnectionError { error })?;

        Ok(Self::new_from_pool(name, pool))
    }

    /// Initialize a new PgQueue backed by an existing connection pool.
    pub fn new_from_pool(name: &str, pool: PgPool) -> Self {
        Self {
            name: name.to_owned(),
            pool,
            table: DEFAULT_QUEUE_TABLE.to_owned(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Enqueue a new job, either ready to claim or delayed.
    pub async fn enqueue<J: Serialize + Send + Sync>(
        &self,
        job: NewQueuedJob<J>,
    ) -> QueueResult<Uuid> {
        let status = match job.delay {
            Some(_) => QueueStatus::Delayed,
            None => QueueStatus::Waiting,
        };
        let scheduled_at = Utc::now() + job.delay.unwrap_or_else(Duration::zero);

        let base_query = format!(
            r#"
INSERT INTO {} (job_id, queue, status, scheduled_at, parameters)
VALUES ($1, $2, $3, $4, $5)
            "#,
            &self.table
        );

        sqlx::query(&base_query)
            .bind(job.job_id)
            .bind(&self.name)
            .bind(status)
            .bind(scheduled_at)
            .bind(&job.parameters)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(job.job_id)
    }

    /// Claim one waiting job, if any. Delayed rows whose schedule has passed
    /// are first returned to waiting; a claim only ever moves waiting to
    /// active. Claims are exclusive via FOR UPDATE SKIP LOCKED,
    /// see: 2ndquadrant.com/en/blog/what-is-select-skip-locked-for-in-postgresql-9-5.
    pub async fn dequeue<J: DeserializeOwned + Send + Unpin + 'static>(
        &self,
        worker: &str,
    ) -> QueueResult<Option<ClaimedJob<J>>> {
        let promote_query = format!(
            r#"
UPDATE "{0}"
SET status = 'waiting'::queue_status
WHERE queue = $1
    AND status = 'delayed'::queue_status
    AND scheduled_at <= NOW()
            "#,
            &self.table
        );

        sqlx::query(&promote_query)
            .bind(&self.name)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        let base_query = format!(
            r#"
WITH available_in_queue AS (
    SELECT id
    FROM "{0}"
    WHERE queue = $1
        AND status = 'waiting'::queue_status
        AND scheduled_at <= NOW()
    ORDER BY id
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE "{0}"
SET attempted_at = NOW(),
    status = 'active'::queue_status,
    attempt = "{0}".attempt + 1,
    attempted_by = array_append("{0}".attempted_by, $2::text)
FROM available_in_queue
WHERE "{0}".id = available_in_queue.id
RETURNING "{0}".*
            "#,
            &self.table
        );

        let record: Option<QueueRecord<J>> = sqlx::query_as(&base_query)
            .bind(&self.name)
            .bind(worker)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(record.map(|record| ClaimedJob {
            record,
            pool: self.pool.clone(),
            table: self.table.clone(),
            queue: self.name.clone(),
        }))
    }

    /// Current row counts per status for this queue.
    pub async fn counts(&self) -> QueueResult<QueueCounts> {
        let base_query = format!(
            r#"SELECT status, COUNT(*) AS count FROM "{0}" WHERE queue = $1 GROUP BY status"#,
            &self.table
        );

        let rows: Vec<(QueueStatus, i64)> = sqlx::query_as(&base_query)
            .bind(&self.name)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        let mut counts = QueueCounts::default();
        for (status, count) in rows {
            match status {
                QueueStatus::Waiting => counts.waiting = count,
                QueueStatus::Active => counts.active = count,
                QueueStatus::Completed => counts.completed = count,
                QueueStatus::Failed => counts.failed = count,
                QueueStatus::Delayed => counts.delayed = count,
                QueueStatus::Dead => counts.dead = count,
            }
        }

        Ok(counts)
    }

    /// Request cancellation, returning the status the record had when the
    /// request landed. A pending record is moved to the dead-letter queue
    /// immediately; an active record is flagged so the owning worker's next
    /// heartbeat kills the container.
    pub async fn cancel(&self, job_id: Uuid) -> QueueResult<Option<QueueStatus>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| QueueError::QueryError {
                command: "BEGIN".to_owned(),
                error,
            })?;

        let flag_query = format!(
            r#"
UPDATE "{0}"
SET cancel_requested = TRUE
WHERE queue = $1 AND job_id = $2
    AND status = ANY('{{waiting,active,delayed}}'::queue_status[])
RETURNING status
            "#,
            &self.table
        );

        let status: Option<QueueStatus> = sqlx::query_scalar(&flag_query)
            .bind(&self.name)
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        let Some(status) = status else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        if status != QueueStatus::Active {
            let dead_query = format!(
                r#"
WITH moved AS (
    UPDATE "{0}"
    SET finished_at = NOW(), status = 'dead'::queue_status
    WHERE queue = $1 AND job_id = $2
    RETURNING job_id, parameters
)
INSERT INTO dead_letter_jobs (job_id, payload, reason)
SELECT job_id, parameters, 'cancelled' FROM moved
                "#,
                &self.table
            );

            sqlx::query(&dead_query)
                .bind(&self.name)
                .bind(job_id)
                .execute(&mut *tx)
                .await
                .map_err(|error| QueueError::QueryError {
                    command: "UPDATE".to_owned(),
                    error,
                })?;
        }

        tx.commit().await.map_err(|error| QueueError::QueryError {
            command: "COMMIT".to_owned(),
            error,
        })?;

        Ok(Some(status))
    }

    /// Delete one record outright. Idempotent: removing an absent record
    /// reports false.
    pub async fn remove(&self, job_id: Uuid) -> QueueResult<bool> {
        let base_query = format!(
            r#"DELETE FROM "{0}" WHERE queue = $1 AND job_id = $2"#,
            &self.table
        );

        let result = sqlx::query(&base_query)
            .bind(&self.name)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "DELETE".to_owned(),
                error,
            })?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove waiting and delayed records. Active claims are never cleared.
    pub async fn clear_pending(&self) -> QueueResult<u64> {
        let base_query = format!(
            r#"
DELETE FROM "{0}"
WHERE queue = $1 AND status = ANY('{{waiting,delayed}}'::queue_status[])
            "#,
            &self.table
        );

        let result = sqlx::query(&base_query)
            .bind(&self.name)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "DELETE".to_owned(),
                error,
            })?;

        Ok(result.rows_affected())
    }

    /// Return over-age active claims to waiting so another worker can pick
    /// them up. This is how claims owned by dead workers get redelivered.
    pub async fn reap_stalled(&self, older_than: Duration) -> QueueResult<u64> {
        let cutoff = Utc::now() - older_than;
        let base_query = format!(
            r#"
UPDATE "{0}"
SET status = 'waiting'::queue_status, scheduled_at = NOW()
WHERE queue = $1 AND status = 'active'::queue_status AND attempted_at < $2
            "#,
            &self.table
        );

        let result = sqlx::query(&base_query)
            .bind(&self.name)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(result.rows_affected())
    }

    /// Whether cancellation has been requested for a job. Polled by the
    /// owning worker's heartbeat while the container runs.
    pub async fn cancel_requested(&self, job_id: Uuid) -> QueueResult<bool> {
        let base_query = format!(
            r#"SELECT cancel_requested FROM "{0}" WHERE queue = $1 AND job_id = $2"#,
            &self.table
        );

        let requested: Option<bool> = sqlx::query_scalar(&base_query)
            .bind(&self.name)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        Ok(requested.unwrap_or(false))
    }

    /// Read a record by job id without claiming it.
    pub async fn find<J: DeserializeOwned + Send + Unpin + 'static>(
        &self,
        job_id: Uuid,
    ) -> QueueResult<Option<QueueRecord<J>>> {
        let base_query = format!(
            r#"SELECT * FROM "{0}" WHERE queue = $1 AND job_id = $2"#,
            &self.table
        );

        sqlx::query_as(&base_query)
            .bind(&self.name)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }
}
