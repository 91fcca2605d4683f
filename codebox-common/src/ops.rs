//! Submission and query operations, shared by the HTTP surface and tests.

use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::job::{JobRequest, JobSnapshot, JobStatus, ValidationError};
use crate::pgqueue::{NewQueuedJob, PgQueue, QueueCounts, QueueError, QueueRecord, QueueStatus};
use crate::runtime::RuntimeCatalog;
use crate::store::{JobLogRecord, JobStore, StatusFields, StoreError};

#[derive(Error, Debug)]
pub enum OpsError {
    #[error("invalid submission: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The operations a submission surface needs: validate + persist + enqueue on
/// the way in, snapshot reads on the way out.
#[derive(Clone)]
pub struct JobOps {
    queue: PgQueue,
    store: Arc<dyn JobStore>,
    catalog: RuntimeCatalog,
}

impl JobOps {
    pub fn new(queue: PgQueue, store: Arc<dyn JobStore>, catalog: RuntimeCatalog) -> Self {
        Self {
            queue,
            store,
            catalog,
        }
    }

    /// Validate and accept a submission. The job row is persisted before the
    /// queue record so a snapshot exists from the moment the id is returned.
    pub async fn enqueue(&self, request: JobRequest) -> Result<Uuid, OpsError> {
        request.validate(&self.catalog)?;

        let job_id = Uuid::now_v7();
        self.store.save_job(job_id, &request).await?;
        self.queue
            .enqueue(NewQueuedJob::new(job_id, request))
            .await?;

        Ok(job_id)
    }

    /// Snapshot of one job. The durable store owns the lifecycle fields; if a
    /// row only exists at queue level (store write raced or was pruned) we
    /// synthesize a snapshot from the queue record instead.
    pub async fn get(&self, job_id: Uuid) -> Result<Option<JobSnapshot>, OpsError> {
        if let Some(snapshot) = self.store.get_job(job_id).await? {
            return Ok(Some(snapshot));
        }

        let record: Option<QueueRecord<JobRequest>> = self.queue.find(job_id).await?;
        Ok(record.map(|record| JobSnapshot {
            job_id: record.job_id,
            status: queue_status_to_job_status(record.status),
            request: record.parameters.0,
            attempts_made: record.attempt.max(0) as u32,
            start_time: None,
            end_time: None,
            duration_ms: None,
            exit_code: None,
            error: None,
        }))
    }

    pub async fn list(&self, statuses: &[JobStatus]) -> Result<Vec<JobSnapshot>, OpsError> {
        Ok(self.store.list_jobs(statuses).await?)
    }

    pub async fn logs(&self, job_id: Uuid) -> Result<Vec<JobLogRecord>, OpsError> {
        Ok(self.store.get_job_logs(job_id).await?)
    }

    /// Request cancellation. An active job is finalized by its owning worker
    /// once the container is killed; a pending job never ran, so its store
    /// record is finalized here.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool, OpsError> {
        match self.queue.cancel(job_id).await? {
            None => Ok(false),
            Some(QueueStatus::Active) => Ok(true),
            Some(_) => {
                self.store
                    .update_job_status(
                        job_id,
                        JobStatus::FailedPermanently,
                        StatusFields {
                            error: Some("cancelled".to_owned()),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(true)
            }
        }
    }

    pub async fn counts(&self) -> Result<QueueCounts, OpsError> {
        Ok(self.queue.counts().await?)
    }

    pub async fn clear_pending(&self) -> Result<u64, OpsError> {
        Ok(self.queue.clear_pending().await?)
    }
}

fn queue_status_to_job_status(status: QueueStatus) -> JobStatus {
    match status {
        QueueStatus::Waiting => JobStatus::Waiting,
        QueueStatus::Active => JobStatus::Active,
        QueueStatus::Completed => JobStatus::Completed,
        QueueStatus::Failed => JobStatus::Failed,
        QueueStatus::Delayed => JobStatus::Delayed,
        QueueStatus::Dead => JobStatus::FailedPermanently,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{MemoryLimit, Submission, TIMEOUT_CAP_MS};
    use crate::store::PgJobStore;
    use chrono::Utc;
    use sqlx::PgPool;
    use std::collections::HashMap;

    fn ops(db: PgPool) -> JobOps {
        JobOps::new(
            PgQueue::new_from_pool("test_ops", db.clone()),
            Arc::new(PgJobStore::new_from_pool(db)),
            RuntimeCatalog::default(),
        )
    }

    fn request() -> JobRequest {
        JobRequest {
            submission: Submission::RawCode {
                raw_code: "console.log('hi')".to_owned(),
            },
            runtime: "nodejs".to_owned(),
            dependencies: vec!["express".to_owned()],
            start_directory: None,
            initial_cmds: vec![],
            build_cmd: None,
            env: HashMap::from([("NODE_ENV".to_owned(), "test".to_owned())]),
            memory_limit: MemoryLimit::from_megabytes(256),
            timeout_ms: 60_000,
            max_attempts: None,
            submitted_at: Utc::now(),
        }
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_enqueue_then_get_roundtrips_the_payload(db: PgPool) {
        let ops = ops(db);
        let request = request();

        let job_id = ops
            .enqueue(request.clone())
            .await
            .expect("failed to enqueue");

        let snapshot = ops
            .get(job_id)
            .await
            .expect("failed to get")
            .expect("job missing");
        assert_eq!(snapshot.request, request);
        assert_eq!(snapshot.status, JobStatus::Waiting);
        assert_eq!(snapshot.attempts_made, 0);

        let counts = ops.counts().await.expect("failed to count");
        assert_eq!(counts.waiting, 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_invalid_submissions_are_rejected_at_enqueue(db: PgPool) {
        let ops = ops(db);

        let mut over_cap = request();
        over_cap.timeout_ms = TIMEOUT_CAP_MS + 1;
        assert!(matches!(
            ops.enqueue(over_cap).await,
            Err(OpsError::Validation(ValidationError::TimeoutTooLarge(_)))
        ));

        let mut bad_runtime = request();
        bad_runtime.runtime = "fortran".to_owned();
        assert!(matches!(
            ops.enqueue(bad_runtime).await,
            Err(OpsError::Validation(ValidationError::UnsupportedRuntime(_)))
        ));

        // Nothing was persisted or enqueued.
        let counts = ops.counts().await.expect("failed to count");
        assert_eq!(counts.waiting, 0);
        assert!(ops.list(&[]).await.expect("failed to list").is_empty());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_cancel_and_clear(db: PgPool) {
        let ops = ops(db);

        let cancelled_id = ops.enqueue(request()).await.expect("failed to enqueue");
        let _pending_id = ops.enqueue(request()).await.expect("failed to enqueue");

        assert!(ops.cancel(cancelled_id).await.expect("failed to cancel"));
        assert_eq!(ops.clear_pending().await.expect("failed to clear"), 1);

        let counts = ops.counts().await.expect("failed to count");
        assert_eq!(counts.pending(), 0);
        assert_eq!(counts.dead, 1);

        // A pending job that never ran is finalized by the cancel itself.
        let snapshot = ops
            .get(cancelled_id)
            .await
            .expect("failed to get")
            .expect("job missing");
        assert_eq!(snapshot.status, JobStatus::FailedPermanently);
        assert_eq!(snapshot.error.as_deref(), Some("cancelled"));
    }
}
