//! Worker pool: claim, admit, execute, transition, retry.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use codebox_common::health::HealthReporter;
use codebox_common::job::{JobRequest, JobStatus};
use codebox_common::pgqueue::{ClaimedJob, PgQueue};
use codebox_common::retry::RetrySchedule;
use codebox_common::store::StatusFields;

use crate::admission::ResourceGovernor;
use crate::error::WorkerError;
use crate::executor::{ContainerExecutor, ExecStatus, ExecutionReport};
use crate::logmux::LogMultiplexer;
use crate::status::StatusPipeline;

/// How long a job waits before re-entering the queue after admission denial.
/// Not an attempt; capacity pressure is not the job's fault.
const ADMISSION_RETRY_DELAY_SECS: i64 = 5;

/// How often the owning worker checks for a cancel request mid-run.
const CANCEL_HEARTBEAT: std::time::Duration = std::time::Duration::from_millis(500);

/// Everything a worker needs to process jobs. Shared by the whole pool.
pub struct WorkerContext {
    pub queue: PgQueue,
    pub pipeline: StatusPipeline,
    pub executor: Arc<ContainerExecutor>,
    pub governor: Arc<ResourceGovernor>,
    pub logs: Arc<LogMultiplexer>,
    pub schedule: RetrySchedule,
}

pub struct JobWorker {
    name: String,
    context: Arc<WorkerContext>,
    poll_interval: std::time::Duration,
    shutdown: CancellationToken,
}

impl JobWorker {
    pub fn new(
        name: String,
        context: Arc<WorkerContext>,
        poll_interval: std::time::Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            name,
            context,
            poll_interval,
            shutdown,
        }
    }

    /// Poll the queue until shutdown. In-flight jobs always run to a terminal
    /// transition; shutdown only declines further claims.
    pub async fn run(self) {
        info!(worker = %self.name, "worker started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            match self.poll_once().await {
                Ok(true) => {}
                Ok(false) => {}
                Err(err) => {
                    error!(worker = %self.name, "failed to process job: {}", err);
                }
            }
        }
        info!(worker = %self.name, "worker stopped");
    }

    /// Claim and process at most one job. Returns whether a job was claimed.
    pub async fn poll_once(&self) -> Result<bool, WorkerError> {
        let Some(claimed) = self.context.queue.dequeue::<JobRequest>(&self.name).await? else {
            return Ok(false);
        };

        self.process(claimed).await?;
        Ok(true)
    }

    async fn process(&self, claimed: ClaimedJob<JobRequest>) -> Result<(), WorkerError> {
        let job_id = claimed.record.job_id;
        let request = claimed.record.parameters.0.clone();
        // The claim counter is 1-based: this is the Nth attempt at the job.
        let attempt = claimed.record.attempt.max(1) as u32;

        metrics::counter!("jobs_claimed_total").increment(1);

        // A claim always surfaces the job as waiting first: a row coming back
        // from delayed re-enters waiting before anything else happens to it,
        // and for a job that already was waiting this replays as a no-op.
        self.context
            .pipeline
            .publish(job_id, JobStatus::Waiting, StatusFields::default())
            .await;

        // Admission before the active transition: a denied job goes back to
        // delayed without ever having been active.
        let Some(permit) = self.context.governor.try_admit() else {
            self.context
                .pipeline
                .publish(job_id, JobStatus::Delayed, StatusFields::default())
                .await;
            claimed
                .delay_until(Utc::now() + chrono::Duration::seconds(ADMISSION_RETRY_DELAY_SECS))
                .await?;
            metrics::counter!("jobs_admission_denied_total").increment(1);
            return Ok(());
        };

        let start_time = Utc::now();
        self.context
            .pipeline
            .publish(
                job_id,
                JobStatus::Active,
                StatusFields {
                    attempts_made: Some(attempt),
                    start_time: Some(start_time),
                    ..Default::default()
                },
            )
            .await;

        let cancel = CancellationToken::new();
        let heartbeat = self.spawn_cancel_heartbeat(job_id, cancel.clone());

        let outcome = self
            .context
            .executor
            .execute(job_id, &request, permit, cancel)
            .await;

        heartbeat.abort();
        let end_time = Utc::now();

        let report = match outcome {
            Ok(report) => report,
            // Supervision failures (workspace, spawn) count as job failures
            // and go through the retry schedule like any other error.
            Err(err) => ExecutionReport {
                status: ExecStatus::Error,
                exit_code: None,
                error: Some(err.to_string()),
            },
        };

        // Consolidated logs are flushed only on terminal transitions; a job
        // headed for a retry keeps its accumulator so durable storage ends up
        // with at most one record per stream.
        match report.status {
            ExecStatus::Success => {
                self.context.logs.flush(job_id).await;
                self.context
                    .pipeline
                    .publish(
                        job_id,
                        JobStatus::Completed,
                        StatusFields {
                            end_time: Some(end_time),
                            exit_code: report.exit_code,
                            ..Default::default()
                        },
                    )
                    .await;
                claimed.complete().await?;
                metrics::counter!("jobs_completed_total").increment(1);
            }
            ExecStatus::Killed => {
                // A cancel is a move-to-dead request, never retried.
                self.context.logs.flush(job_id).await;
                self.context
                    .pipeline
                    .publish(
                        job_id,
                        JobStatus::Failed,
                        StatusFields {
                            end_time: Some(end_time),
                            error: Some("cancelled".to_owned()),
                            ..Default::default()
                        },
                    )
                    .await;
                claimed.dead("cancelled").await?;
                self.context
                    .pipeline
                    .publish(job_id, JobStatus::FailedPermanently, StatusFields::default())
                    .await;
                metrics::counter!("jobs_cancelled_total").increment(1);
            }
            ExecStatus::Timeout => {
                self.handle_failure(claimed, &request, attempt, JobStatus::TimedOut, end_time, report)
                    .await?;
            }
            ExecStatus::Error => {
                self.handle_failure(claimed, &request, attempt, JobStatus::Failed, end_time, report)
                    .await?;
            }
        }

        Ok(())
    }

    async fn handle_failure(
        &self,
        claimed: ClaimedJob<JobRequest>,
        request: &JobRequest,
        attempt: u32,
        failure_status: JobStatus,
        end_time: chrono::DateTime<Utc>,
        report: ExecutionReport,
    ) -> Result<(), WorkerError> {
        let job_id = claimed.record.job_id;
        let error = report
            .error
            .unwrap_or_else(|| "execution failed".to_owned());

        self.context
            .pipeline
            .publish(
                job_id,
                failure_status,
                StatusFields {
                    end_time: Some(end_time),
                    exit_code: report.exit_code,
                    error: Some(error.clone()),
                    attempts_made: Some(attempt),
                    ..Default::default()
                },
            )
            .await;
        metrics::counter!("jobs_failed_total").increment(1);

        // Retries already scheduled for this job: everything before this claim.
        let retries_made = attempt.saturating_sub(1);
        if self.context.schedule.can_retry(retries_made, request.max_attempts) {
            let delay = self.context.schedule.delay_for(retries_made);
            self.context
                .pipeline
                .publish(job_id, JobStatus::Retrying, StatusFields::default())
                .await;
            claimed
                .retry(
                    chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(300)),
                    error,
                )
                .await?;
            self.context
                .pipeline
                .publish(job_id, JobStatus::Waiting, StatusFields::default())
                .await;
            metrics::counter!("jobs_retried_total").increment(1);
        } else {
            self.context.logs.flush(job_id).await;
            claimed.dead(&error).await?;
            self.context
                .pipeline
                .publish(
                    job_id,
                    JobStatus::FailedPermanently,
                    StatusFields {
                        attempts_made: Some(attempt),
                        ..Default::default()
                    },
                )
                .await;
            metrics::counter!("jobs_dead_lettered_total").increment(1);
        }

        Ok(())
    }

    fn spawn_cancel_heartbeat(&self, job_id: Uuid, cancel: CancellationToken) -> JoinHandle<()> {
        let queue = self.context.queue.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CANCEL_HEARTBEAT);
            interval.tick().await;
            loop {
                interval.tick().await;
                match queue.cancel_requested(job_id).await {
                    Ok(true) => {
                        cancel.cancel();
                        break;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!(job_id = %job_id, "cancel heartbeat failed: {}", err);
                    }
                }
            }
        })
    }
}

/// How many workers the backlog calls for.
pub fn desired_workers(pending: usize, jobs_per_worker: usize, min: usize, max: usize) -> usize {
    let per_worker = jobs_per_worker.max(1);
    pending.div_ceil(per_worker).clamp(min, max)
}

#[derive(Clone)]
pub struct PoolSettings {
    pub min_workers: usize,
    pub max_workers: usize,
    pub jobs_per_worker: usize,
    pub poll_interval: std::time::Duration,
    pub scale_interval: std::time::Duration,
    pub shutdown_grace: std::time::Duration,
}

/// Supervises N `JobWorker`s and periodically rescales the pool against the
/// queue backlog. Scale-down stops the oldest workers gracefully: they finish
/// their in-flight job and decline further claims.
pub struct WorkerPool {
    context: Arc<WorkerContext>,
    settings: PoolSettings,
    base_name: String,
}

impl WorkerPool {
    pub fn new(context: Arc<WorkerContext>, settings: PoolSettings, base_name: String) -> Self {
        Self {
            context,
            settings,
            base_name,
        }
    }

    pub async fn run(self, liveness: HealthReporter, shutdown: CancellationToken) {
        let mut workers: Vec<(CancellationToken, JoinHandle<()>)> = Vec::new();
        let mut next_worker_id: u64 = 0;

        let mut spawn_worker = |workers: &mut Vec<(CancellationToken, JoinHandle<()>)>| {
            next_worker_id += 1;
            let token = CancellationToken::new();
            let worker = JobWorker::new(
                format!("{}-{}", self.base_name, next_worker_id),
                Arc::clone(&self.context),
                self.settings.poll_interval,
                token.clone(),
            );
            workers.push((token, tokio::spawn(worker.run())));
        };

        for _ in 0..self.settings.min_workers {
            spawn_worker(&mut workers);
        }

        let mut interval = tokio::time::interval(self.settings.scale_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            liveness.beat();

            workers.retain(|(_, handle)| !handle.is_finished());

            let pending = match self.context.queue.counts().await {
                Ok(counts) => counts.pending().max(0) as usize,
                Err(err) => {
                    warn!("failed to read queue depth for scaling: {}", err);
                    continue;
                }
            };

            let desired = desired_workers(
                pending,
                self.settings.jobs_per_worker,
                self.settings.min_workers,
                self.settings.max_workers,
            );
            metrics::gauge!("worker_pool_size").set(workers.len() as f64);

            if desired > workers.len() {
                info!(
                    "scaling worker pool up from {} to {}",
                    workers.len(),
                    desired
                );
                while workers.len() < desired {
                    spawn_worker(&mut workers);
                }
            } else if desired < workers.len() {
                info!(
                    "scaling worker pool down from {} to {}",
                    workers.len(),
                    desired
                );
                // Stop the oldest workers first.
                for (token, _) in workers.drain(..workers.len() - desired) {
                    token.cancel();
                }
            }
        }

        info!("worker pool shutting down, waiting for in-flight jobs");
        for (token, _) in &workers {
            token.cancel();
        }
        let join_all = futures::future::join_all(workers.into_iter().map(|(_, handle)| handle));
        if tokio::time::timeout(self.settings.shutdown_grace, join_all)
            .await
            .is_err()
        {
            warn!("shutdown grace period expired with jobs still in flight");
        }
    }
}
