//! Periodic load snapshots: queue depth and admission state, persisted to the
//! durable store and published on the metrics channel.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use codebox_common::health::HealthReporter;
use codebox_common::pgqueue::PgQueue;
use codebox_common::pubsub::{publish_event, PubSubClient, METRICS_CHANNEL};
use codebox_common::store::{JobStore, SystemMetricSnapshot};

use crate::admission::ResourceGovernor;
use crate::error::WorkerError;

pub struct MetricsCollector {
    queue: PgQueue,
    store: Arc<dyn JobStore>,
    pubsub: Arc<dyn PubSubClient>,
    governor: Arc<ResourceGovernor>,
    interval: std::time::Duration,
}

impl MetricsCollector {
    pub fn new(
        queue: PgQueue,
        store: Arc<dyn JobStore>,
        pubsub: Arc<dyn PubSubClient>,
        governor: Arc<ResourceGovernor>,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            queue,
            store,
            pubsub,
            governor,
            interval,
        }
    }

    pub async fn run(self, liveness: HealthReporter, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            liveness.beat();

            if let Err(err) = self.collect_once().await {
                warn!("metrics collection failed: {}", err);
            }
        }
    }

    /// Take one snapshot: gauges, durable store, realtime channel.
    pub async fn collect_once(&self) -> Result<(), WorkerError> {
        let counts = self.queue.counts().await?;
        let governor = self.governor.snapshot();

        let snapshot = SystemMetricSnapshot::from_counts(
            counts,
            governor.active_containers,
            governor.max_concurrent,
            governor.memory_per_container_mb,
            governor.memory_budget_mb,
        );

        metrics::gauge!("queue_waiting_jobs").set(snapshot.waiting as f64);
        metrics::gauge!("queue_delayed_jobs").set(snapshot.delayed as f64);
        metrics::gauge!("queue_active_jobs").set(snapshot.active as f64);
        metrics::gauge!("active_containers").set(f64::from(snapshot.active_containers));

        self.store.save_system_metrics(&snapshot).await?;

        if let Err(err) = publish_event(self.pubsub.as_ref(), METRICS_CHANNEL, &snapshot).await {
            warn!("failed to publish metrics snapshot: {}", err);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::ResourceLimits;
    use chrono::Utc;
    use codebox_common::job::{JobRequest, MemoryLimit, Submission};
    use codebox_common::pgqueue::NewQueuedJob;
    use codebox_common::pubsub::MockPubSub;
    use codebox_common::store::MemoryJobStore;
    use sqlx::PgPool;
    use std::collections::HashMap;
    use uuid::Uuid;

    #[sqlx::test(migrations = "../migrations")]
    async fn test_snapshot_reflects_queue_and_governor(db: PgPool) {
        let queue = PgQueue::new_from_pool("test_metrics", db);
        let store = MemoryJobStore::new();
        let pubsub = MockPubSub::new();
        let governor = ResourceGovernor::new(ResourceLimits {
            max_concurrent: 4,
            memory_per_container_mb: 512,
            total_memory_mb: 8192,
            memory_threshold: 0.8,
        });

        let request = JobRequest {
            submission: Submission::RawCode {
                raw_code: "print('hi')".to_owned(),
            },
            runtime: "python".to_owned(),
            dependencies: vec![],
            start_directory: None,
            initial_cmds: vec![],
            build_cmd: None,
            env: HashMap::new(),
            memory_limit: MemoryLimit::default(),
            timeout_ms: 60_000,
            max_attempts: None,
            submitted_at: Utc::now(),
        };
        queue
            .enqueue(NewQueuedJob::new(Uuid::now_v7(), request))
            .await
            .expect("failed to enqueue");

        let _permit = governor.try_admit().expect("admission denied");

        let collector = MetricsCollector::new(
            queue,
            Arc::new(store.clone()),
            Arc::new(pubsub.clone()),
            governor,
            std::time::Duration::from_secs(60),
        );
        collector.collect_once().await.expect("collection failed");

        let snapshots = store.metrics();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].waiting, 1);
        assert_eq!(snapshots[0].active_containers, 1);
        assert_eq!(snapshots[0].memory_reserved_mb, 512);
        assert!((snapshots[0].estimated_cpu_share - 0.25).abs() < f64::EPSILON);

        let published = pubsub.published_on(METRICS_CHANNEL);
        assert_eq!(published.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&published[0]).unwrap();
        assert_eq!(value["waiting"], 1);
        assert_eq!(value["max_concurrent"], 4);
    }
}
