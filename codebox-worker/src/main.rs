//! Consume queue jobs to run user code in containers.
use std::future::ready;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use codebox_common::health::HealthTracker;
use codebox_common::metrics::{serve, setup_metrics_routes};
use codebox_common::pgqueue::PgQueue;
use codebox_common::pubsub::{PubSubClient, RedisPubSub};
use codebox_common::retry::RetrySchedule;
use codebox_common::runtime::RuntimeCatalog;
use codebox_common::store::{self, JobStore, PgJobStore};

use codebox_worker::admission::{ResourceGovernor, ResourceLimits};
use codebox_worker::config::Config;
use codebox_worker::executor::{ContainerExecutor, ExecutorSettings};
use codebox_worker::logmux::LogMultiplexer;
use codebox_worker::metrics_collector::MetricsCollector;
use codebox_worker::status::StatusPipeline;
use codebox_worker::worker::{PoolSettings, WorkerContext, WorkerPool};
use codebox_worker::workspace::WorkspaceManager;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../migrations");

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    // Steps 1-3 fail closed: no database, no workspace root, no pub/sub means
    // no service.
    store::ensure_database(&config.database_url)
        .await
        .expect("failed to ensure the application database exists");
    let store = PgJobStore::new(&config.database_url, config.max_pg_connections)
        .await
        .expect("failed to connect to the database");
    MIGRATOR
        .run(store.pool())
        .await
        .expect("failed to apply schema migrations");

    let queue = PgQueue::new_from_pool(config.queue_name.as_str(), store.pool().clone());

    let governor = ResourceGovernor::new(ResourceLimits {
        max_concurrent: config.max_concurrent_containers,
        memory_per_container_mb: config.container_memory_mb,
        total_memory_mb: config.total_memory_mb,
        memory_threshold: config.memory_threshold,
    });

    let workspaces = WorkspaceManager::new(
        config
            .workspace_root
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(WorkspaceManager::default_root),
    );
    workspaces
        .ensure_root()
        .await
        .expect("failed to create the workspace root");

    let pubsub = RedisPubSub::new(config.redis_url.clone())
        .await
        .expect("failed to connect to redis");

    let liveness = HealthTracker::new("liveness");
    let pool_liveness = liveness.track(
        "worker-pool",
        time::Duration::seconds(config.scale_interval.0.as_secs() as i64 * 4),
    );
    let collector_liveness = liveness.track(
        "metrics-collector",
        time::Duration::seconds(config.metrics_interval_secs as i64 * 4),
    );

    let store_handle: Arc<dyn JobStore> = Arc::new(store.clone());
    let pubsub_handle: Arc<dyn PubSubClient> = Arc::new(pubsub);

    let logs = Arc::new(LogMultiplexer::new(
        Arc::clone(&store_handle),
        Arc::clone(&pubsub_handle),
        config.log_buffer_max_chunks,
    ));
    let (pipeline, pipeline_task) =
        StatusPipeline::start(Arc::clone(&store_handle), Arc::clone(&pubsub_handle));

    let executor = Arc::new(ContainerExecutor::new(
        ExecutorSettings {
            runtime_bin: config.container_runtime.clone(),
            name_prefix: config.container_name_prefix.as_str().to_owned(),
            network_host: config.container_network_host,
        },
        RuntimeCatalog::default(),
        workspaces,
        Arc::clone(&logs),
    ));

    let context = Arc::new(WorkerContext {
        queue: queue.clone(),
        pipeline: pipeline.clone(),
        executor,
        governor: Arc::clone(&governor),
        logs,
        schedule: RetrySchedule::new(config.retry_delays.0.clone(), config.max_retries),
    });

    let shutdown = CancellationToken::new();

    let collector = MetricsCollector::new(
        queue.clone(),
        Arc::clone(&store_handle),
        Arc::clone(&pubsub_handle),
        Arc::clone(&governor),
        std::time::Duration::from_secs(config.metrics_interval_secs),
    );
    let collector_task = tokio::spawn(collector.run(collector_liveness, shutdown.clone()));

    let reaper_task = tokio::spawn(reap_loop(
        queue.clone(),
        config.visibility_timeout_secs,
        shutdown.clone(),
    ));

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.check())));
    let router = setup_metrics_routes(router);
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let pool = WorkerPool::new(
        Arc::clone(&context),
        PoolSettings {
            min_workers: config.min_workers,
            max_workers: config.max_workers,
            jobs_per_worker: config.jobs_per_worker,
            poll_interval: config.poll_interval.0,
            scale_interval: config.scale_interval.0,
            shutdown_grace: std::time::Duration::from_secs(config.shutdown_grace_secs),
        },
        config.worker_name.clone(),
    );
    let pool_task = tokio::spawn(pool.run(pool_liveness, shutdown.clone()));

    shutdown_signal().await;
    info!("shutdown signal received, draining");
    shutdown.cancel();

    if let Err(err) = pool_task.await {
        error!("worker pool task failed: {}", err);
    }
    collector_task.await.ok();
    reaper_task.await.ok();

    // The pool owned the last worker-side producers; dropping ours lets the
    // status consumer drain and stop.
    drop(context);
    drop(pipeline);
    pipeline_task.await.ok();

    info!("shutdown complete");
}

pub async fn index() -> &'static str {
    "codebox worker"
}

/// Return over-age active claims to the queue so jobs owned by dead workers
/// are redelivered.
async fn reap_loop(queue: PgQueue, visibility_timeout_secs: u64, shutdown: CancellationToken) {
    let period = std::time::Duration::from_secs((visibility_timeout_secs / 2).max(1));
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        match queue
            .reap_stalled(chrono::Duration::seconds(visibility_timeout_secs as i64))
            .await
        {
            Ok(0) => {}
            Ok(reaped) => warn!("redelivered {} stalled claims", reaped),
            Err(err) => error!("failed to reap stalled claims: {}", err),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
