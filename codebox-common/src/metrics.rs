use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram buckets sized for container jobs: sub-second spawns through the
/// five-minute timeout cap.
const JOB_SECONDS_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 180.0, 300.0];

/// Install the process-wide prometheus recorder. Called once at startup;
/// a second install is a programming error and panics.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets(JOB_SECONDS_BUCKETS)
        .expect("bucket list must not be empty")
        .install_recorder()
        .expect("failed to install prometheus recorder")
}

/// Add a `/metrics` route rendering the recorder's registry.
pub fn setup_metrics_routes(router: Router) -> Router {
    let handle = install_recorder();

    router.route("/metrics", get(move || std::future::ready(handle.render())))
}

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await
}
