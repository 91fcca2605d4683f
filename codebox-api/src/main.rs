use std::sync::Arc;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;

use codebox_common::metrics::setup_metrics_routes;
use codebox_common::ops::JobOps;
use codebox_common::pgqueue::PgQueue;
use codebox_common::runtime::RuntimeCatalog;
use codebox_common::store::PgJobStore;

mod config;
mod handlers;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let store = PgJobStore::new(&config.database_url, config.max_pg_connections)
        .await
        .expect("failed to connect to the database");
    let queue = PgQueue::new_from_pool(&config.queue_name, store.pool().clone());

    let ops = JobOps::new(queue, Arc::new(store), RuntimeCatalog::default());

    let app = handlers::add_routes(Router::new(), ops);
    let app = setup_metrics_routes(app);

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start codebox-api http server, {}", e),
    }
}
