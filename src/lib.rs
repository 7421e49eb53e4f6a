pub mod api;
pub mod config;
pub mod db;
pub mod errors;
pub mod exchanges;
pub mod execution;
pub mod ingestion;
pub mod metrics;
pub mod models;
pub mod services;

use std::sync::Arc;
use tokio::sync::watch;

use crate::config::AppConfig;
use crate::db::PositionLedger;

#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::PgPool,
    pub config: AppConfig,
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
    pub ledger: Arc<dyn PositionLedger>,
}

/// Resolve once the shutdown flag flips to `true`, or the sender is gone.
pub async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
