//! Metrics HTTP Server for OptiMux
//!
//! Exposes the live job state over HTTP for dashboards and monitoring tools.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use thiserror::Error;
use tracing::info;

use crate::metrics::JobMetrics;
use crate::store::JobStore;
use crate::task::{current_timestamp_ms, Task};

/// Errors that can occur when running the metrics server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid bind address: {0}")]
    InvalidAddress(String),

    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Handler for GET /metrics endpoint
/// Computes the metrics at request time
async fn get_metrics(State(store): State<JobStore>) -> Json<JobMetrics> {
    Json(store.metrics(current_timestamp_ms()).await)
}

async fn get_tasks(State(store): State<JobStore>) -> Json<Vec<Task>> {
    Json(store.tasks().await)
}

async fn get_log(State(store): State<JobStore>) -> Json<Vec<String>> {
    Json(store.log().await)
}

/// Creates the axum Router over a job store
pub fn create_metrics_router(store: JobStore) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .route("/tasks", get(get_tasks))
        .route("/log", get(get_log))
        .with_state(store)
}

/// Runs the metrics HTTP server on `bind` until the process exits.
pub async fn run_metrics_server(store: JobStore, bind: &str) -> Result<(), ServerError> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|_| ServerError::InvalidAddress(bind.to_string()))?;
    let app = create_metrics_router(store);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Metrics endpoint listening");
    axum::serve(listener, app).await?;

    Ok(())
}
