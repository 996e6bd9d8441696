//! Health and metrics endpoints
//!
//! - `GET /health`: ingestion and per-pipeline phase; 503 once ingestion
//!   has failed or any pipeline has halted
//! - `GET /metrics`: every counter as one flat JSON object

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::ingestion::{IngestionPhase, IngestionStatus};
use crate::metrics::ServiceMetrics;
use crate::pipeline::{PipelinePhase, PipelineStatus};

#[derive(Clone)]
pub struct AppState {
    pub metrics: Arc<ServiceMetrics>,
    pub ingestion: Arc<IngestionStatus>,
    pub pipelines: Vec<Arc<PipelineStatus>>,
}

impl AppState {
    /// Service and pipeline counters merged into one sorted map.
    pub fn export_metrics(&self) -> BTreeMap<String, u64> {
        let mut m = self.metrics.export();
        for status in &self.pipelines {
            status.metrics.export_into(status.name(), &mut m);
        }
        m
    }
}

#[derive(Debug, Serialize)]
pub struct PipelineHealth {
    pub name: String,
    pub phase: PipelinePhase,
    pub committed_cycle: u64,
    pub committed_offset: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IngestionHealth {
    pub phase: IngestionPhase,
    pub last_offset: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub ingestion: IngestionHealth,
    pub pipelines: Vec<PipelineHealth>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let pipelines: Vec<PipelineHealth> = state
        .pipelines
        .iter()
        .map(|p| PipelineHealth {
            name: p.name().to_string(),
            phase: p.phase(),
            committed_cycle: p.committed_cycle(),
            committed_offset: p.committed_offset(),
            last_error: p.last_error(),
        })
        .collect();

    let ingestion = IngestionHealth {
        phase: state.ingestion.phase(),
        last_offset: state.ingestion.last_offset(),
        last_error: state.ingestion.last_error(),
    };

    let degraded = ingestion.phase == IngestionPhase::Failed
        || pipelines.iter().any(|p| p.phase == PipelinePhase::Halted);
    let (code, status) = if degraded {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    } else {
        (StatusCode::OK, "ok")
    };
    (
        code,
        Json(HealthResponse {
            status,
            ingestion,
            pipelines,
        }),
    )
}

async fn metrics(State(state): State<AppState>) -> Json<BTreeMap<String, u64>> {
    Json(state.export_metrics())
}

/// Serve until shutdown is signalled.
pub async fn serve(
    bind: &str,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "HTTP server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
}
