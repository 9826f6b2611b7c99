//! Axum JSON API: refresh triggers and metrics/job lookup.

use std::sync::Arc;
use std::time::Duration;

use adpulse_core::{CacheRecord, DerivedMetrics, Rating, RefreshJob};
use adpulse_pipeline::{manual_refresh_all, BatchOrchestrator, MetricsStore};
use adpulse_report::FactSource;
use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "adpulse-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MetricsStore>,
    pub source: Arc<dyn FactSource>,
    pub orchestrator: Arc<BatchOrchestrator>,
    pub fanout_width: usize,
    pub fanout_delay: Duration,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/refresh/batch", post(batch_refresh_handler))
        .route("/refresh/schedule", post(schedule_refresh_handler))
        .route("/refresh/manual", post(manual_refresh_handler))
        .route("/metrics/{entity_key}/{period}", get(metrics_lookup_handler))
        .route("/jobs/{id}", get(job_lookup_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct BatchRefreshRequest {
    job_id: Uuid,
    offset: usize,
    total: Option<usize>,
    #[serde(default)]
    #[allow(dead_code)]
    is_manual: bool,
}

async fn batch_refresh_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchRefreshRequest>,
) -> Response {
    match state
        .orchestrator
        .run(req.job_id, req.offset, req.total.filter(|t| *t > 0))
        .await
    {
        Ok(progress) => Json(progress).into_response(),
        Err(err) => server_error(err),
    }
}

async fn schedule_refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    let job = match state.store.create_job(false).await {
        Ok(job) => job,
        Err(err) => return server_error(err),
    };

    // Run the continuation chain in the background; the trigger returns as
    // soon as the job row exists.
    let orchestrator = Arc::clone(&state.orchestrator);
    let job_id = job.id;
    tokio::spawn(async move {
        let mut offset = 0usize;
        let mut total = None;
        loop {
            match orchestrator.run(job_id, offset, total).await {
                Ok(progress) if progress.completed => break,
                Ok(progress) => {
                    let next = progress.processed as usize;
                    if next <= offset {
                        warn!(%job_id, offset, "refresh chain stalled, stopping");
                        break;
                    }
                    offset = next;
                    total = Some(progress.total as usize);
                }
                Err(err) => {
                    warn!(%job_id, error = %err, "refresh chain failed");
                    break;
                }
            }
        }
    });

    Json(serde_json::json!({ "success": true, "job_id": job.id })).into_response()
}

async fn manual_refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    match manual_refresh_all(
        Arc::clone(&state.source),
        Arc::clone(&state.store),
        state.fanout_width,
        state.fanout_delay,
    )
    .await
    {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => server_error(err),
    }
}

#[derive(Debug, Serialize)]
struct MetricsResponse {
    #[serde(flatten)]
    record: CacheRecord,
    #[serde(flatten)]
    derived: DerivedMetrics,
    rating: &'static str,
}

async fn metrics_lookup_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((entity_key, period)): AxumPath<(String, String)>,
) -> Response {
    let record = match state.store.get_cache(&entity_key, &period).await {
        Ok(Some(record)) => record,
        Ok(None) => return not_found("no cached metrics for entity and period"),
        Err(err) => return server_error(err),
    };

    let threshold = match state.store.entity_threshold(&entity_key).await {
        Ok(threshold) => threshold,
        Err(err) => {
            warn!(entity_key = %entity_key, error = %err, "threshold lookup failed, using default");
            None
        }
    };

    let derived = DerivedMetrics::from_cache(&record);
    let rating = Rating::classify(derived.cpl, threshold).as_str();
    Json(MetricsResponse {
        record,
        derived,
        rating,
    })
    .into_response()
}

async fn job_lookup_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.store.get_job(id).await {
        Ok(Some(job)) => Json::<RefreshJob>(job).into_response(),
        Ok(None) => not_found("no such refresh job"),
        Err(err) => server_error(err),
    }
}

fn not_found(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}
