use axum::{
    Router,
    routing::{get, post},
    extract::{Path, Query, State, Json},
    http::{header, StatusCode},
    response::IntoResponse,
};
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use crate::collection::{BreakerSnapshot, CycleReport, CycleStatus, Orchestrator, SchedulerHandle};
use crate::error::Error;
use crate::health::{HealthDetector, HealthStatus, TimeWindow};
use crate::observability::metrics;
use crate::types::timestamp::Timestamp;

pub struct ApiState {
    pub orchestrator: Orchestrator,
    pub detector: Arc<HealthDetector>,
    /// On-demand cycles run on the scheduler; a dropped request does not cancel them.
    pub scheduler: SchedulerHandle,
}

/// Operator surface: trigger cycles, inspect and reset breakers, read gaps and health.
pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/cycles", post(trigger_cycle))
        .route("/breakers", get(list_breakers))
        .route("/breakers/:source/reset", post(reset_breaker))
        .route("/sources/:source/gaps", get(source_gaps))
        .route("/sources/:source/health", get(source_health))
        .route("/health/sources", get(all_sources_health))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::UnknownSource(_) => StatusCode::NOT_FOUND,
        Error::ConfigValidation(_) | Error::DeserializationError(_) => StatusCode::BAD_REQUEST,
        Error::StoreTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::TaskFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(error: Error) -> StatusCode {
    let status = status_for(&error);
    if status.is_server_error() {
        tracing::error!("Admin request failed: {}", error);
    } else {
        tracing::debug!("Admin request rejected: {}", error);
    }
    status
}

async fn health_check() -> &'static str {
    "OK"
}

#[derive(Debug, Default, Deserialize)]
struct CycleRequest {
    #[serde(default)]
    sources: Option<Vec<String>>,
}

#[derive(Serialize)]
struct CycleResponse {
    status: CycleStatus,
    #[serde(flatten)]
    report: CycleReport,
}

async fn trigger_cycle(
    State(state): State<Arc<ApiState>>,
    request: Option<Json<CycleRequest>>,
) -> Result<Json<CycleResponse>, StatusCode> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    tracing::info!(sources = ?request.sources, "Cycle triggered via admin API");

    let report = state.scheduler
        .trigger(request.sources)
        .await
        .map_err(reject)?;
    Ok(Json(CycleResponse { status: report.status(), report }))
}

async fn list_breakers(
    State(state): State<Arc<ApiState>>,
) -> Json<Vec<BreakerSnapshot>> {
    Json(state.orchestrator.breakers().snapshots())
}

async fn reset_breaker(
    State(state): State<Arc<ApiState>>,
    Path(source): Path<String>,
) -> Result<Json<BreakerSnapshot>, StatusCode> {
    let canonical = state.orchestrator.registry().canonical_name(&source).map_err(reject)?;
    let snapshot = state.orchestrator.breakers().reset(&canonical).map_err(reject)?;
    tracing::warn!(source = %canonical, "Circuit breaker reset by operator");
    Ok(Json(snapshot))
}

#[derive(Debug, Deserialize)]
struct GapsQuery {
    since: Option<String>,
}

async fn source_gaps(
    State(state): State<Arc<ApiState>>,
    Path(source): Path<String>,
    Query(query): Query<GapsQuery>,
) -> Result<Json<Vec<TimeWindow>>, StatusCode> {
    let since = match query.since {
        Some(raw) => Timestamp::parse(&raw).map_err(|_| StatusCode::BAD_REQUEST)?,
        None => state.orchestrator.clock().now().saturating_sub(state.detector.config().lookback),
    };
    let gaps = state.detector.detect_gaps(&source, since).await.map_err(reject)?;
    Ok(Json(gaps))
}

async fn source_health(
    State(state): State<Arc<ApiState>>,
    Path(source): Path<String>,
) -> Result<Json<HealthStatus>, StatusCode> {
    let status = state.detector.current_health(&source).await.map_err(reject)?;
    Ok(Json(status))
}

async fn all_sources_health(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Vec<HealthStatus>>, StatusCode> {
    let report = state.detector.health_report().await.map_err(reject)?;
    Ok(Json(report))
}

async fn prometheus_metrics() -> Result<impl IntoResponse, StatusCode> {
    let body = metrics::render().map_err(|e| {
        tracing::error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}
