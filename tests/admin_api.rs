use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use line_infra::api::{create_router, ApiState};
use line_infra::collection::collectors::{Collector, CollectorHandle};
use line_infra::collection::{
    CircuitBreakers, CollectorRegistry, CycleScheduler, FetchOutcome, Orchestrator, OrchestratorSettings, RateLimiter,
    RawSnapshotRecord,
};
use line_infra::config::{AppConfig, BreakerConfig};
use line_infra::health::HealthDetector;
use line_infra::history::MemoryRunHistory;
use line_infra::staging::{MemoryStagingStore, StagingIngestor};
use line_infra::types::line::LineValue;
use line_infra::types::timestamp::{Clock, ManualClock, Timestamp};
use serde_json::Value;
use tokio::sync::watch;
use tower::ServiceExt;

const CONFIG: &str = r#"
    [orchestrator]
    cycle_interval = "1m"
    cycle_deadline = "20s"
    default_source_timeout = "5s"
    staging_write_timeout = "1s"
    ingest_partial_batches = true

    [health]
    check_interval = "1m"
    tolerance_factor = 1.5
    lookback = "1h"
    breaker_open_alert_cycles = 3
    gap_critical_factor = 4.0
    dead_row_alert_threshold = 0

    [[sources]]
    name = "Pinnacle"
    aliases = ["pin"]
    expected_cadence = "1m"
    rate_limit = { max_requests = 1, window = "1m" }
    feed = { type = "file", path = "unused.ndjson" }
"#;

struct OneLine;

#[async_trait]
impl Collector for OneLine {
    async fn fetch(&self) -> FetchOutcome {
        FetchOutcome::ok(vec![RawSnapshotRecord::new(
            "pinnacle",
            "epl-2024-ars-che",
            "spread",
            "away",
            LineValue::price(1.95),
            Timestamp::from_millis(1_000),
        )])
    }
}

/// The router plus the scheduler's shutdown switch, which must stay alive.
fn app() -> (Router, watch::Sender<bool>) {
    let config = AppConfig::from_toml_str(CONFIG).unwrap();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Timestamp::from_millis(7_200_000)));
    let staging = Arc::new(MemoryStagingStore::new());
    let history = Arc::new(MemoryRunHistory::new());
    let orchestrator = Orchestrator::new(
        Arc::new(CollectorRegistry::new()),
        Arc::new(RateLimiter::new(clock.clone())),
        Arc::new(CircuitBreakers::new(BreakerConfig::default(), clock.clone())),
        Arc::new(StagingIngestor::new(staging.clone(), config.orchestrator.staging_write_timeout)),
        history.clone(),
        clock.clone(),
        OrchestratorSettings::from(&config.orchestrator),
    );
    for source in config.enabled_sources() {
        orchestrator
            .register_source(source, Arc::new(|| {
                let handle: CollectorHandle = Arc::new(OneLine);
                Ok(handle)
            }))
            .unwrap();
    }
    let detector = Arc::new(HealthDetector::new(
        Arc::clone(orchestrator.registry()),
        Arc::clone(orchestrator.breakers()),
        history,
        staging,
        clock,
        config.health.clone(),
    ));
    let (scheduler, handle) = CycleScheduler::new(orchestrator.clone(), config.orchestrator.cycle_interval);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(scheduler.run(shutdown_rx));
    (create_router(Arc::new(ApiState { orchestrator, detector, scheduler: handle })), shutdown_tx)
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = router.clone().oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn test_cycle_by_alias_then_rate_limited() {
    let (router, _shutdown) = app();

    let (status, body) = send(&router, "POST", "/cycles", Some(r#"{"sources":["PIN"]}"#)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "SUCCESS");
    assert_eq!(body["staging"]["inserted"], 1);
    assert_eq!(body["runs"][0]["source"], "pinnacle");

    let (_, body) = send(&router, "POST", "/cycles", None).await;
    assert_eq!(body["skipped_rate_limited"], 1);
    assert_eq!(body["runs"][0]["outcome"], "SKIPPED_RATE_LIMITED");
}

#[tokio::test]
async fn test_health_and_gaps_for_source() {
    let (router, _shutdown) = app();
    send(&router, "POST", "/cycles", None).await;

    let (status, body) = send(&router, "GET", "/sources/pin/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source"], "pinnacle");
    assert_eq!(body["breaker"]["state"], "CLOSED");

    // One success at the end of a silent hour
    let (status, body) = send(&router, "GET", "/sources/pinnacle/gaps", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, _) = send(&router, "GET", "/sources/nobody/gaps", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_reset_unknown_breaker_is_404() {
    let (router, _shutdown) = app();
    let (status, _) = send(&router, "POST", "/breakers/nobody/reset", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&router, "GET", "/breakers", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[test]
fn test_default_config_file_is_valid() {
    let config = AppConfig::load_file(concat!(env!("CARGO_MANIFEST_DIR"), "/config/default")).unwrap();
    assert!(config.enabled_sources().count() >= 1);
    assert_eq!(config.orchestrator.cycle_interval, Duration::from_secs(60));
}

#[tokio::test]
async fn test_cycle_refused_after_scheduler_stops() {
    let (router, shutdown) = app();
    shutdown.send(true).unwrap();
    drop(shutdown);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (status, _) = send(&router, "POST", "/cycles", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
