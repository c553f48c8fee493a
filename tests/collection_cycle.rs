use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use line_infra::collection::collectors::{factory_for, Collector, CollectorFactory, CollectorHandle};
use line_infra::collection::{
    BreakerState, CircuitBreakers, CollectorRegistry, CycleStatus, FetchOutcome, Orchestrator,
    OrchestratorSettings, RateLimiter, RawSnapshotRecord,
};
use line_infra::config::{BreakerConfig, FeedConfig, HealthConfig, RateLimitConfig, SourceConfig};
use line_infra::error::CollectorError;
use line_infra::health::{HealthDetector, HealthLevel};
use line_infra::history::{MemoryRunHistory, RunHistory, RunOutcome};
use line_infra::staging::{MemoryStagingStore, StagingIngestor, StagingKey, StagingStore};
use line_infra::storage::SqliteStore;
use line_infra::types::line::LineValue;
use line_infra::types::timestamp::{Clock, ManualClock, Timestamp};

struct StaticFeed {
    records: Vec<RawSnapshotRecord>,
    calls: AtomicUsize,
}

#[async_trait]
impl Collector for StaticFeed {
    async fn fetch(&self) -> FetchOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        FetchOutcome::ok(self.records.clone())
    }
}

struct DownFeed;

#[async_trait]
impl Collector for DownFeed {
    async fn fetch(&self) -> FetchOutcome {
        FetchOutcome::failed(CollectorError::Network("connection reset by peer".to_string()))
    }
}

struct HangingFeed;

#[async_trait]
impl Collector for HangingFeed {
    async fn fetch(&self) -> FetchOutcome {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        FetchOutcome::ok(Vec::new())
    }
}

fn factory<C: Collector + 'static>(build: impl Fn() -> C + Send + Sync + 'static) -> CollectorFactory {
    Arc::new(move || {
        let handle: CollectorHandle = Arc::new(build());
        Ok(handle)
    })
}

fn source_config(name: &str, threshold: u32, timeout: Option<Duration>) -> SourceConfig {
    SourceConfig {
        name: name.to_string(),
        aliases: Vec::new(),
        expected_cadence: Duration::from_secs(60),
        rate_limit: RateLimitConfig { max_requests: 100, window: Duration::from_secs(60) },
        breaker: BreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_secs(300),
            half_open_trial_limit: 1,
        },
        timeout,
        enabled: true,
        feed: FeedConfig::File { path: format!("spool/{}.ndjson", name).into() },
    }
}

fn moneyline(source: &str, price: f64, at_secs: i64) -> RawSnapshotRecord {
    RawSnapshotRecord::new(source, "nhl-2024-tor-mtl", "moneyline", "home", LineValue::price(price), Timestamp::from_millis(at_secs * 1_000))
}

struct Stack {
    clock: Arc<ManualClock>,
    history: Arc<dyn RunHistory>,
    staging: Arc<dyn StagingStore>,
    orchestrator: Orchestrator,
}

fn stack(staging: Arc<dyn StagingStore>, history: Arc<dyn RunHistory>, settings: OrchestratorSettings) -> Stack {
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_700_000_000_000)));
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let orchestrator = Orchestrator::new(
        Arc::new(CollectorRegistry::new()),
        Arc::new(RateLimiter::new(dyn_clock.clone())),
        Arc::new(CircuitBreakers::new(BreakerConfig::default(), dyn_clock.clone())),
        Arc::new(StagingIngestor::new(staging.clone(), Duration::from_secs(5))),
        history.clone(),
        dyn_clock,
        settings,
    );
    Stack { clock, history, staging, orchestrator }
}

fn memory_stack(settings: OrchestratorSettings) -> Stack {
    stack(Arc::new(MemoryStagingStore::new()), Arc::new(MemoryRunHistory::new()), settings)
}

#[tokio::test(start_paused = true)]
async fn test_mixed_sources_give_partial_failure() {
    let s = memory_stack(OrchestratorSettings {
        cycle_deadline: Duration::from_secs(30),
        default_source_timeout: Duration::from_secs(10),
        ingest_partial_batches: true,
    });
    s.orchestrator
        .register_source(&source_config("pinnacle", 3, None), factory(|| StaticFeed {
            records: vec![moneyline("pinnacle", -120.0, 100)],
            calls: AtomicUsize::new(0),
        }))
        .unwrap();
    s.orchestrator.register_source(&source_config("betcris", 3, None), factory(|| DownFeed)).unwrap();
    s.orchestrator
        .register_source(&source_config("bookmaker", 3, Some(Duration::from_secs(2))), factory(|| HangingFeed))
        .unwrap();

    let report = s.orchestrator.run_cycle(None).await.unwrap();
    assert_eq!(report.status(), CycleStatus::PartialFailure);
    assert_eq!(report.status().exit_code(), 2);
    assert_eq!((report.succeeded, report.failed), (1, 2));
    assert_eq!(report.staging.inserted, 1);

    let hanging = report.run_for("bookmaker").unwrap();
    assert_eq!(hanging.outcome, RunOutcome::Failure);
    assert!(hanging.error_summary.as_deref().unwrap().contains("timed out"));

    let key = StagingKey::new("pinnacle", "nhl-2024-tor-mtl", "moneyline", "home");
    let current = s.staging.current(&key).await.unwrap().unwrap();
    assert_eq!(current.value, LineValue::price(-120.0));
    assert_eq!(current.collection_seq, report.collection_seq);

    let since = Timestamp::from_millis(0);
    for source in ["pinnacle", "betcris", "bookmaker"] {
        let runs = s.history.query(source, since, s.clock.now()).await.unwrap();
        assert_eq!(runs.len(), 1, "{}", source);
        assert_eq!(runs[0].cycle_id, report.cycle_id);
    }
}

#[tokio::test]
async fn test_failing_source_is_breakered_without_touching_others() {
    let s = memory_stack(OrchestratorSettings::default());
    s.orchestrator.register_source(&source_config("betcris", 2, None), factory(|| DownFeed)).unwrap();
    s.orchestrator
        .register_source(&source_config("pinnacle", 2, None), factory(|| StaticFeed {
            records: vec![moneyline("pinnacle", -110.0, 100)],
            calls: AtomicUsize::new(0),
        }))
        .unwrap();

    let first = s.orchestrator.run_cycle(None).await.unwrap();
    let second = s.orchestrator.run_cycle(None).await.unwrap();
    let third = s.orchestrator.run_cycle(None).await.unwrap();

    assert!(first.collection_seq < second.collection_seq && second.collection_seq < third.collection_seq);
    assert_eq!(second.run_for("betcris").unwrap().outcome, RunOutcome::Failure);
    assert_eq!(third.run_for("betcris").unwrap().outcome, RunOutcome::SkippedBreakerOpen);
    assert_eq!(third.run_for("pinnacle").unwrap().outcome, RunOutcome::Success);
    assert_eq!(third.status(), CycleStatus::Success);
    assert_eq!(s.orchestrator.breakers().get("betcris").unwrap().state(), BreakerState::Open);
    assert_eq!(s.orchestrator.breakers().get("pinnacle").unwrap().state(), BreakerState::Closed);

    // Unchanged re-collection never grows history
    let key = StagingKey::new("pinnacle", "nhl-2024-tor-mtl", "moneyline", "home");
    assert_eq!(s.staging.history(&key).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_only_skips_is_total_failure() {
    let s = memory_stack(OrchestratorSettings::default());
    s.orchestrator.register_source(&source_config("betcris", 1, None), factory(|| DownFeed)).unwrap();

    assert_eq!(s.orchestrator.run_cycle(None).await.unwrap().status(), CycleStatus::TotalFailure);
    let skipped = s.orchestrator.run_cycle(None).await.unwrap();
    assert_eq!(skipped.skipped_breaker_open, 1);
    assert_eq!(skipped.status(), CycleStatus::TotalFailure);

    s.clock.advance(Duration::from_secs(300));
    let trial = s.orchestrator.run_cycle(None).await.unwrap();
    assert_eq!(trial.run_for("betcris").unwrap().outcome, RunOutcome::Failure);
}

#[tokio::test]
async fn test_file_feed_into_sqlite_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let spool = dir.path().join("pinnacle.ndjson");
    let db = dir.path().join("lines.db");

    let line = |price: i64, at: &str| {
        format!(
            r#"{{"external_entity_id":"mlb-2024-nyy-bos","market_type":"total","side":"over","price":{},"line_value":8.5,"observed_at":"{}"}}"#,
            price, at
        )
    };
    std::fs::write(&spool, format!("{}\n", line(-110, "2024-07-01T17:00:00Z"))).unwrap();

    let store = Arc::new(SqliteStore::open(&db).unwrap());
    let s = stack(store.clone(), store.clone(), OrchestratorSettings::default());
    let mut config = source_config("pinnacle", 3, None);
    config.feed = FeedConfig::File { path: spool.clone() };
    s.orchestrator.register_source(&config, factory_for(&config)).unwrap();

    let first = s.orchestrator.run_cycle(Some(&["Pinnacle".to_string()][..])).await.unwrap();
    assert_eq!(first.status(), CycleStatus::Success);
    assert_eq!(first.staging.inserted, 1);

    std::fs::write(
        &spool,
        format!("{}\n{}\nnot json\n", line(-110, "2024-07-01T17:00:00Z"), line(-125, "2024-07-01T17:05:00Z")),
    )
    .unwrap();
    s.clock.advance(Duration::from_secs(60));
    let second = s.orchestrator.run_cycle(None).await.unwrap();
    // The unparsable line fails the run but the good records are still staged
    assert_eq!(second.status(), CycleStatus::TotalFailure);
    assert_eq!(second.staging.superseded, 1);
    assert_eq!(second.staging.duplicates, 1);
    drop(s);
    drop(store);

    let reopened = SqliteStore::open(&db).unwrap();
    let key = StagingKey::new("pinnacle", "mlb-2024-nyy-bos", "total", "over");
    let history = reopened.history(&key).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(!history[0].is_current);
    assert!(history[1].is_current);
    assert!(history[1].raw_payload_ref.is_some());

    let runs = RunHistory::query(&reopened, "pinnacle", Timestamp::from_millis(0), Timestamp::from_millis(i64::MAX / 1_000)).await.unwrap();
    let outcomes: Vec<_> = runs.iter().map(|r| r.outcome).collect();
    assert_eq!(outcomes, vec![RunOutcome::Success, RunOutcome::Failure]);
}

#[tokio::test]
async fn test_silent_source_shows_up_as_gap() {
    let s = memory_stack(OrchestratorSettings::default());
    s.orchestrator
        .register_source(&source_config("pinnacle", 3, None), factory(|| StaticFeed {
            records: Vec::new(),
            calls: AtomicUsize::new(0),
        }))
        .unwrap();

    let start = s.clock.now();
    for _ in 0..5 {
        s.orchestrator.run_cycle(None).await.unwrap();
        s.clock.advance(Duration::from_secs(60));
    }
    // Ten quiet minutes, then collection resumes
    s.clock.advance(Duration::from_secs(600));
    let resumed_at = s.clock.now();
    s.orchestrator.run_cycle(None).await.unwrap();

    let detector = HealthDetector::new(
        Arc::clone(s.orchestrator.registry()),
        Arc::clone(s.orchestrator.breakers()),
        s.history.clone(),
        s.staging.clone(),
        s.clock.clone(),
        HealthConfig { lookback: Duration::from_secs(3600), ..HealthConfig::default() },
    );
    let gaps = detector.detect_gaps("pinnacle", start).await.unwrap();
    assert_eq!(gaps.len(), 1);
    assert_eq!(gaps[0].start, resumed_at.saturating_sub(Duration::from_secs(660)));
    assert_eq!(gaps[0].end, resumed_at);
    assert_eq!(gaps[0].width(), Duration::from_secs(660));

    let health = detector.current_health("pinnacle").await.unwrap();
    assert_eq!(health.level, HealthLevel::Critical);
    assert_eq!(health.last_success_at, Some(resumed_at));
}
