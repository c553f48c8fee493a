use lazy_static::lazy_static;
use prometheus::core::Collector;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Cycle metrics
    pub static ref CYCLES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("collection_cycles_total", "Collection cycles by overall status"),
        &["status"]
    ).expect("valid metric definition");

    pub static ref CYCLE_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "collection_cycle_duration_seconds",
            "Wall time of one collection cycle"
        ).buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0])
    ).expect("valid metric definition");

    // Per-source metrics
    pub static ref SOURCE_RUNS: IntCounterVec = IntCounterVec::new(
        Opts::new("source_runs_total", "Collection runs by source and outcome"),
        &["source", "outcome"]
    ).expect("valid metric definition");

    pub static ref LATE_COMPLETIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("source_late_completions_total", "Fetches that finished after the cycle deadline"),
        &["source"]
    ).expect("valid metric definition");

    pub static ref FETCH_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "source_fetch_latency_seconds",
            "Collector fetch latency"
        ).buckets(vec![0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["source"]
    ).expect("valid metric definition");

    pub static ref BREAKER_STATE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("circuit_breaker_state", "0 = closed, 1 = half open, 2 = open"),
        &["source"]
    ).expect("valid metric definition");

    // Staging metrics
    pub static ref STAGING_OUTCOMES: IntCounterVec = IntCounterVec::new(
        Opts::new("staging_snapshots_total", "Staged snapshots by outcome"),
        &["outcome"]
    ).expect("valid metric definition");

    // Health metrics
    pub static ref DETECTED_GAPS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("source_detected_gaps", "Collection gaps found in the health lookback"),
        &["source"]
    ).expect("valid metric definition");

    pub static ref DEAD_ROWS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("staging_dead_rows", "Staging rows of keys without a current row"),
        &["source"]
    ).expect("valid metric definition");

    pub static ref HEALTH_CHECKS: IntCounter = IntCounter::new(
        "health_checks_total",
        "Health monitor passes"
    ).expect("valid metric definition");
}

fn collectors() -> Vec<Box<dyn Collector>> {
    vec![
        Box::new(CYCLES_TOTAL.clone()),
        Box::new(CYCLE_DURATION.clone()),
        Box::new(SOURCE_RUNS.clone()),
        Box::new(LATE_COMPLETIONS.clone()),
        Box::new(FETCH_LATENCY.clone()),
        Box::new(BREAKER_STATE.clone()),
        Box::new(STAGING_OUTCOMES.clone()),
        Box::new(DETECTED_GAPS.clone()),
        Box::new(DEAD_ROWS.clone()),
        Box::new(HEALTH_CHECKS.clone()),
    ]
}

/// Register every metric with `REGISTRY`. Safe to call more than once.
pub fn register_metrics() -> prometheus::Result<()> {
    for collector in collectors() {
        match REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Text exposition of `REGISTRY`.
pub fn render() -> prometheus::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
