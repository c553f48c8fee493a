use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::Instrument;
use crate::collection::circuit_breaker::CircuitBreakers;
use crate::collection::collectors::CollectorFactory;
use crate::collection::rate_limiter::RateLimiter;
use crate::collection::registry::CollectorRegistry;
use crate::collection::{normalize_name, FetchOutcome, Source};
use crate::config::{OrchestratorConfig, SourceConfig};
use crate::error::{CollectorError, Result};
use crate::history::{CollectionRunRecord, RunHistory, RunOutcome};
use crate::observability::metrics::{CYCLES_TOTAL, CYCLE_DURATION, FETCH_LATENCY, LATE_COMPLETIONS, SOURCE_RUNS, STAGING_OUTCOMES};
use crate::observability::tracing::{trace_cycle, trace_source};
use crate::staging::{IngestReport, StagingIngestor};
use crate::types::ids::CycleId;
use crate::types::timestamp::{Clock, Timestamp};
use crate::utils::helper::truncate_summary;

const MAX_SUMMARY_CHARS: usize = 512;

#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    pub cycle_deadline: Duration,
    pub default_source_timeout: Duration,
    /// Stage the records of a fetch that failed part-way.
    pub ingest_partial_batches: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        OrchestratorSettings::from(&OrchestratorConfig::default())
    }
}

impl From<&OrchestratorConfig> for OrchestratorSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        OrchestratorSettings {
            cycle_deadline: config.cycle_deadline,
            default_source_timeout: config.default_source_timeout,
            ingest_partial_batches: config.ingest_partial_batches,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleStatus {
    Success,
    PartialFailure,
    TotalFailure,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Success => "SUCCESS",
            CycleStatus::PartialFailure => "PARTIAL_FAILURE",
            CycleStatus::TotalFailure => "TOTAL_FAILURE",
        }
    }

    /// Process exit code for command-line runs.
    pub fn exit_code(&self) -> i32 {
        match self {
            CycleStatus::Success => 0,
            CycleStatus::PartialFailure => 2,
            CycleStatus::TotalFailure => 3,
        }
    }
}

/// Everything one cycle produced.
#[derive(Clone, Debug, Serialize)]
pub struct CycleReport {
    pub cycle_id: CycleId,
    pub collection_seq: u64,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub runs: Vec<CollectionRunRecord>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped_breaker_open: usize,
    pub skipped_rate_limited: usize,
    pub staging: IngestReport,
}

impl CycleReport {
    /// TOTAL_FAILURE when nothing succeeded and something failed or was cut off by an open
    /// breaker; PARTIAL_FAILURE when anything failed; otherwise SUCCESS.
    pub fn status(&self) -> CycleStatus {
        if self.succeeded == 0 && (self.failed > 0 || self.skipped_breaker_open > 0) {
            CycleStatus::TotalFailure
        } else if self.failed > 0 {
            CycleStatus::PartialFailure
        } else {
            CycleStatus::Success
        }
    }

    fn absorb(&mut self, record: CollectionRunRecord, staging: IngestReport) {
        match record.outcome {
            RunOutcome::Success => self.succeeded += 1,
            RunOutcome::Failure => self.failed += 1,
            RunOutcome::SkippedBreakerOpen => self.skipped_breaker_open += 1,
            RunOutcome::SkippedRateLimited => self.skipped_rate_limited += 1,
        }
        self.staging.merge(staging);
        self.runs.push(record);
    }

    pub fn run_for(&self, source: &str) -> Option<&CollectionRunRecord> {
        let source = normalize_name(source);
        self.runs.iter().find(|r| r.source == source)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BreakerVerdict {
    Success,
    Failure,
    Untouched,
}

/// What one source task hands back to the cycle.
struct SourceResult {
    started_at: Timestamp,
    finished_at: Timestamp,
    outcome: RunOutcome,
    records_collected: u64,
    error_summary: Option<String>,
    verdict: BreakerVerdict,
    staging: IngestReport,
}

impl SourceResult {
    fn skipped(started_at: Timestamp, finished_at: Timestamp, outcome: RunOutcome) -> Self {
        SourceResult {
            started_at,
            finished_at,
            outcome,
            records_collected: 0,
            error_summary: None,
            verdict: BreakerVerdict::Untouched,
            staging: IngestReport::default(),
        }
    }

    fn failed(started_at: Timestamp, finished_at: Timestamp, summary: String) -> Self {
        SourceResult {
            started_at,
            finished_at,
            outcome: RunOutcome::Failure,
            records_collected: 0,
            error_summary: Some(truncate_summary(&summary, MAX_SUMMARY_CHARS)),
            verdict: BreakerVerdict::Failure,
            staging: IngestReport::default(),
        }
    }
}

/// A source's run after its breaker was told and its record written.
struct SettledRun {
    record: CollectionRunRecord,
    staging: IngestReport,
    recorded: Result<()>,
}

/// Runs collection cycles across the registered sources.
///
/// Each source runs in its own task. The breaker is asked first, then the rate limiter;
/// only then is the collector called, bounded by the source timeout. Whatever a task does,
/// exactly one run record is written for it per cycle, and its breaker hears about it once.
/// The task settles its own run, so it is recorded even if nobody waits for the cycle.
///
/// A task that misses the cycle deadline is recorded as FAILURE by the cycle. It keeps
/// running; if it finishes later its records are still staged, but the late result is only
/// logged.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<CollectorRegistry>,
    rate_limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakers>,
    ingestor: Arc<StagingIngestor>,
    history: Arc<dyn RunHistory>,
    clock: Arc<dyn Clock>,
    settings: Arc<OrchestratorSettings>,
    source_timeouts: Arc<DashMap<String, Duration>>,
    last_seq: Arc<AtomicU64>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<CollectorRegistry>,
        rate_limiter: Arc<RateLimiter>,
        breakers: Arc<CircuitBreakers>,
        ingestor: Arc<StagingIngestor>,
        history: Arc<dyn RunHistory>,
        clock: Arc<dyn Clock>,
        settings: OrchestratorSettings,
    ) -> Self {
        Orchestrator {
            registry,
            rate_limiter,
            breakers,
            ingestor,
            history,
            clock,
            settings: Arc::new(settings),
            source_timeouts: Arc::new(DashMap::new()),
            last_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a configured source: collector factory, rate budget, breaker and timeout.
    pub fn register_source(&self, config: &SourceConfig, factory: CollectorFactory) -> Result<()> {
        let source = Source::from(config);
        let name = source.name.clone();
        self.registry.register(source, factory)?;
        self.rate_limiter.configure(&name, config.rate_limit);
        self.breakers.configure(&name, config.breaker);
        if let Some(timeout) = config.timeout {
            self.source_timeouts.insert(name, timeout);
        }
        Ok(())
    }

    pub fn registry(&self) -> &Arc<CollectorRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn ingestor(&self) -> &Arc<StagingIngestor> {
        &self.ingestor
    }

    pub fn history(&self) -> &Arc<dyn RunHistory> {
        &self.history
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    fn timeout_for(&self, source: &str) -> Duration {
        self.source_timeouts
            .get(source)
            .map(|t| *t)
            .unwrap_or(self.settings.default_source_timeout)
    }

    /// Strictly increasing across cycles and, being clock-seeded, across restarts.
    fn next_collection_seq(&self) -> u64 {
        let floor = self.clock.now().as_micros().max(0) as u64;
        let previous = self.last_seq
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| Some(prev.saturating_add(1).max(floor)))
            .unwrap_or_else(|prev| prev);
        previous.saturating_add(1).max(floor)
    }

    /// Canonical names of the cycle's targets, in order, without duplicates.
    fn resolve_targets(&self, sources: Option<&[String]>) -> Result<Vec<String>> {
        let Some(requested) = sources else {
            return Ok(self.registry.list_sources().into_iter().map(|s| s.name).collect());
        };
        let mut targets = Vec::with_capacity(requested.len());
        for name in requested {
            let canonical = self.registry.canonical_name(name)?;
            if !targets.contains(&canonical) {
                targets.push(canonical);
            }
        }
        Ok(targets)
    }

    /// Run one cycle over `sources` (all registered sources when `None`).
    ///
    /// Only fails on unknown source names or when the run history cannot be written;
    /// per-source failures are part of the report.
    pub async fn run_cycle(&self, sources: Option<&[String]>) -> Result<CycleReport> {
        let targets = self.resolve_targets(sources)?;
        let cycle_id = CycleId::new();
        let collection_seq = self.next_collection_seq();
        self.execute_cycle(cycle_id, collection_seq, targets)
            .instrument(trace_cycle(&cycle_id, collection_seq))
            .await
    }

    async fn execute_cycle(&self, cycle_id: CycleId, collection_seq: u64, targets: Vec<String>) -> Result<CycleReport> {
        let started_at = self.clock.now();
        let wall_start = Instant::now();
        let deadline = wall_start + self.settings.cycle_deadline;
        tracing::info!(sources = targets.len(), "Starting collection cycle");

        let mut pending = Vec::with_capacity(targets.len());
        for source in targets {
            let claim = Arc::new(AtomicBool::new(false));
            let (tx, rx) = oneshot::channel();
            let worker = self.clone();
            let task_claim = Arc::clone(&claim);
            let task_source = source.clone();
            tokio::spawn(
                async move {
                    let started_at = worker.clock.now();
                    let result = AssertUnwindSafe(worker.collect_source(&task_source, collection_seq))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            SourceResult::failed(started_at, worker.clock.now(), "collection task panicked".to_string())
                        });
                    if !task_claim.swap(true, Ordering::SeqCst) {
                        let settled = worker.settle(&task_source, cycle_id, result).await;
                        if tx.send(settled).is_err() {
                            tracing::info!("Cycle stopped waiting; run recorded without it");
                        }
                    } else {
                        LATE_COMPLETIONS.with_label_values(&[task_source.as_str()]).inc();
                        tracing::warn!(
                            outcome = result.outcome.as_str(),
                            records = result.records_collected,
                            "Source finished after the cycle deadline; staged records kept, run already recorded"
                        );
                    }
                }
                .instrument(trace_source(&source)),
            );
            pending.push((source, claim, rx));
        }

        let mut report = CycleReport {
            cycle_id,
            collection_seq,
            started_at,
            finished_at: started_at,
            runs: Vec::new(),
            succeeded: 0,
            failed: 0,
            skipped_breaker_open: 0,
            skipped_rate_limited: 0,
            staging: IngestReport::default(),
        };
        let mut history_error = None;

        for (source, claim, mut rx) in pending {
            let settled = match tokio::time::timeout_at(deadline, &mut rx).await {
                Ok(Ok(settled)) => settled,
                Ok(Err(_)) => self.settle_aborted(&source, cycle_id, started_at).await,
                Err(_) => {
                    if !claim.swap(true, Ordering::SeqCst) {
                        let expired = SourceResult::failed(
                            started_at,
                            self.clock.now(),
                            format!("cycle deadline of {:?} exceeded", self.settings.cycle_deadline),
                        );
                        self.settle(&source, cycle_id, expired).await
                    } else {
                        // The task claimed the result between the deadline and our claim
                        match rx.await {
                            Ok(settled) => settled,
                            Err(_) => self.settle_aborted(&source, cycle_id, started_at).await,
                        }
                    }
                }
            };

            let SettledRun { record, staging, recorded } = settled;
            if let Err(e) = recorded {
                tracing::error!(source = %source, "Failed to record collection run: {}", e);
                history_error.get_or_insert(e);
            }
            report.absorb(record, staging);
        }

        report.finished_at = self.clock.now();
        let status = report.status();
        CYCLES_TOTAL.with_label_values(&[status.as_str()]).inc();
        CYCLE_DURATION.observe(wall_start.elapsed().as_secs_f64());
        tracing::info!(
            status = status.as_str(),
            succeeded = report.succeeded,
            failed = report.failed,
            skipped_breaker_open = report.skipped_breaker_open,
            skipped_rate_limited = report.skipped_rate_limited,
            "Collection cycle finished"
        );

        match history_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Report to the breaker and write the run record. Called once per source per cycle.
    async fn settle(&self, source: &str, cycle_id: CycleId, result: SourceResult) -> SettledRun {
        let breaker = self.breakers.get_or_create(source);
        match result.verdict {
            BreakerVerdict::Success => breaker.report_success(),
            BreakerVerdict::Failure => breaker.report_failure(),
            BreakerVerdict::Untouched => {}
        }
        SOURCE_RUNS.with_label_values(&[source, result.outcome.as_str()]).inc();

        let record = CollectionRunRecord::new(
            cycle_id,
            source,
            result.started_at,
            result.finished_at,
            result.outcome,
            result.records_collected,
            result.error_summary,
        );
        let recorded = self.history.append(record.clone()).await;
        SettledRun { record, staging: result.staging, recorded }
    }

    /// The source task died without handing back a run.
    async fn settle_aborted(&self, source: &str, cycle_id: CycleId, started_at: Timestamp) -> SettledRun {
        let aborted = SourceResult::failed(started_at, self.clock.now(), "collection task aborted".to_string());
        self.settle(source, cycle_id, aborted).await
    }

    /// Whether a snapshot tagged `tag` may be staged under `source`: untagged, or tagged
    /// with the source's own name or one of its aliases.
    fn owns_tag(&self, source: &str, tag: &str) -> bool {
        tag.trim().is_empty() || self.registry.canonical_name(tag).is_ok_and(|canonical| canonical == source)
    }

    async fn collect_source(&self, source: &str, collection_seq: u64) -> SourceResult {
        let started_at = self.clock.now();
        let breaker = self.breakers.get_or_create(source);

        if !breaker.allow_request() {
            tracing::debug!("Breaker open, skipping");
            return SourceResult::skipped(started_at, self.clock.now(), RunOutcome::SkippedBreakerOpen);
        }
        if !self.rate_limiter.try_acquire(source) {
            breaker.release_trial();
            tracing::debug!("Rate limit reached, skipping");
            return SourceResult::skipped(started_at, self.clock.now(), RunOutcome::SkippedRateLimited);
        }

        let collector = match self.registry.resolve(source) {
            Ok(collector) => collector,
            Err(e) => return SourceResult::failed(started_at, self.clock.now(), e.to_string()),
        };

        let timeout = self.timeout_for(source);
        let fetch_start = Instant::now();
        let fetched = match tokio::time::timeout(timeout, collector.fetch()).await {
            Ok(fetched) => fetched,
            Err(_) => FetchOutcome::failed(CollectorError::Timeout(timeout)),
        };
        FETCH_LATENCY.with_label_values(&[source]).observe(fetch_start.elapsed().as_secs_f64());

        let FetchOutcome { mut records, error } = fetched;
        let records_collected = records.len() as u64;
        let mut foreign = Vec::new();
        records.retain_mut(|record| {
            if !self.owns_tag(source, &record.source) {
                foreign.push(std::mem::take(&mut record.source));
                return false;
            }
            record.source = source.to_string();
            record.collection_seq = collection_seq;
            true
        });

        let mut staging = if !records.is_empty() && (error.is_none() || self.settings.ingest_partial_batches) {
            self.ingestor.ingest(&records).await
        } else {
            IngestReport::default()
        };
        if let Some(tag) = foreign.first() {
            tracing::warn!(count = foreign.len(), tag = %tag, "Rejected snapshots tagged with another source");
            STAGING_OUTCOMES.with_label_values(&["rejected"]).inc_by(foreign.len() as u64);
            staging.rejected += foreign.len() as u64;
        }
        let staging_note = (staging.failed > 0).then(|| {
            format!(
                "staging: {} snapshot(s) failed ({})",
                staging.failed,
                staging.errors.first().map(String::as_str).unwrap_or("unknown error")
            )
        });

        let (outcome, verdict, summary) = match error {
            None => (RunOutcome::Success, BreakerVerdict::Success, staging_note),
            Some(e) => {
                tracing::warn!(records = records_collected, "Fetch failed: {}", e);
                let summary = match staging_note {
                    Some(note) => format!("{}; {}", e, note),
                    None => e.to_string(),
                };
                (RunOutcome::Failure, BreakerVerdict::Failure, Some(summary))
            }
        };

        SourceResult {
            started_at,
            finished_at: self.clock.now(),
            outcome,
            records_collected,
            error_summary: summary.map(|s| truncate_summary(&s, MAX_SUMMARY_CHARS)),
            verdict,
            staging,
        }
    }
}
