use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use crate::collection::normalize_name;
use crate::error::Result;
use crate::types::ids::{CycleId, RunId};
use crate::types::timestamp::Timestamp;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunOutcome {
    Success,
    Failure,
    SkippedBreakerOpen,
    SkippedRateLimited,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "SUCCESS",
            RunOutcome::Failure => "FAILURE",
            RunOutcome::SkippedBreakerOpen => "SKIPPED_BREAKER_OPEN",
            RunOutcome::SkippedRateLimited => "SKIPPED_RATE_LIMITED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(RunOutcome::Success),
            "FAILURE" => Some(RunOutcome::Failure),
            "SKIPPED_BREAKER_OPEN" => Some(RunOutcome::SkippedBreakerOpen),
            "SKIPPED_RATE_LIMITED" => Some(RunOutcome::SkippedRateLimited),
            _ => None,
        }
    }
}

/// One collection attempt. Written once, never mutated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRunRecord {
    pub run_id: RunId,
    pub cycle_id: CycleId,
    pub source: String,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub outcome: RunOutcome,
    pub records_collected: u64,
    pub error_summary: Option<String>,
}

impl CollectionRunRecord {
    pub fn new(
        cycle_id: CycleId,
        source: &str,
        started_at: Timestamp,
        finished_at: Timestamp,
        outcome: RunOutcome,
        records_collected: u64,
        error_summary: Option<String>,
    ) -> Self {
        CollectionRunRecord {
            run_id: RunId::new(),
            cycle_id,
            source: normalize_name(source),
            started_at,
            finished_at,
            outcome,
            records_collected,
            error_summary,
        }
    }
}

/// Append-only log of collection attempts, queryable by source and time.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RunHistory: Send + Sync {
    async fn append(&self, record: CollectionRunRecord) -> Result<()>;

    /// Runs for `source` that finished within `[from, to]`, oldest first.
    async fn query(&self, source: &str, from: Timestamp, to: Timestamp) -> Result<Vec<CollectionRunRecord>>;

    async fn last_success(&self, source: &str) -> Result<Option<CollectionRunRecord>>;
}

#[derive(Default)]
pub struct MemoryRunHistory {
    entries: RwLock<Vec<CollectionRunRecord>>,
}

impl MemoryRunHistory {
    pub fn new() -> Self {
        MemoryRunHistory::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn entries_for(&self, source: &str) -> Vec<CollectionRunRecord> {
        let source = normalize_name(source);
        self.entries.read().await.iter()
            .filter(|e| e.source == source)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RunHistory for MemoryRunHistory {
    async fn append(&self, record: CollectionRunRecord) -> Result<()> {
        self.entries.write().await.push(record);
        Ok(())
    }

    async fn query(&self, source: &str, from: Timestamp, to: Timestamp) -> Result<Vec<CollectionRunRecord>> {
        let source = normalize_name(source);
        let mut runs: Vec<_> = self.entries.read().await.iter()
            .filter(|e| e.source == source && e.finished_at >= from && e.finished_at <= to)
            .cloned()
            .collect();
        runs.sort_by_key(|r| (r.finished_at, r.started_at));
        Ok(runs)
    }

    async fn last_success(&self, source: &str) -> Result<Option<CollectionRunRecord>> {
        let source = normalize_name(source);
        Ok(self.entries.read().await.iter()
            .filter(|e| e.source == source && e.outcome == RunOutcome::Success)
            .max_by_key(|e| e.finished_at)
            .cloned())
    }
}
