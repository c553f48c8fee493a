use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use crate::collection::RawSnapshotRecord;
use crate::error::{Error, RejectReason, Result};
use crate::observability::metrics::STAGING_OUTCOMES;
use crate::staging::store::StagingStore;
use crate::staging::{Chronology, NewStagingRow, StagingKey, StagingTemporalRecord, Watermark};
use crate::types::line::LineValue;

const MAX_STALE_RETRIES: usize = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First row of the key, now current.
    Inserted,
    /// Replaced the current row.
    Superseded,
    /// Stored as history without changing the current row.
    Backfilled,
    /// Carried no new information.
    Duplicate,
    Rejected(RejectReason),
}

impl IngestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestOutcome::Inserted => "inserted",
            IngestOutcome::Superseded => "superseded",
            IngestOutcome::Backfilled => "backfilled",
            IngestOutcome::Duplicate => "duplicate",
            IngestOutcome::Rejected(_) => "rejected",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub inserted: u64,
    pub superseded: u64,
    pub backfilled: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub failed: u64,
    pub errors: Vec<String>,
}

impl IngestReport {
    fn record(&mut self, outcome: &IngestOutcome) {
        match outcome {
            IngestOutcome::Inserted => self.inserted += 1,
            IngestOutcome::Superseded => self.superseded += 1,
            IngestOutcome::Backfilled => self.backfilled += 1,
            IngestOutcome::Duplicate => self.duplicates += 1,
            IngestOutcome::Rejected(_) => self.rejected += 1,
        }
    }

    /// Rows written, in any role.
    pub fn written(&self) -> u64 {
        self.inserted + self.superseded + self.backfilled
    }

    pub fn total(&self) -> u64 {
        self.written() + self.duplicates + self.rejected + self.failed
    }

    pub fn merge(&mut self, other: IngestReport) {
        self.inserted += other.inserted;
        self.superseded += other.superseded;
        self.backfilled += other.backfilled;
        self.duplicates += other.duplicates;
        self.rejected += other.rejected;
        self.failed += other.failed;
        self.errors.extend(other.errors);
    }
}

/// Turns raw snapshots into temporal staging rows.
///
/// Writes for one key are serialized through a per-key lock; different keys proceed
/// independently. A key's lock is dropped from the map as soon as nobody holds or waits
/// on it. Every store call is bounded by `write_timeout`.
///
/// The store's watermark lets the current row follow the chronologically latest
/// observation even when an unchanged re-collection was discarded and an older, different
/// value arrives afterwards, possibly in a later process: the current value is then
/// re-asserted at the watermark position.
pub struct StagingIngestor {
    store: Arc<dyn StagingStore>,
    write_timeout: Duration,
    keys: DashMap<StagingKey, Arc<Mutex<()>>>,
}

impl StagingIngestor {
    pub fn new(store: Arc<dyn StagingStore>, write_timeout: Duration) -> Self {
        StagingIngestor {
            store,
            write_timeout,
            keys: DashMap::new(),
        }
    }

    pub fn store(&self) -> Arc<dyn StagingStore> {
        Arc::clone(&self.store)
    }

    /// Ingest a batch in order. A bad or failing snapshot never stops the rest.
    pub async fn ingest(&self, batch: &[RawSnapshotRecord]) -> IngestReport {
        let mut report = IngestReport::default();
        for snapshot in batch {
            match self.ingest_one(snapshot).await {
                Ok(outcome) => {
                    if let IngestOutcome::Rejected(reason) = &outcome {
                        tracing::warn!(
                            source = %snapshot.source,
                            entity = %snapshot.external_entity_id,
                            "Rejected snapshot: {}",
                            reason
                        );
                    }
                    STAGING_OUTCOMES.with_label_values(&[outcome.as_str()]).inc();
                    report.record(&outcome);
                }
                Err(e) => {
                    tracing::error!(
                        source = %snapshot.source,
                        entity = %snapshot.external_entity_id,
                        "Failed to stage snapshot: {}",
                        e
                    );
                    STAGING_OUTCOMES.with_label_values(&["failed"]).inc();
                    report.failed += 1;
                    report.errors.push(e.to_string());
                }
            }
        }
        tracing::debug!(
            inserted = report.inserted,
            superseded = report.superseded,
            backfilled = report.backfilled,
            duplicates = report.duplicates,
            rejected = report.rejected,
            failed = report.failed,
            "Ingested batch"
        );
        report
    }

    pub async fn ingest_one(&self, snapshot: &RawSnapshotRecord) -> Result<IngestOutcome> {
        let (key, value) = match StagingKey::from_snapshot(snapshot) {
            Ok(parsed) => parsed,
            Err(reason) => return Ok(IngestOutcome::Rejected(reason)),
        };
        let incoming = Chronology {
            valid_from: snapshot.observed_at,
            collection_seq: snapshot.collection_seq,
            value,
        };

        let lock = self.keys.entry(key.clone()).or_default().clone();
        let outcome = {
            let _guard = lock.lock().await;
            self.apply_with_retries(&key, incoming, &snapshot.raw_payload_ref).await
        };
        drop(lock);
        self.keys.remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        outcome
    }

    /// Keys with a writer in progress or waiting.
    pub fn active_keys(&self) -> usize {
        self.keys.len()
    }

    async fn apply_with_retries(&self, key: &StagingKey, incoming: Chronology, raw_ref: &Option<String>) -> Result<IngestOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.apply(key, incoming, raw_ref.clone()).await {
                Err(Error::StaleCurrentRow { row_id }) if attempt < MAX_STALE_RETRIES => {
                    tracing::debug!(key = %key, row_id, attempt, "Current row moved underneath us, retrying");
                }
                other => return other,
            }
        }
    }

    async fn apply(&self, key: &StagingKey, incoming: Chronology, raw_ref: Option<String>) -> Result<IngestOutcome> {
        let current = self.bounded(self.store.current(key)).await?;
        let seen = Watermark { position: incoming, raw_payload_ref: raw_ref.clone() };

        let Some(current) = current else {
            let history = self.bounded(self.store.history(key)).await?;
            let latest = history.last().map(|r| r.chronology());
            if latest.map_or(true, |latest| incoming > latest) {
                // A key with no current row at all, or one left dead by an interrupted writer
                if latest.is_some() {
                    tracing::warn!(key = %key, "Healing key without a current row");
                }
                self.bounded(self.store.insert(NewStagingRow::at(key, incoming, raw_ref, true))).await?;
                self.bounded(self.store.advance_watermark(key, seen)).await?;
                return Ok(IngestOutcome::Inserted);
            }
            return self.backfill(key, incoming, raw_ref, &history).await;
        };

        let current_position = current.chronology();
        let watermark = match self.bounded(self.store.watermark(key)).await? {
            Some(w) if w.position >= current_position => w,
            _ => Watermark { position: current_position, raw_payload_ref: current.raw_payload_ref.clone() },
        };

        if incoming.value == current.value {
            if incoming > watermark.position {
                self.bounded(self.store.advance_watermark(key, seen)).await?;
            }
            return Ok(IngestOutcome::Duplicate);
        }

        if incoming > watermark.position {
            self.bounded(self.store.supersede(current.row_id, NewStagingRow::at(key, incoming, raw_ref, true))).await?;
            self.bounded(self.store.advance_watermark(key, seen)).await?;
            return Ok(IngestOutcome::Superseded);
        }

        if incoming > current_position {
            // The current value was seen again after `incoming`; it stays current but has
            // to move up to the watermark so the current row keeps the latest valid_from.
            self.bounded(self.store.insert(NewStagingRow::at(key, incoming, raw_ref, false))).await?;
            let reasserted = Chronology { value: current.value, ..watermark.position };
            self.bounded(self.store.supersede(
                current.row_id,
                NewStagingRow::at(key, reasserted, watermark.raw_payload_ref.clone(), true),
            )).await?;
            return Ok(IngestOutcome::Backfilled);
        }

        let history = self.bounded(self.store.history(key)).await?;
        self.backfill(key, incoming, raw_ref, &history).await
    }

    async fn backfill(
        &self,
        key: &StagingKey,
        incoming: Chronology,
        raw_ref: Option<String>,
        history: &[StagingTemporalRecord],
    ) -> Result<IngestOutcome> {
        if history.iter().any(|r| r.chronology() == incoming) {
            return Ok(IngestOutcome::Duplicate);
        }
        let predecessor = history.iter().rev().find(|r| r.chronology() < incoming);
        if predecessor.is_some_and(|r| r.value == incoming.value) {
            return Ok(IngestOutcome::Duplicate);
        }
        self.bounded(self.store.insert(NewStagingRow::at(key, incoming, raw_ref, false))).await?;
        tracing::debug!(key = %key, valid_from = %incoming.valid_from, "Backfilled out-of-order snapshot");
        Ok(IngestOutcome::Backfilled)
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.write_timeout, fut)
            .await
            .map_err(|_| Error::StoreTimeout(self.write_timeout))?
    }

    /// The current value for a key, straight from the store.
    pub async fn current_value(&self, key: &StagingKey) -> Result<Option<LineValue>> {
        Ok(self.bounded(self.store.current(key)).await?.map(|r| r.value))
    }
}
