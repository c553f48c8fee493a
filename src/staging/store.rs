use std::collections::HashMap;
use async_trait::async_trait;
use tokio::sync::RwLock;
use crate::collection::normalize_name;
use crate::error::{Error, Result};
use crate::staging::{NewStagingRow, StagingKey, StagingTemporalRecord, Watermark};
use crate::types::timestamp::Timestamp;

/// Backing store for staged line history.
///
/// Rows are only ever inserted; `supersede` is the one operation allowed to touch an
/// existing row, and it must flip `is_current` and insert the successor atomically.
#[async_trait]
pub trait StagingStore: Send + Sync {
    async fn current(&self, key: &StagingKey) -> Result<Option<StagingTemporalRecord>>;

    /// All rows of a key in chronological order.
    async fn history(&self, key: &StagingKey) -> Result<Vec<StagingTemporalRecord>>;

    /// Fails when `row.is_current` and the key already has a current row.
    async fn insert(&self, row: NewStagingRow) -> Result<StagingTemporalRecord>;

    /// Clear `is_current` on `current_row_id` and insert `row` as the new current row.
    /// Fails with `StaleCurrentRow` when that row is no longer the key's current row.
    async fn supersede(&self, current_row_id: u64, row: NewStagingRow) -> Result<StagingTemporalRecord>;

    async fn current_rows(&self, source: &str) -> Result<Vec<StagingTemporalRecord>>;

    /// Rows belonging to keys that have history but no current row.
    async fn dead_row_estimate(&self, source: &str) -> Result<u64>;

    async fn watermark(&self, key: &StagingKey) -> Result<Option<Watermark>>;

    /// Raise the key's watermark. A position at or below the stored one is ignored.
    async fn advance_watermark(&self, key: &StagingKey, watermark: Watermark) -> Result<()>;
}

#[derive(Default)]
struct MemoryInner {
    rows: Vec<StagingTemporalRecord>,
    by_key: HashMap<StagingKey, Vec<usize>>,
    watermarks: HashMap<StagingKey, Watermark>,
}

impl MemoryInner {
    fn current_index(&self, key: &StagingKey) -> Option<usize> {
        self.by_key.get(key)?.iter().copied().find(|&i| self.rows[i].is_current)
    }

    fn push(&mut self, row: NewStagingRow) -> StagingTemporalRecord {
        let record = StagingTemporalRecord {
            row_id: self.rows.len() as u64 + 1,
            key: row.key,
            value: row.value,
            valid_from: row.valid_from,
            collection_seq: row.collection_seq,
            is_current: row.is_current,
            raw_payload_ref: row.raw_payload_ref,
            ingested_at: Timestamp::now(),
        };
        self.by_key.entry(record.key.clone()).or_default().push(self.rows.len());
        self.rows.push(record.clone());
        record
    }
}

#[derive(Default)]
pub struct MemoryStagingStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStagingStore {
    pub fn new() -> Self {
        MemoryStagingStore::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.rows.len()
    }

    pub async fn all_rows(&self) -> Vec<StagingTemporalRecord> {
        self.inner.read().await.rows.clone()
    }

    /// Clear `is_current` without inserting a successor. Simulates a crash between the
    /// flip and the insert of a non-transactional writer.
    pub async fn orphan_current(&self, key: &StagingKey) -> bool {
        let mut inner = self.inner.write().await;
        match inner.current_index(key) {
            Some(idx) => {
                inner.rows[idx].is_current = false;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl StagingStore for MemoryStagingStore {
    async fn current(&self, key: &StagingKey) -> Result<Option<StagingTemporalRecord>> {
        let inner = self.inner.read().await;
        Ok(inner.current_index(key).map(|i| inner.rows[i].clone()))
    }

    async fn history(&self, key: &StagingKey) -> Result<Vec<StagingTemporalRecord>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<_> = inner.by_key.get(key)
            .map(|idx| idx.iter().map(|&i| inner.rows[i].clone()).collect())
            .unwrap_or_default();
        rows.sort_by_key(|r| r.chronology());
        Ok(rows)
    }

    async fn insert(&self, row: NewStagingRow) -> Result<StagingTemporalRecord> {
        let mut inner = self.inner.write().await;
        if row.is_current && inner.current_index(&row.key).is_some() {
            return Err(Error::StorageError(format!("{} already has a current row", row.key)));
        }
        Ok(inner.push(row))
    }

    async fn supersede(&self, current_row_id: u64, row: NewStagingRow) -> Result<StagingTemporalRecord> {
        let mut inner = self.inner.write().await;
        let idx = match inner.current_index(&row.key) {
            Some(idx) if inner.rows[idx].row_id == current_row_id => idx,
            _ => return Err(Error::StaleCurrentRow { row_id: current_row_id }),
        };
        // Both changes happen under one write guard
        inner.rows[idx].is_current = false;
        Ok(inner.push(NewStagingRow { is_current: true, ..row }))
    }

    async fn current_rows(&self, source: &str) -> Result<Vec<StagingTemporalRecord>> {
        let source = normalize_name(source);
        Ok(self.inner.read().await.rows.iter()
            .filter(|r| r.is_current && r.key.source == source)
            .cloned()
            .collect())
    }

    async fn dead_row_estimate(&self, source: &str) -> Result<u64> {
        let source = normalize_name(source);
        let inner = self.inner.read().await;
        let dead = inner.by_key.iter()
            .filter(|(key, _)| key.source == source)
            .filter(|(_, idx)| !idx.iter().any(|&i| inner.rows[i].is_current))
            .map(|(_, idx)| idx.len() as u64)
            .sum();
        Ok(dead)
    }

    async fn watermark(&self, key: &StagingKey) -> Result<Option<Watermark>> {
        Ok(self.inner.read().await.watermarks.get(key).cloned())
    }

    async fn advance_watermark(&self, key: &StagingKey, watermark: Watermark) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.watermarks.get(key) {
            Some(stored) if stored.position >= watermark.position => {}
            _ => {
                inner.watermarks.insert(key.clone(), watermark);
            }
        }
        Ok(())
    }
}
