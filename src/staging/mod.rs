pub mod ingest;
pub mod store;

use serde::{Deserialize, Serialize};
use crate::collection::{normalize_name, RawSnapshotRecord};
use crate::error::RejectReason;
use crate::types::line::LineValue;
use crate::types::timestamp::Timestamp;

pub use ingest::{IngestOutcome, IngestReport, StagingIngestor};
pub use store::{MemoryStagingStore, StagingStore};

/// Natural identity of a staged line.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StagingKey {
    pub source: String,
    pub external_entity_id: String,
    pub market_type: String,
    pub side: String,
}

impl StagingKey {
    pub fn new(source: &str, external_entity_id: &str, market_type: &str, side: &str) -> Self {
        StagingKey {
            source: normalize_name(source),
            external_entity_id: external_entity_id.trim().to_string(),
            market_type: market_type.trim().to_string(),
            side: side.trim().to_string(),
        }
    }

    /// Key and value of a snapshot, or why it cannot be staged.
    pub fn from_snapshot(snapshot: &RawSnapshotRecord) -> Result<(StagingKey, LineValue), RejectReason> {
        let key = StagingKey::new(
            &snapshot.source,
            &snapshot.external_entity_id,
            &snapshot.market_type,
            &snapshot.side,
        );
        if key.source.is_empty() {
            return Err(RejectReason::MissingSource);
        }
        if key.external_entity_id.is_empty() {
            return Err(RejectReason::MissingEntityId);
        }
        if key.market_type.is_empty() {
            return Err(RejectReason::MissingMarketType);
        }
        if key.side.is_empty() {
            return Err(RejectReason::MissingSide);
        }
        let value = snapshot.value();
        if value.is_empty() {
            return Err(RejectReason::MissingValue);
        }
        Ok((key, value))
    }
}

impl std::fmt::Display for StagingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}/{}", self.source, self.external_entity_id, self.market_type, self.side)
    }
}

/// Position of a row in its key's history: `valid_from`, then collection sequence,
/// then value so that ties never depend on arrival order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Chronology {
    pub valid_from: Timestamp,
    pub collection_seq: u64,
    pub value: LineValue,
}

/// Latest position observed for a key, including unchanged re-collections that wrote
/// no row. Never moves backwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Watermark {
    pub position: Chronology,
    pub raw_payload_ref: Option<String>,
}

/// One version of a line. Inserted once; the only later change is `is_current` -> false.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingTemporalRecord {
    pub row_id: u64,
    #[serde(flatten)]
    pub key: StagingKey,
    pub value: LineValue,
    pub valid_from: Timestamp,
    pub collection_seq: u64,
    pub is_current: bool,
    pub raw_payload_ref: Option<String>,
    pub ingested_at: Timestamp,
}

impl StagingTemporalRecord {
    pub fn chronology(&self) -> Chronology {
        Chronology {
            valid_from: self.valid_from,
            collection_seq: self.collection_seq,
            value: self.value,
        }
    }
}

/// A row about to be written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewStagingRow {
    pub key: StagingKey,
    pub value: LineValue,
    pub valid_from: Timestamp,
    pub collection_seq: u64,
    pub raw_payload_ref: Option<String>,
    pub is_current: bool,
}

impl NewStagingRow {
    pub fn at(key: &StagingKey, position: Chronology, raw_payload_ref: Option<String>, is_current: bool) -> Self {
        NewStagingRow {
            key: key.clone(),
            value: position.value,
            valid_from: position.valid_from,
            collection_seq: position.collection_seq,
            raw_payload_ref,
            is_current,
        }
    }
}
