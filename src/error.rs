use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Registry Errors
    #[error("Duplicate source registration: {0}")]
    DuplicateSource(String),

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Collector construction failed for {source_name}: {reason}")]
    CollectorConstruction {
        source_name: String,
        reason: String,
    },

    // Configuration Errors
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Staging / Storage Errors
    #[error("Staging row {row_id} is no longer current")]
    StaleCurrentRow {
        row_id: u64,
    },

    #[error("Store operation timed out after {0:?}")]
    StoreTimeout(Duration),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization failed: {0}")]
    DeserializationError(String),

    // System Errors
    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Transient failure reported by a collector. Never escapes a cycle: it is recorded
/// in the run history and fed to the source's breaker.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollectorError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("{0}")]
    Other(String),
}

/// Why a snapshot was refused by staging ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    MissingSource,
    MissingEntityId,
    MissingMarketType,
    MissingSide,
    MissingValue,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let field = match self {
            RejectReason::MissingSource => "source",
            RejectReason::MissingEntityId => "external_entity_id",
            RejectReason::MissingMarketType => "market_type",
            RejectReason::MissingSide => "side",
            RejectReason::MissingValue => "price/line_value",
        };
        write!(f, "missing {}", field)
    }
}
