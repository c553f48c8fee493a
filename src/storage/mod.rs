pub mod sqlite;

use std::sync::Arc;
use crate::config::StorageConfig;
use crate::error::Result;
use crate::history::{MemoryRunHistory, RunHistory};
use crate::staging::{MemoryStagingStore, StagingStore};

pub use sqlite::SqliteStore;

/// Staging store and run-history log for the configured backend.
pub fn open(config: &StorageConfig) -> Result<(Arc<dyn StagingStore>, Arc<dyn RunHistory>)> {
    match config {
        StorageConfig::Memory => {
            tracing::warn!("Using in-memory storage, nothing survives a restart");
            Ok((Arc::new(MemoryStagingStore::new()), Arc::new(MemoryRunHistory::new())))
        }
        StorageConfig::Sqlite { path } => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let store = Arc::new(SqliteStore::open(path)?);
            let history: Arc<dyn RunHistory> = store.clone();
            Ok((store, history))
        }
    }
}
