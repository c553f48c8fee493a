pub mod file_feed;

use std::sync::Arc;
use async_trait::async_trait;
use crate::collection::FetchOutcome;
use crate::config::{FeedConfig, SourceConfig};
use crate::error::Result;

pub use file_feed::FileFeedCollector;

/// Talks to one external feed.
///
/// Implementations must not retry: retry policy belongs to the orchestrator's breaker
/// and rate limiter. On failure, return whatever was collected plus the error.
/// The orchestrator bounds every call with a timeout.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Collector: Send + Sync {
    async fn fetch(&self) -> FetchOutcome;
}

pub type CollectorHandle = Arc<dyn Collector>;

/// Builds a collector on first use. Construction may be expensive (clients, parsers).
pub type CollectorFactory = Arc<dyn Fn() -> Result<CollectorHandle> + Send + Sync>;

/// Factory for the feed kind named in configuration.
pub fn factory_for(config: &SourceConfig) -> CollectorFactory {
    let source = config.name.clone();
    match &config.feed {
        FeedConfig::File { path } => {
            let path = path.clone();
            Arc::new(move || {
                let collector: CollectorHandle = Arc::new(FileFeedCollector::new(&source, &path));
                Ok(collector)
            })
        }
    }
}
