pub mod circuit_breaker;
pub mod collectors;
pub mod orchestrator;
pub mod rate_limiter;
pub mod registry;
pub mod scheduler;

use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::config::{RateLimitConfig, SourceConfig};
use crate::error::CollectorError;
use crate::types::line::{LineValue, Quote};
use crate::types::timestamp::Timestamp;

pub use circuit_breaker::{BreakerSnapshot, BreakerState, CircuitBreaker, CircuitBreakers};
pub use collectors::{Collector, CollectorFactory, CollectorHandle};
pub use orchestrator::{CycleReport, CycleStatus, Orchestrator, OrchestratorSettings};
pub use rate_limiter::RateLimiter;
pub use registry::CollectorRegistry;
pub use scheduler::{CycleScheduler, SchedulerHandle};

/// Canonical form of source names and aliases.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Identity and collection policy of one feed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub name: String,
    pub aliases: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub expected_cadence: Duration,
    pub rate_limit: RateLimitConfig,
}

impl Source {
    pub fn new(name: &str, expected_cadence: Duration, rate_limit: RateLimitConfig) -> Self {
        Source {
            name: normalize_name(name),
            aliases: Vec::new(),
            expected_cadence,
            rate_limit,
        }
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.aliases = aliases.into_iter().map(|a| normalize_name(a.as_ref())).collect();
        self
    }
}

impl From<&SourceConfig> for Source {
    fn from(config: &SourceConfig) -> Self {
        Source::new(&config.name, config.expected_cadence, config.rate_limit)
            .with_aliases(&config.aliases)
    }
}

/// One raw observation as emitted by a collector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawSnapshotRecord {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub external_entity_id: String,
    #[serde(default)]
    pub market_type: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub price: Option<Quote>,
    #[serde(default)]
    pub line_value: Option<Quote>,
    pub observed_at: Timestamp,
    /// Stamped by the orchestrator with the cycle sequence.
    #[serde(default)]
    pub collection_seq: u64,
    #[serde(default)]
    pub raw_payload_ref: Option<String>,
}

impl RawSnapshotRecord {
    pub fn new(
        source: &str,
        external_entity_id: &str,
        market_type: &str,
        side: &str,
        value: LineValue,
        observed_at: Timestamp,
    ) -> Self {
        RawSnapshotRecord {
            source: source.to_string(),
            external_entity_id: external_entity_id.to_string(),
            market_type: market_type.to_string(),
            side: side.to_string(),
            price: value.price,
            line_value: value.line,
            observed_at,
            collection_seq: 0,
            raw_payload_ref: None,
        }
    }

    pub fn value(&self) -> LineValue {
        LineValue::new(self.price, self.line_value)
    }
}

/// Result of one `fetch`: whatever was collected, plus the error that cut it short.
#[derive(Clone, Debug, Default)]
pub struct FetchOutcome {
    pub records: Vec<RawSnapshotRecord>,
    pub error: Option<CollectorError>,
}

impl FetchOutcome {
    pub fn ok(records: Vec<RawSnapshotRecord>) -> Self {
        FetchOutcome { records, error: None }
    }

    pub fn failed(error: CollectorError) -> Self {
        FetchOutcome { records: Vec::new(), error: Some(error) }
    }

    pub fn partial(records: Vec<RawSnapshotRecord>, error: CollectorError) -> Self {
        FetchOutcome { records, error: Some(error) }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
