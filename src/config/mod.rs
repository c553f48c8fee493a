use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};

pub mod loader;
pub mod validation;

pub use loader::AppConfig;

/// One external odds feed.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub expected_cadence: Duration,
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Overrides `orchestrator.default_source_timeout`.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub feed: FeedConfig,
}

fn default_enabled() -> bool {
    true
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    pub half_open_trial_limit: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(300),  // 5 minutes
            half_open_trial_limit: 2,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedConfig {
    /// NDJSON spool file written by an external scraper.
    File { path: PathBuf },
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    #[serde(with = "humantime_serde")]
    pub cycle_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub cycle_deadline: Duration,
    #[serde(with = "humantime_serde")]
    pub default_source_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub staging_write_timeout: Duration,
    pub ingest_partial_batches: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            cycle_interval: Duration::from_secs(60),
            cycle_deadline: Duration::from_secs(45),
            default_source_timeout: Duration::from_secs(20),
            staging_write_timeout: Duration::from_secs(5),
            ingest_partial_batches: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HealthConfig {
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
    /// A window wider than `expected_cadence * tolerance_factor` without a success is a gap.
    pub tolerance_factor: f64,
    #[serde(with = "humantime_serde")]
    pub lookback: Duration,
    /// Alert once a breaker has stayed open this many cooldowns.
    pub breaker_open_alert_cycles: u32,
    /// Gaps wider than `expected_cadence * gap_critical_factor` are critical.
    pub gap_critical_factor: f64,
    pub dead_row_alert_threshold: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            check_interval: Duration::from_secs(60),
            tolerance_factor: 1.5,
            lookback: Duration::from_secs(86400),  // 24 hours
            breaker_open_alert_cycles: 3,
            gap_critical_factor: 4.0,
            dead_row_alert_threshold: 0,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    #[default]
    Memory,
    Sqlite { path: PathBuf },
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub json: bool,
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            json: false,
            filter: "info,line_infra=debug".to_string(),
        }
    }
}
