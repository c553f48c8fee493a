use crate::config::*;
use crate::error::{Error, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl AppConfig {
    /// `config/default`, then `config/<env>`, then `LINE_INFRA__*` environment overrides.
    pub fn load(env: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name("config/default"))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(Environment::with_prefix(crate::ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| Error::ConfigError(e.to_string()))?;

        Self::finish(config)
    }

    pub fn load_file(path: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix(crate::ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| Error::ConfigError(e.to_string()))?;

        Self::finish(config)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .map_err(|e| Error::ConfigError(e.to_string()))?;

        Self::finish(config)
    }

    fn finish(config: Config) -> Result<Self> {
        let app: AppConfig = config.try_deserialize()
            .map_err(|e| Error::ConfigError(e.to_string()))?;
        app.validate()?;
        Ok(app)
    }

    /// Sources that take part in collection.
    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SAMPLE: &str = r#"
        [orchestrator]
        cycle_interval = "1m"
        cycle_deadline = "40s"
        default_source_timeout = "15s"
        staging_write_timeout = "2s"
        ingest_partial_batches = false

        [[sources]]
        name = "feedA"
        aliases = ["a", "feed-a"]
        expected_cadence = "5m"
        rate_limit = { max_requests = 10, window = "1m" }
        breaker = { failure_threshold = 3, cooldown = "2m", half_open_trial_limit = 1 }
        timeout = "10s"
        feed = { type = "file", path = "/tmp/feed_a.ndjson" }

        [[sources]]
        name = "feedB"
        expected_cadence = "10m"
        rate_limit = { max_requests = 2, window = "30s" }
        enabled = false
        feed = { type = "file", path = "/tmp/feed_b.ndjson" }
    "#;

    #[test]
    fn test_parses_humantime_durations() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.orchestrator.cycle_deadline, Duration::from_secs(40));
        assert!(!config.orchestrator.ingest_partial_batches);

        let a = &config.sources[0];
        assert_eq!(a.aliases, vec!["a".to_string(), "feed-a".to_string()]);
        assert_eq!(a.expected_cadence, Duration::from_secs(300));
        assert_eq!(a.rate_limit.window, Duration::from_secs(60));
        assert_eq!(a.breaker.cooldown, Duration::from_secs(120));
        assert_eq!(a.timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        let b = &config.sources[1];
        assert_eq!(b.breaker, BreakerConfig::default());
        assert_eq!(b.timeout, None);
        assert!(matches!(config.storage, StorageConfig::Memory));
        assert_eq!(config.health.tolerance_factor, 1.5);
    }

    #[test]
    fn test_enabled_sources_skips_disabled() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        let names: Vec<_> = config.enabled_sources().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["feedA"]);
    }
}
