use std::collections::HashSet;
use std::time::Duration;
use crate::collection::normalize_name;
use crate::config::*;
use crate::error::{Error, Result};

fn invalid(msg: impl Into<String>) -> Error {
    Error::ConfigValidation(msg.into())
}

fn require_positive(what: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(invalid(format!("{} must be positive", what)));
    }
    Ok(())
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(invalid("rate_limit.max_requests must be positive"));
        }
        require_positive("rate_limit.window", self.window)
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold must be non-zero"));
        }
        if self.half_open_trial_limit == 0 {
            return Err(invalid("breaker.half_open_trial_limit must be non-zero"));
        }
        require_positive("breaker.cooldown", self.cooldown)
    }
}

impl SourceConfig {
    pub fn validate(&self) -> Result<()> {
        if normalize_name(&self.name).is_empty() {
            return Err(invalid("source name cannot be empty"));
        }
        let ctx = |e: Error| match e {
            Error::ConfigValidation(msg) => invalid(format!("source '{}': {}", self.name, msg)),
            other => other,
        };
        require_positive("expected_cadence", self.expected_cadence).map_err(ctx)?;
        self.rate_limit.validate().map_err(ctx)?;
        self.breaker.validate().map_err(ctx)?;
        if let Some(timeout) = self.timeout {
            require_positive("timeout", timeout).map_err(ctx)?;
        }
        Ok(())
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        require_positive("orchestrator.cycle_interval", self.cycle_interval)?;
        require_positive("orchestrator.cycle_deadline", self.cycle_deadline)?;
        require_positive("orchestrator.default_source_timeout", self.default_source_timeout)?;
        require_positive("orchestrator.staging_write_timeout", self.staging_write_timeout)
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<()> {
        require_positive("health.check_interval", self.check_interval)?;
        require_positive("health.lookback", self.lookback)?;
        if !(self.tolerance_factor >= 1.0) {
            return Err(invalid("health.tolerance_factor must be at least 1.0"));
        }
        if !(self.gap_critical_factor >= self.tolerance_factor) {
            return Err(invalid("health.gap_critical_factor must not be below tolerance_factor"));
        }
        if self.breaker_open_alert_cycles == 0 {
            return Err(invalid("health.breaker_open_alert_cycles must be non-zero"));
        }
        Ok(())
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        self.orchestrator.validate()?;
        self.health.validate()?;

        // Names and aliases share one namespace
        let mut seen = HashSet::new();
        for source in &self.sources {
            source.validate()?;
            for name in std::iter::once(&source.name).chain(source.aliases.iter()) {
                let key = normalize_name(name);
                if key.is_empty() {
                    return Err(invalid(format!("source '{}': empty alias", source.name)));
                }
                if !seen.insert(key) {
                    return Err(invalid(format!("duplicate source name or alias: '{}'", name)));
                }
            }
            let timeout = source.timeout.unwrap_or(self.orchestrator.default_source_timeout);
            if timeout > self.orchestrator.cycle_deadline {
                tracing::warn!(
                    source = %source.name,
                    "Source timeout {:?} exceeds cycle deadline {:?}",
                    timeout,
                    self.orchestrator.cycle_deadline
                );
            }
        }

        Ok(())
    }
}
