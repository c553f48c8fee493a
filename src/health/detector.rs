use std::sync::Arc;
use std::time::Duration;
use futures::future::try_join_all;
use serde::Serialize;
use crate::collection::{BreakerSnapshot, BreakerState, CircuitBreakers, CollectorRegistry, Source};
use crate::config::HealthConfig;
use crate::error::Result;
use crate::health::gaps::{self, TimeWindow};
use crate::history::RunHistory;
use crate::staging::StagingStore;
use crate::types::timestamp::{Clock, Timestamp};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthAlert {
    pub level: HealthLevel,
    pub message: String,
}

/// Composite view of one source.
#[derive(Clone, Debug, Serialize)]
pub struct HealthStatus {
    pub source: String,
    pub checked_at: Timestamp,
    pub last_success_at: Option<Timestamp>,
    /// `None` until the source's breaker has been used.
    pub breaker: Option<BreakerSnapshot>,
    pub detected_gaps: Vec<TimeWindow>,
    pub dead_tuple_estimate: u64,
    pub level: HealthLevel,
    pub alerts: Vec<HealthAlert>,
}

/// Answers "is any source silently behind?" from the run history, breaker snapshots and
/// the staging store. Read-only: it never transitions a breaker or touches staging rows.
pub struct HealthDetector {
    registry: Arc<CollectorRegistry>,
    breakers: Arc<CircuitBreakers>,
    history: Arc<dyn RunHistory>,
    staging: Arc<dyn StagingStore>,
    clock: Arc<dyn Clock>,
    config: HealthConfig,
}

impl HealthDetector {
    pub fn new(
        registry: Arc<CollectorRegistry>,
        breakers: Arc<CircuitBreakers>,
        history: Arc<dyn RunHistory>,
        staging: Arc<dyn StagingStore>,
        clock: Arc<dyn Clock>,
        config: HealthConfig,
    ) -> Self {
        HealthDetector { registry, breakers, history, staging, clock, config }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Gaps for a source between `since` and now.
    pub async fn detect_gaps(&self, source: &str, since: Timestamp) -> Result<Vec<TimeWindow>> {
        let source = self.registry.source(source)?;
        self.gaps_for(&source, since, self.clock.now()).await
    }

    async fn gaps_for(&self, source: &Source, since: Timestamp, until: Timestamp) -> Result<Vec<TimeWindow>> {
        let runs = self.history.query(&source.name, since, until).await?;
        Ok(gaps::detect_gaps(&runs, since, until, source.expected_cadence, self.config.tolerance_factor))
    }

    pub async fn current_health(&self, source: &str) -> Result<HealthStatus> {
        let source = self.registry.source(source)?;
        let now = self.clock.now();
        let since = now.saturating_sub(self.config.lookback);

        let last_success_at = self.history.last_success(&source.name).await?.map(|r| r.finished_at);
        let detected_gaps = self.gaps_for(&source, since, now).await?;
        let dead_tuple_estimate = self.staging.dead_row_estimate(&source.name).await?;
        let breaker = self.breakers.get(&source.name).map(|b| b.snapshot());

        let mut alerts = Vec::new();

        if let Some(snapshot) = breaker.as_ref().filter(|b| b.state == BreakerState::Open) {
            let limit = snapshot.cooldown_duration.saturating_mul(self.config.breaker_open_alert_cycles);
            if let Some(open_for) = snapshot.opened_at.map(|at| now.duration_since(at)) {
                if open_for >= limit {
                    alerts.push(HealthAlert {
                        level: HealthLevel::Critical,
                        message: format!("breaker open for {}", humanize(open_for)),
                    });
                }
            }
        }

        match last_success_at {
            Some(at) if at >= since => {}
            Some(at) => alerts.push(HealthAlert {
                level: HealthLevel::Critical,
                message: format!("no successful collection since {}", at),
            }),
            None => alerts.push(HealthAlert {
                level: HealthLevel::Critical,
                message: "never collected successfully".to_string(),
            }),
        }

        if let Some(widest) = detected_gaps.iter().max_by_key(|g| g.width()) {
            let critical = source.expected_cadence.mul_f64(self.config.gap_critical_factor);
            let level = if widest.width() > critical { HealthLevel::Critical } else { HealthLevel::Degraded };
            alerts.push(HealthAlert {
                level,
                message: format!(
                    "{} collection gap(s) in the last {}, widest {} from {}",
                    detected_gaps.len(),
                    humanize(self.config.lookback),
                    humanize(widest.width()),
                    widest.start
                ),
            });
        }

        if dead_tuple_estimate > self.config.dead_row_alert_threshold {
            alerts.push(HealthAlert {
                level: HealthLevel::Degraded,
                message: format!("{} staging row(s) without a current row", dead_tuple_estimate),
            });
        }

        let level = alerts.iter().map(|a| a.level).max().unwrap_or(HealthLevel::Healthy);
        Ok(HealthStatus {
            source: source.name,
            checked_at: now,
            last_success_at,
            breaker,
            detected_gaps,
            dead_tuple_estimate,
            level,
            alerts,
        })
    }

    /// Health of every registered source, sorted by name.
    pub async fn health_report(&self) -> Result<Vec<HealthStatus>> {
        let sources = self.registry.list_sources();
        try_join_all(sources.iter().map(|s| self.current_health(&s.name))).await
    }
}

fn humanize(duration: Duration) -> String {
    humantime::format_duration(Duration::from_secs(duration.as_secs())).to_string()
}
