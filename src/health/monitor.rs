use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, Duration, MissedTickBehavior};
use crate::error::Result;
use crate::health::detector::{HealthDetector, HealthLevel, HealthStatus};
use crate::observability::metrics::{DEAD_ROWS, DETECTED_GAPS, HEALTH_CHECKS};
use crate::observability::tracing::trace_health_check;
use crate::utils::helper::{alert_operations_team_critical, alert_operations_team_warning};

/// Periodically evaluates every source and raises alerts when a source's level worsens.
/// A source that stays at the same level is not re-alerted on every pass.
pub struct HealthMonitor {
    detector: Arc<HealthDetector>,
    check_interval: Duration,
    last_levels: Mutex<HashMap<String, HealthLevel>>,
}

impl HealthMonitor {
    pub fn new(detector: Arc<HealthDetector>) -> Self {
        let check_interval = detector.config().check_interval;
        HealthMonitor {
            detector,
            check_interval,
            last_levels: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.check_once().await {
                        tracing::error!("Health check failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Health monitor stopping");
                        break;
                    }
                }
            }
        }
    }

    /// One pass over all sources. Returns the statuses it evaluated.
    pub async fn check_once(&self) -> Result<Vec<HealthStatus>> {
        let report = self.detector.health_report().await?;
        HEALTH_CHECKS.inc();

        let mut last_levels = self.last_levels.lock().await;
        for status in &report {
            let _span = trace_health_check(&status.source).entered();
            DETECTED_GAPS.with_label_values(&[status.source.as_str()]).set(status.detected_gaps.len() as i64);
            DEAD_ROWS.with_label_values(&[status.source.as_str()]).set(status.dead_tuple_estimate as i64);

            let previous = last_levels.insert(status.source.clone(), status.level).unwrap_or(HealthLevel::Healthy);
            if status.level <= previous {
                if status.level == HealthLevel::Healthy && previous != HealthLevel::Healthy {
                    tracing::info!(source = %status.source, "Source recovered");
                }
                continue;
            }

            let summary = status.alerts.iter()
                .filter(|a| a.level == status.level)
                .map(|a| a.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            let message = format!("source '{}' is {:?}: {}", status.source, status.level, summary);
            match status.level {
                HealthLevel::Critical => alert_operations_team_critical(message),
                HealthLevel::Degraded => alert_operations_team_warning(message),
                HealthLevel::Healthy => {}
            }
        }
        Ok(report)
    }

    /// Level reported for `source` on the last pass.
    pub async fn last_level(&self, source: &str) -> Option<HealthLevel> {
        self.last_levels.lock().await.get(source).copied()
    }
}
