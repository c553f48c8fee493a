use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use crate::collection::orchestrator::{CycleReport, Orchestrator};
use crate::error::{Error, Result};

struct TriggerRequest {
    sources: Option<Vec<String>>,
    respond_to: oneshot::Sender<Result<CycleReport>>,
}

/// Asks a running scheduler for an immediate cycle. The cycle belongs to the scheduler, so
/// a caller that stops waiting does not stop it.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<TriggerRequest>,
}

impl SchedulerHandle {
    /// Run a cycle now, independent of the timer, and wait for its report.
    pub async fn trigger(&self, sources: Option<Vec<String>>) -> Result<CycleReport> {
        let (respond_to, rx) = oneshot::channel();
        self.tx
            .send(TriggerRequest { sources, respond_to })
            .await
            .map_err(|_| Error::TaskFailed("scheduler is not running".to_string()))?;
        rx.await
            .map_err(|_| Error::TaskFailed("scheduler dropped the cycle".to_string()))?
    }
}

/// Starts a cycle every `interval`, the first one `interval` after start, and on demand.
///
/// A new cycle never waits for the previous one; slow cycles overlap and report on their
/// own. On shutdown, cycles already started are allowed to finish.
pub struct CycleScheduler {
    orchestrator: Orchestrator,
    interval: Duration,
    rx: mpsc::Receiver<TriggerRequest>,
}

impl CycleScheduler {
    pub fn new(orchestrator: Orchestrator, interval: Duration) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::channel(16);
        (CycleScheduler { orchestrator, interval, rx }, SchedulerHandle { tx })
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight: JoinSet<()> = JoinSet::new();
        tracing::info!(interval = ?self.interval, "Cycle scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let orchestrator = self.orchestrator.clone();
                    in_flight.spawn(async move {
                        match orchestrator.run_cycle(None).await {
                            Ok(report) => tracing::debug!(
                                cycle_id = %report.cycle_id,
                                status = report.status().as_str(),
                                "Scheduled cycle done"
                            ),
                            Err(e) => tracing::error!("Scheduled cycle failed: {}", e),
                        }
                    });
                }
                Some(request) = self.rx.recv() => {
                    let orchestrator = self.orchestrator.clone();
                    in_flight.spawn(async move {
                        let result = orchestrator.run_cycle(request.sources.as_deref()).await;
                        let _ = request.respond_to.send(result);
                    });
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("Cycle task panicked: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(in_flight = in_flight.len(), "Cycle scheduler stopping");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Cycle task panicked: {}", e);
            }
        }
    }
}
