use std::time::Duration;
use serde::Serialize;
use crate::history::{CollectionRunRecord, RunOutcome};
use crate::types::timestamp::Timestamp;

/// Half-open interval `[start, end)` without a successful collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeWindow {
    pub fn width(&self) -> Duration {
        self.end.duration_since(self.start)
    }
}

/// Windows inside `[since, until]` wider than `cadence * tolerance` that contain no
/// successful run.
///
/// Successes are placed at their `finished_at`. The window before the first success starts
/// at `since`; the one after the last success runs to `until`, which is how a source that
/// has quietly stopped shows up. Other outcomes and runs of other sources are ignored, so
/// the caller may pass the raw history.
pub fn detect_gaps(
    runs: &[CollectionRunRecord],
    since: Timestamp,
    until: Timestamp,
    cadence: Duration,
    tolerance: f64,
) -> Vec<TimeWindow> {
    if until <= since {
        return Vec::new();
    }
    let threshold = cadence.mul_f64(tolerance.max(0.0));

    let mut successes: Vec<Timestamp> = runs.iter()
        .filter(|r| r.outcome == RunOutcome::Success)
        .map(|r| r.finished_at)
        .filter(|at| *at >= since && *at <= until)
        .collect();
    successes.sort();

    let mut gaps = Vec::new();
    let mut cursor = since;
    for at in successes.into_iter().chain(std::iter::once(until)) {
        let window = TimeWindow { start: cursor, end: at };
        if window.width() > threshold {
            gaps.push(window);
        }
        cursor = cursor.max(at);
    }
    gaps
}
