use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use crate::collection::normalize_name;
use crate::config::BreakerConfig;
use crate::error::{Error, Result};
use crate::observability::metrics::BREAKER_STATE;
use crate::types::timestamp::{Clock, Timestamp};
use crate::utils::helper::alert_operations_team_warning;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_gauge(&self) -> i64 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::HalfOpen => 1,
            BreakerState::Open => 2,
        }
    }
}

/// Point-in-time copy of one breaker, safe to hand to readers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub source: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes_in_half_open: u32,
    pub half_open_in_flight: u32,
    pub opened_at: Option<Timestamp>,
    pub failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub cooldown_duration: Duration,
    pub half_open_trial_limit: u32,
    pub trips: u64,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes_in_half_open: u32,
    half_open_in_flight: u32,
    opened_at: Option<Timestamp>,
    trips: u64,
}

/// Failure-protection state machine for one source.
///
/// CLOSED counts consecutive failures and opens at `failure_threshold`. OPEN refuses
/// requests until `cooldown_duration` has passed; the next `allow_request` after that moves to
/// HALF_OPEN and hands out a trial slot. HALF_OPEN admits up to `half_open_trial_limit`
/// concurrent trials; any failure reopens, `half_open_trial_limit` consecutive successes close.
///
/// The OPEN -> HALF_OPEN move happens on the read side, there is no timer. All transitions
/// go through one mutex per breaker, so breakers of different sources never contend.
pub struct CircuitBreaker {
    source: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(source: &str, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        CircuitBreaker {
            source: normalize_name(source),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes_in_half_open: 0,
                half_open_in_flight: 0,
                opened_at: None,
                trips: 0,
            }),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// May the orchestrator call the collector now? Granting a HALF_OPEN trial consumes
    /// its slot under the same lock as the decision.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let now = self.clock.now();
                let cooled = inner
                    .opened_at
                    .map(|opened| now.duration_since(opened) >= self.config.cooldown)
                    .unwrap_or(true);
                if !cooled {
                    return false;
                }
                self.transition(&mut inner, BreakerState::HalfOpen);
                inner.consecutive_successes_in_half_open = 0;
                inner.half_open_in_flight = 1;
                true
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_trial_limit {
                    inner.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Give back a trial slot that was granted but not used.
    pub fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    pub fn report_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.consecutive_successes_in_half_open += 1;
                if inner.consecutive_successes_in_half_open >= self.config.half_open_trial_limit {
                    self.transition(&mut inner, BreakerState::Closed);
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes_in_half_open = 0;
                    inner.half_open_in_flight = 0;
                    inner.opened_at = None;
                }
            }
            BreakerState::Open => {
                // Request admitted before the breaker opened
                tracing::debug!(source = %self.source, "Ignoring success reported while open");
            }
        }
    }

    pub fn report_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        match inner.state {
            BreakerState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            BreakerState::HalfOpen => {
                self.trip(&mut inner);
            }
            BreakerState::Open => {}
        }
    }

    /// Administrative override: force CLOSED with all counters cleared.
    pub fn reset(&self) {
        let mut inner = self.lock();
        self.transition(&mut inner, BreakerState::Closed);
        inner.consecutive_failures = 0;
        inner.consecutive_successes_in_half_open = 0;
        inner.half_open_in_flight = 0;
        inner.opened_at = None;
        tracing::info!(source = %self.source, "Circuit breaker reset");
    }

    /// Read-only view. Never performs the OPEN -> HALF_OPEN transition.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            source: self.source.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes_in_half_open: inner.consecutive_successes_in_half_open,
            half_open_in_flight: inner.half_open_in_flight,
            opened_at: inner.opened_at,
            failure_threshold: self.config.failure_threshold,
            cooldown_duration: self.config.cooldown,
            half_open_trial_limit: self.config.half_open_trial_limit,
            trips: inner.trips,
        }
    }

    fn trip(&self, inner: &mut BreakerInner) {
        let from = inner.state;
        self.transition(inner, BreakerState::Open);
        inner.opened_at = Some(self.clock.now());
        inner.consecutive_successes_in_half_open = 0;
        inner.half_open_in_flight = 0;
        inner.trips += 1;

        tracing::error!(
            source = %self.source,
            consecutive_failures = inner.consecutive_failures,
            "Circuit breaker opened from {:?}",
            from
        );
        alert_operations_team_warning(format!(
            "Circuit breaker for source '{}' opened after {} consecutive failures",
            self.source, inner.consecutive_failures
        ));
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        if inner.state != to {
            tracing::info!(source = %self.source, "Circuit breaker {:?} -> {:?}", inner.state, to);
        }
        inner.state = to;
        BREAKER_STATE.with_label_values(&[self.source.as_str()]).set(to.as_gauge());
    }
}

/// Exactly one breaker per source name.
pub struct CircuitBreakers {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakers {
    pub fn new(default_config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        CircuitBreakers {
            breakers: DashMap::new(),
            default_config,
            clock,
        }
    }

    /// Create the source's breaker with `config` unless it already exists.
    pub fn configure(&self, source: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let clock = Arc::clone(&self.clock);
        self.breakers
            .entry(normalize_name(source))
            .or_insert_with(|| Arc::new(CircuitBreaker::new(source, config, clock)))
            .clone()
    }

    pub fn get_or_create(&self, source: &str) -> Arc<CircuitBreaker> {
        self.configure(source, self.default_config)
    }

    pub fn get(&self, source: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(&normalize_name(source)).map(|b| b.clone())
    }

    pub fn reset(&self, source: &str) -> Result<BreakerSnapshot> {
        let breaker = self.get(source).ok_or_else(|| Error::UnknownSource(source.to_string()))?;
        breaker.reset();
        Ok(breaker.snapshot())
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.source.cmp(&b.source));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::timestamp::ManualClock;

    fn config(threshold: u32, cooldown_secs: u64, trials: u32) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_secs(cooldown_secs),
            half_open_trial_limit: trials,
        }
    }

    fn breaker(cfg: BreakerConfig) -> (Arc<ManualClock>, CircuitBreaker) {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000_000)));
        (clock.clone(), CircuitBreaker::new("feedA", cfg, clock))
    }

    #[test]
    fn test_opens_exactly_at_threshold() {
        let (_, breaker) = breaker(config(3, 60, 1));

        breaker.report_failure();
        breaker.report_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow_request());

        breaker.report_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let (_, breaker) = breaker(config(3, 60, 1));
        breaker.report_failure();
        breaker.report_failure();
        breaker.report_success();
        breaker.report_failure();
        breaker.report_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_feed_a_recovery_scenario() {
        let (clock, breaker) = breaker(config(3, 60, 2));
        for _ in 0..3 {
            breaker.report_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        clock.advance(Duration::from_secs(59));
        assert!(!breaker.allow_request());
        assert_eq!(breaker.state(), BreakerState::Open);

        clock.advance(Duration::from_secs(1));
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.report_success();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.report_success();
        assert_eq!(breaker.state(), BreakerState::Closed);

        let snap = breaker.snapshot();
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.consecutive_successes_in_half_open, 0);
        assert_eq!(snap.opened_at, None);
    }

    #[test]
    fn test_half_open_failure_reopens_with_fresh_opened_at() {
        let (clock, breaker) = breaker(config(1, 30, 3));
        breaker.report_failure();
        let first_open = breaker.snapshot().opened_at.unwrap();

        clock.advance(Duration::from_secs(30));
        assert!(breaker.allow_request());
        breaker.report_failure();

        let snap = breaker.snapshot();
        assert_eq!(snap.state, BreakerState::Open);
        assert_eq!(snap.opened_at, Some(clock.now()));
        assert!(snap.opened_at.unwrap() > first_open);
        assert_eq!(snap.trips, 2);
    }

    #[test]
    fn test_half_open_limits_concurrent_trials() {
        let (clock, breaker) = breaker(config(1, 10, 2));
        breaker.report_failure();
        clock.advance(Duration::from_secs(10));

        assert!(breaker.allow_request());
        assert!(breaker.allow_request());
        assert!(!breaker.allow_request());

        breaker.release_trial();
        assert!(breaker.allow_request());
    }

    #[test]
    fn test_snapshot_does_not_transition() {
        let (clock, breaker) = breaker(config(1, 10, 1));
        breaker.report_failure();
        clock.advance(Duration::from_secs(60));
        assert_eq!(breaker.snapshot().state, BreakerState::Open);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_reset_forces_closed() {
        let (_, breaker) = breaker(config(1, 3600, 1));
        breaker.report_failure();
        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow_request());
    }

    #[test]
    fn test_board_keeps_one_instance_per_source() {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
        let board = CircuitBreakers::new(BreakerConfig::default(), clock);
        let a = board.configure("feedA", config(5, 1, 1));
        let b = board.get_or_create("FEEDA");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.config().failure_threshold, 5);
        assert!(matches!(board.reset("nope"), Err(Error::UnknownSource(_))));
    }

    #[test]
    fn test_concurrent_failures_are_not_lost() {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
        let breaker = Arc::new(CircuitBreaker::new("feedA", config(1_000, 60, 1), clock));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let breaker = Arc::clone(&breaker);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        breaker.report_failure();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(breaker.snapshot().consecutive_failures, 400);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
