use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// UTC instant with microsecond precision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    micros: i64,  // Microseconds since epoch
}

impl Timestamp {
    pub fn now() -> Self {
        Timestamp::from_datetime(Utc::now())
    }

    pub fn from_micros(micros: i64) -> Self {
        Timestamp { micros }
    }

    pub fn from_millis(millis: i64) -> Self {
        Timestamp { micros: millis.saturating_mul(1_000) }
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Timestamp { micros: dt.timestamp_micros() }
    }

    pub fn as_micros(&self) -> i64 {
        self.micros
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_micros(self.micros).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn parse(s: &str) -> Result<Self, chrono::ParseError> {
        let dt = DateTime::parse_from_rfc3339(s.trim())?;
        Ok(Timestamp::from_datetime(dt.with_timezone(&Utc)))
    }

    /// Saturating difference, zero when `earlier` is not before `self`.
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let delta = self.micros.saturating_sub(earlier.micros);
        if delta <= 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(delta as u64)
        }
    }

    pub fn saturating_sub(&self, duration: Duration) -> Timestamp {
        Timestamp { micros: self.micros.saturating_sub(duration_micros(duration)) }
    }
}

fn duration_micros(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}

impl std::ops::Sub for Timestamp {
    type Output = Duration;

    fn sub(self, other: Timestamp) -> Duration {
        self.duration_since(other)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339_opts(SecondsFormat::Micros, true))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TimestampRepr {
    Text(String),
    Micros(i64),
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match TimestampRepr::deserialize(deserializer)? {
            TimestampRepr::Text(text) => Timestamp::parse(&text).map_err(serde::de::Error::custom),
            TimestampRepr::Micros(micros) => Ok(Timestamp::from_micros(micros)),
        }
    }
}

/// Source of "now" for breakers, limiters and health checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    micros: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        ManualClock {
            micros: AtomicI64::new(start.as_micros()),
        }
    }

    pub fn set(&self, at: Timestamp) {
        self.micros.store(at.as_micros(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.micros.fetch_add(duration_micros(by), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_micros(self.micros.load(Ordering::SeqCst))
    }
}
