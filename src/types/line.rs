use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Fixed-point decimal with 4 places. Used for odds prices and line values
/// (spreads, totals), so equality is exact and history deduplication is stable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quote(i64);

impl Quote {
    const MULTIPLIER: i64 = 10_000;  // 10^4

    pub fn from_raw(value: i64) -> Self {
        Quote(value)
    }

    pub fn raw_value(&self) -> i64 {
        self.0
    }

    pub fn from_f64(value: f64) -> Self {
        Quote((value * Self::MULTIPLIER as f64).round() as i64)
    }

    pub fn to_f64(&self) -> f64 {
        self.0 as f64 / Self::MULTIPLIER as f64
    }

    pub fn from_i64(value: i64) -> Self {
        Quote(value.saturating_mul(Self::MULTIPLIER))
    }
}

impl fmt::Display for Quote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}

// Feeds publish plain JSON numbers (-110, 1.91, -3.5).
impl Serialize for Quote {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_f64())
    }
}

impl<'de> Deserialize<'de> for Quote {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        if !value.is_finite() {
            return Err(serde::de::Error::custom("quote must be finite"));
        }
        Ok(Quote::from_f64(value))
    }
}

/// The observed value of one market side: a price, a line, or both.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LineValue {
    pub price: Option<Quote>,
    pub line: Option<Quote>,
}

impl LineValue {
    pub fn new(price: Option<Quote>, line: Option<Quote>) -> Self {
        LineValue { price, line }
    }

    pub fn price(price: f64) -> Self {
        LineValue { price: Some(Quote::from_f64(price)), line: None }
    }

    pub fn is_empty(&self) -> bool {
        self.price.is_none() && self.line.is_none()
    }
}

impl fmt::Display for LineValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.price, self.line) {
            (Some(price), Some(line)) => write!(f, "{} @ {}", line, price),
            (Some(price), None) => write!(f, "{}", price),
            (None, Some(line)) => write!(f, "line {}", line),
            (None, None) => write!(f, "-"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_rounds_to_four_places() {
        assert_eq!(Quote::from_f64(-3.5).raw_value(), -35_000);
        assert_eq!(Quote::from_f64(1.90909), Quote::from_raw(19_091));
        assert_eq!(Quote::from_i64(-110), Quote::from_f64(-110.0));
    }

    #[test]
    fn test_quote_json_is_a_number() {
        let q: Quote = serde_json::from_str("-110").unwrap();
        assert_eq!(q, Quote::from_i64(-110));
        assert_eq!(serde_json::to_string(&Quote::from_f64(-3.5)).unwrap(), "-3.5");
    }

    #[test]
    fn test_line_value_empty() {
        assert!(LineValue::default().is_empty());
        assert!(!LineValue::price(-110.0).is_empty());
    }
}
