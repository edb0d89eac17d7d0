//! Inclusive key ranges, watermarks, and per-partition sink coverage.

use crate::key::OrderedKey;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors from range construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("Range start {start} is after end {end}")]
    Inverted { start: String, end: String },
}

/// Inclusive, non-empty range over an ordered key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FetchRange<K> {
    start: K,
    end: K,
}

/// A fetch range bounded by a maximum span.
pub type Chunk<K> = FetchRange<K>;

impl<K: OrderedKey> FetchRange<K> {
    pub fn new(start: K, end: K) -> Result<Self, RangeError> {
        if start > end {
            return Err(RangeError::Inverted {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        Ok(Self { start, end })
    }

    /// A range covering exactly one key.
    pub fn single(key: K) -> Self {
        Self {
            start: key,
            end: key,
        }
    }

    pub fn start(&self) -> K {
        self.start
    }

    pub fn end(&self) -> K {
        self.end
    }

    /// Number of keys in the range.
    pub fn span(&self) -> u64 {
        K::span(self.start, self.end)
    }

    pub fn contains(&self, key: K) -> bool {
        self.start <= key && key <= self.end
    }

    /// Smallest range covering both `self` and `other`.
    pub fn union(&self, other: &Self) -> Self {
        Self {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Extend the range so it covers `key`.
    pub fn include(&mut self, key: K) {
        if key < self.start {
            self.start = key;
        }
        if key > self.end {
            self.end = key;
        }
    }
}

impl<K: OrderedKey> fmt::Display for FetchRange<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

impl<'de, K: OrderedKey> Deserialize<'de> for FetchRange<K> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Repr<K> {
            start: K,
            end: K,
        }

        let repr = Repr::<K>::deserialize(deserializer)?;
        FetchRange::new(repr.start, repr.end).map_err(serde::de::Error::custom)
    }
}

/// Key coverage already persisted in the sink for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watermark<K> {
    /// The partition has no persisted data.
    Absent,
    Covered { min: K, max: K },
}

impl<K: OrderedKey> Watermark<K> {
    pub fn covered(min: K, max: K) -> Self {
        Watermark::Covered { min, max }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Watermark::Absent)
    }

    /// Inclusive span between min and max (gaps inside are not visible).
    pub fn covered_span(&self) -> u64 {
        match self {
            Watermark::Absent => 0,
            Watermark::Covered { min, max } => K::span(*min, *max),
        }
    }
}

impl<K: OrderedKey> fmt::Display for Watermark<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Watermark::Absent => write!(f, "absent"),
            Watermark::Covered { min, max } => write!(f, "[{}, {}]", min, max),
        }
    }
}

/// Grouped min/max row as read back from a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange<K> {
    pub partition_id: String,
    pub min: K,
    pub max: K,
    pub rows: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_fetch_range_rejects_inverted() {
        let err = FetchRange::new(date(2021, 2, 1), date(2021, 1, 1)).unwrap_err();
        assert!(err.to_string().contains("after end"));
    }

    #[test]
    fn test_fetch_range_deserialize_validates() {
        let ok: FetchRange<i64> = serde_json::from_str(r#"{"start":1,"end":5}"#).unwrap();
        assert_eq!(ok.span(), 5);

        let bad = serde_json::from_str::<FetchRange<i64>>(r#"{"start":9,"end":5}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_fetch_range_include_and_union() {
        let mut range = FetchRange::single(10_i64);
        range.include(4);
        range.include(12);
        assert_eq!(range, FetchRange::new(4, 12).unwrap());

        let other = FetchRange::new(20_i64, 30).unwrap();
        assert_eq!(range.union(&other), FetchRange::new(4, 30).unwrap());
    }

    #[test]
    fn test_watermark_covered_span() {
        let wm = Watermark::covered(date(2021, 1, 1), date(2021, 6, 30));
        assert_eq!(wm.covered_span(), 181);
        assert_eq!(Watermark::<NaiveDate>::Absent.covered_span(), 0);
    }
}
