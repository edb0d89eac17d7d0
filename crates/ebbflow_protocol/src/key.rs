//! Ordered keys that partitions are extracted over.
//!
//! A key type knows how to step forward, measure an inclusive span, and find
//! where a chunk starting at a given key must end. Dates chunk on calendar-year
//! edges; integer ids chunk on fixed widths.

use chrono::{Datelike, NaiveDate};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Column type family of an ordered key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Date,
    Integer,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Date => "date",
            KeyKind::Integer => "integer",
        }
    }

    /// SQL column type used by sinks for this key.
    pub fn sql_type(&self) -> &'static str {
        match self {
            KeyKind::Date => "DATE",
            KeyKind::Integer => "BIGINT",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for KeyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "date" => Ok(KeyKind::Date),
            "integer" | "int" | "id" => Ok(KeyKind::Integer),
            other => Err(format!("Unknown key kind: '{}'", other)),
        }
    }
}

/// Maximum span of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkSpan {
    /// Chunks end on Dec 31 of the chunk start's year.
    CalendarYear,
    /// Chunks hold at most this many consecutive keys.
    Width(u64),
}

impl Default for ChunkSpan {
    fn default() -> Self {
        ChunkSpan::CalendarYear
    }
}

/// A totally ordered, discrete key.
pub trait OrderedKey:
    Copy + Ord + fmt::Debug + fmt::Display + Send + Sync + Serialize + DeserializeOwned + 'static
{
    const KIND: KeyKind;

    /// The next key, or `None` at the top of the domain.
    fn successor(self) -> Option<Self>;

    /// Number of keys in `[start, end]`; zero when `start > end`.
    fn span(start: Self, end: Self) -> u64;

    /// Last key of a chunk that begins at `start`, before clamping to the
    /// range end. `None` means the chunk is unbounded.
    fn chunk_end(start: Self, span: ChunkSpan) -> Option<Self>;

    fn to_json(&self) -> Value;

    fn from_json(value: &Value) -> Option<Self>;
}

impl OrderedKey for NaiveDate {
    const KIND: KeyKind = KeyKind::Date;

    fn successor(self) -> Option<Self> {
        self.succ_opt()
    }

    fn span(start: Self, end: Self) -> u64 {
        if start > end {
            return 0;
        }
        (end - start).num_days() as u64 + 1
    }

    fn chunk_end(start: Self, span: ChunkSpan) -> Option<Self> {
        match span {
            ChunkSpan::CalendarYear => NaiveDate::from_ymd_opt(start.year(), 12, 31),
            ChunkSpan::Width(0) => None,
            ChunkSpan::Width(width) => start.checked_add_days(chrono::Days::new(width - 1)),
        }
    }

    fn to_json(&self) -> Value {
        Value::String(self.format("%Y-%m-%d").to_string())
    }

    fn from_json(value: &Value) -> Option<Self> {
        let raw = value.as_str()?;
        // Timestamps ("2021-01-01T00:00") carry the date in their first 10 chars.
        let date_part = raw.get(..10).unwrap_or(raw);
        NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
    }
}

impl OrderedKey for i64 {
    const KIND: KeyKind = KeyKind::Integer;

    fn successor(self) -> Option<Self> {
        self.checked_add(1)
    }

    fn span(start: Self, end: Self) -> u64 {
        if start > end {
            return 0;
        }
        (end as i128 - start as i128 + 1) as u64
    }

    fn chunk_end(start: Self, span: ChunkSpan) -> Option<Self> {
        match span {
            ChunkSpan::CalendarYear | ChunkSpan::Width(0) => None,
            ChunkSpan::Width(width) => {
                let width = i64::try_from(width).unwrap_or(i64::MAX);
                Some(start.saturating_add(width - 1))
            }
        }
    }

    fn to_json(&self) -> Value {
        Value::from(*self)
    }

    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}
