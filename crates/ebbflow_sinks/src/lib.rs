//! Keyed record sinks.
//!
//! A sink stores records addressed by `(ordered key, partition)` and answers
//! one question for planning: which key span each partition already covers.
//! Reads distinguish a sink that was never created and a missing relation
//! from real failures, so the watermark pass can treat the first two as
//! "no data yet".

use ebbflow_db::BackendError;
use ebbflow_protocol::{KeyRange, OrderedKey, Record};
use std::collections::BTreeMap;
use thiserror::Error;

pub mod duckdb;
pub mod memory;
pub mod schema;

pub use crate::duckdb::DuckDbSink;
pub use memory::MemorySink;
pub use schema::{ColumnSpec, ColumnType, SinkSchema, FETCHED_AT_COLUMN};

/// Errors from reading key coverage out of a sink.
#[derive(Debug, Error)]
pub enum SinkReadError {
    /// The sink database did not exist before this process opened it.
    #[error("Sink has never been initialized: {location}")]
    NeverInitialized { location: String },

    /// The sink exists but the target relation does not.
    #[error("Relation does not exist: {table}")]
    UndefinedRelation { table: String },

    #[error("Sink read failed: {0}")]
    Backend(#[from] BackendError),

    #[error("Sink read failed: {0}")]
    Unavailable(String),
}

impl SinkReadError {
    /// True for the two "nothing persisted yet" signals.
    pub fn is_missing_data(&self) -> bool {
        matches!(
            self,
            SinkReadError::NeverInitialized { .. } | SinkReadError::UndefinedRelation { .. }
        )
    }
}

/// Errors from writing records into a sink.
#[derive(Debug, Error)]
pub enum SinkWriteError {
    #[error("Sink write failed: {0}")]
    Backend(#[from] BackendError),

    #[error("Sink rejected batch: {0}")]
    Rejected(String),
}

/// Destination for extracted records.
///
/// Sinks are driven from a single task; implementations need not be `Send`.
pub trait RecordSink<K: OrderedKey> {
    /// Short description for logs, e.g. `duckdb:warehouse.duckdb/daily_weather`.
    fn describe(&self) -> String;

    /// Grouped min/max key and row count per partition.
    fn key_ranges(&self) -> Result<Vec<KeyRange<K>>, SinkReadError>;

    /// Insert records, replacing rows that share a natural key. Idempotent.
    ///
    /// Duplicates inside `records` collapse to their last occurrence; the
    /// return value counts the rows left after collapsing.
    fn upsert(&mut self, records: &[Record<K>]) -> Result<u64, SinkWriteError>;

    /// Total rows stored (zero when nothing was ever written).
    fn row_count(&self) -> Result<u64, SinkReadError>;
}

/// Collapse records sharing `(key, partition)`; the last occurrence wins and
/// first-seen order is kept.
pub fn dedupe_by_natural_key<K: OrderedKey>(records: &[Record<K>]) -> Vec<&Record<K>> {
    let mut slot: BTreeMap<(K, &str), usize> = BTreeMap::new();
    let mut out: Vec<&Record<K>> = Vec::with_capacity(records.len());
    for record in records {
        match slot.get(&record.natural_key()) {
            Some(&index) => out[index] = record,
            None => {
                slot.insert(record.natural_key(), out.len());
                out.push(record);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn record(id: i64, partition: &str, name: &str) -> Record<i64> {
        let mut fields = Map::new();
        fields.insert("name".into(), json!(name));
        Record::new(id, partition, fields)
    }

    #[test]
    fn test_dedupe_last_wins() {
        let records = vec![
            record(1, "character", "Rick"),
            record(2, "character", "Morty"),
            record(1, "character", "Rick Sanchez"),
            record(1, "episode", "Pilot"),
        ];
        let deduped = dedupe_by_natural_key(&records);
        assert_eq!(deduped.len(), 3);
        assert_eq!(deduped[0].field("name"), Some(&json!("Rick Sanchez")));
        assert_eq!(deduped[1].key, 2);
        assert_eq!(deduped[2].partition_id, "episode");
    }

    #[test]
    fn test_missing_data_signals() {
        assert!(SinkReadError::NeverInitialized {
            location: "memory".into()
        }
        .is_missing_data());
        assert!(SinkReadError::UndefinedRelation {
            table: "t".into()
        }
        .is_missing_data());
        assert!(!SinkReadError::Unavailable("disk".into()).is_missing_data());
    }
}
