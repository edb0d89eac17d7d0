//! In-memory sink for tests and dry runs.

use crate::{dedupe_by_natural_key, RecordSink, SinkReadError, SinkWriteError};
use ebbflow_protocol::{KeyRange, OrderedKey, Record};
use std::collections::BTreeMap;

/// Which "nothing persisted" signal an empty memory sink reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmptySignal {
    None,
    NeverInitialized,
    UndefinedRelation,
}

/// Records keyed by `(partition, key)`.
#[derive(Debug)]
pub struct MemorySink<K: OrderedKey> {
    rows: BTreeMap<(String, K), Record<K>>,
    empty_signal: EmptySignal,
    read_failure: Option<String>,
    write_failure: Option<String>,
    upserts: usize,
}

impl<K: OrderedKey> Default for MemorySink<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: OrderedKey> MemorySink<K> {
    pub fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
            empty_signal: EmptySignal::None,
            read_failure: None,
            write_failure: None,
            upserts: 0,
        }
    }

    /// Reports `NeverInitialized` until the first write.
    pub fn never_initialized() -> Self {
        Self {
            empty_signal: EmptySignal::NeverInitialized,
            ..Self::new()
        }
    }

    /// Reports `UndefinedRelation` until the first write.
    pub fn without_relation() -> Self {
        Self {
            empty_signal: EmptySignal::UndefinedRelation,
            ..Self::new()
        }
    }

    /// Pre-load rows without counting an upsert.
    pub fn with_records(mut self, records: impl IntoIterator<Item = Record<K>>) -> Self {
        for record in records {
            self.rows
                .insert((record.partition_id.clone(), record.key), record);
        }
        self
    }

    /// Every `key_ranges` call fails with a non-missing-data error.
    pub fn fail_reads(mut self, message: impl Into<String>) -> Self {
        self.read_failure = Some(message.into());
        self
    }

    /// Every `upsert` call fails.
    pub fn fail_writes(mut self, message: impl Into<String>) -> Self {
        self.write_failure = Some(message.into());
        self
    }

    pub fn records(&self) -> impl Iterator<Item = &Record<K>> {
        self.rows.values()
    }

    pub fn get(&self, partition_id: &str, key: K) -> Option<&Record<K>> {
        self.rows.get(&(partition_id.to_string(), key))
    }

    pub fn partition_rows(&self, partition_id: &str) -> usize {
        self.rows
            .keys()
            .filter(|(partition, _)| partition == partition_id)
            .count()
    }

    /// Number of successful `upsert` calls.
    pub fn upsert_calls(&self) -> usize {
        self.upserts
    }
}

impl<K: OrderedKey> RecordSink<K> for MemorySink<K> {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn key_ranges(&self) -> Result<Vec<KeyRange<K>>, SinkReadError> {
        if let Some(message) = &self.read_failure {
            return Err(SinkReadError::Unavailable(message.clone()));
        }
        if self.rows.is_empty() {
            match self.empty_signal {
                EmptySignal::NeverInitialized => {
                    return Err(SinkReadError::NeverInitialized {
                        location: self.describe(),
                    })
                }
                EmptySignal::UndefinedRelation => {
                    return Err(SinkReadError::UndefinedRelation {
                        table: self.describe(),
                    })
                }
                EmptySignal::None => {}
            }
        }

        let mut ranges: Vec<KeyRange<K>> = Vec::new();
        // Keys are sorted by (partition, key), so each partition is one run.
        for (partition, key) in self.rows.keys() {
            match ranges.last_mut() {
                Some(range) if &range.partition_id == partition => {
                    range.max = *key;
                    range.rows += 1;
                }
                _ => ranges.push(KeyRange {
                    partition_id: partition.clone(),
                    min: *key,
                    max: *key,
                    rows: 1,
                }),
            }
        }
        Ok(ranges)
    }

    fn upsert(&mut self, records: &[Record<K>]) -> Result<u64, SinkWriteError> {
        if let Some(message) = &self.write_failure {
            return Err(SinkWriteError::Rejected(message.clone()));
        }
        let unique = dedupe_by_natural_key(records);
        for record in &unique {
            self.rows.insert(
                (record.partition_id.clone(), record.key),
                (*record).clone(),
            );
        }
        self.empty_signal = EmptySignal::None;
        self.upserts += 1;
        Ok(unique.len() as u64)
    }

    fn row_count(&self) -> Result<u64, SinkReadError> {
        Ok(self.rows.len() as u64)
    }
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
    fn test_upsert_is_idempotent() {
        let mut sink = MemorySink::new();
        let batch = vec![record(1, "character", "Rick"), record(2, "character", "Morty")];
        sink.upsert(&batch).unwrap();
        sink.upsert(&batch).unwrap();
        assert_eq!(sink.row_count().unwrap(), 2);

        sink.upsert(&[record(2, "character", "Morty Smith")]).unwrap();
        assert_eq!(sink.row_count().unwrap(), 2);
        assert_eq!(
            sink.get("character", 2).unwrap().field("name"),
            Some(&json!("Morty Smith"))
        );
    }

    #[test]
    fn test_key_ranges_grouped_by_partition() {
        let sink = MemorySink::new().with_records(vec![
            record(3, "character", "a"),
            record(1, "character", "b"),
            record(7, "episode", "c"),
        ]);
        let ranges = sink.key_ranges().unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!((ranges[0].min, ranges[0].max, ranges[0].rows), (1, 3, 2));
        assert_eq!(ranges[1].partition_id, "episode");
    }

    #[test]
    fn test_empty_signals_clear_after_write() {
        let mut sink = MemorySink::<i64>::never_initialized();
        assert!(matches!(
            sink.key_ranges(),
            Err(SinkReadError::NeverInitialized { .. })
        ));
        sink.upsert(&[record(1, "character", "Rick")]).unwrap();
        assert_eq!(sink.key_ranges().unwrap().len(), 1);

        let sink = MemorySink::<i64>::without_relation();
        assert!(matches!(
            sink.key_ranges(),
            Err(SinkReadError::UndefinedRelation { .. })
        ));
    }
}
