//! Natural-key upsert into the sink.

use ebbflow_protocol::{OrderedKey, Record};
use ebbflow_sinks::{RecordSink, SinkWriteError};
use tracing::info;

/// Funnels partition batches into one sink and keeps totals.
///
/// Rows are addressed by `(key, partition_id)`: a batch replaces whatever the
/// sink holds for the same addresses, so reapplying a batch is a no-op.
pub struct MergeWriter<'a, K: OrderedKey> {
    sink: &'a mut dyn RecordSink<K>,
    batches: usize,
    rows: u64,
    collapsed: u64,
}

impl<'a, K: OrderedKey> MergeWriter<'a, K> {
    pub fn new(sink: &'a mut dyn RecordSink<K>) -> Self {
        Self {
            sink,
            batches: 0,
            rows: 0,
            collapsed: 0,
        }
    }

    /// Upsert one batch. Duplicate addresses inside the batch collapse to
    /// their last occurrence.
    pub fn upsert(&mut self, records: &[Record<K>]) -> Result<u64, SinkWriteError> {
        if records.is_empty() {
            return Ok(0);
        }
        let written = self.sink.upsert(records)?;
        let collapsed = (records.len() as u64).saturating_sub(written);
        if collapsed > 0 {
            info!("Collapsed {} duplicate rows while merging", collapsed);
        }
        self.batches += 1;
        self.rows += written;
        self.collapsed += collapsed;
        info!("Merged {} rows into {}", written, self.sink.describe());
        Ok(written)
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    /// Rows dropped because a later row in the same batch shared their address.
    pub fn collapsed(&self) -> u64 {
        self.collapsed
    }
}
