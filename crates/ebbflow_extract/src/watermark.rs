//! Per-partition coverage read back from the sink.

use crate::error::ExtractError;
use ebbflow_protocol::{OrderedKey, Partition, Watermark};
use ebbflow_sinks::RecordSink;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Map each configured partition to the key span the sink already holds.
///
/// A sink that was never created or lacks the target relation yields
/// `Absent` for every partition. Any other read error aborts the run.
pub fn compute_watermarks<K: OrderedKey>(
    sink: &dyn RecordSink<K>,
    partitions: &[Partition],
) -> Result<BTreeMap<String, Watermark<K>>, ExtractError> {
    let mut watermarks: BTreeMap<String, Watermark<K>> = partitions
        .iter()
        .map(|p| (p.id.clone(), Watermark::Absent))
        .collect();

    let ranges = match sink.key_ranges() {
        Ok(ranges) => ranges,
        Err(err) if err.is_missing_data() => {
            warn!("{}; assuming first run for {}", err, sink.describe());
            return Ok(watermarks);
        }
        Err(err) => return Err(ExtractError::SinkRead(err)),
    };

    for range in ranges {
        match watermarks.get_mut(&range.partition_id) {
            Some(slot) => {
                *slot = Watermark::covered(range.min, range.max);
            }
            None => debug!(
                "Ignoring sink rows for unconfigured partition {} ({} rows)",
                range.partition_id, range.rows
            ),
        }
    }

    for (partition, watermark) in &watermarks {
        info!("Watermark {}: {}", partition, watermark);
    }
    Ok(watermarks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ebbflow_protocol::Record;
    use ebbflow_sinks::MemorySink;
    use serde_json::Map;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn partitions(ids: &[&str]) -> Vec<Partition> {
        ids.iter().map(|id| Partition::new(*id)).collect()
    }

    #[test]
    fn test_watermarks_from_grouped_ranges() {
        let sink = MemorySink::new().with_records(vec![
            Record::new(date(2021, 1, 1), "Sydney", Map::new()),
            Record::new(date(2021, 6, 30), "Sydney", Map::new()),
            Record::new(date(2022, 1, 1), "Retired City", Map::new()),
        ]);

        let watermarks = compute_watermarks(&sink, &partitions(&["Sydney", "Perth"])).unwrap();
        assert_eq!(
            watermarks["Sydney"],
            Watermark::covered(date(2021, 1, 1), date(2021, 6, 30))
        );
        assert_eq!(watermarks["Perth"], Watermark::Absent);
        assert!(!watermarks.contains_key("Retired City"));
    }

    #[test]
    fn test_missing_sink_is_absent_everywhere() {
        let sink = MemorySink::<NaiveDate>::never_initialized();
        let watermarks = compute_watermarks(&sink, &partitions(&["Sydney", "Perth"])).unwrap();
        assert!(watermarks.values().all(|w| w.is_absent()));

        let sink = MemorySink::<NaiveDate>::without_relation();
        let watermarks = compute_watermarks(&sink, &partitions(&["Sydney"])).unwrap();
        assert!(watermarks["Sydney"].is_absent());
    }

    #[test]
    fn test_other_read_errors_abort() {
        let sink = MemorySink::<NaiveDate>::new().fail_reads("disk on fire");
        let err = compute_watermarks(&sink, &partitions(&["Sydney"])).unwrap_err();
        assert!(matches!(err, ExtractError::SinkRead(_)));
    }
}
