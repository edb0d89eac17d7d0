//! `ebbflow plan`: show what a run would fetch, without fetching.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Args;
use ebbflow_db::DbConnection;
use ebbflow_extract::{compute_watermarks, plan, Requested, SourceDefinition};
use ebbflow_protocol::{KeyKind, OrderedKey, Watermark};
use ebbflow_sinks::DuckDbSink;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::cli::config::ResolvedConfig;
use crate::cli::output::print_table;
use crate::runner::{configured_ranges, KeyBounds, KeySpan};

/// Arguments for the plan command
#[derive(Debug, Args)]
pub struct PlanArgs {
    /// Source to plan
    pub source: String,

    /// First key to request
    #[arg(long)]
    pub start: Option<String>,

    /// Last key to request
    #[arg(long)]
    pub end: Option<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionPlan {
    pub partition: String,
    pub watermark: Option<KeySpan>,
    pub requested: String,
    pub decision: String,
    pub needed: Option<KeySpan>,
    pub chunks: Vec<KeySpan>,
}

pub fn run(args: PlanArgs, config: &ResolvedConfig) -> Result<()> {
    let source = config.source(&args.source)?;
    let bounds = KeyBounds {
        start: args.start.clone(),
        end: args.end.clone(),
    };
    let plans = match source.key_kind {
        KeyKind::Date => plan_source::<NaiveDate>(source, &config.sink_path, &bounds)?,
        KeyKind::Integer => plan_source::<i64>(source, &config.sink_path, &bounds)?,
    };

    if args.json {
        let value = serde_json::json!({
            "source": source.name,
            "table": source.table,
            "sink": config.sink_path.to_string_lossy(),
            "partitions": plans,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("{} -> {} ({})", source.name, source.table, config.sink_path.display());
    let rows = plans
        .iter()
        .map(|p| {
            vec![
                p.partition.clone(),
                p.watermark
                    .as_ref()
                    .map(|w| w.to_string())
                    .unwrap_or_else(|| "absent".to_string()),
                p.requested.clone(),
                p.decision.clone(),
                p.needed
                    .as_ref()
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                p.chunks.len().to_string(),
            ]
        })
        .collect();
    print_table(
        &["Partition", "Holds", "Requested", "Decision", "Needed", "Chunks"],
        rows,
    );
    Ok(())
}

/// Plan every partition of `source` against the sink at `sink_path`.
///
/// The sink is opened read-only and without the writer lock. A missing sink
/// file means nothing is held yet.
pub fn plan_source<K: OrderedKey>(
    source: &SourceDefinition,
    sink_path: &Path,
    bounds: &KeyBounds,
) -> Result<Vec<PartitionPlan>> {
    let watermarks: BTreeMap<String, Watermark<K>> = if sink_path.exists() {
        let conn = DbConnection::open_readonly(sink_path)
            .with_context(|| format!("Failed to open sink {}", sink_path.display()))?;
        let sink = DuckDbSink::<K>::with_connection(conn, source.sink_schema());
        compute_watermarks(&sink, &source.partitions)?
    } else {
        source
            .partitions
            .iter()
            .map(|p| (p.id.clone(), Watermark::Absent))
            .collect()
    };
    let requested = configured_ranges::<K>(source, bounds)?;

    let plans = source
        .partitions
        .iter()
        .map(|partition| {
            let watermark = watermarks
                .get(&partition.id)
                .copied()
                .unwrap_or(Watermark::Absent);
            let held = match watermark {
                Watermark::Covered { min, max } => Some(KeySpan {
                    start: min.to_json(),
                    end: max.to_json(),
                }),
                Watermark::Absent => None,
            };
            match requested.for_partition(&partition.id) {
                Requested::Range(range) => {
                    let planned = plan(&watermark, range, source.chunk_span);
                    PartitionPlan {
                        partition: partition.id.clone(),
                        watermark: held,
                        requested: range.to_string(),
                        decision: planned.reason.to_string(),
                        needed: planned.needed.as_ref().map(KeySpan::from_range),
                        chunks: planned.chunks.iter().map(KeySpan::from_range).collect(),
                    }
                }
                Requested::Empty => PartitionPlan {
                    partition: partition.id.clone(),
                    watermark: held,
                    requested: "empty".to_string(),
                    decision: "skip".to_string(),
                    needed: None,
                    chunks: Vec::new(),
                },
                Requested::Unavailable(reason) => PartitionPlan {
                    partition: partition.id.clone(),
                    watermark: held,
                    requested: reason.clone(),
                    decision: "probe".to_string(),
                    needed: None,
                    chunks: Vec::new(),
                },
            }
        })
        .collect();
    Ok(plans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebbflow_extract::presets;
    use ebbflow_protocol::{FetchRange, Partition, Record};
    use ebbflow_sinks::RecordSink;
    use serde_json::{json, Map};

    fn bounds(start: &str, end: &str) -> KeyBounds {
        KeyBounds {
            start: Some(start.to_string()),
            end: Some(end.to_string()),
        }
    }

    fn weather() -> SourceDefinition {
        let mut source = presets::open_meteo();
        source.partitions = vec![Partition::new("Sydney"), Partition::new("Perth")];
        source
    }

    #[test]
    fn test_plan_without_sink_file() {
        let dir = tempfile::tempdir().unwrap();
        let plans = plan_source::<NaiveDate>(
            &weather(),
            &dir.path().join("missing.duckdb"),
            &bounds("2021-06-01", "2023-02-01"),
        )
        .unwrap();

        assert_eq!(plans.len(), 2);
        assert!(plans.iter().all(|p| p.watermark.is_none()));
        assert_eq!(plans[0].decision, "new");
        // Yearly chunks: 2021 tail, 2022, 2023 head.
        assert_eq!(plans[0].chunks.len(), 3);
        assert_eq!(plans[0].chunks[0].start, json!("2021-06-01"));
        assert_eq!(plans[0].chunks[2].end, json!("2023-02-01"));
        assert!(!dir.path().join("missing.duckdb").exists());
    }

    #[test]
    fn test_plan_reads_watermarks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.duckdb");
        let source = weather();
        {
            let mut sink = DuckDbSink::<NaiveDate>::open(&path, source.sink_schema()).unwrap();
            let mut fields = Map::new();
            fields.insert("temperature_max".to_string(), json!(21.5));
            let records = (1..=31)
                .map(|day| {
                    Record::new(
                        NaiveDate::from_ymd_opt(2021, 1, day).unwrap(),
                        "Sydney",
                        fields.clone(),
                    )
                })
                .collect::<Vec<_>>();
            sink.upsert(&records).unwrap();
        }

        let plans = plan_source::<NaiveDate>(&source, &path, &bounds("2021-01-01", "2021-03-31"))
            .unwrap();
        let sydney = plans.iter().find(|p| p.partition == "Sydney").unwrap();
        assert_eq!(sydney.decision, "extend");
        assert_eq!(
            sydney.needed,
            Some(KeySpan::from_range(
                &FetchRange::new(
                    NaiveDate::from_ymd_opt(2021, 2, 1).unwrap(),
                    NaiveDate::from_ymd_opt(2021, 3, 31).unwrap()
                )
                .unwrap()
            ))
        );
        let perth = plans.iter().find(|p| p.partition == "Perth").unwrap();
        assert_eq!(perth.decision, "new");
    }

    #[test]
    fn test_probe_sources_defer_to_run_time() {
        let dir = tempfile::tempdir().unwrap();
        let plans = plan_source::<i64>(
            &presets::rick_and_morty(),
            &dir.path().join("w.duckdb"),
            &KeyBounds::default(),
        )
        .unwrap();
        assert!(plans.iter().all(|p| p.decision == "probe"));
    }
}
