//! One extraction run per source.
//!
//! The runner owns the glue around the coordinator: it opens the DuckDB sink
//! for the source's table, reads watermarks, works out the requested range
//! (configured, overridden, or probed), runs the coordinator and saves the
//! finalized `RunState`. The sink is dropped before `run_source` returns, so
//! the writer lock is free by the time any downstream hook starts.

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, Utc};
use ebbflow_db::{BackendError, LockError};
use ebbflow_extract::{
    compute_watermarks, probe_counts, Coordinator, PageSource, PartitionFetcher, Requested,
    RequestedRanges, RunSummary, SourceDefinition,
};
use ebbflow_protocol::{
    FetchRange, KeyKind, LastRunStatus, OrderedKey, PartitionStatus, RunState,
};
use ebbflow_sinks::{DuckDbSink, SinkWriteError};
use ebbflow_state_store::{save_run_state, StateStore};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::cli::error::HelpfulError;

/// Key bounds given on the command line. Missing bounds fall back to the
/// source's configured range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyBounds {
    pub start: Option<String>,
    pub end: Option<String>,
}

impl KeyBounds {
    pub fn is_empty(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// Resolve to a concrete range for `source`.
    pub fn resolve<K: OrderedKey>(&self, source: &SourceDefinition) -> Result<FetchRange<K>> {
        let now = Utc::now();
        let start = match &self.start {
            Some(raw) => parse_key::<K>(raw)?,
            None => configured_bound(source, "--start", |r| r.start.resolve::<K>(now))?,
        };
        let end = match &self.end {
            Some(raw) => parse_key::<K>(raw)?,
            None => configured_bound(source, "--end", |r| r.end.resolve::<K>(now))?,
        };
        FetchRange::new(start, end).map_err(|e| anyhow!("Invalid key bounds: {}", e))
    }
}

fn configured_bound<K: OrderedKey>(
    source: &SourceDefinition,
    flag: &str,
    resolve: impl Fn(&ebbflow_extract::RangeConfig) -> Result<K, ebbflow_extract::ExtractError>,
) -> Result<K> {
    let range = source.range.as_ref().ok_or_else(|| {
        HelpfulError::new(format!("Source '{}' has no configured range", source.name))
            .with_suggestion(format!("TRY: Pass {} as well", flag))
    })?;
    Ok(resolve(range)?)
}

pub fn parse_key<K: OrderedKey>(raw: &str) -> Result<K> {
    K::from_json(&Value::String(raw.trim().to_string()))
        .ok_or_else(|| HelpfulError::invalid_key(raw, K::KIND.as_str()).into())
}

/// A key span as JSON values, for reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeySpan {
    pub start: Value,
    pub end: Value,
}

impl KeySpan {
    pub fn from_range<K: OrderedKey>(range: &FetchRange<K>) -> Self {
        Self {
            start: range.start().to_json(),
            end: range.end().to_json(),
        }
    }
}

impl std::fmt::Display for KeySpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", display_value(&self.start), display_value(&self.end))
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionReport {
    pub partition: String,
    pub status: PartitionStatus,
    pub fetched: Option<KeySpan>,
    pub error: Option<String>,
}

/// What one source run did, for tables, JSON and the downstream hook.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceReport {
    pub source: String,
    pub key_kind: KeyKind,
    pub table: String,
    pub summary: RunSummary,
    pub last_run_status: Option<LastRunStatus>,
    pub observed: Option<KeySpan>,
    pub rows_written: u64,
    pub partitions: Vec<PartitionReport>,
}

impl SourceReport {
    pub fn from_state<K: OrderedKey>(
        source: &SourceDefinition,
        state: &RunState<K>,
        rows_written: u64,
    ) -> Self {
        let partitions = state
            .partitions
            .iter()
            .map(|(id, status)| PartitionReport {
                partition: id.clone(),
                status: *status,
                fetched: state.fetched.get(id).map(KeySpan::from_range),
                error: state.errors.get(id).cloned(),
            })
            .collect();
        Self {
            source: source.name.clone(),
            key_kind: source.key_kind,
            table: source.table.clone(),
            summary: RunSummary::from_state(state),
            last_run_status: state.last_run_status,
            observed: state.observed.as_ref().map(KeySpan::from_range),
            rows_written,
            partitions,
        }
    }
}

/// Runs sources against one sink file and one state store.
pub struct Runner<'a> {
    sink_path: PathBuf,
    concurrency: usize,
    pages: Arc<dyn PageSource>,
    store: &'a dyn StateStore,
}

impl<'a> Runner<'a> {
    pub fn new(
        sink_path: impl Into<PathBuf>,
        concurrency: usize,
        pages: Arc<dyn PageSource>,
        store: &'a dyn StateStore,
    ) -> Self {
        Self {
            sink_path: sink_path.into(),
            concurrency,
            pages,
            store,
        }
    }

    /// Run one source to completion and persist its state.
    ///
    /// An error means the run aborted (sink unreadable or unwritable, state
    /// not saved); partition failures are reported, not returned.
    pub async fn run_source(
        &self,
        source: &SourceDefinition,
        bounds: &KeyBounds,
    ) -> Result<SourceReport> {
        match source.key_kind {
            KeyKind::Date => self.run_typed::<NaiveDate>(source, bounds).await,
            KeyKind::Integer => self.run_typed::<i64>(source, bounds).await,
        }
    }

    async fn run_typed<K: OrderedKey>(
        &self,
        source: &SourceDefinition,
        bounds: &KeyBounds,
    ) -> Result<SourceReport> {
        info!(
            "Running {} into {} ({})",
            source.name,
            source.table,
            self.sink_path.display()
        );
        let mut sink = DuckDbSink::<K>::open(&self.sink_path, source.sink_schema())
            .map_err(|e| open_error(&self.sink_path, e))?;

        let watermarks = compute_watermarks(&sink, &source.partitions)
            .with_context(|| format!("Run of '{}' aborted", source.name))?;
        let requested = requested_ranges::<K>(source, bounds, self.pages.as_ref()).await?;

        let fetcher = PartitionFetcher::new(Arc::new(source.clone()), self.pages.clone());
        let coordinator = Coordinator::new(fetcher, self.concurrency);
        let state = coordinator
            .run(&source.partitions, &watermarks, &requested, &mut sink)
            .await
            .with_context(|| format!("Run of '{}' aborted", source.name))?;

        save_run_state(self.store, &source.name, &state)
            .await
            .with_context(|| format!("Failed to save run state for '{}'", source.name))?;

        let report = SourceReport::from_state(source, &state, sink.rows_written());
        info!("{}: {}", source.name, report.summary);
        Ok(report)
    }
}

/// Requested ranges for a run: explicit bounds win, then the count probe,
/// then the configured range.
pub async fn requested_ranges<K: OrderedKey>(
    source: &SourceDefinition,
    bounds: &KeyBounds,
    pages: &dyn PageSource,
) -> Result<RequestedRanges<K>> {
    if !bounds.is_empty() {
        let range = bounds.resolve::<K>(source)?;
        info!("{}: using requested range {}", source.name, range);
        return Ok(RequestedRanges::uniform(range));
    }
    if source.count_probe.is_some() {
        return Ok(probe_counts::<K>(source, pages).await?);
    }
    Ok(RequestedRanges::new(
        source.requested_range::<K>(Utc::now())?,
    ))
}

/// Ranges for display only: the probe is replaced by a note.
pub fn configured_ranges<K: OrderedKey>(
    source: &SourceDefinition,
    bounds: &KeyBounds,
) -> Result<RequestedRanges<K>> {
    if !bounds.is_empty() {
        return Ok(RequestedRanges::uniform(bounds.resolve::<K>(source)?));
    }
    if source.count_probe.is_some() {
        return Ok(RequestedRanges::new(Requested::Unavailable(
            "decided by the count probe at run time".to_string(),
        )));
    }
    Ok(RequestedRanges::new(
        source.requested_range::<K>(Utc::now())?,
    ))
}

fn open_error(path: &Path, err: SinkWriteError) -> anyhow::Error {
    match &err {
        SinkWriteError::Backend(BackendError::Lock(LockError::Locked { .. })) => {
            HelpfulError::sink_busy(path, &err.to_string()).into()
        }
        _ => anyhow::Error::new(err).context(format!("Failed to open sink {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ebbflow_extract::{presets, PageError, PageRequest, RequestError, TransportError};
    use ebbflow_protocol::RunOutcome;
    use ebbflow_state_store::{load_run_state, MemoryStateStore};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves the Rick and Morty API shape: a count page per resource and
    /// id-list lookups returning one object per id.
    struct FakeRickAndMorty {
        counts: Vec<(&'static str, u64)>,
        requests: AtomicUsize,
    }

    impl FakeRickAndMorty {
        fn new(counts: Vec<(&'static str, u64)>) -> Self {
            Self {
                counts,
                requests: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PageSource for FakeRickAndMorty {
        async fn get(&self, request: &PageRequest) -> Result<Value, RequestError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let path = request
                .url
                .strip_prefix("https://rickandmortyapi.com/api/")
                .ok_or_else(|| {
                    TransportError::InvalidRequest(format!("unexpected url {}", request.url))
                })?;
            let (resource, ids) = match path.split_once('/') {
                Some((resource, ids)) => (resource, Some(ids)),
                None => (path, None),
            };
            let Some(&(_, count)) = self.counts.iter().find(|(r, _)| *r == resource) else {
                return Err(PageError::Status {
                    status: 404,
                    url: request.url.clone(),
                    body: "not found".to_string(),
                }
                .into());
            };
            match ids {
                None => Ok(json!({ "info": { "count": count, "pages": 1 }, "results": [] })),
                Some(ids) => {
                    let rows: Vec<Value> = ids
                        .split(',')
                        .filter_map(|id| id.parse::<u64>().ok())
                        .filter(|id| *id <= count)
                        .map(|id| {
                            json!({
                                "id": id,
                                "name": format!("{} {}", resource, id),
                                "url": format!("https://rickandmortyapi.com/api/{}/{}", resource, id),
                                "created": "2017-11-04T18:48:46.250Z",
                            })
                        })
                        .collect();
                    Ok(Value::Array(rows))
                }
            }
        }
    }

    #[tokio::test]
    async fn test_run_probe_source_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let sink_path = dir.path().join("warehouse.duckdb");
        let store = MemoryStateStore::new();
        let pages = Arc::new(FakeRickAndMorty::new(vec![
            ("character", 45),
            ("episode", 0),
            ("location", 7),
        ]));
        let runner = Runner::new(&sink_path, 2, pages.clone(), &store);
        let source = presets::rick_and_morty();

        let report = runner
            .run_source(&source, &KeyBounds::default())
            .await
            .unwrap();
        assert_eq!(
            report.summary.outcome,
            RunOutcome::PartialOrFullSuccess { success_count: 2 }
        );
        assert_eq!(report.rows_written, 52);
        assert_eq!(report.observed, Some(KeySpan { start: json!(1), end: json!(45) }));
        let episode = report
            .partitions
            .iter()
            .find(|p| p.partition == "episode")
            .unwrap();
        assert_eq!(episode.status, PartitionStatus::Skipped);

        let saved: RunState<i64> = load_run_state(&store, "rick_and_morty")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.status("character"), Some(PartitionStatus::Success));
        assert_eq!(saved.fetched["location"], FetchRange::new(1, 7).unwrap());

        // Second run: counts unchanged, only the probes go out.
        let before = pages.requests.load(Ordering::SeqCst);
        let rerun = runner
            .run_source(&source, &KeyBounds::default())
            .await
            .unwrap();
        assert_eq!(rerun.summary.outcome, RunOutcome::AllSkipped);
        assert!(!rerun.summary.triggers_downstream);
        assert_eq!(rerun.rows_written, 0);
        assert_eq!(pages.requests.load(Ordering::SeqCst) - before, 3);
    }

    #[tokio::test]
    async fn test_explicit_bounds_skip_probe() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStateStore::new();
        let pages = Arc::new(FakeRickAndMorty::new(vec![
            ("character", 45),
            ("episode", 45),
            ("location", 45),
        ]));
        let runner = Runner::new(dir.path().join("w.duckdb"), 5, pages.clone(), &store);
        let bounds = KeyBounds {
            start: Some("1".to_string()),
            end: Some("10".to_string()),
        };

        let report = runner
            .run_source(&presets::rick_and_morty(), &bounds)
            .await
            .unwrap();
        assert_eq!(report.summary.success, 3);
        assert_eq!(report.rows_written, 30);
        // One id-list request per partition, no count requests.
        assert_eq!(pages.requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_locked_sink_is_helpful_error() {
        let dir = tempfile::tempdir().unwrap();
        let sink_path = dir.path().join("w.duckdb");
        let store = MemoryStateStore::new();
        let pages = Arc::new(FakeRickAndMorty::new(vec![("character", 1)]));

        let _holder =
            DuckDbSink::<i64>::open(&sink_path, presets::rick_and_morty().sink_schema()).unwrap();
        let runner = Runner::new(&sink_path, 1, pages, &store);
        let err = runner
            .run_source(&presets::rick_and_morty(), &KeyBounds::default())
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<HelpfulError>().is_some());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[test]
    fn test_bounds_fall_back_to_configured_range() {
        let weather = presets::open_meteo();
        let bounds = KeyBounds {
            start: Some("2024-01-01".to_string()),
            end: None,
        };
        let range = bounds.resolve::<NaiveDate>(&weather).unwrap();
        assert_eq!(range.start(), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert!(range.end() > range.start());

        // The probe source has no configured range to fall back on.
        let start_only = KeyBounds {
            start: Some("5".to_string()),
            end: None,
        };
        let err = start_only
            .resolve::<i64>(&presets::rick_and_morty())
            .unwrap_err();
        assert!(err.to_string().contains("no configured range"));

        assert!(parse_key::<NaiveDate>("yesterday").is_err());
        assert_eq!(parse_key::<i64>(" 42 ").unwrap(), 42);
    }

    #[test]
    fn test_inverted_bounds_are_rejected() {
        let bounds = KeyBounds {
            start: Some("10".to_string()),
            end: Some("1".to_string()),
        };
        assert!(bounds.resolve::<i64>(&presets::rick_and_morty()).is_err());
    }

    #[test]
    fn test_configured_ranges_do_not_probe() {
        let ranges =
            configured_ranges::<i64>(&presets::rick_and_morty(), &KeyBounds::default()).unwrap();
        assert!(matches!(
            ranges.for_partition("character"),
            Requested::Unavailable(_)
        ));
    }
}
