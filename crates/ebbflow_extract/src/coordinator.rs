//! Run coordinator.
//!
//! Plans every partition, dispatches the ones with missing data to a bounded
//! pool of tokio tasks, and applies their results one at a time as they
//! arrive:
//!
//! - records go through the [`MergeWriter`] into the sink,
//! - statuses go into the [`RunState`],
//! - after every task has joined, the state is finalized once.
//!
//! The sink is only touched from the coordinator's own task. A sink write
//! failure aborts the run; any other failure stays with its partition.

use crate::error::{ExtractError, TransportError};
use crate::fetcher::{FetchOutcome, PartitionFetcher};
use crate::merge::MergeWriter;
use crate::planner::{plan, PlanReason};
use ebbflow_protocol::{ChunkSpan, FetchRange, OrderedKey, Partition, RunState, Watermark};
use ebbflow_sinks::RecordSink;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const DEFAULT_CONCURRENCY: usize = 5;

/// The key range a partition should end up covering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requested<K> {
    Range(FetchRange<K>),
    /// Nothing to fetch; the partition is skipped.
    Empty,
    /// The range could not be determined; the partition fails.
    Unavailable(String),
}

/// A default requested range plus per-partition overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedRanges<K> {
    default: Requested<K>,
    overrides: BTreeMap<String, Requested<K>>,
}

impl<K: OrderedKey> RequestedRanges<K> {
    pub fn new(default: Requested<K>) -> Self {
        Self {
            default,
            overrides: BTreeMap::new(),
        }
    }

    pub fn uniform(range: FetchRange<K>) -> Self {
        Self::new(Requested::Range(range))
    }

    pub fn set(&mut self, partition_id: &str, requested: Requested<K>) {
        self.overrides.insert(partition_id.to_string(), requested);
    }

    pub fn with(mut self, partition_id: &str, requested: Requested<K>) -> Self {
        self.set(partition_id, requested);
        self
    }

    pub fn for_partition(&self, partition_id: &str) -> &Requested<K> {
        self.overrides.get(partition_id).unwrap_or(&self.default)
    }
}

type TaskResult<K> = (String, Result<FetchOutcome<K>, TransportError>);

/// Bounded-concurrency partition dispatcher for one source.
pub struct Coordinator {
    fetcher: Arc<PartitionFetcher>,
    concurrency: usize,
    chunk_span: ChunkSpan,
}

impl Coordinator {
    pub fn new(fetcher: PartitionFetcher, concurrency: usize) -> Self {
        let chunk_span = fetcher.source().chunk_span;
        Self {
            fetcher: Arc::new(fetcher),
            concurrency: concurrency.max(1),
            chunk_span,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run every partition and return the finalized state.
    ///
    /// Only a sink write failure is an error; the state is then discarded.
    pub async fn run<K: OrderedKey>(
        &self,
        partitions: &[Partition],
        watermarks: &BTreeMap<String, Watermark<K>>,
        requested: &RequestedRanges<K>,
        sink: &mut dyn RecordSink<K>,
    ) -> Result<RunState<K>, ExtractError> {
        let mut state = RunState::new();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let (tx, mut rx) = mpsc::channel::<TaskResult<K>>(partitions.len().max(1));
        let mut handles: Vec<(String, JoinHandle<()>)> = Vec::new();

        for partition in partitions {
            let id = partition.id.as_str();
            let range = match requested.for_partition(id) {
                Requested::Range(range) => *range,
                Requested::Empty => {
                    info!("Skipping {}: requested range is empty", id);
                    state.mark_skipped(id);
                    continue;
                }
                Requested::Unavailable(reason) => {
                    warn!("Failing {}: {}", id, reason);
                    state.mark_failed(id, reason.clone());
                    continue;
                }
            };

            let watermark = watermarks.get(id).copied().unwrap_or(Watermark::Absent);
            let plan = plan(&watermark, &range, self.chunk_span);
            match (plan.reason, plan.needed) {
                (PlanReason::FullyCovered, _) => {
                    info!("Skipping {}: {} already covers {}", id, watermark, range);
                }
                (PlanReason::NothingMissing, _) => {
                    info!("Skipping {}: no missing range before {}", id, range.end());
                }
                (PlanReason::New, Some(needed)) => {
                    info!("New partition {}: fetching {} in {} chunks", id, needed, plan.chunks.len());
                }
                (PlanReason::Extend, Some(needed)) => {
                    info!(
                        "Updating {}: holds {}, fetching {} in {} chunks",
                        id,
                        watermark,
                        needed,
                        plan.chunks.len()
                    );
                }
                _ => {}
            }
            if plan.is_skip() {
                state.mark_skipped(id);
                continue;
            }

            state.mark_new(id);
            let fetcher = self.fetcher.clone();
            let semaphore = semaphore.clone();
            let tx = tx.clone();
            let partition = partition.clone();
            let chunks = plan.chunks;
            let handle = tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let result = fetcher.fetch(&partition, &chunks).await;
                if tx.send((partition.id.clone(), result)).await.is_err() {
                    warn!("Coordinator stopped before {} reported", partition.id);
                }
            });
            handles.push((id.to_string(), handle));
        }
        drop(tx);

        let scheduled = handles.len();
        info!(
            "Dispatched {} of {} partitions (concurrency {})",
            scheduled,
            partitions.len(),
            self.concurrency
        );

        let mut writer = MergeWriter::new(sink);
        while let Some((id, result)) = rx.recv().await {
            match result {
                Ok(outcome) => match outcome.fetched_range() {
                    Some(fetched) => {
                        if let Err(err) = writer.upsert(&outcome.records) {
                            error!("Merging {} failed, aborting run: {}", id, err);
                            for (_, handle) in &handles {
                                handle.abort();
                            }
                            return Err(ExtractError::SinkWrite(err));
                        }
                        info!("{} succeeded: {} records in {}", id, outcome.records.len(), fetched);
                        state.mark_success(&id, fetched);
                    }
                    None => {
                        warn!("{} failed: no records fetched", id);
                        state.mark_failed(&id, "no records fetched");
                    }
                },
                Err(err) => {
                    error!("{} failed: {}", id, err);
                    state.mark_failed(&id, err.to_string());
                }
            }
        }

        for (id, handle) in handles {
            if let Err(join_err) = handle.await {
                error!("Task for {} did not complete: {}", id, join_err);
                state.mark_failed(&id, format!("task did not complete: {}", join_err));
            }
        }
        let unreported: Vec<String> = state.pending().map(str::to_string).collect();
        for id in unreported {
            state.mark_failed(&id, "task ended without a result");
        }

        state.finalize();
        Ok(state)
    }
}
