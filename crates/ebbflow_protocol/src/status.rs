//! Per-partition statuses, cross-run state, and run outcomes.

use crate::key::OrderedKey;
use crate::range::FetchRange;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Outcome of one partition within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStatus {
    /// Scheduled, result not applied yet
    #[default]
    New,
    /// Nothing missing; no request was made
    Skipped,
    /// At least one record fetched and merged
    Success,
    /// Unrecoverable error or zero records
    Failed,
}

impl PartitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionStatus::New => "new",
            PartitionStatus::Skipped => "skipped",
            PartitionStatus::Success => "success",
            PartitionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PartitionStatus::New)
    }
}

impl fmt::Display for PartitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PartitionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "new" => Ok(PartitionStatus::New),
            "skipped" => Ok(PartitionStatus::Skipped),
            "success" => Ok(PartitionStatus::Success),
            "failed" => Ok(PartitionStatus::Failed),
            other => Err(format!("Unknown partition status: '{}'", other)),
        }
    }
}

/// Whether the last run persisted anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastRunStatus {
    Success,
    NoData,
}

impl LastRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LastRunStatus::Success => "success",
            LastRunStatus::NoData => "no_data",
        }
    }
}

impl fmt::Display for LastRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Record of what happened to each partition in a run.
///
/// Owned by the coordinator while a run is in flight and persisted as a whole
/// once every partition task has joined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "K: Serialize", deserialize = "K: OrderedKey"))]
pub struct RunState<K> {
    #[serde(default)]
    pub partitions: BTreeMap<String, PartitionStatus>,
    /// Key span of the records fetched per successful partition.
    #[serde(default)]
    pub fetched: BTreeMap<String, FetchRange<K>>,
    /// Failure cause per failed partition.
    #[serde(default)]
    pub errors: BTreeMap<String, String>,
    /// Run-wide min/max over all successful partitions.
    #[serde(default)]
    pub observed: Option<FetchRange<K>>,
    #[serde(default)]
    pub last_run_status: Option<LastRunStatus>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl<K: OrderedKey> RunState<K> {
    pub fn new() -> Self {
        Self {
            partitions: BTreeMap::new(),
            fetched: BTreeMap::new(),
            errors: BTreeMap::new(),
            observed: None,
            last_run_status: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn status(&self, partition_id: &str) -> Option<PartitionStatus> {
        self.partitions.get(partition_id).copied()
    }

    pub fn mark_new(&mut self, partition_id: &str) {
        self.partitions
            .insert(partition_id.to_string(), PartitionStatus::New);
    }

    pub fn mark_skipped(&mut self, partition_id: &str) {
        self.partitions
            .insert(partition_id.to_string(), PartitionStatus::Skipped);
    }

    pub fn mark_success(&mut self, partition_id: &str, fetched: FetchRange<K>) {
        self.partitions
            .insert(partition_id.to_string(), PartitionStatus::Success);
        self.fetched.insert(partition_id.to_string(), fetched);
        self.errors.remove(partition_id);
    }

    pub fn mark_failed(&mut self, partition_id: &str, error: impl Into<String>) {
        self.partitions
            .insert(partition_id.to_string(), PartitionStatus::Failed);
        self.fetched.remove(partition_id);
        self.errors.insert(partition_id.to_string(), error.into());
    }

    /// Partitions still waiting on a result.
    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.partitions
            .iter()
            .filter(|(_, status)| !status.is_terminal())
            .map(|(id, _)| id.as_str())
    }

    pub fn count(&self, status: PartitionStatus) -> usize {
        self.partitions.values().filter(|s| **s == status).count()
    }

    /// Compute run-wide fields. Call once, after every task has joined.
    pub fn finalize(&mut self) {
        self.observed = self
            .fetched
            .values()
            .copied()
            .reduce(|acc, range| acc.union(&range));
        self.last_run_status = Some(if self.observed.is_some() {
            LastRunStatus::Success
        } else {
            LastRunStatus::NoData
        });
        self.finished_at = Some(Utc::now());
    }

    pub fn is_finalized(&self) -> bool {
        self.finished_at.is_some()
    }
}

impl<K: OrderedKey> Default for RunState<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Whole-run classification that drives downstream triggering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    AllSkipped,
    AllFailed,
    PartialOrFullSuccess { success_count: usize },
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::AllSkipped => "all_skipped",
            RunOutcome::AllFailed => "all_failed",
            RunOutcome::PartialOrFullSuccess { .. } => "partial_or_full_success",
        }
    }

    /// The only signal the transformation trigger consumes.
    pub fn triggers_downstream(&self) -> bool {
        matches!(self, RunOutcome::PartialOrFullSuccess { .. })
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_finalize_computes_observed_range() {
        let mut state = RunState::<NaiveDate>::new();
        state.mark_success(
            "Sydney",
            FetchRange::new(date(2021, 7, 1), date(2021, 12, 31)).unwrap(),
        );
        state.mark_success(
            "Hobart",
            FetchRange::new(date(2021, 1, 1), date(2021, 3, 31)).unwrap(),
        );
        state.mark_skipped("Perth");
        state.finalize();

        assert_eq!(
            state.observed,
            Some(FetchRange::new(date(2021, 1, 1), date(2021, 12, 31)).unwrap())
        );
        assert_eq!(state.last_run_status, Some(LastRunStatus::Success));
        assert!(state.is_finalized());
    }

    #[test]
    fn test_finalize_without_data() {
        let mut state = RunState::<i64>::new();
        state.mark_skipped("character");
        state.mark_failed("episode", "HTTP 503");
        state.finalize();

        assert_eq!(state.observed, None);
        assert_eq!(state.last_run_status, Some(LastRunStatus::NoData));
        assert_eq!(state.errors["episode"], "HTTP 503");
    }

    #[test]
    fn test_mark_failed_clears_fetched_range() {
        let mut state = RunState::<i64>::new();
        state.mark_success("character", FetchRange::new(1, 20).unwrap());
        state.mark_failed("character", "panicked");
        assert!(state.fetched.is_empty());
        assert_eq!(state.status("character"), Some(PartitionStatus::Failed));
    }

    #[test]
    fn test_run_state_json_shape() {
        let mut state = RunState::<NaiveDate>::new();
        state.mark_success(
            "Sydney",
            FetchRange::new(date(2021, 1, 1), date(2021, 1, 31)).unwrap(),
        );
        state.finalize();

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["partitions"]["Sydney"], "success");
        assert_eq!(json["fetched"]["Sydney"]["start"], "2021-01-01");
        assert_eq!(json["last_run_status"], "success");

        let back: RunState<NaiveDate> = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_outcome_trigger_signal() {
        assert!(!RunOutcome::AllSkipped.triggers_downstream());
        assert!(!RunOutcome::AllFailed.triggers_downstream());
        assert!(RunOutcome::PartialOrFullSuccess { success_count: 1 }.triggers_downstream());
    }
}
