//! Whole-run classification.

use ebbflow_protocol::{OrderedKey, PartitionStatus, RunOutcome, RunState};
use serde::Serialize;
use std::fmt;

/// Classify a finalized run.
///
/// Zero partitions counts as all skipped.
pub fn classify<K: OrderedKey>(state: &RunState<K>) -> RunOutcome {
    let statuses = state.partitions.values();
    if statuses.clone().all(|s| *s == PartitionStatus::Skipped) {
        return RunOutcome::AllSkipped;
    }
    if statuses.clone().all(|s| *s == PartitionStatus::Failed) {
        return RunOutcome::AllFailed;
    }
    RunOutcome::PartialOrFullSuccess {
        success_count: state.count(PartitionStatus::Success),
    }
}

/// Counts per status plus the downstream signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub partitions: usize,
    pub success: usize,
    pub skipped: usize,
    pub failed: usize,
    pub triggers_downstream: bool,
}

impl RunSummary {
    pub fn from_state<K: OrderedKey>(state: &RunState<K>) -> Self {
        let outcome = classify(state);
        Self {
            outcome,
            partitions: state.partitions.len(),
            success: state.count(PartitionStatus::Success),
            skipped: state.count(PartitionStatus::Skipped),
            failed: state.count(PartitionStatus::Failed),
            triggers_downstream: outcome.triggers_downstream(),
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} succeeded, {} skipped, {} failed of {} partitions; downstream {}",
            self.outcome,
            self.success,
            self.skipped,
            self.failed,
            self.partitions,
            if self.triggers_downstream {
                "triggered"
            } else {
                "not triggered"
            }
        )
    }
}
