//! Shared data model for Ebbflow.
//!
//! Every crate in the workspace speaks these types: ordered keys and the
//! ranges over them, partitions and records, per-partition statuses, the
//! persisted [`RunState`], and the [`RunOutcome`] handed to downstream
//! triggers.

pub mod key;
pub mod paths;
pub mod range;
pub mod record;
pub mod status;

pub use key::{ChunkSpan, KeyKind, OrderedKey};
pub use range::{Chunk, FetchRange, KeyRange, RangeError, Watermark};
pub use record::{Partition, Record};
pub use status::{LastRunStatus, PartitionStatus, RunOutcome, RunState};
