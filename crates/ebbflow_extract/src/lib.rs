//! Incremental extraction engine.
//!
//! One run of a source goes:
//!
//! 1. [`compute_watermarks`] reads what the sink already holds,
//! 2. [`plan`] turns watermark + requested range into ordered chunks,
//! 3. the [`Coordinator`] fetches partitions concurrently through a
//!    [`PartitionFetcher`] and merges results via the [`MergeWriter`],
//! 4. [`classify`] turns the finalized `RunState` into a `RunOutcome`.

pub mod aggregate;
pub mod coordinator;
pub mod error;
pub mod fetcher;
pub mod http;
pub mod merge;
pub mod planner;
pub mod presets;
pub mod probe;
pub mod source;
pub mod watermark;

pub use aggregate::{classify, RunSummary};
pub use coordinator::{Coordinator, Requested, RequestedRanges, DEFAULT_CONCURRENCY};
pub use error::{ExtractError, PageError, RequestError, TransportError};
pub use fetcher::{FetchOutcome, PartitionFetcher};
pub use http::{HttpConfig, PageRequest, PageSource, ReqwestPageSource};
pub use merge::MergeWriter;
pub use planner::{chunk_range, plan, Plan, PlanReason};
pub use probe::probe_counts;
pub use source::{
    CountProbe, Pagination, RangeBound, RangeConfig, RequestTemplate, RowLayout, SourceDefinition,
};
pub use watermark::compute_watermarks;
