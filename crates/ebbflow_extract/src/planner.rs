//! Delta planning: what is missing for a partition, split into bounded chunks.

use ebbflow_protocol::{Chunk, ChunkSpan, FetchRange, OrderedKey, Watermark};
use std::fmt;

/// Why a partition does or does not need fetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanReason {
    /// No persisted data; fetch the whole requested range.
    New,
    /// Persisted data ends before the requested end.
    Extend,
    /// Coverage reaches the requested end and spans at least as many keys.
    FullyCovered,
    /// The resume point lies past the requested end.
    NothingMissing,
}

impl PlanReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanReason::New => "new",
            PlanReason::Extend => "extend",
            PlanReason::FullyCovered => "fully_covered",
            PlanReason::NothingMissing => "nothing_missing",
        }
    }
}

impl fmt::Display for PlanReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fetch plan for one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan<K> {
    pub reason: PlanReason,
    /// `None` means the partition is skipped.
    pub needed: Option<FetchRange<K>>,
    pub chunks: Vec<Chunk<K>>,
}

impl<K: OrderedKey> Plan<K> {
    pub fn is_skip(&self) -> bool {
        self.needed.is_none()
    }

    fn skip(reason: PlanReason) -> Self {
        Self {
            reason,
            needed: None,
            chunks: Vec::new(),
        }
    }

    fn fetch(reason: PlanReason, needed: FetchRange<K>, span: ChunkSpan) -> Self {
        Self {
            reason,
            needed: Some(needed),
            chunks: chunk_range(&needed, span),
        }
    }
}

/// Decide the missing range for a partition and chunk it.
///
/// Gaps inside `[min, max]` are invisible here: coverage is judged only by
/// the watermark's bounds and span.
pub fn plan<K: OrderedKey>(
    watermark: &Watermark<K>,
    requested: &FetchRange<K>,
    span: ChunkSpan,
) -> Plan<K> {
    let Watermark::Covered { max, .. } = *watermark else {
        return Plan::fetch(PlanReason::New, *requested, span);
    };

    if max >= requested.end() && watermark.covered_span() >= requested.span() {
        return Plan::skip(PlanReason::FullyCovered);
    }

    let resume = match max.successor() {
        Some(next) => next.max(requested.start()),
        None => return Plan::skip(PlanReason::NothingMissing),
    };
    match FetchRange::new(resume, requested.end()) {
        Ok(needed) => Plan::fetch(PlanReason::Extend, needed, span),
        Err(_) => Plan::skip(PlanReason::NothingMissing),
    }
}

/// Split `range` into ascending, gapless, non-overlapping chunks.
///
/// Each chunk ends at the earlier of its span boundary and the range end.
pub fn chunk_range<K: OrderedKey>(range: &FetchRange<K>, span: ChunkSpan) -> Vec<Chunk<K>> {
    let mut chunks = Vec::new();
    let mut start = range.start();
    loop {
        let end = match K::chunk_end(start, span) {
            Some(boundary) => boundary.min(range.end()),
            None => range.end(),
        };
        // start <= end holds: boundaries never precede their start.
        chunks.push(FetchRange::new(start, end).unwrap_or_else(|_| FetchRange::single(start)));
        if end >= range.end() {
            break;
        }
        match end.successor() {
            Some(next) => start = next,
            None => break,
        }
    }
    chunks
}
