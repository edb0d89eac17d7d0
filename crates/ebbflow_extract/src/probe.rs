//! Count probe: ask the upstream how many entities exist per partition and
//! request `[1, count]`.

use crate::coordinator::{Requested, RequestedRanges};
use crate::error::ExtractError;
use crate::http::PageSource;
use crate::source::SourceDefinition;
use ebbflow_protocol::{FetchRange, OrderedKey};
use serde_json::Value;
use tracing::{info, warn};

/// Probe every partition of `source`. Fails only when the source has no
/// probe configured; per-partition failures become `Unavailable`.
pub async fn probe_counts<K: OrderedKey>(
    source: &SourceDefinition,
    pages: &dyn PageSource,
) -> Result<RequestedRanges<K>, ExtractError> {
    let probe = source.count_probe.as_ref().ok_or_else(|| {
        ExtractError::Config(format!("source '{}' has no count probe", source.name))
    })?;
    let first = K::from_json(&Value::from(1)).ok_or_else(|| {
        ExtractError::Config(format!("count probe needs an integer key, not {}", K::KIND))
    })?;

    let mut ranges = RequestedRanges::new(Requested::Empty);
    for partition in &source.partitions {
        let request = source.base_request(partition);
        let requested = match pages.get(&request).await {
            Ok(page) => match page.pointer(&probe.pointer).and_then(Value::as_u64) {
                Some(0) => {
                    info!("{} reports no rows", partition.id);
                    Requested::Empty
                }
                Some(count) => match K::from_json(&Value::from(count)) {
                    Some(last) => {
                        info!("{} reports {} rows", partition.id, count);
                        FetchRange::new(first, last)
                            .map(Requested::Range)
                            .unwrap_or(Requested::Empty)
                    }
                    None => Requested::Unavailable(format!("count {} is not a valid key", count)),
                },
                None => Requested::Unavailable(format!(
                    "no count at '{}' in {}",
                    probe.pointer, request.url
                )),
            },
            Err(err) => Requested::Unavailable(format!("count probe failed: {}", err)),
        };
        if let Requested::Unavailable(reason) = &requested {
            warn!("Count probe for {}: {}", partition.id, reason);
        }
        ranges.set(&partition.id, requested);
    }
    Ok(ranges)
}
