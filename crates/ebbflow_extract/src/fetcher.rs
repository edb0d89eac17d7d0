//! Per-partition fetching: chunks in order, pages within a chunk, rows shaped
//! into records.

use crate::error::{PageError, RequestError, TransportError};
use crate::http::{PageRequest, PageSource};
use crate::source::SourceDefinition;
use chrono::{DateTime, Utc};
use ebbflow_protocol::{Chunk, FetchRange, OrderedKey, Partition, Record};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What one partition fetch produced.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome<K> {
    pub partition_id: String,
    pub records: Vec<Record<K>>,
    pub chunks_ok: usize,
    pub chunks_failed: usize,
    /// Rows dropped for a missing key or a key outside their chunk.
    pub rows_dropped: usize,
}

impl<K: OrderedKey> FetchOutcome<K> {
    fn new(partition_id: &str) -> Self {
        Self {
            partition_id: partition_id.to_string(),
            records: Vec::new(),
            chunks_ok: 0,
            chunks_failed: 0,
            rows_dropped: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        !self.records.is_empty()
    }

    /// Min/max key over the fetched records.
    pub fn fetched_range(&self) -> Option<FetchRange<K>> {
        let mut keys = self.records.iter().map(|r| r.key);
        let first = keys.next()?;
        Some(keys.fold(FetchRange::single(first), |mut range, key| {
            range.include(key);
            range
        }))
    }
}

/// Fetches partitions of one source through a [`PageSource`].
#[derive(Clone)]
pub struct PartitionFetcher {
    source: Arc<SourceDefinition>,
    pages: Arc<dyn PageSource>,
}

impl PartitionFetcher {
    pub fn new(source: Arc<SourceDefinition>, pages: Arc<dyn PageSource>) -> Self {
        Self { source, pages }
    }

    pub fn source(&self) -> &SourceDefinition {
        &self.source
    }

    /// Fetch `chunks` in ascending order.
    ///
    /// Page-level problems cost only their chunk. Transport failures abort
    /// the partition and are returned.
    pub async fn fetch<K: OrderedKey>(
        &self,
        partition: &Partition,
        chunks: &[Chunk<K>],
    ) -> Result<FetchOutcome<K>, TransportError> {
        let mut outcome = FetchOutcome::new(&partition.id);

        for chunk in chunks {
            match self.fetch_chunk(partition, chunk, &mut outcome).await {
                Ok(0) => {
                    warn!("No data for {} in {}", partition.id, chunk);
                    outcome.chunks_ok += 1;
                }
                Ok(rows) => {
                    debug!("Fetched {} rows for {} in {}", rows, partition.id, chunk);
                    outcome.chunks_ok += 1;
                }
                Err(RequestError::Page(err)) => {
                    warn!("Chunk {} for {} failed: {}", chunk, partition.id, err);
                    outcome.chunks_failed += 1;
                }
                Err(RequestError::Transport(err)) => return Err(err),
            }
        }

        info!(
            "Fetched {} records for {} ({} chunks ok, {} failed, {} rows dropped)",
            outcome.records.len(),
            partition.id,
            outcome.chunks_ok,
            outcome.chunks_failed,
            outcome.rows_dropped
        );
        Ok(outcome)
    }

    /// Fetch every page of one chunk. Records are only appended once the
    /// whole chunk succeeded.
    async fn fetch_chunk<K: OrderedKey>(
        &self,
        partition: &Partition,
        chunk: &Chunk<K>,
        outcome: &mut FetchOutcome<K>,
    ) -> Result<usize, RequestError> {
        let fetched_at = Utc::now();
        let mut request = self.source.chunk_request(partition, chunk);
        let mut records = Vec::new();
        let mut dropped = 0;
        let mut pages = 0;

        loop {
            pages += 1;
            let page = self.pages.get(&request).await?;
            let rows = self.source.layout.extract_rows(&page, &request.url)?;
            for row in rows {
                match self.shape_row(partition, row, chunk, fetched_at) {
                    Some(record) => records.push(record),
                    None => dropped += 1,
                }
            }

            let Some(pagination) = &self.source.pagination else {
                break;
            };
            let Some(next) = pagination.next_url(&page) else {
                break;
            };
            if pages >= pagination.max_pages {
                return Err(PageError::PageLimit {
                    limit: pagination.max_pages,
                }
                .into());
            }
            request = PageRequest::new(next);
        }

        let count = records.len();
        outcome.records.extend(records);
        outcome.rows_dropped += dropped;
        Ok(count)
    }

    /// Rename fields, parse the key, stamp partition identity and attributes.
    fn shape_row<K: OrderedKey>(
        &self,
        partition: &Partition,
        mut row: Map<String, Value>,
        chunk: &Chunk<K>,
        fetched_at: DateTime<Utc>,
    ) -> Option<Record<K>> {
        let source = &self.source;
        for (from, to) in &source.renames {
            if let Some(value) = row.remove(from) {
                row.insert(to.clone(), value);
            }
        }

        let Some(key) = row.get(&source.key_field).and_then(K::from_json) else {
            warn!(
                "Dropping row for {} without a valid '{}'",
                partition.id, source.key_field
            );
            return None;
        };
        if !chunk.contains(key) {
            debug!("Dropping {} row {} outside {}", partition.id, key, chunk);
            return None;
        }

        for (name, value) in &partition.attributes {
            row.insert(name.clone(), value.clone());
        }
        row.insert(
            source.partition_column.clone(),
            Value::String(partition.id.clone()),
        );
        Some(Record::new(key, partition.id.as_str(), row).with_fetched_at(fetched_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presets;
    use crate::source::{Pagination, RowLayout};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::sync::Mutex;

    /// Answers by URL prefix and records every request.
    struct RoutedPages {
        routes: Vec<(String, Result<Value, RequestError>)>,
        seen: Mutex<Vec<PageRequest>>,
    }

    impl RoutedPages {
        fn new(routes: Vec<(&str, Result<Value, RequestError>)>) -> Arc<Self> {
            Arc::new(Self {
                routes: routes
                    .into_iter()
                    .map(|(prefix, reply)| (prefix.to_string(), reply))
                    .collect(),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PageSource for RoutedPages {
        async fn get(&self, request: &PageRequest) -> Result<Value, RequestError> {
            self.seen.lock().unwrap().push(request.clone());
            let target = match request.query_value("start_date") {
                Some(start) => format!("{}?{}", request.url, start),
                None => request.url.clone(),
            };
            self.routes
                .iter()
                .find(|(prefix, _)| target.starts_with(prefix.as_str()))
                .map(|(_, reply)| reply.clone())
                .unwrap_or_else(|| Ok(json!({})))
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn daily(days: &[&str], temps: &[f64]) -> Value {
        json!({"daily": {"time": days, "temperature_2m_max": temps}})
    }

    const ARCHIVE: &str = "https://archive-api.open-meteo.com/v1/archive";

    #[tokio::test]
    async fn test_rows_are_shaped_into_records() {
        let pages = RoutedPages::new(vec![(
            ARCHIVE,
            Ok(daily(&["2024-01-01", "2024-01-02"], &[25.0, 26.5])),
        )]);
        let fetcher = PartitionFetcher::new(Arc::new(presets::open_meteo()), pages.clone());
        let source = presets::open_meteo();
        let sydney = source.partition("Sydney").unwrap();
        let chunk = FetchRange::new(date(2024, 1, 1), date(2024, 1, 2)).unwrap();

        let outcome = fetcher.fetch(sydney, &[chunk]).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.records.len(), 2);

        let record = &outcome.records[1];
        assert_eq!(record.key, date(2024, 1, 2));
        assert_eq!(record.partition_id, "Sydney");
        assert_eq!(record.field("temperature_max"), Some(&json!(26.5)));
        assert_eq!(record.field("temperature_2m_max"), None);
        assert_eq!(record.field("City"), Some(&json!("Sydney")));
        assert_eq!(record.field("country"), Some(&json!("Australia")));
        assert_eq!(outcome.fetched_range(), Some(chunk));

        let seen = pages.seen.lock().unwrap();
        assert_eq!(seen[0].query_value("latitude"), Some("-33.8688"));
        assert_eq!(seen[0].query_value("end_date"), Some("2024-01-02"));
    }

    #[tokio::test]
    async fn test_failed_chunk_does_not_stop_partition() {
        let pages = RoutedPages::new(vec![
            (
                format!("{}?2021", ARCHIVE).as_str(),
                Err(PageError::Status {
                    status: 400,
                    url: ARCHIVE.to_string(),
                    body: "bad".to_string(),
                }
                .into()),
            ),
            (
                format!("{}?2022", ARCHIVE).as_str(),
                Ok(daily(&["2022-01-01"], &[30.0])),
            ),
        ]);
        let source = presets::open_meteo();
        let fetcher = PartitionFetcher::new(Arc::new(source.clone()), pages);
        let chunks = vec![
            FetchRange::new(date(2021, 1, 1), date(2021, 12, 31)).unwrap(),
            FetchRange::new(date(2022, 1, 1), date(2022, 1, 1)).unwrap(),
        ];

        let outcome = fetcher
            .fetch(source.partition("Perth").unwrap(), &chunks)
            .await
            .unwrap();
        assert_eq!(outcome.chunks_failed, 1);
        assert_eq!(outcome.chunks_ok, 1);
        assert_eq!(outcome.records.len(), 1);
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_missing_data_everywhere_is_not_success() {
        let pages = RoutedPages::new(vec![(ARCHIVE, Ok(json!({"reason": "nope"})))]);
        let source = presets::open_meteo();
        let fetcher = PartitionFetcher::new(Arc::new(source.clone()), pages);
        let chunk = FetchRange::new(date(2024, 1, 1), date(2024, 1, 5)).unwrap();

        let outcome = fetcher
            .fetch(source.partition("Hobart").unwrap(), &[chunk])
            .await
            .unwrap();
        assert!(!outcome.is_success());
        assert_eq!(outcome.chunks_failed, 1);
    }

    #[tokio::test]
    async fn test_transport_error_aborts_partition() {
        let pages = RoutedPages::new(vec![(
            ARCHIVE,
            Err(TransportError::Unauthorized {
                status: 401,
                url: ARCHIVE.to_string(),
            }
            .into()),
        )]);
        let source = presets::open_meteo();
        let fetcher = PartitionFetcher::new(Arc::new(source.clone()), pages);
        let chunk = FetchRange::new(date(2024, 1, 1), date(2024, 1, 5)).unwrap();

        let err = fetcher
            .fetch::<NaiveDate>(source.partition("Darwin").unwrap(), &[chunk])
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn test_pages_are_followed_and_rows_filtered_by_chunk() {
        let mut source = presets::rick_and_morty();
        source.request = crate::source::RequestTemplate::Unbounded;
        source.layout = RowLayout::Nested {
            pointer: "/results".to_string(),
        };
        source.pagination = Some(Pagination::new("/info/next"));

        let pages = RoutedPages::new(vec![
            (
                "https://rickandmortyapi.com/api/character?page=2",
                Ok(json!({"info": {"next": null}, "results": [{"id": 3}, {"id": 4}]})),
            ),
            (
                "https://rickandmortyapi.com/api/character",
                Ok(json!({
                    "info": {"next": "https://rickandmortyapi.com/api/character?page=2"},
                    "results": [{"id": 1}, {"id": 2}, {"name": "no id"}]
                })),
            ),
        ]);
        let fetcher = PartitionFetcher::new(Arc::new(source.clone()), pages.clone());
        let chunk = FetchRange::new(2_i64, 3).unwrap();

        let outcome = fetcher
            .fetch(source.partition("character").unwrap(), &[chunk])
            .await
            .unwrap();
        let keys: Vec<i64> = outcome.records.iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![2, 3]);
        assert_eq!(outcome.rows_dropped, 3);
        assert_eq!(pages.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_page_cap_fails_the_chunk() {
        let mut source = presets::rick_and_morty();
        source.request = crate::source::RequestTemplate::Unbounded;
        source.layout = RowLayout::Nested {
            pointer: "/results".to_string(),
        };
        source.pagination = Some(Pagination {
            next_pointer: "/info/next".to_string(),
            max_pages: 2,
        });

        // Every page links to another one.
        let pages = RoutedPages::new(vec![(
            "https://rickandmortyapi.com/api/location",
            Ok(json!({
                "info": {"next": "https://rickandmortyapi.com/api/location?page=n"},
                "results": [{"id": 1}]
            })),
        )]);
        let fetcher = PartitionFetcher::new(Arc::new(source.clone()), pages);
        let chunk = FetchRange::new(1_i64, 10).unwrap();

        let outcome = fetcher
            .fetch(source.partition("location").unwrap(), &[chunk])
            .await
            .unwrap();
        assert_eq!(outcome.chunks_failed, 1);
        assert!(!outcome.is_success());
    }
}
