//! Declarative source definitions.
//!
//! A [`SourceDefinition`] says where pages come from, how rows are laid out
//! inside a page, how a chunk becomes a request, and which partitions and key
//! range to extract. Definitions are plain data so they can be loaded from
//! TOML as well as built in code (see [`crate::presets`]).

use crate::coordinator::Requested;
use crate::error::{ExtractError, PageError};
use crate::http::PageRequest;
use chrono::{DateTime, Days, NaiveDate, Utc};
use chrono_tz::Tz;
use ebbflow_protocol::{Chunk, ChunkSpan, FetchRange, KeyKind, OrderedKey, Partition};
use ebbflow_sinks::{ColumnSpec, SinkSchema};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Placeholder in `url` replaced by the partition id.
pub const PARTITION_PLACEHOLDER: &str = "{partition}";

pub const DEFAULT_MAX_PAGES: usize = 1000;

fn default_partition_column() -> String {
    "partition".to_string()
}

fn default_max_pages() -> usize {
    DEFAULT_MAX_PAGES
}

/// Where the rows of a page live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RowLayout {
    /// The body is an array of row objects (or a single row object).
    Flat,
    /// An array of row objects under a JSON pointer.
    Nested { pointer: String },
    /// An object of parallel arrays under a JSON pointer.
    Columnar { pointer: String },
}

impl RowLayout {
    /// Pull row objects out of a page.
    pub fn extract_rows(&self, page: &Value, url: &str) -> Result<Vec<Map<String, Value>>, PageError> {
        match self {
            RowLayout::Flat => match page {
                Value::Object(row) => Ok(vec![row.clone()]),
                Value::Array(items) => rows_from_array(items, url),
                _ => Err(malformed(url, "expected an array or object of rows")),
            },
            RowLayout::Nested { pointer } => match lookup(page, pointer, url)? {
                Value::Array(items) => rows_from_array(items, url),
                _ => Err(malformed(url, &format!("'{}' is not an array", pointer))),
            },
            RowLayout::Columnar { pointer } => match lookup(page, pointer, url)? {
                Value::Object(columns) => zip_columns(columns, url),
                _ => Err(malformed(url, &format!("'{}' is not an object", pointer))),
            },
        }
    }

    fn pointer(&self) -> Option<&str> {
        match self {
            RowLayout::Flat => None,
            RowLayout::Nested { pointer } | RowLayout::Columnar { pointer } => Some(pointer),
        }
    }
}

fn malformed(url: &str, reason: &str) -> PageError {
    PageError::Malformed {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

fn lookup<'a>(page: &'a Value, pointer: &str, url: &str) -> Result<&'a Value, PageError> {
    match page.pointer(pointer) {
        Some(Value::Null) | None => Err(PageError::MissingData {
            url: url.to_string(),
            pointer: pointer.to_string(),
        }),
        Some(value) => Ok(value),
    }
}

fn rows_from_array(items: &[Value], url: &str) -> Result<Vec<Map<String, Value>>, PageError> {
    items
        .iter()
        .map(|item| match item {
            Value::Object(row) => Ok(row.clone()),
            _ => Err(malformed(url, "row is not an object")),
        })
        .collect()
}

/// Zip `{"time": [..], "temp": [..]}` into one object per index. Shorter
/// columns are padded with nulls.
fn zip_columns(columns: &Map<String, Value>, url: &str) -> Result<Vec<Map<String, Value>>, PageError> {
    let mut arrays = Vec::with_capacity(columns.len());
    for (name, values) in columns {
        match values {
            Value::Array(values) => arrays.push((name, values)),
            _ => return Err(malformed(url, &format!("column '{}' is not an array", name))),
        }
    }

    let len = arrays.iter().map(|(_, values)| values.len()).max().unwrap_or(0);
    let rows = (0..len)
        .map(|idx| {
            arrays
                .iter()
                .map(|(name, values)| {
                    let value = values.get(idx).cloned().unwrap_or(Value::Null);
                    ((*name).clone(), value)
                })
                .collect()
        })
        .collect();
    Ok(rows)
}

/// "Next page" link following.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// JSON pointer to the next page URL, e.g. `/info/next`.
    pub next_pointer: String,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

impl Pagination {
    pub fn new(next_pointer: impl Into<String>) -> Self {
        Self {
            next_pointer: next_pointer.into(),
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    /// Next page URL, or `None` when the link is null or absent.
    pub fn next_url(&self, page: &Value) -> Option<String> {
        page.pointer(&self.next_pointer)
            .and_then(Value::as_str)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
    }
}

/// How a chunk is turned into a request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestTemplate {
    /// Chunk bounds as `%Y-%m-%d` query parameters.
    DateWindow { start_param: String, end_param: String },
    /// Every id of the chunk, comma-joined, as a path suffix.
    IdList,
    /// The base request; rows outside the chunk are filtered afterwards.
    #[default]
    Unbounded,
}

/// One end of the requested key range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RangeBound {
    /// Today's date in `timezone`, shifted by `today` days.
    Relative {
        today: i64,
        #[serde(default = "default_timezone")]
        timezone: String,
    },
    /// A literal key, e.g. `"2021-01-01"` or `1`.
    Literal(Value),
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl RangeBound {
    pub fn literal(value: impl Into<Value>) -> Self {
        RangeBound::Literal(value.into())
    }

    pub fn today(offset_days: i64, timezone: impl Into<String>) -> Self {
        RangeBound::Relative {
            today: offset_days,
            timezone: timezone.into(),
        }
    }

    pub fn resolve<K: OrderedKey>(&self, now: DateTime<Utc>) -> Result<K, ExtractError> {
        match self {
            RangeBound::Literal(value) => K::from_json(value).ok_or_else(|| {
                ExtractError::Config(format!("'{}' is not a valid {} key", value, K::KIND))
            }),
            RangeBound::Relative { today, timezone } => {
                if K::KIND != KeyKind::Date {
                    return Err(ExtractError::Config(
                        "relative range bounds need a date key".to_string(),
                    ));
                }
                let date = relative_date(now, *today, timezone)?;
                K::from_json(&Value::String(date.format("%Y-%m-%d").to_string())).ok_or_else(
                    || ExtractError::Config(format!("cannot use {} as a range bound", date)),
                )
            }
        }
    }
}

fn relative_date(now: DateTime<Utc>, offset: i64, timezone: &str) -> Result<NaiveDate, ExtractError> {
    let tz: Tz = timezone
        .parse()
        .map_err(|e| ExtractError::Config(format!("unknown timezone '{}': {}", timezone, e)))?;
    let today = now.with_timezone(&tz).date_naive();
    let shifted = if offset >= 0 {
        today.checked_add_days(Days::new(offset.unsigned_abs()))
    } else {
        today.checked_sub_days(Days::new(offset.unsigned_abs()))
    };
    shifted.ok_or_else(|| ExtractError::Config(format!("date offset {} out of range", offset)))
}

/// Requested key range, inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeConfig {
    pub start: RangeBound,
    pub end: RangeBound,
}

/// Total-count request used to derive an id range `[1, count]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountProbe {
    /// JSON pointer to the count, e.g. `/info/count`.
    pub pointer: String,
}

/// Everything needed to extract one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDefinition {
    pub name: String,
    /// Base URL; `{partition}` is replaced by the partition id.
    pub url: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    pub key_kind: KeyKind,
    /// Field holding the ordered key, after renames. Also the sink key column.
    pub key_field: String,
    #[serde(default = "default_partition_column")]
    pub partition_column: String,
    pub table: String,
    #[serde(default)]
    pub chunk_span: ChunkSpan,
    pub layout: RowLayout,
    #[serde(default)]
    pub pagination: Option<Pagination>,
    #[serde(default)]
    pub request: RequestTemplate,
    /// Upstream field name to stored field name.
    #[serde(default)]
    pub renames: BTreeMap<String, String>,
    #[serde(default)]
    pub columns: Vec<ColumnSpec>,
    pub partitions: Vec<Partition>,
    #[serde(default)]
    pub range: Option<RangeConfig>,
    #[serde(default)]
    pub count_probe: Option<CountProbe>,
}

impl SourceDefinition {
    /// Reject definitions that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<(), ExtractError> {
        let fail = |msg: String| Err(ExtractError::Config(format!("source '{}': {}", self.name, msg)));

        if self.name.trim().is_empty() {
            return Err(ExtractError::Config("source name is empty".to_string()));
        }
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return fail(format!("url '{}' is not http(s)", self.url));
        }
        if self.key_field.is_empty() || self.table.is_empty() || self.partition_column.is_empty() {
            return fail("key_field, table and partition_column must be set".to_string());
        }
        if self.key_field == self.partition_column {
            return fail("key_field and partition_column must differ".to_string());
        }
        if self.partitions.is_empty() {
            return fail("no partitions configured".to_string());
        }
        let mut seen = BTreeSet::new();
        for partition in &self.partitions {
            if partition.id.is_empty() {
                return fail("partition id is empty".to_string());
            }
            if !seen.insert(partition.id.as_str()) {
                return fail(format!("duplicate partition '{}'", partition.id));
            }
        }
        if let Some(pointer) = self.layout.pointer() {
            if !pointer.starts_with('/') {
                return fail(format!("layout pointer '{}' must start with '/'", pointer));
            }
        }
        if let Some(pagination) = &self.pagination {
            if !pagination.next_pointer.starts_with('/') || pagination.max_pages == 0 {
                return fail("pagination needs a '/' pointer and max_pages > 0".to_string());
            }
        }
        match (&self.request, self.key_kind) {
            (RequestTemplate::DateWindow { .. }, KeyKind::Integer) => {
                return fail("date_window requests need a date key".to_string());
            }
            (RequestTemplate::IdList, KeyKind::Date) => {
                return fail("id_list requests need an integer key".to_string());
            }
            _ => {}
        }
        if self.request == RequestTemplate::IdList
            && matches!(self.chunk_span, ChunkSpan::CalendarYear | ChunkSpan::Width(0))
        {
            return fail("id_list requests need a fixed chunk width".to_string());
        }
        match (&self.count_probe, &self.range) {
            (Some(_), _) if self.key_kind != KeyKind::Integer => {
                fail("count_probe needs an integer key".to_string())
            }
            (None, None) => fail("either range or count_probe must be set".to_string()),
            _ => Ok(()),
        }
    }

    pub fn sink_schema(&self) -> SinkSchema {
        let mut schema = SinkSchema::new(&self.table, &self.key_field, &self.partition_column);
        schema.columns = self.columns.clone();
        schema
    }

    pub fn partition(&self, id: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.id == id)
    }

    /// URL plus static and per-partition query parameters.
    pub fn base_request(&self, partition: &Partition) -> PageRequest {
        let mut request = PageRequest::new(self.url.replace(PARTITION_PLACEHOLDER, &partition.id));
        for (name, value) in self.query.iter().chain(partition.params.iter()) {
            request = request.with_query(name.as_str(), value.as_str());
        }
        request
    }

    /// First request for `chunk`.
    pub fn chunk_request<K: OrderedKey>(&self, partition: &Partition, chunk: &Chunk<K>) -> PageRequest {
        let mut request = self.base_request(partition);
        match &self.request {
            RequestTemplate::DateWindow {
                start_param,
                end_param,
            } => {
                request = request
                    .with_query(start_param.as_str(), key_param(&chunk.start()))
                    .with_query(end_param.as_str(), key_param(&chunk.end()));
            }
            RequestTemplate::IdList => {
                let ids: Vec<String> = keys_in(chunk).iter().map(key_param).collect();
                request.url = format!("{}/{}", request.url.trim_end_matches('/'), ids.join(","));
            }
            RequestTemplate::Unbounded => {}
        }
        request
    }

    /// Configured range, resolved against `now`. An inverted range is empty.
    pub fn requested_range<K: OrderedKey>(&self, now: DateTime<Utc>) -> Result<Requested<K>, ExtractError> {
        let range = self.range.as_ref().ok_or_else(|| {
            ExtractError::Config(format!("source '{}' has no range configured", self.name))
        })?;
        let start: K = range.start.resolve(now)?;
        let end: K = range.end.resolve(now)?;
        Ok(match FetchRange::new(start, end) {
            Ok(range) => Requested::Range(range),
            Err(_) => Requested::Empty,
        })
    }
}

fn key_param<K: OrderedKey>(key: &K) -> String {
    match key.to_json() {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn keys_in<K: OrderedKey>(chunk: &Chunk<K>) -> Vec<K> {
    let mut keys = Vec::with_capacity(chunk.span().min(10_000) as usize);
    let mut key = chunk.start();
    loop {
        keys.push(key);
        if key >= chunk.end() {
            break;
        }
        match key.successor() {
            Some(next) => key = next,
            None => break,
        }
    }
    keys
}
