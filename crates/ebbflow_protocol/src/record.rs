//! Partitions and the records extracted for them.

use crate::key::OrderedKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// An independently fetchable unit of work (a city, a resource type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub id: String,
    /// Query parameters added to every request for this partition.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Static fields stamped onto every record of this partition.
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl Partition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            params: BTreeMap::new(),
            attributes: Map::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// One extracted row, addressed by `(key, partition_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "K: Serialize", deserialize = "K: OrderedKey"))]
pub struct Record<K> {
    pub key: K,
    pub partition_id: String,
    pub fields: Map<String, Value>,
    pub fetched_at: DateTime<Utc>,
}

impl<K: OrderedKey> Record<K> {
    pub fn new(key: K, partition_id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            key,
            partition_id: partition_id.into(),
            fields,
            fetched_at: Utc::now(),
        }
    }

    pub fn with_fetched_at(mut self, fetched_at: DateTime<Utc>) -> Self {
        self.fetched_at = fetched_at;
        self
    }

    /// Natural key used for upsert deduplication.
    pub fn natural_key(&self) -> (K, &str) {
        (self.key, self.partition_id.as_str())
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}
