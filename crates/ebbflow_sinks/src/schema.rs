//! Target table layout and JSON-to-column conversion.

use chrono::{DateTime, NaiveDate, Utc};
use ebbflow_db::DbValue;
use ebbflow_protocol::{KeyKind, OrderedKey, Record};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Column type family for record fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Boolean,
    BigInt,
    Double,
    Varchar,
    Date,
    Timestamp,
    /// Nested JSON, stored as serialized text.
    Json,
}

impl ColumnType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Double => "DOUBLE",
            ColumnType::Varchar | ColumnType::Json => "VARCHAR",
            ColumnType::Date => "DATE",
            ColumnType::Timestamp => "TIMESTAMP",
        }
    }

    pub fn for_key(kind: KeyKind) -> Self {
        match kind {
            KeyKind::Date => ColumnType::Date,
            KeyKind::Integer => ColumnType::BigInt,
        }
    }

    /// Narrowest type that holds every non-null value in `values`.
    pub fn infer<'a>(values: impl IntoIterator<Item = &'a Value>) -> Self {
        let mut inferred: Option<ColumnType> = None;
        for value in values {
            let candidate = match value {
                Value::Null => continue,
                Value::Bool(_) => ColumnType::Boolean,
                Value::Number(n) if n.is_i64() || n.is_u64() => ColumnType::BigInt,
                Value::Number(_) => ColumnType::Double,
                Value::String(_) => ColumnType::Varchar,
                Value::Array(_) | Value::Object(_) => ColumnType::Json,
            };
            inferred = Some(match inferred {
                None => candidate,
                Some(current) => current.widen(candidate),
            });
        }
        inferred.unwrap_or(ColumnType::Varchar)
    }

    /// Narrowest type holding values of both `self` and `other`.
    pub fn widen(self, other: ColumnType) -> ColumnType {
        match (self, other) {
            (a, b) if a == b => a,
            (ColumnType::BigInt, ColumnType::Double) | (ColumnType::Double, ColumnType::BigInt) => {
                ColumnType::Double
            }
            (ColumnType::Json, _) | (_, ColumnType::Json) => ColumnType::Json,
            _ => ColumnType::Varchar,
        }
    }

    /// Family of a DuckDB type name from `information_schema`, if it is one we write.
    pub fn from_sql_type(data_type: &str) -> Option<ColumnType> {
        let upper = data_type.trim().to_ascii_uppercase();
        let column_type = match upper.as_str() {
            "BOOLEAN" => ColumnType::Boolean,
            "TINYINT" | "SMALLINT" | "INTEGER" | "BIGINT" | "UTINYINT" | "USMALLINT"
            | "UINTEGER" => ColumnType::BigInt,
            "FLOAT" | "REAL" | "DOUBLE" => ColumnType::Double,
            "VARCHAR" => ColumnType::Varchar,
            "DATE" => ColumnType::Date,
            t if t.starts_with("DECIMAL") => ColumnType::Double,
            t if t.starts_with("TIMESTAMP") => ColumnType::Timestamp,
            _ => return None,
        };
        Some(column_type)
    }

    /// Convert a JSON field into a bound value. Values that do not fit become NULL.
    pub fn to_db_value(&self, value: &Value) -> DbValue {
        if value.is_null() {
            return DbValue::Null;
        }
        match self {
            ColumnType::Boolean => value.as_bool().into(),
            ColumnType::BigInt => match value {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                    .into(),
                Value::String(s) => s.trim().parse::<i64>().ok().into(),
                _ => DbValue::Null,
            },
            ColumnType::Double => match value {
                Value::Number(n) => n.as_f64().into(),
                Value::String(s) => s.trim().parse::<f64>().ok().into(),
                _ => DbValue::Null,
            },
            ColumnType::Varchar => match value {
                Value::String(s) => DbValue::Text(s.clone()),
                other => DbValue::Text(other.to_string()),
            },
            ColumnType::Json => DbValue::Text(value.to_string()),
            ColumnType::Date => value
                .as_str()
                .and_then(|s| NaiveDate::parse_from_str(s.get(..10).unwrap_or(s), "%Y-%m-%d").ok())
                .into(),
            ColumnType::Timestamp => value
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|ts| ts.with_timezone(&Utc))
                .into(),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_type())
    }
}

impl FromStr for ColumnType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "boolean" | "bool" => Ok(ColumnType::Boolean),
            "bigint" | "integer" | "int" => Ok(ColumnType::BigInt),
            "double" | "float" | "real" => Ok(ColumnType::Double),
            "varchar" | "text" | "string" => Ok(ColumnType::Varchar),
            "date" => Ok(ColumnType::Date),
            "timestamp" => Ok(ColumnType::Timestamp),
            "json" => Ok(ColumnType::Json),
            other => Err(format!("Unknown column type: '{}'", other)),
        }
    }
}

/// One declared value column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

pub const FETCHED_AT_COLUMN: &str = "fetched_at";

/// Where and how records land in a relational sink.
///
/// The key, partition, and `fetched_at` columns are always present. Value
/// columns are the declared ones; undeclared fields are typed by inference
/// from each batch, widened against the type the table already has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkSchema {
    pub table: String,
    pub key_column: String,
    pub partition_column: String,
    #[serde(default)]
    pub columns: Vec<ColumnSpec>,
}

impl SinkSchema {
    pub fn new(
        table: impl Into<String>,
        key_column: impl Into<String>,
        partition_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            key_column: key_column.into(),
            partition_column: partition_column.into(),
            columns: Vec::new(),
        }
    }

    pub fn with_column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.push(ColumnSpec::new(name, column_type));
        self
    }

    pub fn is_reserved(&self, name: &str) -> bool {
        name == self.key_column || name == self.partition_column || name == FETCHED_AT_COLUMN
    }

    /// Value columns for a batch: declared columns first, then any other
    /// field seen in the batch, in first-seen order.
    pub fn value_columns<K: OrderedKey>(&self, records: &[Record<K>]) -> Vec<ColumnSpec> {
        let mut columns: Vec<ColumnSpec> = self
            .columns
            .iter()
            .filter(|c| !self.is_reserved(&c.name))
            .cloned()
            .collect();

        let mut extra: Vec<String> = Vec::new();
        for record in records {
            for name in record.fields.keys() {
                if self.is_reserved(name)
                    || columns.iter().any(|c| &c.name == name)
                    || extra.contains(name)
                {
                    continue;
                }
                extra.push(name.clone());
            }
        }

        for name in extra {
            let column_type =
                ColumnType::infer(records.iter().filter_map(|r| r.fields.get(&name)));
            columns.push(ColumnSpec::new(name, column_type));
        }
        columns
    }
}

/// Bound value for an ordered key.
pub fn key_to_db<K: OrderedKey>(key: &K) -> DbValue {
    match key.to_json() {
        Value::Number(n) => n.as_i64().into(),
        Value::String(s) => match K::KIND {
            KeyKind::Date => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .map(DbValue::Date)
                .unwrap_or(DbValue::Text(s)),
            KeyKind::Integer => DbValue::Text(s),
        },
        other => DbValue::Text(other.to_string()),
    }
}

/// Ordered key from a result cell.
pub fn key_from_db<K: OrderedKey>(value: &DbValue) -> Option<K> {
    let json = match value {
        DbValue::Integer(v) => Value::from(*v),
        DbValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
        DbValue::Timestamp(ts) => Value::String(ts.format("%Y-%m-%d").to_string()),
        DbValue::Text(s) => Value::String(s.clone()),
        _ => return None,
    };
    K::from_json(&json)
}
