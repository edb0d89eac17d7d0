//! Typed values and rows exchanged with DuckDB.

use crate::BackendError;
use chrono::{DateTime, NaiveDate, Utc};

/// Days between 0001-01-01 (CE day 1) and 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// A single bound parameter or result cell.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Boolean(bool),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl DbValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DbValue::Null)
    }

    pub(crate) fn to_duckdb(&self) -> duckdb::types::Value {
        use duckdb::types::{TimeUnit, Value};

        match self {
            DbValue::Null => Value::Null,
            DbValue::Integer(v) => Value::BigInt(*v),
            DbValue::Real(v) => Value::Double(*v),
            DbValue::Text(v) => Value::Text(v.clone()),
            DbValue::Boolean(v) => Value::Boolean(*v),
            // Bound as ISO text; DuckDB casts to the DATE column on insert and compare.
            DbValue::Date(v) => Value::Text(v.format("%Y-%m-%d").to_string()),
            DbValue::Timestamp(v) => Value::Timestamp(TimeUnit::Microsecond, v.timestamp_micros()),
        }
    }

    pub(crate) fn from_duckdb(row: &duckdb::Row, index: usize) -> Result<DbValue, duckdb::Error> {
        use duckdb::types::{TimeUnit, ValueRef};

        let value = match row.get_ref(index)? {
            ValueRef::Null => DbValue::Null,
            ValueRef::Boolean(v) => DbValue::Boolean(v),
            ValueRef::TinyInt(v) => DbValue::Integer(v as i64),
            ValueRef::SmallInt(v) => DbValue::Integer(v as i64),
            ValueRef::Int(v) => DbValue::Integer(v as i64),
            ValueRef::BigInt(v) => DbValue::Integer(v),
            ValueRef::HugeInt(v) => DbValue::Integer(v as i64),
            ValueRef::UTinyInt(v) => DbValue::Integer(v as i64),
            ValueRef::USmallInt(v) => DbValue::Integer(v as i64),
            ValueRef::UInt(v) => DbValue::Integer(v as i64),
            ValueRef::UBigInt(v) => DbValue::Integer(v as i64),
            ValueRef::Float(v) => DbValue::Real(v as f64),
            ValueRef::Double(v) => DbValue::Real(v),
            ValueRef::Text(v) => DbValue::Text(String::from_utf8_lossy(v).to_string()),
            ValueRef::Date32(days) => {
                match NaiveDate::from_num_days_from_ce_opt(UNIX_EPOCH_DAYS_FROM_CE + days) {
                    Some(date) => DbValue::Date(date),
                    None => DbValue::Integer(days as i64),
                }
            }
            ValueRef::Timestamp(unit, v) => {
                let micros = match unit {
                    TimeUnit::Second => v * 1_000_000,
                    TimeUnit::Millisecond => v * 1_000,
                    TimeUnit::Microsecond => v,
                    TimeUnit::Nanosecond => v / 1_000,
                };
                let secs = micros.div_euclid(1_000_000);
                let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
                match DateTime::from_timestamp(secs, nanos) {
                    Some(ts) => DbValue::Timestamp(ts),
                    None => DbValue::Integer(micros),
                }
            }
            other => {
                tracing::warn!(
                    "DuckDB type {:?} at column {} mapped to debug string",
                    std::mem::discriminant(&other),
                    index
                );
                DbValue::Text(format!("{:?}", other))
            }
        };
        Ok(value)
    }
}

impl From<i64> for DbValue {
    fn from(v: i64) -> Self {
        DbValue::Integer(v)
    }
}

impl From<f64> for DbValue {
    fn from(v: f64) -> Self {
        DbValue::Real(v)
    }
}

impl From<String> for DbValue {
    fn from(v: String) -> Self {
        DbValue::Text(v)
    }
}

impl From<&str> for DbValue {
    fn from(v: &str) -> Self {
        DbValue::Text(v.to_string())
    }
}

impl From<bool> for DbValue {
    fn from(v: bool) -> Self {
        DbValue::Boolean(v)
    }
}

impl From<NaiveDate> for DbValue {
    fn from(v: NaiveDate) -> Self {
        DbValue::Date(v)
    }
}

impl From<DateTime<Utc>> for DbValue {
    fn from(v: DateTime<Utc>) -> Self {
        DbValue::Timestamp(v)
    }
}

impl<T: Into<DbValue>> From<Option<T>> for DbValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => DbValue::Null,
        }
    }
}

/// One result row with its column names.
#[derive(Debug, Clone)]
pub struct DbRow {
    columns: Vec<String>,
    values: Vec<DbValue>,
}

impl DbRow {
    pub fn new(columns: Vec<String>, values: Vec<DbValue>) -> Self {
        Self { columns, values }
    }

    pub fn get<T: FromDbValue>(&self, index: usize) -> Result<T, BackendError> {
        let value = self.values.get(index).ok_or_else(|| {
            BackendError::TypeConversion(format!(
                "Column index {} out of range ({} columns)",
                index,
                self.values.len()
            ))
        })?;
        T::from_db_value(value)
    }

    pub fn get_by_name<T: FromDbValue>(&self, name: &str) -> Result<T, BackendError> {
        let index = self
            .columns
            .iter()
            .position(|col| col == name)
            .ok_or_else(|| BackendError::TypeConversion(format!("No column named '{}'", name)))?;
        self.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    pub fn get_raw(&self, index: usize) -> Option<&DbValue> {
        self.values.get(index)
    }
}

/// Conversion out of a result cell.
pub trait FromDbValue: Sized {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError>;
}

fn mismatch(expected: &str, value: &DbValue) -> BackendError {
    BackendError::TypeConversion(format!("Expected {}, got {:?}", expected, value))
}

impl FromDbValue for i64 {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Integer(v) => Ok(*v),
            DbValue::Boolean(v) => Ok(i64::from(*v)),
            other => Err(mismatch("integer", other)),
        }
    }
}

impl FromDbValue for f64 {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Real(v) => Ok(*v),
            DbValue::Integer(v) => Ok(*v as f64),
            other => Err(mismatch("real", other)),
        }
    }
}

impl FromDbValue for String {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Text(v) => Ok(v.clone()),
            DbValue::Date(v) => Ok(v.format("%Y-%m-%d").to_string()),
            DbValue::Timestamp(v) => Ok(v.to_rfc3339()),
            other => Err(mismatch("text", other)),
        }
    }
}

impl FromDbValue for bool {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Boolean(v) => Ok(*v),
            DbValue::Integer(v) => Ok(*v != 0),
            other => Err(mismatch("boolean", other)),
        }
    }
}

impl FromDbValue for NaiveDate {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Date(v) => Ok(*v),
            DbValue::Timestamp(v) => Ok(v.date_naive()),
            DbValue::Text(v) => NaiveDate::parse_from_str(v, "%Y-%m-%d")
                .map_err(|e| BackendError::TypeConversion(format!("Invalid date '{}': {}", v, e))),
            other => Err(mismatch("date", other)),
        }
    }
}

impl FromDbValue for DateTime<Utc> {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Timestamp(v) => Ok(*v),
            DbValue::Text(v) => DateTime::parse_from_rfc3339(v)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| {
                    BackendError::TypeConversion(format!("Invalid timestamp '{}': {}", v, e))
                }),
            other => Err(mismatch("timestamp", other)),
        }
    }
}

impl<T: FromDbValue> FromDbValue for Option<T> {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Null => Ok(None),
            other => T::from_db_value(other).map(Some),
        }
    }
}
