//! DuckDB-backed record sink.
//!
//! Writes go through a stage table: the batch is bulk-loaded into the stage,
//! then one transaction deletes target rows sharing a natural key with the
//! stage and inserts the stage. The target has no primary key; uniqueness of
//! `(key, partition)` is kept by the delete-then-insert.

use crate::schema::{key_from_db, key_to_db, ColumnSpec, ColumnType, SinkSchema, FETCHED_AT_COLUMN};
use crate::{dedupe_by_natural_key, RecordSink, SinkReadError, SinkWriteError};
use ebbflow_db::{quote_ident, DbConnection, DbValue};
use ebbflow_protocol::{KeyRange, OrderedKey, Record};
use std::marker::PhantomData;
use std::path::Path;
use tracing::{debug, info, warn};

fn stage_table_name(table: &str) -> String {
    format!(
        "__ebbflow_stage_{}",
        &blake3::hash(table.as_bytes()).to_hex()[..16]
    )
}

/// DuckDB sink writing one table. Holds the writer lock while open.
pub struct DuckDbSink<K: OrderedKey> {
    conn: DbConnection,
    schema: SinkSchema,
    stage_table: String,
    rows_written: u64,
    _key: PhantomData<K>,
}

impl<K: OrderedKey> std::fmt::Debug for DuckDbSink<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuckDbSink")
            .field("conn", &self.conn)
            .field("table", &self.schema.table)
            .finish()
    }
}

impl<K: OrderedKey> DuckDbSink<K> {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path, schema: SinkSchema) -> Result<Self, SinkWriteError> {
        let conn = DbConnection::open(path)?;
        Ok(Self::with_connection(conn, schema))
    }

    /// Use an existing connection, e.g. an in-memory database.
    pub fn with_connection(conn: DbConnection, schema: SinkSchema) -> Self {
        let stage_table = stage_table_name(&schema.table);
        Self {
            conn,
            schema,
            stage_table,
            rows_written: 0,
            _key: PhantomData,
        }
    }

    pub fn schema(&self) -> &SinkSchema {
        &self.schema
    }

    pub fn connection(&self) -> &DbConnection {
        &self.conn
    }

    /// Rows written by this sink instance.
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    fn location(&self) -> String {
        match self.conn.path() {
            Some(path) => path.display().to_string(),
            None => ":memory:".to_string(),
        }
    }

    fn fixed_columns(&self) -> Vec<ColumnSpec> {
        vec![
            ColumnSpec::new(&self.schema.key_column, ColumnType::for_key(K::KIND)),
            ColumnSpec::new(&self.schema.partition_column, ColumnType::Varchar),
        ]
    }

    /// Create the target if missing, add the value columns it lacks and widen
    /// those the batch no longer fits. Returns the columns typed as the table
    /// now holds them.
    fn ensure_table(&self, value_columns: Vec<ColumnSpec>) -> Result<Vec<ColumnSpec>, SinkWriteError> {
        let target = quote_ident(&self.schema.table);

        if !self.conn.table_exists(&self.schema.table)? {
            let mut defs: Vec<String> = self
                .fixed_columns()
                .iter()
                .map(|c| format!("{} {} NOT NULL", quote_ident(&c.name), c.column_type.sql_type()))
                .collect();
            defs.extend(
                value_columns
                    .iter()
                    .map(|c| format!("{} {}", quote_ident(&c.name), c.column_type.sql_type())),
            );
            defs.push(format!("{} TIMESTAMP", quote_ident(FETCHED_AT_COLUMN)));

            let create_sql = format!("CREATE TABLE {} ({})", target, defs.join(", "));
            debug!("CREATE TABLE: {}", create_sql);
            self.conn.execute_batch(&create_sql)?;
            info!("Created sink table {}", self.schema.table);
            return Ok(value_columns);
        }

        let existing = self.conn.table_columns(&self.schema.table)?;
        let mut resolved = Vec::with_capacity(value_columns.len());
        for column in value_columns {
            let Some(current) = existing
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(&column.name))
            else {
                let alter_sql = format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    target,
                    quote_ident(&column.name),
                    column.column_type.sql_type()
                );
                self.conn.execute_batch(&alter_sql)?;
                info!(
                    "Added column {} {} to {}",
                    column.name,
                    column.column_type.sql_type(),
                    self.schema.table
                );
                resolved.push(column);
                continue;
            };

            let Some(held) = ColumnType::from_sql_type(&current.data_type) else {
                debug!(
                    "Column {}.{} is {}; binding {} values unchanged",
                    self.schema.table, current.name, current.data_type, column.column_type
                );
                resolved.push(column);
                continue;
            };
            // VARCHAR also backs JSON columns; keep the batch's reading of it.
            if held.sql_type() == column.column_type.sql_type() {
                resolved.push(column);
                continue;
            }

            let widened = held.widen(column.column_type);
            if widened.sql_type() != held.sql_type() {
                let alter_sql = format!(
                    "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
                    target,
                    quote_ident(&current.name),
                    widened.sql_type()
                );
                self.conn.execute_batch(&alter_sql)?;
                warn!(
                    "Widened column {}.{} from {} to {}",
                    self.schema.table,
                    current.name,
                    held.sql_type(),
                    widened.sql_type()
                );
            }
            resolved.push(ColumnSpec::new(column.name, widened));
        }
        Ok(resolved)
    }

    fn to_row(&self, record: &Record<K>, value_columns: &[ColumnSpec]) -> Vec<DbValue> {
        let mut row = Vec::with_capacity(value_columns.len() + 3);
        row.push(key_to_db(&record.key));
        row.push(DbValue::from(record.partition_id.as_str()));
        for column in value_columns {
            row.push(match record.fields.get(&column.name) {
                Some(value) => column.column_type.to_db_value(value),
                None => DbValue::Null,
            });
        }
        row.push(DbValue::from(record.fetched_at));
        row
    }
}

impl<K: OrderedKey> RecordSink<K> for DuckDbSink<K> {
    fn describe(&self) -> String {
        format!("duckdb:{}/{}", self.location(), self.schema.table)
    }

    fn key_ranges(&self) -> Result<Vec<KeyRange<K>>, SinkReadError> {
        if !self.conn.table_exists(&self.schema.table)? {
            if self.conn.was_created() && self.rows_written == 0 {
                return Err(SinkReadError::NeverInitialized {
                    location: self.location(),
                });
            }
            return Err(SinkReadError::UndefinedRelation {
                table: self.schema.table.clone(),
            });
        }

        let key = quote_ident(&self.schema.key_column);
        let partition = quote_ident(&self.schema.partition_column);
        let sql = format!(
            "SELECT {partition} AS partition_id, MIN({key}) AS min_key, MAX({key}) AS max_key, COUNT(*) AS row_count \
             FROM {table} GROUP BY {partition} ORDER BY {partition}",
            partition = partition,
            key = key,
            table = quote_ident(&self.schema.table),
        );

        let rows = self.conn.query_all(&sql, &[])?;
        let mut ranges = Vec::with_capacity(rows.len());
        for row in rows {
            let partition_id: String = row.get_by_name("partition_id")?;
            let min_raw = row.get_raw(1).cloned().unwrap_or(DbValue::Null);
            let max_raw = row.get_raw(2).cloned().unwrap_or(DbValue::Null);
            let (Some(min), Some(max)) = (key_from_db::<K>(&min_raw), key_from_db::<K>(&max_raw))
            else {
                return Err(SinkReadError::Unavailable(format!(
                    "Unreadable key bounds for partition {}: {:?} / {:?}",
                    partition_id, min_raw, max_raw
                )));
            };
            let count: i64 = row.get_by_name("row_count")?;
            ranges.push(KeyRange {
                partition_id,
                min,
                max,
                rows: count.max(0) as u64,
            });
        }
        Ok(ranges)
    }

    fn upsert(&mut self, records: &[Record<K>]) -> Result<u64, SinkWriteError> {
        if records.is_empty() {
            return Ok(0);
        }

        let unique: Vec<Record<K>> = dedupe_by_natural_key(records)
            .into_iter()
            .cloned()
            .collect();
        let value_columns = self.ensure_table(self.schema.value_columns(&unique))?;

        let target = quote_ident(&self.schema.table);
        let stage = quote_ident(&self.stage_table);

        let mut column_names: Vec<&str> = vec![
            self.schema.key_column.as_str(),
            self.schema.partition_column.as_str(),
        ];
        column_names.extend(value_columns.iter().map(|c| c.name.as_str()));
        column_names.push(FETCHED_AT_COLUMN);
        let column_list = column_names
            .iter()
            .map(|name| quote_ident(name))
            .collect::<Vec<_>>()
            .join(", ");

        self.conn.execute_batch(&format!(
            "CREATE OR REPLACE TABLE {} AS SELECT {} FROM {} WHERE 1=0",
            stage, column_list, target
        ))?;

        let rows: Vec<Vec<DbValue>> = unique
            .iter()
            .map(|record| self.to_row(record, &value_columns))
            .collect();
        let staged = self.conn.bulk_insert(&self.stage_table, &column_names, &rows)?;
        debug!("Staged {} rows for {}", staged, self.schema.table);

        let key = quote_ident(&self.schema.key_column);
        let partition = quote_ident(&self.schema.partition_column);
        let delete_sql = format!(
            "DELETE FROM {target} USING {stage} s \
             WHERE {target}.{key} = s.{key} AND {target}.{partition} = s.{partition}",
            target = target,
            stage = stage,
            key = key,
            partition = partition,
        );
        let insert_sql = format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            target, column_list, column_list, stage
        );

        let replaced = self.conn.transaction(|tx| {
            let replaced = tx.execute(&delete_sql, &[])?;
            tx.execute(&insert_sql, &[])?;
            tx.execute_batch(&format!("DROP TABLE {}", stage))?;
            Ok(replaced)
        })?;
        self.conn.checkpoint()?;

        self.rows_written += staged;
        info!(
            "Merged {} rows into {} ({} replaced)",
            staged, self.schema.table, replaced
        );
        Ok(staged)
    }

    fn row_count(&self) -> Result<u64, SinkReadError> {
        if !self.conn.table_exists(&self.schema.table)? {
            return Ok(0);
        }
        let count: i64 = self.conn.query_scalar(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(&self.schema.table)),
            &[],
        )?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::{json, Map};
    use tempfile::tempdir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn weather_schema() -> SinkSchema {
        SinkSchema::new("daily_weather", "date", "City")
            .with_column("temperature_max", ColumnType::Double)
            .with_column("country", ColumnType::Varchar)
    }

    fn weather(day: NaiveDate, city: &str, temp: f64) -> Record<NaiveDate> {
        let mut fields = Map::new();
        fields.insert("temperature_max".into(), json!(temp));
        fields.insert("country".into(), json!("Australia"));
        Record::new(day, city, fields)
    }

    #[test]
    fn test_never_initialized_then_ranges() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("warehouse.duckdb");
        let mut sink = DuckDbSink::<NaiveDate>::open(&path, weather_schema()).unwrap();

        assert!(matches!(
            sink.key_ranges(),
            Err(SinkReadError::NeverInitialized { .. })
        ));

        sink.upsert(&[
            weather(date(2021, 1, 1), "Sydney", 25.1),
            weather(date(2021, 1, 2), "Sydney", 26.3),
            weather(date(2021, 1, 1), "Hobart", 18.0),
        ])
        .unwrap();

        let ranges = sink.key_ranges().unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].partition_id, "Hobart");
        assert_eq!(ranges[1].min, date(2021, 1, 1));
        assert_eq!(ranges[1].max, date(2021, 1, 2));
        assert_eq!(ranges[1].rows, 2);
    }

    #[test]
    fn test_undefined_relation_on_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("warehouse.duckdb");
        {
            let conn = DbConnection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE other (id BIGINT)").unwrap();
        }

        let sink = DuckDbSink::<NaiveDate>::open(&path, weather_schema()).unwrap();
        assert!(matches!(
            sink.key_ranges(),
            Err(SinkReadError::UndefinedRelation { .. })
        ));
        assert_eq!(sink.row_count().unwrap(), 0);
    }

    #[test]
    fn test_upsert_replaces_matching_keys() {
        let conn = DbConnection::open_in_memory().unwrap();
        let mut sink = DuckDbSink::<NaiveDate>::with_connection(conn, weather_schema());

        sink.upsert(&[
            weather(date(2021, 1, 1), "Sydney", 25.1),
            weather(date(2021, 1, 2), "Sydney", 26.3),
        ])
        .unwrap();
        sink.upsert(&[
            weather(date(2021, 1, 2), "Sydney", 30.0),
            weather(date(2021, 1, 3), "Sydney", 27.0),
        ])
        .unwrap();

        assert_eq!(sink.row_count().unwrap(), 3);
        let temp: f64 = sink
            .connection()
            .query_scalar(
                "SELECT temperature_max FROM daily_weather WHERE date = ? AND \"City\" = ?",
                &[DbValue::from(date(2021, 1, 2)), DbValue::from("Sydney")],
            )
            .unwrap();
        assert_eq!(temp, 30.0);
        assert!(!sink.connection().table_exists(&sink.stage_table).unwrap());
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let conn = DbConnection::open_in_memory().unwrap();
        let mut sink = DuckDbSink::<NaiveDate>::with_connection(conn, weather_schema());
        let batch = vec![
            weather(date(2021, 1, 1), "Perth", 31.0),
            weather(date(2021, 1, 1), "Perth", 32.0),
        ];

        assert_eq!(sink.upsert(&batch).unwrap(), 1);
        assert_eq!(sink.upsert(&batch).unwrap(), 1);
        assert_eq!(sink.row_count().unwrap(), 1);
    }

    #[test]
    fn test_new_fields_extend_table() {
        let conn = DbConnection::open_in_memory().unwrap();
        let schema = SinkSchema::new("characters", "id", "resource");
        let mut sink = DuckDbSink::<i64>::with_connection(conn, schema);

        let mut first = Map::new();
        first.insert("name".into(), json!("Rick Sanchez"));
        sink.upsert(&[Record::new(1, "character", first)]).unwrap();

        let mut second = Map::new();
        second.insert("name".into(), json!("Morty Smith"));
        second.insert("episode".into(), json!(["S01E01"]));
        sink.upsert(&[Record::new(2, "character", second)]).unwrap();

        let columns = sink.connection().table_columns("characters").unwrap();
        assert!(columns.iter().any(|c| c.name == "episode"));
        let ranges = sink.key_ranges().unwrap();
        assert_eq!((ranges[0].min, ranges[0].max), (1, 2));
    }

    fn scored(id: i64, score: serde_json::Value) -> Record<i64> {
        let mut fields = Map::new();
        fields.insert("score".into(), score);
        Record::new(id, "character", fields)
    }

    fn column_type(sink: &DuckDbSink<i64>, name: &str) -> String {
        sink.connection()
            .table_columns("characters")
            .unwrap()
            .into_iter()
            .find(|c| c.name == name)
            .map(|c| c.data_type)
            .unwrap()
    }

    #[test]
    fn test_inferred_column_widens_across_batches() {
        let conn = DbConnection::open_in_memory().unwrap();
        let schema = SinkSchema::new("characters", "id", "resource");
        let mut sink = DuckDbSink::<i64>::with_connection(conn, schema);

        sink.upsert(&[scored(1, json!(7))]).unwrap();
        assert_eq!(column_type(&sink, "score"), "BIGINT");

        sink.upsert(&[scored(2, json!(2.75))]).unwrap();
        assert_eq!(column_type(&sink, "score"), "DOUBLE");
        let score: f64 = sink
            .connection()
            .query_scalar("SELECT score FROM characters WHERE id = 2", &[])
            .unwrap();
        assert_eq!(score, 2.75);

        sink.upsert(&[scored(3, json!("unknown"))]).unwrap();
        assert_eq!(column_type(&sink, "score"), "VARCHAR");
        let text: String = sink
            .connection()
            .query_scalar("SELECT score FROM characters WHERE id = 3", &[])
            .unwrap();
        assert_eq!(text, "unknown");
        let earlier: String = sink
            .connection()
            .query_scalar("SELECT score FROM characters WHERE id = 2", &[])
            .unwrap();
        assert_eq!(earlier, "2.75");

        // Narrower values keep landing in the wider column.
        sink.upsert(&[scored(4, json!(12))]).unwrap();
        assert_eq!(column_type(&sink, "score"), "VARCHAR");
        assert_eq!(sink.row_count().unwrap(), 4);
    }

    #[test]
    fn test_lock_conflict() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("locked.duckdb");
        let _first = DuckDbSink::<NaiveDate>::open(&path, weather_schema()).unwrap();

        let err = DuckDbSink::<NaiveDate>::open(&path, weather_schema()).unwrap_err();
        assert!(
            err.to_string().to_lowercase().contains("locked"),
            "expected lock error, got: {}",
            err
        );
    }
}
