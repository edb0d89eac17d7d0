//! Synchronous DuckDB connection wrapper.
//!
//! A writable connection owns the single-writer file lock for as long as it
//! lives. Every statement runs inside a `debug_span` carrying the SQL verb, a
//! stable hash of the text, and the elapsed time.

use crate::lock::{try_lock_exclusive, DbLockGuard, LockError};
use crate::value::{DbRow, DbValue, FromDbValue};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug_span, info};

/// Errors from database backend operations.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Operation requires write access but database is read-only")]
    ReadOnly,

    #[error("Query error: {0}")]
    Query(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Type conversion error: {0}")]
    TypeConversion(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),
}

/// Database access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Holds the exclusive writer lock.
    ReadWrite,
    /// Coexists with other readers and with the writer.
    ReadOnly,
}

/// A column as reported by `information_schema.columns`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableColumn {
    pub name: String,
    /// DuckDB type name, e.g. `BIGINT` or `VARCHAR`.
    pub data_type: String,
}

/// DuckDB caps prepared statements well above this; it keeps INSERTs readable in logs.
const MAX_PARAMS_PER_STATEMENT: usize = 999;

/// A DuckDB connection (not `Send`; keep it on one task).
#[derive(Clone)]
pub struct DbConnection {
    conn: Rc<duckdb::Connection>,
    access_mode: AccessMode,
    path: Option<PathBuf>,
    created: bool,
    // Dropping the last clone releases the lock.
    _lock: Option<Rc<DbLockGuard>>,
}

impl std::fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConnection")
            .field("path", &self.path)
            .field("access_mode", &self.access_mode)
            .field("created", &self.created)
            .finish()
    }
}

impl DbConnection {
    /// Open (or create) a database file for writing, taking the writer lock.
    pub fn open(path: &Path) -> Result<Self, BackendError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                BackendError::InvalidInput(format!(
                    "Cannot create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let lock = try_lock_exclusive(path)?;
        let created = !path.exists();
        let conn = duckdb::Connection::open(path)?;
        info!(
            "Opened DuckDB database {} (new: {})",
            path.display(),
            created
        );

        Ok(Self {
            conn: Rc::new(conn),
            access_mode: AccessMode::ReadWrite,
            path: Some(path.to_path_buf()),
            created,
            _lock: Some(Rc::new(lock)),
        })
    }

    /// Open an existing database file without the writer lock.
    pub fn open_readonly(path: &Path) -> Result<Self, BackendError> {
        let config = duckdb::Config::default().access_mode(duckdb::AccessMode::ReadOnly)?;
        let conn = duckdb::Connection::open_with_flags(path, config)?;
        info!("Opened DuckDB database (read-only): {}", path.display());

        Ok(Self {
            conn: Rc::new(conn),
            access_mode: AccessMode::ReadOnly,
            path: Some(path.to_path_buf()),
            created: false,
            _lock: None,
        })
    }

    /// In-memory database, always reported as freshly created.
    pub fn open_in_memory() -> Result<Self, BackendError> {
        let conn = duckdb::Connection::open_in_memory()?;
        Ok(Self {
            conn: Rc::new(conn),
            access_mode: AccessMode::ReadWrite,
            path: None,
            created: true,
            _lock: None,
        })
    }

    pub fn access_mode(&self) -> AccessMode {
        self.access_mode
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// True when the database file did not exist before this connection opened it.
    pub fn was_created(&self) -> bool {
        self.created
    }

    pub fn execute(&self, sql: &str, params: &[DbValue]) -> Result<u64, BackendError> {
        self.require_writable()?;
        exec_on(&self.conn, sql, params)
    }

    pub fn execute_batch(&self, sql: &str) -> Result<(), BackendError> {
        self.require_writable()?;
        exec_batch_on(&self.conn, sql)
    }

    pub fn query_all(&self, sql: &str, params: &[DbValue]) -> Result<Vec<DbRow>, BackendError> {
        query_on(&self.conn, sql, params)
    }

    pub fn query_optional(
        &self,
        sql: &str,
        params: &[DbValue],
    ) -> Result<Option<DbRow>, BackendError> {
        Ok(self.query_all(sql, params)?.into_iter().next())
    }

    pub fn query_scalar<T: FromDbValue>(
        &self,
        sql: &str,
        params: &[DbValue],
    ) -> Result<T, BackendError> {
        self.query_optional(sql, params)?
            .ok_or_else(|| BackendError::Query("Expected one row, got none".to_string()))?
            .get(0)
    }

    /// Whether `table` exists in the main schema.
    pub fn table_exists(&self, table: &str) -> Result<bool, BackendError> {
        let count: i64 = self.query_scalar(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = 'main' AND table_name = ?",
            &[DbValue::from(table)],
        )?;
        Ok(count > 0)
    }

    /// Columns of `table` in declaration order.
    pub fn table_columns(&self, table: &str) -> Result<Vec<TableColumn>, BackendError> {
        let rows = self.query_all(
            "SELECT column_name, data_type FROM information_schema.columns WHERE table_schema = 'main' AND table_name = ? ORDER BY ordinal_position",
            &[DbValue::from(table)],
        )?;
        rows.iter()
            .map(|row| {
                Ok(TableColumn {
                    name: row.get(0)?,
                    data_type: row.get(1)?,
                })
            })
            .collect()
    }

    /// Insert rows with multi-row `INSERT ... VALUES` statements.
    pub fn bulk_insert(
        &self,
        table: &str,
        columns: &[&str],
        rows: &[Vec<DbValue>],
    ) -> Result<u64, BackendError> {
        self.require_writable()?;
        bulk_insert_on(&self.conn, table, columns, rows)
    }

    /// Flush the WAL into the main database file.
    pub fn checkpoint(&self) -> Result<(), BackendError> {
        self.execute_batch("CHECKPOINT")
    }

    /// Run `op` between BEGIN and COMMIT, rolling back on error.
    pub fn transaction<T, F>(&self, op: F) -> Result<T, BackendError>
    where
        F: FnOnce(&mut DbTransaction<'_>) -> Result<T, BackendError>,
    {
        self.require_writable()?;
        self.conn.execute_batch("BEGIN TRANSACTION")?;
        let mut tx = DbTransaction { conn: &self.conn };

        match op(&mut tx) {
            Ok(value) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(err) => match self.conn.execute_batch("ROLLBACK") {
                Ok(()) => Err(err),
                Err(rollback_err) => Err(BackendError::Transaction(format!(
                    "{}; rollback failed: {}",
                    err, rollback_err
                ))),
            },
        }
    }

    fn require_writable(&self) -> Result<(), BackendError> {
        match self.access_mode {
            AccessMode::ReadWrite => Ok(()),
            AccessMode::ReadOnly => Err(BackendError::ReadOnly),
        }
    }
}

/// Statements issued inside [`DbConnection::transaction`].
pub struct DbTransaction<'a> {
    conn: &'a duckdb::Connection,
}

impl DbTransaction<'_> {
    pub fn execute(&mut self, sql: &str, params: &[DbValue]) -> Result<u64, BackendError> {
        exec_on(self.conn, sql, params)
    }

    pub fn execute_batch(&mut self, sql: &str) -> Result<(), BackendError> {
        exec_batch_on(self.conn, sql)
    }

    pub fn query_all(&mut self, sql: &str, params: &[DbValue]) -> Result<Vec<DbRow>, BackendError> {
        query_on(self.conn, sql, params)
    }

    pub fn bulk_insert(
        &mut self,
        table: &str,
        columns: &[&str],
        rows: &[Vec<DbValue>],
    ) -> Result<u64, BackendError> {
        bulk_insert_on(self.conn, table, columns, rows)
    }
}

fn bind(params: &[DbValue]) -> Vec<duckdb::types::Value> {
    params.iter().map(DbValue::to_duckdb).collect()
}

fn exec_on(conn: &duckdb::Connection, sql: &str, params: &[DbValue]) -> Result<u64, BackendError> {
    let span = debug_span!(
        "db.exec",
        op = sql_op_name(sql),
        sql_hash = %hash_sql(sql),
        duration_ms = tracing::field::Empty
    );
    let _guard = span.enter();
    let start = Instant::now();

    let mut stmt = conn.prepare(sql)?;
    let values = bind(params);
    let refs: Vec<&dyn duckdb::ToSql> = values.iter().map(|v| v as &dyn duckdb::ToSql).collect();
    let affected = stmt.execute(refs.as_slice())?;

    span.record("duration_ms", start.elapsed().as_millis() as u64);
    Ok(affected as u64)
}

fn exec_batch_on(conn: &duckdb::Connection, sql: &str) -> Result<(), BackendError> {
    let span = debug_span!(
        "db.exec_batch",
        op = "BATCH",
        sql_hash = %hash_sql(sql),
        duration_ms = tracing::field::Empty
    );
    let _guard = span.enter();
    let start = Instant::now();

    conn.execute_batch(sql)?;

    span.record("duration_ms", start.elapsed().as_millis() as u64);
    Ok(())
}

fn query_on(
    conn: &duckdb::Connection,
    sql: &str,
    params: &[DbValue],
) -> Result<Vec<DbRow>, BackendError> {
    let span = debug_span!(
        "db.query",
        op = sql_op_name(sql),
        sql_hash = %hash_sql(sql),
        duration_ms = tracing::field::Empty
    );
    let _guard = span.enter();
    let start = Instant::now();

    let mut stmt = conn.prepare(sql)?;
    let values = bind(params);
    let refs: Vec<&dyn duckdb::ToSql> = values.iter().map(|v| v as &dyn duckdb::ToSql).collect();
    let mut rows = stmt.query(refs.as_slice())?;

    let columns: Vec<String> = match rows.as_ref() {
        Some(stmt_ref) => (0..stmt_ref.column_count())
            .map(|i| {
                stmt_ref
                    .column_name(i)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|_| format!("col{}", i))
            })
            .collect(),
        None => return Ok(Vec::new()),
    };

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let values = (0..columns.len())
            .map(|i| DbValue::from_duckdb(row, i))
            .collect::<Result<Vec<_>, _>>()?;
        out.push(DbRow::new(columns.clone(), values));
    }

    span.record("duration_ms", start.elapsed().as_millis() as u64);
    Ok(out)
}

fn bulk_insert_on(
    conn: &duckdb::Connection,
    table: &str,
    columns: &[&str],
    rows: &[Vec<DbValue>],
) -> Result<u64, BackendError> {
    if rows.is_empty() {
        return Ok(0);
    }
    if columns.is_empty() {
        return Err(BackendError::InvalidInput(
            "bulk_insert requires at least one column".to_string(),
        ));
    }
    if columns.len() > MAX_PARAMS_PER_STATEMENT {
        return Err(BackendError::InvalidInput(format!(
            "Too many columns ({}) for one statement",
            columns.len()
        )));
    }
    if let Some((index, row)) = rows
        .iter()
        .enumerate()
        .find(|(_, row)| row.len() != columns.len())
    {
        return Err(BackendError::InvalidInput(format!(
            "Row {} has {} values, expected {}",
            index,
            row.len(),
            columns.len()
        )));
    }

    let quoted_cols = columns
        .iter()
        .map(|col| quote_ident(col))
        .collect::<Vec<_>>()
        .join(", ");
    let row_clause = format!("({})", vec!["?"; columns.len()].join(", "));
    let rows_per_statement = MAX_PARAMS_PER_STATEMENT / columns.len();

    let mut total = 0;
    for chunk in rows.chunks(rows_per_statement) {
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            quote_ident(table),
            quoted_cols,
            vec![row_clause.as_str(); chunk.len()].join(", ")
        );
        let params: Vec<DbValue> = chunk.iter().flatten().cloned().collect();
        exec_on(conn, &sql, &params)?;
        total += chunk.len() as u64;
    }
    Ok(total)
}

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_op_name(sql: &str) -> &str {
    sql.split_whitespace().next().unwrap_or("unknown")
}

fn hash_sql(sql: &str) -> String {
    blake3::hash(sql.as_bytes()).to_hex()[..16].to_string()
}
