//! DuckDB access layer for Ebbflow.
//!
//! Wraps a synchronous `duckdb::Connection` with typed values, debug spans
//! around every statement, batched inserts, transactions, and the
//! single-writer file lock.

pub mod backend;
pub mod lock;
pub mod value;

pub use backend::{quote_ident, AccessMode, BackendError, DbConnection, DbTransaction, TableColumn};
pub use lock::{lock_path_for, DbLockGuard, LockError, LockHolder};
pub use value::{DbRow, DbValue, FromDbValue};
