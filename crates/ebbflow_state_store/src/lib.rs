//! Persisted cross-run state.
//!
//! Each source owns one opaque JSON blob (its serialized `RunState`). The
//! store neither interprets nor merges blobs; the last save wins.
//!
//! Backends:
//! - `sqlite:<path>`: table `source_state`, one row per source
//! - `memory`: process-local map, for tests and dry runs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ebbflow_protocol::{OrderedKey, RunState};
use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;

mod memory;
mod sqlite;

pub use memory::MemoryStateStore;
pub use sqlite::SqliteStateStore;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("State store database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("State store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State for source '{source_name}' is not valid: {message}")]
    Serialization {
        source_name: String,
        message: String,
    },

    #[error("Invalid state store URL '{0}' (expected 'sqlite:<path>' or 'memory')")]
    InvalidUrl(String),
}

/// Parsed state store location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateStoreUrl {
    Sqlite(PathBuf),
    Memory,
}

impl StateStoreUrl {
    pub fn parse(raw: &str) -> Result<Self, StateStoreError> {
        let trimmed = raw.trim();
        if trimmed == "memory" || trimmed == "sqlite::memory:" {
            return Ok(StateStoreUrl::Memory);
        }
        let path = trimmed
            .strip_prefix("sqlite://")
            .or_else(|| trimmed.strip_prefix("sqlite:"))
            .ok_or_else(|| StateStoreError::InvalidUrl(raw.to_string()))?;
        if path.is_empty() {
            return Err(StateStoreError::InvalidUrl(raw.to_string()));
        }
        Ok(StateStoreUrl::Sqlite(PathBuf::from(path)))
    }

    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        StateStoreUrl::Sqlite(path.into())
    }
}

impl std::fmt::Display for StateStoreUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateStoreUrl::Sqlite(path) => write!(f, "sqlite:{}", path.display()),
            StateStoreUrl::Memory => write!(f, "memory"),
        }
    }
}

/// A saved blob and when it was written.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredState {
    pub source: String,
    pub state: Value,
    pub updated_at: DateTime<Utc>,
}

/// Source-scoped blob storage.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Latest blob for `source`, or `None` before the first save.
    async fn load(&self, source: &str) -> Result<Option<StoredState>, StateStoreError>;

    /// Replace the blob for `source`.
    async fn save(&self, source: &str, state: &Value) -> Result<(), StateStoreError>;

    /// Every stored source, ordered by name.
    async fn list(&self) -> Result<Vec<StoredState>, StateStoreError>;
}

/// Open the backend named by `url`.
pub async fn open_state_store(url: &StateStoreUrl) -> Result<Box<dyn StateStore>, StateStoreError> {
    match url {
        StateStoreUrl::Sqlite(path) => Ok(Box::new(SqliteStateStore::open(path).await?)),
        StateStoreUrl::Memory => Ok(Box::new(MemoryStateStore::new())),
    }
}

/// Load and decode the `RunState` saved for `source`.
pub async fn load_run_state<K: OrderedKey>(
    store: &dyn StateStore,
    source: &str,
) -> Result<Option<RunState<K>>, StateStoreError> {
    let Some(stored) = store.load(source).await? else {
        return Ok(None);
    };
    serde_json::from_value(stored.state)
        .map(Some)
        .map_err(|e| StateStoreError::Serialization {
            source_name: source.to_string(),
            message: e.to_string(),
        })
}

/// Encode and save a finalized `RunState` for `source`.
pub async fn save_run_state<K: OrderedKey>(
    store: &dyn StateStore,
    source: &str,
    state: &RunState<K>,
) -> Result<(), StateStoreError> {
    let blob = serde_json::to_value(state).map_err(|e| StateStoreError::Serialization {
        source_name: source.to_string(),
        message: e.to_string(),
    })?;
    store.save(source, &blob).await
}
