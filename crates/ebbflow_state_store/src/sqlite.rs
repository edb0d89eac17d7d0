use crate::{StateStore, StateStoreError, StoredState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CREATE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS source_state (
    source TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

/// SQLite-backed state store.
#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteStateStore {
    /// Open (creating if needed) the database file and its table.
    pub async fn open(path: &Path) -> Result<Self, StateStoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        apply_sqlite_optimizations(&pool).await?;
        sqlx::query(CREATE_TABLE_SQL).execute(&pool).await?;

        info!("Opened state store: {}", path.display());
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn row_to_state(row: &SqliteRow) -> Result<StoredState, StateStoreError> {
        let source: String = row.try_get("source")?;
        let raw_state: String = row.try_get("state")?;
        let raw_updated: String = row.try_get("updated_at")?;

        let state: Value =
            serde_json::from_str(&raw_state).map_err(|e| StateStoreError::Serialization {
                source_name: source.clone(),
                message: e.to_string(),
            })?;
        let updated_at = DateTime::parse_from_rfc3339(&raw_updated)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| StateStoreError::Serialization {
                source_name: source.clone(),
                message: format!("bad updated_at '{}': {}", raw_updated, e),
            })?;

        Ok(StoredState {
            source,
            state,
            updated_at,
        })
    }
}

async fn apply_sqlite_optimizations(pool: &SqlitePool) -> Result<(), StateStoreError> {
    sqlx::query("PRAGMA journal_mode=WAL").execute(pool).await?;
    sqlx::query("PRAGMA synchronous=NORMAL")
        .execute(pool)
        .await?;
    Ok(())
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load(&self, source: &str) -> Result<Option<StoredState>, StateStoreError> {
        let row = sqlx::query("SELECT source, state, updated_at FROM source_state WHERE source = ?")
            .bind(source)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_state).transpose()
    }

    async fn save(&self, source: &str, state: &Value) -> Result<(), StateStoreError> {
        let payload = serde_json::to_string(state).map_err(|e| StateStoreError::Serialization {
            source_name: source.to_string(),
            message: e.to_string(),
        })?;

        sqlx::query(
            r#"
            INSERT INTO source_state (source, state, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(source) DO UPDATE SET
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(source)
        .bind(&payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!("Saved state for {} ({} bytes)", source, payload.len());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<StoredState>, StateStoreError> {
        let rows = sqlx::query("SELECT source, state, updated_at FROM source_state ORDER BY source")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_state).collect()
    }
}
