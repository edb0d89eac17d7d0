use crate::{StateStore, StateStoreError, StoredState};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Process-local state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: RwLock<BTreeMap<String, StoredState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, source: &str) -> Result<Option<StoredState>, StateStoreError> {
        Ok(self.entries.read().await.get(source).cloned())
    }

    async fn save(&self, source: &str, state: &Value) -> Result<(), StateStoreError> {
        let entry = StoredState {
            source: source.to_string(),
            state: state.clone(),
            updated_at: Utc::now(),
        };
        self.entries.write().await.insert(source.to_string(), entry);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<StoredState>, StateStoreError> {
        Ok(self.entries.read().await.values().cloned().collect())
    }
}
