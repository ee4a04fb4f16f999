//! Persistence seams consumed by the batch runner, plus an in-memory implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::config::SourceRecord;
use crate::error::SyncError;
use crate::model::ExtractedItem;

#[async_trait]
pub trait SourceRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<SourceRecord>, SyncError>;

    async fn get(&self, id: &str) -> Result<Option<SourceRecord>, SyncError>;

    /// Stores the validators of a successful sync together with its completion time.
    async fn update_sync_state(
        &self,
        id: &str,
        etag: Option<String>,
        last_modified: Option<DateTime<Utc>>,
        synced_at: DateTime<Utc>,
    ) -> Result<(), SyncError>;
}

#[async_trait]
pub trait ItemRepository: Send + Sync {
    /// Inserts or replaces items keyed by `(source_id, hash)`.
    async fn upsert(&self, items: &[ExtractedItem]) -> Result<(), SyncError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    sources: RwLock<BTreeMap<String, SourceRecord>>,
    items: RwLock<BTreeMap<(String, String), ExtractedItem>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sources(records: impl IntoIterator<Item = SourceRecord>) -> Self {
        let sources = records
            .into_iter()
            .map(|record| (record.source.id.clone(), record))
            .collect();
        Self {
            sources: RwLock::new(sources),
            items: RwLock::default(),
        }
    }

    pub async fn insert_source(&self, record: SourceRecord) {
        self.sources
            .write()
            .await
            .insert(record.source.id.clone(), record);
    }

    pub async fn items(&self) -> Vec<ExtractedItem> {
        self.items.read().await.values().cloned().collect()
    }

    pub async fn items_for(&self, source_id: &str) -> Vec<ExtractedItem> {
        self.items
            .read()
            .await
            .values()
            .filter(|item| item.source_id == source_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SourceRepository for MemoryStore {
    async fn list(&self) -> Result<Vec<SourceRecord>, SyncError> {
        Ok(self.sources.read().await.values().cloned().collect())
    }

    async fn get(&self, id: &str) -> Result<Option<SourceRecord>, SyncError> {
        Ok(self.sources.read().await.get(id).cloned())
    }

    async fn update_sync_state(
        &self,
        id: &str,
        etag: Option<String>,
        last_modified: Option<DateTime<Utc>>,
        synced_at: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let mut sources = self.sources.write().await;
        let record = sources
            .get_mut(id)
            .ok_or_else(|| SyncError::SourceNotFound { id: id.to_string() })?;
        record.source.etag = etag;
        record.source.last_modified = last_modified;
        record.last_synced_at = Some(synced_at);
        Ok(())
    }
}

#[async_trait]
impl ItemRepository for MemoryStore {
    async fn upsert(&self, items: &[ExtractedItem]) -> Result<(), SyncError> {
        let mut stored = self.items.write().await;
        for item in items {
            stored.insert((item.source_id.clone(), item.hash.clone()), item.clone());
        }
        Ok(())
    }
}
