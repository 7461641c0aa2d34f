//! Document storage for day collections, raw payload archiving and HTTP fetch utilities.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tabsync_core::{CollectionKey, EventRecord, SyncError};
use thiserror::Error;
use tokio::sync::Mutex;

mod archive;
mod file;
mod http;
mod postgres;

pub use archive::{ArchivedPayload, PayloadArchive};
pub use file::FileDocumentStore;
pub use http::{FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RetryPolicy};
pub use postgres::PgDocumentStore;

pub const CRATE_NAME: &str = "tabsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("collection {0} does not exist")]
    MissingCollection(String),
    #[error("collection {0} already exists")]
    DuplicateCollection(String),
    #[error("document {event_id} already exists in {collection}")]
    DuplicateDocument { collection: String, event_id: String },
    #[error("document {event_id} not found in {collection}")]
    MissingDocument { collection: String, event_id: String },
    #[error("invalid document path {0:?}")]
    InvalidPath(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("document codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::StoreUnavailable(err.to_string())
    }
}

/// Keyed document store holding one collection per racing day.
///
/// `replace` is a whole-document overwrite; there is no field-level update.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn collection_exists(&self, key: &CollectionKey) -> Result<bool, StoreError>;

    /// Creates the collection holding `records`. The collection only becomes visible once
    /// every document is written; a failed call leaves no collection behind.
    async fn create_collection(
        &self,
        key: &CollectionKey,
        records: &[EventRecord],
    ) -> Result<(), StoreError>;

    async fn list_collections(&self) -> Result<Vec<CollectionKey>, StoreError>;

    async fn list_event_ids(&self, key: &CollectionKey) -> Result<BTreeSet<String>, StoreError>;

    async fn read_all(&self, key: &CollectionKey)
        -> Result<BTreeMap<String, EventRecord>, StoreError>;

    async fn replace(
        &self,
        key: &CollectionKey,
        event_id: &str,
        record: &EventRecord,
        upsert: bool,
    ) -> Result<(), StoreError>;

    /// Fails with `DuplicateDocument` when the event id is already stored.
    async fn insert(&self, key: &CollectionKey, record: &EventRecord) -> Result<(), StoreError>;
}

/// In-process store that keeps documents as JSON values, so every write goes through
/// the same serialization as the durable stores.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: Mutex<BTreeMap<CollectionKey, BTreeMap<String, JsonValue>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored document, as the store holds it.
    pub async fn document(&self, key: &CollectionKey, event_id: &str) -> Option<JsonValue> {
        let collections = self.collections.lock().await;
        collections.get(key)?.get(event_id).cloned()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn collection_exists(&self, key: &CollectionKey) -> Result<bool, StoreError> {
        Ok(self.collections.lock().await.contains_key(key))
    }

    async fn create_collection(
        &self,
        key: &CollectionKey,
        records: &[EventRecord],
    ) -> Result<(), StoreError> {
        let mut docs = BTreeMap::new();
        for record in records {
            let doc = serde_json::to_value(record)?;
            if docs.insert(record.event_id.clone(), doc).is_some() {
                return Err(StoreError::DuplicateDocument {
                    collection: key.to_string(),
                    event_id: record.event_id.clone(),
                });
            }
        }
        let mut collections = self.collections.lock().await;
        if collections.contains_key(key) {
            return Err(StoreError::DuplicateCollection(key.to_string()));
        }
        collections.insert(key.clone(), docs);
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<CollectionKey>, StoreError> {
        Ok(self.collections.lock().await.keys().cloned().collect())
    }

    async fn list_event_ids(&self, key: &CollectionKey) -> Result<BTreeSet<String>, StoreError> {
        let collections = self.collections.lock().await;
        let docs = collections
            .get(key)
            .ok_or_else(|| StoreError::MissingCollection(key.to_string()))?;
        Ok(docs.keys().cloned().collect())
    }

    async fn read_all(
        &self,
        key: &CollectionKey,
    ) -> Result<BTreeMap<String, EventRecord>, StoreError> {
        let collections = self.collections.lock().await;
        let docs = collections
            .get(key)
            .ok_or_else(|| StoreError::MissingCollection(key.to_string()))?;
        let mut records = BTreeMap::new();
        for (id, doc) in docs {
            let record: EventRecord = serde_json::from_value(doc.clone())?;
            records.insert(id.clone(), record);
        }
        Ok(records)
    }

    async fn replace(
        &self,
        key: &CollectionKey,
        event_id: &str,
        record: &EventRecord,
        upsert: bool,
    ) -> Result<(), StoreError> {
        let doc = serde_json::to_value(record)?;
        let mut collections = self.collections.lock().await;
        let docs = collections
            .get_mut(key)
            .ok_or_else(|| StoreError::MissingCollection(key.to_string()))?;
        if !upsert && !docs.contains_key(event_id) {
            return Err(StoreError::MissingDocument {
                collection: key.to_string(),
                event_id: event_id.to_string(),
            });
        }
        docs.insert(event_id.to_string(), doc);
        Ok(())
    }

    async fn insert(&self, key: &CollectionKey, record: &EventRecord) -> Result<(), StoreError> {
        let doc = serde_json::to_value(record)?;
        let mut collections = self.collections.lock().await;
        let docs = collections
            .get_mut(key)
            .ok_or_else(|| StoreError::MissingCollection(key.to_string()))?;
        if docs.contains_key(&record.event_id) {
            return Err(StoreError::DuplicateDocument {
                collection: key.to_string(),
                event_id: record.event_id.clone(),
            });
        }
        docs.insert(record.event_id.clone(), doc);
        Ok(())
    }
}
