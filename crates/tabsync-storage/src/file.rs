use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Local;
use tabsync_core::{format_timestamp, CollectionKey, EventRecord};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::{DocumentStore, StoreError};

const COLLECTION_MARKER: &str = ".collection";
const ENCODED_PREFIX: char = '~';

fn is_plain_id(event_id: &str) -> bool {
    !event_id.is_empty()
        && !event_id.starts_with('.')
        && event_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// File stem for an event id. Ids that are not filename-safe are hex encoded behind `~`.
fn encode_id(event_id: &str) -> String {
    if is_plain_id(event_id) {
        event_id.to_string()
    } else {
        format!("{ENCODED_PREFIX}{}", hex::encode(event_id.as_bytes()))
    }
}

fn decode_id(stem: &str) -> Option<String> {
    match stem.strip_prefix(ENCODED_PREFIX) {
        Some(encoded) => String::from_utf8(hex::decode(encoded).ok()?).ok(),
        None => is_plain_id(stem).then(|| stem.to_string()),
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Writes through a temp file in the same directory and renames over `path`, so readers
/// never see a half-written file.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::InvalidPath(path.display().to_string()))?;
    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));

    let mut file = fs::File::create(&temp_path)
        .await
        .map_err(io_err(&temp_path))?;
    file.write_all(bytes).await.map_err(io_err(&temp_path))?;
    file.sync_all().await.map_err(io_err(&temp_path))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(io_err(path)(err));
    }
    Ok(())
}

/// Day collections as directories of JSON documents: `<root>/<key>/<event_id>.json`.
/// A directory without its `.collection` marker is not a collection.
#[derive(Debug, Clone)]
pub struct FileDocumentStore {
    root: PathBuf,
}

impl FileDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn collection_dir(&self, key: &CollectionKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    fn document_path(&self, key: &CollectionKey, event_id: &str) -> PathBuf {
        self.collection_dir(key).join(format!("{}.json", encode_id(event_id)))
    }

    async fn require_collection(&self, key: &CollectionKey) -> Result<PathBuf, StoreError> {
        if !self.collection_exists(key).await? {
            return Err(StoreError::MissingCollection(key.to_string()));
        }
        Ok(self.collection_dir(key))
    }

    async fn stage_collection(
        &self,
        staging: &Path,
        key: &CollectionKey,
        records: &[EventRecord],
    ) -> Result<(), StoreError> {
        let mut seen = BTreeSet::new();
        for record in records {
            if !seen.insert(record.event_id.as_str()) {
                return Err(StoreError::DuplicateDocument {
                    collection: key.to_string(),
                    event_id: record.event_id.clone(),
                });
            }
            let path = staging.join(format!("{}.json", encode_id(&record.event_id)));
            write_atomic(&path, &serde_json::to_vec_pretty(record)?).await?;
        }
        let body = serde_json::json!({ "created_at": format_timestamp(Local::now().naive_local()) });
        write_atomic(&staging.join(COLLECTION_MARKER), &serde_json::to_vec(&body)?).await
    }

    async fn read_document(&self, path: &Path) -> Result<EventRecord, StoreError> {
        let bytes = fs::read(path).await.map_err(io_err(path))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    async fn collection_exists(&self, key: &CollectionKey) -> Result<bool, StoreError> {
        let marker = self.collection_dir(key).join(COLLECTION_MARKER);
        fs::try_exists(&marker).await.map_err(io_err(&marker))
    }

    async fn create_collection(
        &self,
        key: &CollectionKey,
        records: &[EventRecord],
    ) -> Result<(), StoreError> {
        if self.collection_exists(key).await? {
            return Err(StoreError::DuplicateCollection(key.to_string()));
        }
        fs::create_dir_all(&self.root).await.map_err(io_err(&self.root))?;
        let staging = self.root.join(format!(".{}.{}.staging", key, Uuid::new_v4()));
        fs::create_dir(&staging).await.map_err(io_err(&staging))?;

        let staged = self.stage_collection(&staging, key, records).await;
        if let Err(err) = staged {
            let _ = fs::remove_dir_all(&staging).await;
            return Err(err);
        }

        // Leftovers of an earlier attempt that never got its marker.
        let dir = self.collection_dir(key);
        if fs::try_exists(&dir).await.map_err(io_err(&dir))? {
            fs::remove_dir_all(&dir).await.map_err(io_err(&dir))?;
        }
        if let Err(err) = fs::rename(&staging, &dir).await {
            let _ = fs::remove_dir_all(&staging).await;
            return Err(io_err(&dir)(err));
        }
        debug!(collection = %key, documents = records.len(), "created collection directory");
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<CollectionKey>, StoreError> {
        if !fs::try_exists(&self.root).await.map_err(io_err(&self.root))? {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let mut dir = fs::read_dir(&self.root).await.map_err(io_err(&self.root))?;
        while let Some(entry) = dir.next_entry().await.map_err(io_err(&self.root))? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(key) = CollectionKey::parse(&name) {
                if fs::try_exists(entry.path().join(COLLECTION_MARKER))
                    .await
                    .unwrap_or(false)
                {
                    out.push(key);
                }
            }
        }
        out.sort();
        Ok(out)
    }

    async fn list_event_ids(&self, key: &CollectionKey) -> Result<BTreeSet<String>, StoreError> {
        let dir_path = self.require_collection(key).await?;
        let mut ids = BTreeSet::new();
        let mut dir = fs::read_dir(&dir_path).await.map_err(io_err(&dir_path))?;
        while let Some(entry) = dir.next_entry().await.map_err(io_err(&dir_path))? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if let Some(id) = name.strip_suffix(".json").and_then(decode_id) {
                ids.insert(id);
            }
        }
        Ok(ids)
    }

    async fn read_all(
        &self,
        key: &CollectionKey,
    ) -> Result<BTreeMap<String, EventRecord>, StoreError> {
        let mut records = BTreeMap::new();
        for id in self.list_event_ids(key).await? {
            let path = self.document_path(key, &id);
            let record = self.read_document(&path).await?;
            records.insert(id, record);
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
        self.require_collection(key).await?;
        let path = self.document_path(key, event_id);
        if !upsert && !fs::try_exists(&path).await.map_err(io_err(&path))? {
            return Err(StoreError::MissingDocument {
                collection: key.to_string(),
                event_id: event_id.to_string(),
            });
        }
        let bytes = serde_json::to_vec_pretty(record)?;
        write_atomic(&path, &bytes).await
    }

    async fn insert(&self, key: &CollectionKey, record: &EventRecord) -> Result<(), StoreError> {
        self.require_collection(key).await?;
        let path = self.document_path(key, &record.event_id);
        if fs::try_exists(&path).await.map_err(io_err(&path))? {
            return Err(StoreError::DuplicateDocument {
                collection: key.to_string(),
                event_id: record.event_id.clone(),
            });
        }
        let bytes = serde_json::to_vec_pretty(record)?;
        write_atomic(&path, &bytes).await
    }
}
