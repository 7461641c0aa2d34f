use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tabsync_core::{CollectionKey, EventRecord};
use tracing::info;

use crate::{DocumentStore, StoreError};

/// Postgres-backed store: one JSONB document per `(collection, event_id)`.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS collections (
                key TEXT PRIMARY KEY,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS event_documents (
                collection TEXT NOT NULL REFERENCES collections(key),
                event_id TEXT NOT NULL,
                document JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (collection, event_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn require_collection(&self, key: &CollectionKey) -> Result<(), StoreError> {
        if self.collection_exists(key).await? {
            Ok(())
        } else {
            Err(StoreError::MissingCollection(key.to_string()))
        }
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn collection_exists(&self, key: &CollectionKey) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM collections WHERE key = $1)")
            .bind(key.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<bool, _>(0)?)
    }

    async fn create_collection(
        &self,
        key: &CollectionKey,
        records: &[EventRecord],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let created = sqlx::query("INSERT INTO collections (key) VALUES ($1) ON CONFLICT (key) DO NOTHING")
            .bind(key.as_str())
            .execute(&mut *tx)
            .await?;
        if created.rows_affected() == 0 {
            return Err(StoreError::DuplicateCollection(key.to_string()));
        }

        for record in records {
            let document = serde_json::to_value(record)?;
            let inserted = sqlx::query(
                r#"
                INSERT INTO event_documents (collection, event_id, document)
                VALUES ($1, $2, $3)
                ON CONFLICT (collection, event_id) DO NOTHING
                "#,
            )
            .bind(key.as_str())
            .bind(&record.event_id)
            .bind(Json(&document))
            .execute(&mut *tx)
            .await?;
            if inserted.rows_affected() == 0 {
                return Err(StoreError::DuplicateDocument {
                    collection: key.to_string(),
                    event_id: record.event_id.clone(),
                });
            }
        }

        tx.commit().await?;
        info!(collection = %key, documents = records.len(), "created collection");
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<CollectionKey>, StoreError> {
        let rows = sqlx::query("SELECT key FROM collections ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("key")?;
            if let Some(key) = CollectionKey::parse(&name) {
                out.push(key);
            }
        }
        Ok(out)
    }

    async fn list_event_ids(&self, key: &CollectionKey) -> Result<BTreeSet<String>, StoreError> {
        self.require_collection(key).await?;
        let rows = sqlx::query("SELECT event_id FROM event_documents WHERE collection = $1")
            .bind(key.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("event_id").map_err(StoreError::from))
            .collect()
    }

    async fn read_all(
        &self,
        key: &CollectionKey,
    ) -> Result<BTreeMap<String, EventRecord>, StoreError> {
        self.require_collection(key).await?;
        let rows = sqlx::query(
            r#"
            SELECT event_id, document
              FROM event_documents
             WHERE collection = $1
            "#,
        )
        .bind(key.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut out = BTreeMap::new();
        for row in rows {
            let event_id: String = row.try_get("event_id")?;
            let Json(record): Json<EventRecord> = row.try_get("document")?;
            out.insert(event_id, record);
        }
        Ok(out)
    }

    async fn replace(
        &self,
        key: &CollectionKey,
        event_id: &str,
        record: &EventRecord,
        upsert: bool,
    ) -> Result<(), StoreError> {
        self.require_collection(key).await?;
        let document = serde_json::to_value(record)?;
        let result = if upsert {
            sqlx::query(
                r#"
                INSERT INTO event_documents (collection, event_id, document)
                VALUES ($1, $2, $3)
                ON CONFLICT (collection, event_id)
                DO UPDATE SET document = EXCLUDED.document, updated_at = now()
                "#,
            )
            .bind(key.as_str())
            .bind(event_id)
            .bind(Json(&document))
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE event_documents
                   SET document = $3, updated_at = now()
                 WHERE collection = $1 AND event_id = $2
                "#,
            )
            .bind(key.as_str())
            .bind(event_id)
            .bind(Json(&document))
            .execute(&self.pool)
            .await?
        };
        if result.rows_affected() == 0 {
            return Err(StoreError::MissingDocument {
                collection: key.to_string(),
                event_id: event_id.to_string(),
            });
        }
        Ok(())
    }

    async fn insert(&self, key: &CollectionKey, record: &EventRecord) -> Result<(), StoreError> {
        self.require_collection(key).await?;
        let document = serde_json::to_value(record)?;
        let result = sqlx::query(
            r#"
            INSERT INTO event_documents (collection, event_id, document)
            VALUES ($1, $2, $3)
            ON CONFLICT (collection, event_id) DO NOTHING
            "#,
        )
        .bind(key.as_str())
        .bind(&record.event_id)
        .bind(Json(&document))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateDocument {
                collection: key.to_string(),
                event_id: record.event_id.clone(),
            });
        }
        Ok(())
    }
}
