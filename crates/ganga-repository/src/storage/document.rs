// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Document-store storage backend.
//!
//! Each registry is a collection inside one SQLite database:
//! - `documents`: one row per object, with the previous payload kept for recovery
//! - `document_index`: index entries of all collections, keyed by (collection, id)
//! - `tombstones`: deleted ids
//! - `id_counters`: per-collection id allocation
//! - `sessions` / `locks`: lease records (see [`SqliteLeaseStore`])
//!
//! Every mutation of a document and its index row happens in one transaction.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, error, info, warn};

use super::{IndexScope, StorageBackend};
use crate::ObjectId;
use crate::codec;
use crate::container::{ContainerController, NativeController};
use crate::error::{BatchReport, RepoError, Result};
use crate::index::{IndexCache, IndexEntry};
use crate::lock::{LeaseStore, SqliteLeaseStore};
use crate::object::{ManagedObject, NewObject};
use crate::plugins::PluginRegistry;
use crate::retry::{RetryPolicy, with_retry};
use crate::schema::GangaObject;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Stored in `master` columns for top-level objects.
const NO_MASTER: i64 = -1;

fn master_to_column(master: Option<ObjectId>) -> i64 {
    master.map_or(NO_MASTER, |m| m as i64)
}

fn master_from_column(master: i64) -> Option<ObjectId> {
    (master >= 0).then_some(master as ObjectId)
}

/// Connection pool to the document database.
#[derive(Clone)]
pub struct DocumentStore {
    pool: SqlitePool,
}

impl DocumentStore {
    /// Create a pool for `url` without connecting yet, so the database
    /// process can be started first.
    pub fn connect_lazy(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_lazy_with(options);
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create or upgrade the schema.
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await.map_err(|e| {
            RepoError::repository(
                "document-store",
                "migrate",
                format!("failed to run migrations: {}", e),
            )
        })
    }
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    master: i64,
    body: String,
    previous_body: Option<String>,
}

#[derive(sqlx::FromRow)]
struct IndexRow {
    id: i64,
    master: i64,
    classname: String,
    category: String,
    cache: String,
    error: Option<String>,
}

impl IndexRow {
    fn into_entry(self) -> (ObjectId, IndexEntry) {
        let master_id = master_from_column(self.master);
        let entry = match (self.error, serde_json::from_str::<IndexCache>(&self.cache)) {
            (Some(reason), _) => IndexEntry::inaccessible(master_id, reason),
            (None, Ok(cache)) => IndexEntry {
                class_name: self.classname,
                category: self.category,
                master_id,
                cache,
                error: None,
            },
            (None, Err(e)) => {
                IndexEntry::inaccessible(master_id, format!("corrupt index entry: {}", e))
            }
        };
        (self.id as ObjectId, entry)
    }
}

#[derive(sqlx::FromRow)]
struct RepairRow {
    id: i64,
    master: i64,
    body: String,
    previous_body: Option<String>,
    cache: Option<String>,
    error: Option<String>,
}

/// A document ready to be written: encoded payload plus its index entry.
struct PreparedDocument {
    master: i64,
    body: String,
    entry: IndexEntry,
}

impl PreparedDocument {
    fn new(object: &GangaObject, master_id: Option<ObjectId>) -> Result<Self> {
        Ok(Self {
            master: master_to_column(master_id),
            body: serde_json::to_string(&codec::serialize(object))?,
            entry: IndexEntry::new(object, master_id),
        })
    }
}

async fn upsert_index(
    conn: &mut SqliteConnection,
    collection: &str,
    id: ObjectId,
    entry: &IndexEntry,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO document_index (collection, id, master, classname, category, cache, error)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (collection, id) DO UPDATE
        SET master = excluded.master,
            classname = excluded.classname,
            category = excluded.category,
            cache = excluded.cache,
            error = excluded.error
        "#,
    )
    .bind(collection)
    .bind(id as i64)
    .bind(master_to_column(entry.master_id))
    .bind(&entry.class_name)
    .bind(&entry.category)
    .bind(serde_json::to_string(&entry.cache)?)
    .bind(&entry.error)
    .execute(conn)
    .await?;
    Ok(())
}

/// Storage backend keeping each registry as a collection in a SQLite database.
pub struct DocumentBackend {
    registry: String,
    store: DocumentStore,
    plugins: Arc<PluginRegistry>,
    retry: RetryPolicy,
    controller: Arc<dyn ContainerController>,
    lease_timeout: Duration,
    leases: Arc<SqliteLeaseStore>,
}

impl DocumentBackend {
    pub fn new(
        store: DocumentStore,
        registry: &str,
        plugins: Arc<PluginRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        let leases = Arc::new(SqliteLeaseStore::new(store.pool().clone(), registry));
        Self {
            registry: registry.to_string(),
            store,
            plugins,
            retry,
            controller: Arc::new(NativeController),
            lease_timeout: Duration::from_secs(30),
            leases,
        }
    }

    pub fn with_controller(mut self, controller: Arc<dyn ContainerController>) -> Self {
        self.controller = controller;
        self
    }

    /// Heartbeat age after which a session no longer keeps the database running.
    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    fn fatal(&self, operation: &str, e: RepoError) -> RepoError {
        error!(registry = %self.registry, operation, error = %e, "Document store failure");
        if e.is_fatal() {
            e
        } else {
            RepoError::repository(&self.registry, operation, e.to_string())
        }
    }

    fn decode(&self, body: &str) -> Result<GangaObject> {
        let tree = codec::decode(body.as_bytes())?;
        codec::deserialize(&tree, &self.plugins)
    }

    /// Decode `body`, falling back to the previous version.
    ///
    /// The flag is set when the object came from the fallback.
    fn decode_with_fallback(
        &self,
        id: ObjectId,
        body: &str,
        previous: Option<&str>,
    ) -> Result<(GangaObject, bool)> {
        let failure = match self.decode(body) {
            Ok(object) => return Ok((object, false)),
            Err(e) => e,
        };
        if let Some(previous) = previous
            && let Ok(object) = self.decode(previous)
        {
            warn!(
                registry = %self.registry,
                id,
                error = %failure,
                "Document unreadable, recovered previous version"
            );
            return Ok((object, true));
        }
        Err(RepoError::inaccessible(&self.registry, id, failure))
    }

    async fn insert_documents(&self, documents: &[PreparedDocument]) -> Result<Vec<ObjectId>> {
        let mut tx = self.store.pool.begin().await?;
        let mut ids = Vec::with_capacity(documents.len());
        for doc in documents {
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO id_counters (collection, next_id)
                VALUES (?, 1)
                ON CONFLICT (collection) DO UPDATE SET next_id = next_id + 1
                RETURNING next_id - 1
                "#,
            )
            .bind(&self.registry)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO documents (collection, id, master, classname, category, body, modified_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&self.registry)
            .bind(id)
            .bind(doc.master)
            .bind(&doc.entry.class_name)
            .bind(&doc.entry.category)
            .bind(&doc.body)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

            upsert_index(&mut tx, &self.registry, id as ObjectId, &doc.entry).await?;
            ids.push(id as ObjectId);
        }
        tx.commit().await?;
        Ok(ids)
    }

    /// Returns `false` when the document does not exist.
    async fn update_document(&self, id: ObjectId, doc: &PreparedDocument) -> Result<bool> {
        let mut tx = self.store.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE documents
            SET master = ?, classname = ?, category = ?,
                previous_body = body, body = ?, modified_at = ?
            WHERE collection = ? AND id = ?
            "#,
        )
        .bind(doc.master)
        .bind(&doc.entry.class_name)
        .bind(&doc.entry.category)
        .bind(&doc.body)
        .bind(Utc::now())
        .bind(&self.registry)
        .bind(id as i64)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        upsert_index(&mut tx, &self.registry, id, &doc.entry).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn remove_document(&self, id: ObjectId) -> Result<()> {
        let mut tx = self.store.pool.begin().await?;
        sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
            .bind(&self.registry)
            .bind(id as i64)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM document_index WHERE collection = ? AND id = ?")
            .bind(&self.registry)
            .bind(id as i64)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO tombstones (collection, id, deleted_at)
            VALUES (?, ?, ?)
            ON CONFLICT (collection, id) DO NOTHING
            "#,
        )
        .bind(&self.registry)
        .bind(id as i64)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn wipe_collection(&self) -> Result<()> {
        let mut tx = self.store.pool.begin().await?;
        for statement in [
            "DELETE FROM documents WHERE collection = ?",
            "DELETE FROM document_index WHERE collection = ?",
            "DELETE FROM tombstones WHERE collection = ?",
            "DELETE FROM id_counters WHERE collection = ?",
        ] {
            sqlx::query(statement)
                .bind(&self.registry)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn fetch_document(&self, id: ObjectId) -> Result<Option<DocumentRow>> {
        Ok(sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT master, body, previous_body
            FROM documents
            WHERE collection = ? AND id = ?
            "#,
        )
        .bind(&self.registry)
        .bind(id as i64)
        .fetch_optional(&self.store.pool)
        .await?)
    }

    async fn fetch_index(&self, scope: IndexScope) -> Result<Vec<IndexRow>> {
        let query = match scope {
            IndexScope::TopLevel => sqlx::query_as::<_, IndexRow>(
                r#"
                SELECT id, master, classname, category, cache, error
                FROM document_index
                WHERE collection = ? AND master = -1
                ORDER BY id
                "#,
            )
            .bind(&self.registry),
            IndexScope::All => sqlx::query_as::<_, IndexRow>(
                r#"
                SELECT id, master, classname, category, cache, error
                FROM document_index
                WHERE collection = ?
                ORDER BY id
                "#,
            )
            .bind(&self.registry),
            IndexScope::ChildrenOf(master) => sqlx::query_as::<_, IndexRow>(
                r#"
                SELECT id, master, classname, category, cache, error
                FROM document_index
                WHERE collection = ? AND master = ?
                ORDER BY id
                "#,
            )
            .bind(&self.registry)
            .bind(master as i64),
        };
        Ok(query.fetch_all(&self.store.pool).await?)
    }

    /// Regenerate index rows from document bodies.
    ///
    /// With `all` unset only missing, corrupt or placeholder rows are
    /// rebuilt. Undecodable documents get a placeholder row.
    async fn repair_index(&self, all: bool) -> Result<usize> {
        let rows = sqlx::query_as::<_, RepairRow>(
            r#"
            SELECT d.id, d.master, d.body, d.previous_body, i.cache, i.error
            FROM documents d
            LEFT JOIN document_index i ON i.collection = d.collection AND i.id = d.id
            WHERE d.collection = ?
            ORDER BY d.id
            "#,
        )
        .bind(&self.registry)
        .fetch_all(&self.store.pool)
        .await?;

        let mut rebuilt = 0;
        for row in rows {
            let healthy = row.error.is_none()
                && row
                    .cache
                    .as_deref()
                    .is_some_and(|c| serde_json::from_str::<IndexCache>(c).is_ok());
            if healthy && !all {
                continue;
            }

            let id = row.id as ObjectId;
            let master_id = master_from_column(row.master);
            let entry =
                match self.decode_with_fallback(id, &row.body, row.previous_body.as_deref()) {
                    Ok((object, _)) => {
                        rebuilt += 1;
                        IndexEntry::new(&object, master_id)
                    }
                    Err(e) => {
                        error!(registry = %self.registry, id, error = %e, "Cannot rebuild index entry");
                        IndexEntry::inaccessible(master_id, e.to_string())
                    }
                };
            let mut conn = self.store.pool.acquire().await?;
            upsert_index(&mut conn, &self.registry, id, &entry).await?;
        }
        Ok(rebuilt)
    }

    async fn startup_inner(&self) -> Result<()> {
        self.controller.start().await?;
        self.store.migrate().await?;
        let repaired = self.repair_index(false).await?;
        if repaired > 0 {
            warn!(registry = %self.registry, repaired, "Rebuilt missing or corrupt index rows");
        }
        info!(
            registry = %self.registry,
            controller = self.controller.name(),
            "Document-store repository started"
        );
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for DocumentBackend {
    fn registry(&self) -> &str {
        &self.registry
    }

    async fn startup(&self) -> Result<()> {
        self.startup_inner()
            .await
            .map_err(|e| self.fatal("startup", e))
    }

    async fn shutdown(&self) -> Result<()> {
        let timeout = chrono::Duration::from_std(self.lease_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let stale_before = Utc::now() - timeout;
        let alive: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sessions WHERE heartbeat_ms >= ?")
                .bind(stale_before.timestamp_millis())
                .fetch_one(&self.store.pool)
                .await?;

        if alive == 0 {
            self.controller.quit().await?;
            info!(registry = %self.registry, "No live sessions left, document store stopped");
        } else {
            debug!(
                registry = %self.registry,
                alive,
                "Leaving document store running for other sessions"
            );
        }
        Ok(())
    }

    async fn add(&self, objects: Vec<NewObject>) -> Result<Vec<ObjectId>> {
        let documents = objects
            .iter()
            .map(|new| PreparedDocument::new(&new.object, new.master_id))
            .collect::<Result<Vec<_>>>()?;
        let documents = &documents;
        let ids = with_retry(&self.retry, &self.registry, "add", || async move {
            self.insert_documents(documents).await
        })
        .await
        .map_err(|e| self.fatal("add", e))?;
        debug!(registry = %self.registry, ids = ?ids, "Documents added");
        Ok(ids)
    }

    async fn load(&self, ids: &[ObjectId]) -> Result<BatchReport<ManagedObject>> {
        let mut report = BatchReport::new();
        for &id in ids {
            let row = with_retry(&self.retry, &self.registry, "load", || async move {
                self.fetch_document(id).await
            })
            .await
            .map_err(|e| self.fatal("load", e))?;

            let Some(row) = row else {
                report.fail(id, RepoError::not_found(&self.registry, id));
                continue;
            };
            match self.decode_with_fallback(id, &row.body, row.previous_body.as_deref()) {
                Ok((object, recovered)) => {
                    let mut managed =
                        ManagedObject::new(id, object, master_from_column(row.master));
                    if recovered {
                        managed.mark_dirty();
                    }
                    report.ok(managed);
                }
                Err(e) => {
                    error!(registry = %self.registry, id, error = %e, "Failed to load document");
                    report.fail(id, e);
                }
            }
        }
        Ok(report)
    }

    async fn flush(&self, objects: &[ManagedObject]) -> Result<BatchReport<ObjectId>> {
        let mut report = BatchReport::new();
        for managed in objects {
            let id = managed.id();
            let Ok(object) = managed.object() else {
                report.ok(id);
                continue;
            };
            let doc = &PreparedDocument::new(object, managed.master_id())?;
            let updated = with_retry(&self.retry, &self.registry, "flush", || async move {
                self.update_document(id, doc).await
            })
            .await
            .map_err(|e| self.fatal("flush", e))?;

            if updated {
                report.ok(id);
            } else {
                report.fail(id, RepoError::not_found(&self.registry, id));
            }
        }
        Ok(report)
    }

    async fn delete(&self, ids: &[ObjectId]) -> Result<BatchReport<ObjectId>> {
        let mut report = BatchReport::new();
        for &id in ids {
            with_retry(&self.retry, &self.registry, "delete", || async move {
                self.remove_document(id).await
            })
            .await
            .map_err(|e| self.fatal("delete", e))?;
            report.ok(id);
        }
        Ok(report)
    }

    async fn list_entries(&self, scope: IndexScope) -> Result<BTreeMap<ObjectId, IndexEntry>> {
        let rows = with_retry(&self.retry, &self.registry, "list", || async move {
            self.fetch_index(scope).await
        })
        .await
        .map_err(|e| self.fatal("list", e))?;
        Ok(rows.into_iter().map(IndexRow::into_entry).collect())
    }

    async fn rebuild_index(&self) -> Result<usize> {
        let rebuilt = self.repair_index(true).await?;
        info!(registry = %self.registry, rebuilt, "Index rebuilt from documents");
        Ok(rebuilt)
    }

    async fn clean(&self) -> Result<()> {
        with_retry(&self.retry, &self.registry, "clean", || async move {
            self.wipe_collection().await
        })
        .await
        .map_err(|e| self.fatal("clean", e))?;
        warn!(registry = %self.registry, "Collection wiped");
        Ok(())
    }

    fn lease_store(&self) -> Arc<dyn LeaseStore> {
        self.leases.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend(registry: &str) -> DocumentBackend {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let backend = DocumentBackend::new(
            DocumentStore::from_pool(pool),
            registry,
            Arc::new(PluginRegistry::with_builtins()),
            RetryPolicy::none(),
        );
        backend.startup().await.unwrap();
        backend
    }

    fn job(name: &str) -> GangaObject {
        let mut job = PluginRegistry::with_builtins()
            .instantiate("jobs", "Job")
            .unwrap();
        job.set("name", name).unwrap();
        job
    }

    #[tokio::test]
    async fn test_ids_allocated_per_collection() {
        let backend = backend("jobs").await;
        let ids = backend
            .add(vec![NewObject::top_level(job("a")), NewObject::top_level(job("b"))])
            .await
            .unwrap();
        assert_eq!(ids, vec![0, 1]);

        let templates = DocumentBackend::new(
            backend.store().clone(),
            "templates",
            Arc::new(PluginRegistry::with_builtins()),
            RetryPolicy::none(),
        );
        let ids = templates
            .add(vec![NewObject::top_level(job("t"))])
            .await
            .unwrap();
        assert_eq!(ids, vec![0]);
    }

    #[tokio::test]
    async fn test_previous_body_recovery() {
        let backend = backend("jobs").await;
        let id = backend
            .add(vec![NewObject::top_level(job("first"))])
            .await
            .unwrap()[0];
        let mut loaded = backend.load(&[id]).await.unwrap().succeeded.remove(0);
        loaded.mutate(|j| j.set("name", "second")).unwrap();
        backend.flush(&[loaded]).await.unwrap();

        sqlx::query("UPDATE documents SET body = '{' WHERE id = ?")
            .bind(id as i64)
            .execute(backend.store().pool())
            .await
            .unwrap();

        let recovered = backend.load(&[id]).await.unwrap().succeeded.remove(0);
        assert_eq!(recovered.object().unwrap().get_str("name"), Some("first"));
        assert!(recovered.is_dirty());
    }

    #[tokio::test]
    async fn test_flush_of_deleted_document_is_not_found() {
        let backend = backend("jobs").await;
        let id = backend
            .add(vec![NewObject::top_level(job("gone"))])
            .await
            .unwrap()[0];
        let loaded = backend.load(&[id]).await.unwrap().succeeded.remove(0);
        backend.delete(&[id]).await.unwrap();

        let report = backend.flush(&[loaded]).await.unwrap();
        assert_eq!(report.failed_ids(), vec![id]);
        assert_eq!(report.failure(id).unwrap().error_code(), "NOT_FOUND");

        // Deleting twice is fine.
        assert!(backend.delete(&[id]).await.unwrap().is_complete());
    }

    #[tokio::test]
    async fn test_startup_repairs_missing_index_rows() {
        let backend = backend("jobs").await;
        let id = backend
            .add(vec![NewObject::top_level(job("indexed"))])
            .await
            .unwrap()[0];
        sqlx::query("DELETE FROM document_index")
            .execute(backend.store().pool())
            .await
            .unwrap();
        assert!(backend.list_index().await.unwrap().is_empty());

        backend.startup().await.unwrap();
        let listed = backend.list_index().await.unwrap();
        assert_eq!(listed[&id].get_str("name"), Some("indexed"));
    }

    #[tokio::test]
    async fn test_children_listed_by_scope() {
        let backend = backend("jobs").await;
        let master = backend
            .add(vec![NewObject::top_level(job("master"))])
            .await
            .unwrap()[0];
        let children = backend
            .add(vec![
                NewObject::child_of(master, job("c0")),
                NewObject::child_of(master, job("c1")),
            ])
            .await
            .unwrap();

        let top = backend.list_index().await.unwrap();
        assert_eq!(top.keys().copied().collect::<Vec<_>>(), vec![master]);
        let listed = backend
            .list_entries(IndexScope::ChildrenOf(master))
            .await
            .unwrap();
        assert_eq!(listed.keys().copied().collect::<Vec<_>>(), children);
        assert_eq!(backend.list_entries(IndexScope::All).await.unwrap().len(), 3);
    }
}
