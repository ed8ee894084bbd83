// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! File-tree storage backend.
//!
//! Layout under `<location>/6.0/<registry>/`:
//!
//! ```text
//! cnt                 next-id hint
//! master.idx          index snapshot written at shutdown
//! locks/<id>.lock     object leases
//! sessions/<s>.session session heartbeats
//! 0xxx/3/data         payload of object 3 (data~ is the previous version)
//! 0xxx/3.index        index entry of object 3
//! 1xxx/1042/deleted   tombstone of object 1042
//! ```
//!
//! Objects are sharded into buckets of 1000 ids. Payload files are written
//! to `data.new` and renamed into place, keeping the prior version as
//! `data~`; the index file is written after the payload, so an index entry
//! never exists without a loadable payload. Ids are reserved by creating the
//! object directory, which is never removed, so ids are not reused.

use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::{IndexScope, StorageBackend};
use crate::ObjectId;
use crate::codec::{self, ObjectTree};
use crate::error::{BatchReport, RepoError, Result};
use crate::index::IndexEntry;
use crate::lock::{FileLeaseStore, LeaseStore};
use crate::object::{ManagedObject, NewObject};
use crate::plugins::PluginRegistry;
use crate::retry::{RetryPolicy, with_retry};
use crate::schema::GangaObject;

/// On-disk layout version directory.
pub const LAYOUT_VERSION: &str = "6.0";
const BUCKET_SIZE: ObjectId = 1000;
const DATA: &str = "data";
const DATA_NEW: &str = "data.new";
const DATA_BACKUP: &str = "data~";
const TOMBSTONE: &str = "deleted";
const INDEX_SUFFIX: &str = ".index";
const MASTER_INDEX: &str = "master.idx";
const COUNTER: &str = "cnt";

/// Contents of a `data` file.
#[derive(Debug, Serialize, Deserialize)]
struct StoredPayload {
    master: Option<ObjectId>,
    object: ObjectTree,
}

/// The part of a `data` file readable without the object's plugin.
#[derive(Debug, Deserialize)]
struct PayloadHeader {
    master: Option<ObjectId>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MasterIndexEntry {
    id: ObjectId,
    mtime_ms: i64,
    entry: IndexEntry,
}

#[derive(Debug, Default)]
struct IndexState {
    /// Entry and index-file modification time per live id.
    entries: BTreeMap<ObjectId, (IndexEntry, i64)>,
    /// Placeholders for ids whose payload could not be decoded while
    /// rebuilding the index; they keep the master id when it is known.
    broken: BTreeMap<ObjectId, IndexEntry>,
    next_hint: ObjectId,
}

/// What a directory scan found for one bucket tree.
#[derive(Debug, Default)]
struct Scan {
    with_data: BTreeSet<ObjectId>,
    index_files: BTreeMap<ObjectId, i64>,
    max_id: Option<ObjectId>,
}

/// Storage backend keeping each object in its own directory.
pub struct FileTreeBackend {
    registry: String,
    root: PathBuf,
    plugins: Arc<PluginRegistry>,
    retry: RetryPolicy,
    leases: Arc<FileLeaseStore>,
    state: RwLock<IndexState>,
    allocation: Mutex<()>,
}

impl FileTreeBackend {
    pub fn new(
        location: impl AsRef<Path>,
        registry: &str,
        plugins: Arc<PluginRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        let root = location.as_ref().join(LAYOUT_VERSION).join(registry);
        let leases = FileLeaseStore::new(root.join("sessions"), root.join("locks"));
        Self {
            registry: registry.to_string(),
            root,
            plugins,
            retry,
            leases: Arc::new(leases),
            state: RwLock::new(IndexState::default()),
            allocation: Mutex::new(()),
        }
    }

    /// Directory holding this registry's objects.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, id: ObjectId) -> PathBuf {
        self.root.join(format!("{}xxx", id / BUCKET_SIZE))
    }

    /// Directory of object `id`.
    pub fn object_dir(&self, id: ObjectId) -> PathBuf {
        self.bucket_dir(id).join(id.to_string())
    }

    /// Path of the index file of object `id`.
    pub fn index_path(&self, id: ObjectId) -> PathBuf {
        self.bucket_dir(id).join(format!("{}{}", id, INDEX_SUFFIX))
    }

    /// Path of the payload file of object `id`.
    pub fn data_path(&self, id: ObjectId) -> PathBuf {
        self.object_dir(id).join(DATA)
    }

    fn fatal(&self, operation: &str, id: Option<ObjectId>, e: RepoError) -> RepoError {
        error!(
            registry = %self.registry,
            operation,
            id = ?id,
            error = %e,
            "Storage failure"
        );
        if e.is_fatal() {
            e
        } else {
            RepoError::repository(&self.registry, operation, e.to_string())
        }
    }

    async fn read_optional(&self, path: &Path, operation: &str) -> Result<Option<Vec<u8>>> {
        with_retry(&self.retry, &self.registry, operation, || async move {
            match fs::read(path).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn write_replace(&self, path: &Path, tmp: &Path, bytes: &[u8]) -> Result<()> {
        with_retry(&self.retry, &self.registry, "write", || async move {
            write_synced(tmp, bytes).await?;
            fs::rename(tmp, path).await?;
            Ok(())
        })
        .await
    }

    fn decode_payload(&self, bytes: &[u8]) -> Result<(GangaObject, Option<ObjectId>)> {
        let stored: StoredPayload = serde_json::from_slice(bytes)
            .map_err(|e| RepoError::corrupt(format!("unreadable payload: {}", e)))?;
        let object = codec::deserialize(&stored.object, &self.plugins)?;
        Ok((object, stored.master))
    }

    /// Write the payload, keeping the previous version as `data~`.
    async fn write_payload(&self, id: ObjectId, stored: &StoredPayload) -> Result<()> {
        let dir = self.object_dir(id);
        let bytes = &serde_json::to_vec_pretty(stored)?;
        let data = &dir.join(DATA);
        let data_new = &dir.join(DATA_NEW);
        let backup = &dir.join(DATA_BACKUP);
        with_retry(&self.retry, &self.registry, "write_payload", || async move {
            write_synced(data_new, bytes).await?;
            match fs::rename(data, backup).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            fs::rename(data_new, data).await?;
            Ok(())
        })
        .await
    }

    async fn write_index(&self, id: ObjectId, entry: &IndexEntry) -> Result<i64> {
        let path = self.index_path(id);
        let tmp = self
            .bucket_dir(id)
            .join(format!("{}{}.new", id, INDEX_SUFFIX));
        self.write_replace(&path, &tmp, &serde_json::to_vec(entry)?)
            .await?;
        Ok(mtime_ms(&path).await?)
    }

    async fn is_tombstoned(&self, id: ObjectId) -> Result<bool> {
        Ok(fs::try_exists(self.object_dir(id).join(TOMBSTONE)).await?)
    }

    /// Load one object, falling back to `data.new` and then `data~`.
    async fn load_one(&self, id: ObjectId) -> Result<ManagedObject> {
        let dir = self.object_dir(id);
        if !fs::try_exists(&dir).await? || self.is_tombstoned(id).await? {
            return Err(RepoError::not_found(&self.registry, id));
        }

        let primary = match self.read_optional(&dir.join(DATA), "load").await? {
            Some(bytes) => Some(bytes),
            None => self.read_optional(&dir.join(DATA_NEW), "load").await?,
        };
        let Some(bytes) = primary else {
            return Err(RepoError::not_found(&self.registry, id));
        };

        let failure = match self.decode_payload(&bytes) {
            Ok((object, master)) => return Ok(ManagedObject::new(id, object, master)),
            Err(e) => e,
        };

        if let Some(backup) = self.read_optional(&dir.join(DATA_BACKUP), "load").await?
            && let Ok((object, master)) = self.decode_payload(&backup)
        {
            warn!(
                registry = %self.registry,
                id,
                error = %failure,
                "Payload unreadable, recovered previous version from backup"
            );
            let mut managed = ManagedObject::new(id, object, master);
            managed.mark_dirty();
            return Ok(managed);
        }

        error!(registry = %self.registry, id, error = %failure, "Failed to load object");
        Err(RepoError::inaccessible(&self.registry, id, failure))
    }

    /// Reserve the next free id by creating its directory.
    async fn reserve_id(&self) -> Result<ObjectId> {
        let counter = self.root.join(COUNTER);
        let on_disk = fs::read_to_string(&counter)
            .await
            .ok()
            .and_then(|s| s.trim().parse::<ObjectId>().ok())
            .unwrap_or(0);
        let mut candidate = on_disk.max(self.state.read().await.next_hint);

        loop {
            fs::create_dir_all(self.bucket_dir(candidate)).await?;
            match fs::create_dir(self.object_dir(candidate)).await {
                Ok(()) => break,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => candidate += 1,
                Err(e) => return Err(e.into()),
            }
        }

        self.state.write().await.next_hint = candidate + 1;
        let tmp = self.root.join(format!("{}.new", COUNTER));
        if let Err(e) = self
            .write_replace(&counter, &tmp, (candidate + 1).to_string().as_bytes())
            .await
        {
            debug!(registry = %self.registry, error = %e, "Could not update id counter hint");
        }
        Ok(candidate)
    }

    /// Walk the bucket directories, repairing interrupted writes and
    /// purging the leftovers of deleted objects.
    async fn scan(&self) -> Result<Scan> {
        let mut scan = Scan::default();
        let mut buckets = fs::read_dir(&self.root).await?;
        while let Some(bucket) = buckets.next_entry().await? {
            let name = bucket.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.strip_suffix("xxx").and_then(|n| n.parse::<u64>().ok()).is_none()
                || !bucket.file_type().await?.is_dir()
            {
                continue;
            }

            let mut entries = fs::read_dir(bucket.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_name = entry.file_name();
                let Some(file_name) = file_name.to_str() else { continue };

                if file_name.ends_with(".new") {
                    fs::remove_file(entry.path()).await.ok();
                    continue;
                }
                if let Some(id) = file_name
                    .strip_suffix(INDEX_SUFFIX)
                    .and_then(|n| n.parse::<ObjectId>().ok())
                {
                    scan.index_files.insert(id, mtime_ms(&entry.path()).await?);
                    continue;
                }
                let Ok(id) = file_name.parse::<ObjectId>() else { continue };
                scan.max_id = Some(scan.max_id.map_or(id, |m| m.max(id)));

                let dir = entry.path();
                if fs::try_exists(dir.join(TOMBSTONE)).await? {
                    for leftover in [DATA, DATA_NEW, DATA_BACKUP] {
                        remove_if_exists(&dir.join(leftover)).await?;
                    }
                    continue;
                }
                let has_data = fs::try_exists(dir.join(DATA)).await?;
                let has_new = fs::try_exists(dir.join(DATA_NEW)).await?;
                if has_new && has_data {
                    remove_if_exists(&dir.join(DATA_NEW)).await?;
                } else if has_new {
                    // The previous payload was moved aside; the new one is complete.
                    fs::rename(dir.join(DATA_NEW), dir.join(DATA)).await?;
                    info!(registry = %self.registry, id, "Completed interrupted payload write");
                }
                if has_data || has_new {
                    scan.with_data.insert(id);
                }
            }
        }

        for (&id, _) in scan.index_files.iter() {
            if !scan.with_data.contains(&id) {
                info!(registry = %self.registry, id, "Removing index file without payload");
                remove_if_exists(&self.index_path(id)).await?;
            }
        }
        scan.index_files.retain(|id, _| scan.with_data.contains(id));
        Ok(scan)
    }

    /// Master of `id` as recorded in its payload or backup, even when the
    /// object itself cannot be decoded.
    async fn master_hint(&self, id: ObjectId) -> Option<Option<ObjectId>> {
        let dir = self.object_dir(id);
        for file in [DATA, DATA_BACKUP] {
            if let Ok(bytes) = fs::read(dir.join(file)).await
                && let Ok(header) = serde_json::from_slice::<PayloadHeader>(&bytes)
            {
                return Some(header.master);
            }
        }
        None
    }

    /// Placeholder listed for an object whose index cannot be rebuilt.
    async fn placeholder(
        &self,
        id: ObjectId,
        known_master: Option<ObjectId>,
        e: &RepoError,
    ) -> IndexEntry {
        let master = self.master_hint(id).await.unwrap_or(known_master);
        IndexEntry::inaccessible(master, e.to_string())
    }

    /// Regenerate the index file of `id` from its payload.
    async fn rebuild_entry(&self, id: ObjectId) -> Result<(IndexEntry, i64)> {
        let managed = self.load_one(id).await?;
        let entry = managed.index_entry();
        let mtime = self.write_index(id, &entry).await?;
        Ok((entry, mtime))
    }

    async fn read_master_index(&self) -> BTreeMap<ObjectId, (IndexEntry, i64)> {
        let path = self.root.join(MASTER_INDEX);
        let Ok(bytes) = fs::read(&path).await else {
            return BTreeMap::new();
        };
        match serde_json::from_slice::<Vec<MasterIndexEntry>>(&bytes) {
            Ok(entries) => entries
                .into_iter()
                .map(|e| (e.id, (e.entry, e.mtime_ms)))
                .collect(),
            Err(e) => {
                warn!(registry = %self.registry, error = %e, "Ignoring unreadable master index");
                BTreeMap::new()
            }
        }
    }

    async fn read_index_file(&self, id: ObjectId) -> Option<IndexEntry> {
        let bytes = fs::read(self.index_path(id)).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Bring the in-memory index up to date with changes made by other sessions.
    async fn refresh(&self) -> Result<()> {
        let mut found: BTreeMap<ObjectId, i64> = BTreeMap::new();
        let mut buckets = match fs::read_dir(&self.root).await {
            Ok(b) => b,
            Err(e) => return Err(self.fatal("list", None, e.into())),
        };
        while let Some(bucket) = buckets.next_entry().await? {
            let name = bucket.file_name();
            if !name.to_str().is_some_and(|n| n.ends_with("xxx")) {
                continue;
            }
            let mut entries = fs::read_dir(bucket.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_name = entry.file_name();
                let Some(id) = file_name
                    .to_str()
                    .and_then(|n| n.strip_suffix(INDEX_SUFFIX))
                    .and_then(|n| n.parse::<ObjectId>().ok())
                else {
                    continue;
                };
                match mtime_ms(&entry.path()).await {
                    Ok(mtime) => {
                        found.insert(id, mtime);
                    }
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let stale: Vec<ObjectId> = {
            let state = self.state.read().await;
            found
                .iter()
                .filter(|(id, mtime)| state.entries.get(id).is_none_or(|(_, m)| m != *mtime))
                .map(|(id, _)| *id)
                .collect()
        };

        let mut updates = Vec::new();
        for id in stale {
            match self.read_index_file(id).await {
                Some(entry) => updates.push((id, entry)),
                None => {
                    if self.is_tombstoned(id).await? {
                        continue;
                    }
                    warn!(registry = %self.registry, id, "Index file unreadable, rebuilding from payload");
                    match self.rebuild_entry(id).await {
                        Ok((entry, mtime)) => {
                            found.insert(id, mtime);
                            updates.push((id, entry));
                        }
                        Err(e) => {
                            let known = self
                                .state
                                .read()
                                .await
                                .entries
                                .get(&id)
                                .and_then(|(entry, _)| entry.master_id);
                            let placeholder = self.placeholder(id, known, &e).await;
                            self.state.write().await.broken.insert(id, placeholder);
                        }
                    }
                }
            }
        }

        let mut state = self.state.write().await;
        for (id, entry) in updates {
            let mtime = found.get(&id).copied().unwrap_or_default();
            state.broken.remove(&id);
            state.entries.insert(id, (entry, mtime));
        }
        state.entries.retain(|id, _| found.contains_key(id));
        Ok(())
    }

    async fn startup_inner(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        self.leases.init().await?;

        let cached = self.read_master_index().await;
        let scan = self.scan().await?;

        let mut entries = BTreeMap::new();
        let mut broken = BTreeMap::new();
        let mut rebuilt = 0usize;
        for &id in &scan.with_data {
            if let Some(&mtime) = scan.index_files.get(&id) {
                if let Some((entry, cached_mtime)) = cached.get(&id)
                    && *cached_mtime == mtime
                {
                    entries.insert(id, (entry.clone(), mtime));
                    continue;
                }
                if let Some(entry) = self.read_index_file(id).await {
                    entries.insert(id, (entry, mtime));
                    continue;
                }
            }
            match self.rebuild_entry(id).await {
                Ok(rebuilt_entry) => {
                    rebuilt += 1;
                    entries.insert(id, rebuilt_entry);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!(registry = %self.registry, id, error = %e, "Cannot rebuild index entry");
                    let known = cached.get(&id).and_then(|(entry, _)| entry.master_id);
                    broken.insert(id, self.placeholder(id, known, &e).await);
                }
            }
        }
        if rebuilt > 0 {
            warn!(registry = %self.registry, rebuilt, "Rebuilt missing or corrupt index entries");
        }

        let mut state = self.state.write().await;
        state.next_hint = scan.max_id.map_or(0, |m| m + 1);
        state.entries = entries;
        state.broken = broken;
        info!(
            registry = %self.registry,
            objects = state.entries.len(),
            broken = state.broken.len(),
            root = %self.root.display(),
            "File-tree repository started"
        );
        Ok(())
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn mtime_ms(path: &Path) -> std::io::Result<i64> {
    let modified = fs::metadata(path).await?.modified()?;
    Ok(DateTime::<Utc>::from(modified).timestamp_millis())
}

#[async_trait]
impl StorageBackend for FileTreeBackend {
    fn registry(&self) -> &str {
        &self.registry
    }

    async fn startup(&self) -> Result<()> {
        self.startup_inner()
            .await
            .map_err(|e| self.fatal("startup", None, e))
    }

    async fn shutdown(&self) -> Result<()> {
        let snapshot: Vec<MasterIndexEntry> = {
            let state = self.state.read().await;
            state
                .entries
                .iter()
                .map(|(&id, (entry, mtime))| MasterIndexEntry {
                    id,
                    mtime_ms: *mtime,
                    entry: entry.clone(),
                })
                .collect()
        };
        let path = self.root.join(MASTER_INDEX);
        let tmp = self.root.join(format!("{}.new", MASTER_INDEX));
        self.write_replace(&path, &tmp, &serde_json::to_vec(&snapshot)?)
            .await?;
        debug!(registry = %self.registry, entries = snapshot.len(), "Master index written");
        Ok(())
    }

    async fn add(&self, objects: Vec<NewObject>) -> Result<Vec<ObjectId>> {
        let _allocation = self.allocation.lock().await;
        let mut ids = Vec::with_capacity(objects.len());
        for new in objects {
            let id = self
                .reserve_id()
                .await
                .map_err(|e| self.fatal("add", None, e))?;
            let entry = IndexEntry::new(&new.object, new.master_id);
            let stored = StoredPayload {
                master: new.master_id,
                object: codec::serialize(&new.object),
            };
            self.write_payload(id, &stored)
                .await
                .map_err(|e| self.fatal("add", Some(id), e))?;
            let mtime = self
                .write_index(id, &entry)
                .await
                .map_err(|e| self.fatal("add", Some(id), e))?;
            self.state.write().await.entries.insert(id, (entry, mtime));
            debug!(registry = %self.registry, id, "Object added");
            ids.push(id);
        }
        Ok(ids)
    }

    async fn load(&self, ids: &[ObjectId]) -> Result<BatchReport<ManagedObject>> {
        let mut report = BatchReport::new();
        for &id in ids {
            match self.load_one(id).await {
                Ok(managed) => report.ok(managed),
                Err(e) if e.is_fatal() => return Err(self.fatal("load", Some(id), e)),
                Err(e) if e.is_per_object() => report.fail(id, e),
                Err(e) => report.fail(id, RepoError::inaccessible(&self.registry, id, e)),
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
            if !fs::try_exists(self.object_dir(id)).await? || self.is_tombstoned(id).await? {
                report.fail(id, RepoError::not_found(&self.registry, id));
                continue;
            }

            let entry = IndexEntry::new(object, managed.master_id());
            let stored = StoredPayload {
                master: managed.master_id(),
                object: codec::serialize(object),
            };
            self.write_payload(id, &stored)
                .await
                .map_err(|e| self.fatal("flush", Some(id), e))?;
            let mtime = self
                .write_index(id, &entry)
                .await
                .map_err(|e| self.fatal("flush", Some(id), e))?;

            let mut state = self.state.write().await;
            state.broken.remove(&id);
            state.entries.insert(id, (entry, mtime));
            drop(state);
            debug!(registry = %self.registry, id, "Object flushed");
            report.ok(id);
        }
        Ok(report)
    }

    async fn delete(&self, ids: &[ObjectId]) -> Result<BatchReport<ObjectId>> {
        let mut report = BatchReport::new();
        for &id in ids {
            let dir = self.object_dir(id);
            if !fs::try_exists(&dir).await? || self.is_tombstoned(id).await? {
                report.ok(id);
                continue;
            }
            let purge = async {
                write_synced(&dir.join(TOMBSTONE), Utc::now().to_rfc3339().as_bytes()).await?;
                remove_if_exists(&self.index_path(id)).await?;
                for file in [DATA, DATA_NEW, DATA_BACKUP] {
                    remove_if_exists(&dir.join(file)).await?;
                }
                Ok::<_, RepoError>(())
            };
            purge
                .await
                .map_err(|e| self.fatal("delete", Some(id), e))?;

            let mut state = self.state.write().await;
            state.entries.remove(&id);
            state.broken.remove(&id);
            drop(state);
            debug!(registry = %self.registry, id, "Object deleted");
            report.ok(id);
        }
        Ok(report)
    }

    async fn list_entries(&self, scope: IndexScope) -> Result<BTreeMap<ObjectId, IndexEntry>> {
        self.refresh().await?;
        let state = self.state.read().await;
        let mut listed: BTreeMap<ObjectId, IndexEntry> = state
            .entries
            .iter()
            .filter(|(_, (entry, _))| scope.matches(entry))
            .map(|(&id, (entry, _))| (id, entry.clone()))
            .collect();
        for (&id, placeholder) in &state.broken {
            if scope.matches(placeholder) {
                listed.entry(id).or_insert_with(|| placeholder.clone());
            }
        }
        Ok(listed)
    }

    async fn rebuild_index(&self) -> Result<usize> {
        let scan = self.scan().await?;
        let mut rebuilt = 0;
        for &id in &scan.with_data {
            match self.rebuild_entry(id).await {
                Ok((entry, mtime)) => {
                    let mut state = self.state.write().await;
                    state.broken.remove(&id);
                    state.entries.insert(id, (entry, mtime));
                    rebuilt += 1;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!(registry = %self.registry, id, error = %e, "Cannot rebuild index entry");
                    let known = {
                        let state = self.state.read().await;
                        state
                            .entries
                            .get(&id)
                            .map(|(entry, _)| entry.master_id)
                            .or_else(|| state.broken.get(&id).map(|p| p.master_id))
                            .flatten()
                    };
                    let placeholder = self.placeholder(id, known, &e).await;
                    self.state.write().await.broken.insert(id, placeholder);
                }
            }
        }
        info!(registry = %self.registry, rebuilt, "Index rebuilt from payloads");
        Ok(rebuilt)
    }

    async fn clean(&self) -> Result<()> {
        let _allocation = self.allocation.lock().await;
        let wipe = async {
            let mut entries = fs::read_dir(&self.root).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                if name == "sessions" || name == "locks" {
                    continue;
                }
                if entry.file_type().await?.is_dir() {
                    fs::remove_dir_all(entry.path()).await?;
                } else {
                    remove_if_exists(&entry.path()).await?;
                }
            }
            Ok::<_, RepoError>(())
        };
        wipe.await.map_err(|e| self.fatal("clean", None, e))?;

        *self.state.write().await = IndexState::default();
        warn!(registry = %self.registry, root = %self.root.display(), "Registry wiped");
        Ok(())
    }

    fn lease_store(&self) -> Arc<dyn LeaseStore> {
        self.leases.clone()
    }
}
