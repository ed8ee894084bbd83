// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Repository façade.
//!
//! One [`Repository`] per registry and process. It combines a storage
//! backend with the session lock manager and keeps an in-memory cache of
//! the objects it has handed out:
//!
//! - objects listed lazily stay index-only until their payload is needed
//! - mutations happen on cached objects and reach storage on `flush`
//! - every `flush` and `delete` of an id runs under that id's lease
//! - ids that failed to load are remembered as incomplete and are only
//!   re-read by an explicit [`Repository::reload`]
//!
//! A backend-wide failure disables the repository: further mutations are
//! refused until the session is restarted, and shutdown still flushes what
//! it can.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::ObjectId;
use crate::config::RepositoryConfig;
use crate::error::{BatchReport, RepoError, Result};
use crate::flusher::AutoFlusher;
use crate::index::IndexEntry;
use crate::lock::{LockSettings, SessionIdentity, SessionLockManager, SessionStatus, TakeoverWarning};
use crate::object::{ManagedObject, NewObject};
use crate::plugins::{PluginRegistry, TRANSITIONAL_STATUSES};
use crate::schema::GangaObject;
use crate::storage::{self, IndexScope, StorageBackend};

/// Process-wide state shared by every registry a session opens.
#[derive(Clone)]
pub struct RepositoryContext {
    pub session: SessionIdentity,
    pub config: RepositoryConfig,
    pub plugins: Arc<PluginRegistry>,
}

impl RepositoryContext {
    /// Context with the built-in plugin set and a session identity taken
    /// from the configuration (or generated).
    pub fn new(config: RepositoryConfig) -> Self {
        Self::with_plugins(config, Arc::new(PluginRegistry::with_builtins()))
    }

    pub fn with_plugins(config: RepositoryConfig, plugins: Arc<PluginRegistry>) -> Self {
        let session = match &config.session_name {
            Some(name) => SessionIdentity::named(name),
            None => SessionIdentity::generate(),
        };
        Self {
            session,
            config,
            plugins,
        }
    }
}

fn std_guard<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Persistent store of one registry (`jobs`, `templates`, ...).
pub struct Repository {
    registry: String,
    ctx: RepositoryContext,
    backend: Arc<dyn StorageBackend>,
    locks: Arc<SessionLockManager>,
    cache: Mutex<BTreeMap<ObjectId, ManagedObject>>,
    /// Ids that failed to load, with the reason.
    incomplete: Mutex<BTreeMap<ObjectId, String>>,
    /// Orders flushes and deletes of one id within this session.
    flush_guards: StdMutex<HashMap<ObjectId, Arc<Mutex<()>>>>,
    disabled: AtomicBool,
    flusher: StdMutex<Option<Arc<Notify>>>,
}

impl Repository {
    /// Open `registry` with the backend selected by the context's configuration.
    pub async fn open(ctx: &RepositoryContext, registry: &str) -> Result<Arc<Self>> {
        let backend = storage::open_backend(&ctx.config, ctx.plugins.clone(), registry).await?;
        Ok(Self::with_backend(ctx, backend))
    }

    pub fn with_backend(ctx: &RepositoryContext, backend: Arc<dyn StorageBackend>) -> Arc<Self> {
        let registry = backend.registry().to_string();
        let locks = Arc::new(SessionLockManager::new(
            &registry,
            backend.lease_store(),
            ctx.session.clone(),
            LockSettings::from(&ctx.config),
        ));
        Arc::new(Self {
            registry,
            ctx: ctx.clone(),
            backend,
            locks,
            cache: Mutex::new(BTreeMap::new()),
            incomplete: Mutex::new(BTreeMap::new()),
            flush_guards: StdMutex::new(HashMap::new()),
            disabled: AtomicBool::new(false),
            flusher: StdMutex::new(None),
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn session_id(&self) -> &str {
        self.locks.session_id()
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.is_disabled() {
            return Err(RepoError::Disabled {
                registry: self.registry.clone(),
            });
        }
        Ok(())
    }

    /// Disable the repository when `e` is a backend-wide failure.
    fn escalate(&self, e: RepoError) -> RepoError {
        if e.is_fatal() && !self.disabled.swap(true, Ordering::SeqCst) {
            error!(
                registry = %self.registry,
                error = %e,
                "Fatal repository error, refusing further mutation until restart"
            );
        }
        e
    }

    fn flush_guard(&self, id: ObjectId) -> Arc<Mutex<()>> {
        std_guard(&self.flush_guards)
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Open the backend, register the session and run the startup hooks.
    pub async fn startup(self: &Arc<Self>) -> Result<()> {
        self.backend
            .startup()
            .await
            .map_err(|e| self.escalate(e))?;

        let reclaimed = self.locks.start().await?;
        if !reclaimed.is_empty() {
            info!(
                registry = %self.registry,
                ids = ?reclaimed,
                "Locks of a previous run reclaimed; objects will be re-read from storage"
            );
        }
        self.locks.spawn_heartbeat();

        if self.ctx.config.startup_check {
            self.fail_interrupted_jobs().await?;
        }
        if let Some(interval) = self.ctx.config.autoflush_interval {
            let flusher = AutoFlusher::new(Arc::downgrade(self), interval);
            *std_guard(&self.flusher) = Some(flusher.shutdown_handle());
            tokio::spawn(async move { flusher.run().await });
        }

        info!(
            registry = %self.registry,
            session_id = %self.session_id(),
            "Repository started"
        );
        Ok(())
    }

    /// Flush dirty objects, release every lock and deregister the session.
    ///
    /// Runs every step even after a failure and returns the first error.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(shutdown) = std_guard(&self.flusher).take() {
            shutdown.notify_one();
        }

        let mut first_error = None;
        let dirty = self.dirty_ids().await;
        match self.flush_inner(&dirty).await {
            Ok(report) if !report.is_complete() => {
                warn!(
                    registry = %self.registry,
                    unflushed = ?report.failed_ids(),
                    "Some objects could not be flushed at shutdown"
                );
            }
            Ok(_) => {}
            Err(e) => {
                error!(registry = %self.registry, error = %e, "Final flush failed");
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.locks.stop().await {
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.backend.shutdown().await {
            first_error.get_or_insert(e);
        }
        info!(registry = %self.registry, "Repository shut down");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Store new top-level objects; returns their ids in input order.
    pub async fn add(&self, objects: Vec<GangaObject>) -> Result<Vec<ObjectId>> {
        self.add_new(objects.into_iter().map(NewObject::top_level).collect())
            .await
    }

    /// Store sub-objects of `master`.
    pub async fn add_children(
        &self,
        master: ObjectId,
        objects: Vec<GangaObject>,
    ) -> Result<Vec<ObjectId>> {
        self.add_new(
            objects
                .into_iter()
                .map(|o| NewObject::child_of(master, o))
                .collect(),
        )
        .await
    }

    async fn add_new(&self, objects: Vec<NewObject>) -> Result<Vec<ObjectId>> {
        self.ensure_enabled()?;
        let ids = self
            .backend
            .add(objects.clone())
            .await
            .map_err(|e| self.escalate(e))?;

        let mut cache = self.cache.lock().await;
        for (id, new) in ids.iter().zip(objects) {
            cache.insert(*id, ManagedObject::new(*id, new.object, new.master_id));
        }
        debug!(registry = %self.registry, ids = ?ids, "Objects added");
        Ok(ids)
    }

    /// Objects for `ids`, served from the cache where possible.
    ///
    /// With `lazy` set, uncached objects come back index-only and their
    /// payload is read on first access. Unknown, corrupt and incomplete ids
    /// are reported per id.
    pub async fn load(&self, ids: &[ObjectId], lazy: bool) -> Result<BatchReport<ManagedObject>> {
        let mut report = BatchReport::new();
        let mut need_index = Vec::new();
        let mut need_payload = Vec::new();
        {
            let incomplete = self.incomplete.lock().await;
            let cache = self.cache.lock().await;
            for &id in ids {
                if let Some(reason) = incomplete.get(&id) {
                    report.fail(id, self.incomplete_error(id, reason));
                    continue;
                }
                match cache.get(&id) {
                    Some(cached) if cached.is_loaded() || lazy => report.ok(cached.clone()),
                    Some(_) => need_payload.push(id),
                    None if lazy => need_index.push(id),
                    None => need_payload.push(id),
                }
            }
        }

        if !need_index.is_empty() {
            let entries = self
                .backend
                .list_entries(IndexScope::All)
                .await
                .map_err(|e| self.escalate(e))?;
            let mut cache = self.cache.lock().await;
            for id in need_index {
                match entries.get(&id) {
                    Some(entry) if entry.error.is_none() => {
                        let managed = cache
                            .entry(id)
                            .or_insert_with(|| ManagedObject::from_entry(id, entry));
                        report.ok(managed.clone());
                    }
                    Some(_) => need_payload.push(id),
                    None => report.fail(id, RepoError::not_found(&self.registry, id)),
                }
            }
        }

        if !need_payload.is_empty() {
            let loaded = self
                .backend
                .load(&need_payload)
                .await
                .map_err(|e| self.escalate(e))?;
            let mut cache = self.cache.lock().await;
            for managed in loaded.succeeded {
                let id = managed.id();
                let entry = match cache.remove(&id) {
                    Some(mut cached) if !cached.is_loaded() => {
                        cached.fill_payload(managed);
                        cached
                    }
                    // Loaded concurrently by another task; keep its state.
                    Some(cached) => cached,
                    None => managed,
                };
                report.ok(entry.clone());
                cache.insert(id, entry);
            }
            drop(cache);

            let mut incomplete = self.incomplete.lock().await;
            for failure in loaded.failed {
                if matches!(failure.error, RepoError::Inaccessible { .. }) {
                    incomplete.insert(failure.id, failure.error.to_string());
                }
                report.fail(failure.id, failure.error);
            }
        }

        Ok(report)
    }

    fn incomplete_error(&self, id: ObjectId, reason: &str) -> RepoError {
        RepoError::inaccessible(&self.registry, id, RepoError::corrupt(reason))
    }

    /// A single fully loaded object.
    pub async fn get(&self, id: ObjectId) -> Result<ManagedObject> {
        let mut report = self.load(&[id], false).await?;
        match report.failed.pop() {
            Some(failure) => Err(failure.error),
            None => report
                .succeeded
                .pop()
                .ok_or_else(|| RepoError::not_found(&self.registry, id)),
        }
    }

    /// Make sure the payload of a cached index-only object is in memory.
    pub async fn ensure_loaded(&self, id: ObjectId) -> Result<()> {
        self.get(id).await.map(|_| ())
    }

    /// Mutate a cached object in place; the change reaches storage on flush.
    pub async fn modify<R>(
        &self,
        id: ObjectId,
        f: impl FnOnce(&mut GangaObject) -> Result<R>,
    ) -> Result<R> {
        self.ensure_enabled()?;
        self.ensure_loaded(id).await?;
        let mut cache = self.cache.lock().await;
        let managed = cache
            .get_mut(&id)
            .ok_or_else(|| RepoError::not_found(&self.registry, id))?;
        managed.mutate(f)
    }

    /// Discard the cached state of `id` and read it again from storage.
    ///
    /// Clears the incomplete mark on success; unsaved changes are lost.
    pub async fn reload(&self, id: ObjectId) -> Result<ManagedObject> {
        self.incomplete.lock().await.remove(&id);
        self.cache.lock().await.remove(&id);
        self.get(id).await
    }

    /// Ids that failed to load, with the reason.
    pub async fn incomplete(&self) -> BTreeMap<ObjectId, String> {
        self.incomplete.lock().await.clone()
    }

    async fn dirty_ids(&self) -> Vec<ObjectId> {
        self.cache
            .lock()
            .await
            .values()
            .filter(|m| m.is_dirty())
            .map(ManagedObject::id)
            .collect()
    }

    /// Write back the dirty objects among `ids`.
    ///
    /// Each id is flushed under its lease. Ids whose lease is held by a live
    /// session, or which are unknown or incomplete, are reported as failures
    /// while the rest proceed. Clean ids succeed without I/O.
    pub async fn flush(&self, ids: &[ObjectId]) -> Result<BatchReport<ObjectId>> {
        self.ensure_enabled()?;
        self.flush_inner(ids).await
    }

    /// Flush every dirty object in the cache.
    pub async fn flush_all(&self) -> Result<BatchReport<ObjectId>> {
        let dirty = self.dirty_ids().await;
        self.flush(&dirty).await
    }

    async fn flush_inner(&self, ids: &[ObjectId]) -> Result<BatchReport<ObjectId>> {
        let mut report = BatchReport::new();
        for &id in ids {
            let guard = self.flush_guard(id);
            let _ordered = guard.lock().await;

            if let Some(reason) = self.incomplete.lock().await.get(&id) {
                report.fail(id, self.incomplete_error(id, reason));
                continue;
            }
            let snapshot = match self.cache.lock().await.get(&id) {
                Some(managed) if managed.is_dirty() => managed.clone(),
                Some(_) => {
                    report.ok(id);
                    continue;
                }
                None => {
                    report.fail(id, RepoError::not_found(&self.registry, id));
                    continue;
                }
            };

            let newly_locked = match self.locks.acquire(id).await {
                Ok(newly) => newly,
                Err(e) => {
                    warn!(registry = %self.registry, id, error = %e, "Cannot lock object for flush");
                    report.fail(id, e);
                    continue;
                }
            };
            let written = self
                .backend
                .flush(std::slice::from_ref(&snapshot))
                .await;
            // A lock held before this flush belongs to whoever took it.
            if newly_locked && let Err(e) = self.locks.release(id).await {
                warn!(registry = %self.registry, id, error = %e, "Failed to release lock after flush");
            }
            let written = written.map_err(|e| self.escalate(e))?;

            if written.is_complete() {
                let mut cache = self.cache.lock().await;
                if let Some(managed) = cache.get_mut(&id)
                    && managed.generation() == snapshot.generation()
                {
                    managed.mark_clean();
                }
                debug!(registry = %self.registry, id, "Object flushed");
            }
            report.merge(written);
        }
        Ok(report)
    }

    /// Delete objects together with their sub-objects.
    ///
    /// The object and its sub-objects are locked as one group; ids whose
    /// group cannot be locked are reported while the rest proceed. Deleting
    /// an unknown id succeeds. Incomplete objects can be removed this way.
    pub async fn delete(&self, ids: &[ObjectId]) -> Result<BatchReport<ObjectId>> {
        self.ensure_enabled()?;
        let mut report = BatchReport::new();
        for &id in ids {
            let children: Vec<ObjectId> = self
                .backend
                .list_entries(IndexScope::ChildrenOf(id))
                .await
                .map_err(|e| self.escalate(e))?
                .into_keys()
                .collect();
            let mut group = children.clone();
            group.push(id);
            group.sort_unstable();
            group.dedup();

            // Flushes of these ids in this session wait until the delete is done.
            let mut ordered = Vec::with_capacity(group.len());
            for &member in &group {
                ordered.push(self.flush_guard(member).lock_owned().await);
            }

            let newly_locked = match self.locks.acquire_many(&group).await {
                Ok(newly) => newly,
                Err(e) => {
                    warn!(registry = %self.registry, id, error = %e, "Cannot lock object for delete");
                    report.fail(id, e);
                    continue;
                }
            };
            let deleted = self.backend.delete(&group).await;
            if let Err(e) = self.locks.release_many(&newly_locked).await {
                warn!(registry = %self.registry, id, error = %e, "Failed to release locks after delete");
            }
            let deleted = deleted.map_err(|e| self.escalate(e))?;

            {
                let mut incomplete = self.incomplete.lock().await;
                let mut cache = self.cache.lock().await;
                for gone in &group {
                    cache.remove(gone);
                    incomplete.remove(gone);
                }
            }
            drop(ordered);

            if deleted.failure(id).is_some() {
                report.merge(BatchReport {
                    succeeded: Vec::new(),
                    failed: deleted.failed,
                });
            } else {
                if !children.is_empty() {
                    debug!(
                        registry = %self.registry,
                        id,
                        children = children.len(),
                        "Deleted with sub-objects"
                    );
                }
                report.ok(id);
            }
        }
        Ok(report)
    }

    /// Index of every top-level object, reflecting unsaved changes made in
    /// this session. Incomplete objects appear as error placeholders.
    pub async fn list_index(&self) -> Result<BTreeMap<ObjectId, IndexEntry>> {
        let stored = self
            .backend
            .list_entries(IndexScope::All)
            .await
            .map_err(|e| self.escalate(e))?;
        let mut listed: BTreeMap<ObjectId, IndexEntry> = stored
            .iter()
            .filter(|(_, entry)| entry.is_top_level())
            .map(|(&id, entry)| (id, entry.clone()))
            .collect();

        for managed in self.cache.lock().await.values() {
            if managed.is_dirty() && managed.master_id().is_none() {
                listed.insert(managed.id(), managed.index_entry());
            }
        }
        for (id, reason) in self.incomplete.lock().await.iter() {
            // Sub-objects stay out of the listing even when unreadable.
            if stored.get(id).is_some_and(|entry| !entry.is_top_level()) {
                continue;
            }
            listed.insert(*id, IndexEntry::inaccessible(None, reason.clone()));
        }
        Ok(listed)
    }

    /// Index entries of the sub-objects of `master`.
    pub async fn children(&self, master: ObjectId) -> Result<BTreeMap<ObjectId, IndexEntry>> {
        self.backend
            .list_entries(IndexScope::ChildrenOf(master))
            .await
            .map_err(|e| self.escalate(e))
    }

    /// Regenerate the stored index from payloads.
    pub async fn rebuild_index(&self) -> Result<usize> {
        self.ensure_enabled()?;
        self.backend
            .rebuild_index()
            .await
            .map_err(|e| self.escalate(e))
    }

    /// Wipe the registry: every object goes and ids restart at 0.
    ///
    /// Refused while other live sessions use the registry unless `force` is
    /// set. Locks of dead sessions are reaped first. Without `force` every
    /// stored object is locked for the duration of the wipe.
    pub async fn clean(&self, force: bool) -> Result<()> {
        self.ensure_enabled()?;
        let live: Vec<String> = self
            .locks
            .other_sessions()
            .await?
            .into_iter()
            .filter(|status| status.alive)
            .map(|status| status.record.session_id)
            .collect();
        if !live.is_empty() {
            if !force {
                return Err(RepoError::SessionsActive {
                    registry: self.registry.clone(),
                    sessions: live,
                });
            }
            warn!(registry = %self.registry, sessions = ?live, "Cleaning registry used by live sessions");
        }
        self.locks.reap().await?;

        let stored: Vec<ObjectId> = self
            .backend
            .list_entries(IndexScope::All)
            .await
            .map_err(|e| self.escalate(e))?
            .into_keys()
            .collect();
        let mut ordered = Vec::with_capacity(stored.len());
        for &id in &stored {
            ordered.push(self.flush_guard(id).lock_owned().await);
        }
        let newly_locked = if force {
            Vec::new()
        } else {
            self.locks.acquire_many(&stored).await?
        };

        let cleaned = self.backend.clean().await;
        if let Err(e) = self.locks.release_many(&newly_locked).await {
            warn!(registry = %self.registry, error = %e, "Failed to release locks after clean");
        }
        cleaned.map_err(|e| self.escalate(e))?;

        self.cache.lock().await.clear();
        self.incomplete.lock().await.clear();
        drop(ordered);
        std_guard(&self.flush_guards).clear();
        info!(registry = %self.registry, removed = stored.len(), "Registry cleaned");
        Ok(())
    }

    pub async fn other_sessions(&self) -> Result<Vec<SessionStatus>> {
        self.locks.other_sessions().await
    }

    /// Session currently holding the lease on `id`.
    pub async fn lock_owner(&self, id: ObjectId) -> Result<Option<String>> {
        self.locks.owner_of(id).await
    }

    /// Clear the locks and records of dead sessions; returns their ids.
    pub async fn reap_locks(&self) -> Result<Vec<String>> {
        self.locks.reap().await
    }

    /// Locks this session took over from sessions whose lease had expired.
    pub fn takeover_warnings(&self) -> Vec<TakeoverWarning> {
        self.locks.warnings()
    }

    /// Auto-fail jobs left in a transitional state by an interrupted session.
    ///
    /// Returns the ids that were marked failed.
    pub async fn fail_interrupted_jobs(&self) -> Result<Vec<ObjectId>> {
        let entries = self
            .backend
            .list_entries(IndexScope::All)
            .await
            .map_err(|e| self.escalate(e))?;
        let stuck: Vec<ObjectId> = entries
            .iter()
            .filter(|(_, entry)| entry.class_name == "Job")
            .filter(|(_, entry)| {
                entry
                    .get_str("status")
                    .is_some_and(|s| TRANSITIONAL_STATUSES.contains(&s))
            })
            .map(|(id, _)| *id)
            .collect();
        if stuck.is_empty() {
            return Ok(stuck);
        }

        let mut failed = Vec::new();
        for &id in &stuck {
            match self.modify(id, |job| job.set("status", "failed")).await {
                Ok(()) => failed.push(id),
                Err(e) => warn!(registry = %self.registry, id, error = %e, "Cannot auto-fail job"),
            }
        }
        let report = self.flush(&failed).await?;
        let failed: Vec<ObjectId> = report.succeeded;
        warn!(
            registry = %self.registry,
            ids = ?failed,
            "Jobs interrupted in a transitional state were marked failed"
        );
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn context(dir: &TempDir, session: &str) -> RepositoryContext {
        let mut config = RepositoryConfig::file_tree(dir.path());
        config.session_name = Some(session.to_string());
        config.heartbeat_interval = Duration::ZERO;
        config.acquire_timeout = Duration::from_millis(100);
        RepositoryContext::new(config)
    }

    fn job(ctx: &RepositoryContext, name: &str) -> GangaObject {
        let mut job = ctx.plugins.instantiate("jobs", "Job").unwrap();
        job.set("name", name).unwrap();
        job
    }

    #[tokio::test]
    async fn test_add_modify_flush_reopen() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, "alpha");
        let repo = Repository::open(&ctx, "jobs").await.unwrap();
        repo.startup().await.unwrap();

        let id = repo.add(vec![job(&ctx, "first")]).await.unwrap()[0];
        repo.modify(id, |j| j.set("status", "running")).await.unwrap();
        assert_eq!(repo.list_index().await.unwrap()[&id].get_str("status"), Some("running"));

        let report = repo.flush(&[id]).await.unwrap();
        assert!(report.is_complete());
        assert!(!repo.get(id).await.unwrap().is_dirty());
        repo.shutdown().await.unwrap();

        let repo = Repository::open(&ctx, "jobs").await.unwrap();
        repo.startup().await.unwrap();
        let reopened = repo.get(id).await.unwrap();
        assert_eq!(reopened.object().unwrap().get_str("status"), Some("running"));
        repo.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_lazy_load_is_index_only() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, "alpha");
        let writer = Repository::open(&ctx, "jobs").await.unwrap();
        writer.startup().await.unwrap();
        let id = writer.add(vec![job(&ctx, "lazy")]).await.unwrap()[0];
        writer.shutdown().await.unwrap();

        let repo = Repository::open(&ctx, "jobs").await.unwrap();
        repo.startup().await.unwrap();
        let lazy = repo.load(&[id], true).await.unwrap().succeeded.remove(0);
        assert!(!lazy.is_loaded());
        assert_eq!(lazy.index_cache()["name"], "lazy");
        assert_eq!(lazy.object().unwrap_err().error_code(), "NOT_LOADED");

        repo.ensure_loaded(id).await.unwrap();
        let full = repo.load(&[id], true).await.unwrap().succeeded.remove(0);
        assert!(full.is_loaded());
    }

    #[tokio::test]
    async fn test_flush_reports_locked_ids() {
        let dir = TempDir::new().unwrap();
        let ctx_a = context(&dir, "alpha");
        let ctx_b = context(&dir, "beta");
        let a = Repository::open(&ctx_a, "jobs").await.unwrap();
        let b = Repository::open(&ctx_b, "jobs").await.unwrap();
        a.startup().await.unwrap();
        b.startup().await.unwrap();

        let ids = a
            .add(vec![job(&ctx_a, "one"), job(&ctx_a, "two")])
            .await
            .unwrap();
        b.modify(ids[0], |j| j.set("comment", "b")).await.unwrap();
        b.modify(ids[1], |j| j.set("comment", "b")).await.unwrap();

        // `a` keeps the lease on the first id.
        a.locks.acquire(ids[0]).await.unwrap();

        let report = b.flush(&ids).await.unwrap();
        assert_eq!(report.succeeded, vec![ids[1]]);
        assert_eq!(report.failure(ids[0]).unwrap().error_code(), "LOCKED");
    }

    #[tokio::test]
    async fn test_cascade_delete() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, "alpha");
        let repo = Repository::open(&ctx, "jobs").await.unwrap();
        repo.startup().await.unwrap();

        let master = repo.add(vec![job(&ctx, "master")]).await.unwrap()[0];
        let children = repo
            .add_children(master, vec![job(&ctx, "c0"), job(&ctx, "c1")])
            .await
            .unwrap();
        assert_eq!(repo.children(master).await.unwrap().len(), 2);

        assert!(repo.delete(&[master]).await.unwrap().is_complete());
        assert!(repo.list_index().await.unwrap().is_empty());
        for child in children {
            assert_eq!(repo.get(child).await.unwrap_err().error_code(), "NOT_FOUND");
        }
        // Deleting again is a no-op.
        assert!(repo.delete(&[master]).await.unwrap().is_complete());
    }

    #[tokio::test]
    async fn test_startup_check_fails_interrupted_jobs() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, "alpha");
        let (stuck, fine) = {
            let repo = Repository::open(&ctx, "jobs").await.unwrap();
            repo.startup().await.unwrap();
            let ids = repo
                .add(vec![job(&ctx, "stuck"), job(&ctx, "fine")])
                .await
                .unwrap();
            repo.modify(ids[0], |j| j.set("status", "submitting"))
                .await
                .unwrap();
            repo.modify(ids[1], |j| j.set("status", "running"))
                .await
                .unwrap();
            repo.shutdown().await.unwrap();
            (ids[0], ids[1])
        };

        let repo = Repository::open(&ctx, "jobs").await.unwrap();
        repo.startup().await.unwrap();
        let listed = repo.list_index().await.unwrap();
        assert_eq!(listed[&stuck].get_str("status"), Some("failed"));
        assert_eq!(listed[&fine].get_str("status"), Some("running"));
    }

    #[tokio::test]
    async fn test_autoflush_writes_dirty_objects() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir, "alpha");
        ctx.config.autoflush_interval = Some(Duration::from_millis(20));
        let repo = Repository::open(&ctx, "jobs").await.unwrap();
        repo.startup().await.unwrap();

        let id = repo.add(vec![job(&ctx, "auto")]).await.unwrap()[0];
        repo.modify(id, |j| j.set("status", "completed"))
            .await
            .unwrap();

        let mut flushed = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !repo.get(id).await.unwrap().is_dirty() {
                flushed = true;
                break;
            }
        }
        assert!(flushed);
        repo.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_flush_and_delete_of_one_id_are_ordered() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir, "alpha");
        ctx.config.acquire_timeout = Duration::from_secs(5);
        let repo = Repository::open(&ctx, "jobs").await.unwrap();
        repo.startup().await.unwrap();

        for round in 0..40 {
            let id = repo.add(vec![job(&ctx, "raced")]).await.unwrap()[0];
            repo.modify(id, |j| j.set("comment", format!("round {}", round)))
                .await
                .unwrap();

            let flushing = tokio::spawn({
                let repo = repo.clone();
                async move { repo.flush(&[id]).await }
            });
            let deleting = tokio::spawn({
                let repo = repo.clone();
                async move { repo.delete(&[id]).await }
            });
            let (flushed, deleted) = tokio::join!(flushing, deleting);
            let flushed = flushed.unwrap().unwrap();
            assert!(deleted.unwrap().unwrap().is_complete());
            // Either the flush ran first, or it found the object gone.
            if let Some(failure) = flushed.failure(id) {
                assert_eq!(failure.error_code(), "NOT_FOUND");
            }

            let entries = repo.backend().list_entries(IndexScope::All).await.unwrap();
            assert!(!entries.contains_key(&id), "round {} left an index entry", round);
            assert_eq!(repo.get(id).await.unwrap_err().error_code(), "NOT_FOUND");
        }
        assert_eq!(repo.locks.held(), Vec::<ObjectId>::new());
    }

    #[tokio::test]
    async fn test_flush_keeps_lock_taken_by_caller() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, "alpha");
        let repo = Repository::open(&ctx, "jobs").await.unwrap();
        repo.startup().await.unwrap();
        let id = repo.add(vec![job(&ctx, "held")]).await.unwrap()[0];

        assert_eq!(repo.locks.acquire_many(&[id]).await.unwrap(), vec![id]);
        repo.modify(id, |j| j.set("status", "running")).await.unwrap();
        assert!(repo.flush(&[id]).await.unwrap().is_complete());
        assert!(!repo.get(id).await.unwrap().is_dirty());
        assert_eq!(repo.lock_owner(id).await.unwrap().as_deref(), Some("alpha"));

        repo.locks.release_many(&[id]).await.unwrap();
        assert_eq!(repo.lock_owner(id).await.unwrap(), None);
    }
}
