// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage backends.
//!
//! Both backends implement [`StorageBackend`] so the repository façade does
//! not depend on where objects live:
//! - [`FileTreeBackend`]: sharded directory tree of payload and index files
//! - [`DocumentBackend`]: document collections in a SQLite database

mod document;
mod file_tree;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::ObjectId;
use crate::config::{BackendKind, RepositoryConfig};
use crate::container;
use crate::error::{BatchReport, RepoError, Result};
use crate::index::IndexEntry;
use crate::lock::LeaseStore;
use crate::object::{ManagedObject, NewObject};
use crate::plugins::PluginRegistry;

pub use document::{DocumentBackend, DocumentStore};
pub use file_tree::FileTreeBackend;

/// Which index entries a listing returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexScope {
    /// Objects without a master (the default listing).
    TopLevel,
    /// Every live object.
    All,
    /// Sub-objects of the given master.
    ChildrenOf(ObjectId),
}

impl IndexScope {
    pub fn matches(&self, entry: &IndexEntry) -> bool {
        match self {
            IndexScope::TopLevel => entry.master_id.is_none(),
            IndexScope::All => true,
            IndexScope::ChildrenOf(master) => entry.master_id == Some(*master),
        }
    }
}

/// Persistence contract shared by every backend.
///
/// One backend instance serves one registry (`jobs`, `templates`,
/// `jobs.metadata`, ...).
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the registry this backend stores.
    fn registry(&self) -> &str;

    /// Open or create the store and build its index.
    ///
    /// Fails with a repository error if the location is unusable.
    async fn startup(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;

    /// Persist new objects, returning their ids in input order.
    ///
    /// Payload and index of each object land together or not at all.
    async fn add(&self, objects: Vec<NewObject>) -> Result<Vec<ObjectId>>;

    /// Load and decode objects; unknown or unreadable ids are reported per id.
    async fn load(&self, ids: &[ObjectId]) -> Result<BatchReport<ManagedObject>>;

    /// Write back loaded objects together with a recomputed index.
    async fn flush(&self, objects: &[ManagedObject]) -> Result<BatchReport<ObjectId>>;

    /// Tombstone objects. Deleting an absent id succeeds.
    async fn delete(&self, ids: &[ObjectId]) -> Result<BatchReport<ObjectId>>;

    /// Index entries of live objects in `scope`, without decoding payloads.
    async fn list_entries(&self, scope: IndexScope) -> Result<BTreeMap<ObjectId, IndexEntry>>;

    /// Index of every live top-level object.
    async fn list_index(&self) -> Result<BTreeMap<ObjectId, IndexEntry>> {
        self.list_entries(IndexScope::TopLevel).await
    }

    /// Regenerate every index entry from its payload; returns the count.
    async fn rebuild_index(&self) -> Result<usize>;

    /// Remove every object, index entry and tombstone of the registry and
    /// restart id allocation at 0. Session and lock records are kept.
    async fn clean(&self) -> Result<()>;

    /// Lease records for this registry, kept in the same medium.
    fn lease_store(&self) -> Arc<dyn LeaseStore>;
}

/// Construct the backend selected by `config` for `registry`.
pub async fn open_backend(
    config: &RepositoryConfig,
    plugins: Arc<PluginRegistry>,
    registry: &str,
) -> Result<Arc<dyn StorageBackend>> {
    match config.backend {
        BackendKind::FileTree => Ok(Arc::new(FileTreeBackend::new(
            &config.location,
            registry,
            plugins,
            config.retry.clone(),
        ))),
        BackendKind::DocumentStore => {
            if config.document.url.is_none() {
                tokio::fs::create_dir_all(&config.location)
                    .await
                    .map_err(|e| RepoError::repository(registry, "startup", e.to_string()))?;
            }
            let store = DocumentStore::connect_lazy(&config.document_url())?;
            let controller = container::from_config(&config.document.controller);
            Ok(Arc::new(
                DocumentBackend::new(store, registry, plugins, config.retry.clone())
                    .with_controller(controller)
                    .with_lease_timeout(config.lease_timeout),
            ))
        }
    }
}
