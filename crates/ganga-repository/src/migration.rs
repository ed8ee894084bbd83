// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Migration of registries between storage backends.
//!
//! Objects are copied master by master: each top-level object is read with
//! its sub-objects and written to the destination, which assigns fresh ids.
//! Sub-objects are re-parented to the new master id and every index entry is
//! derived again from the payload. Unreadable objects are recorded in the
//! report and skipped.
//!
//! Migration is an offline operation: no other session should be using the
//! source while it runs.

use std::sync::Arc;

use tracing::{info, warn};

use crate::ObjectId;
use crate::config::RepositoryConfig;
use crate::error::{RepoError, Result};
use crate::object::NewObject;
use crate::plugins::PluginRegistry;
use crate::storage::{DocumentBackend, DocumentStore, FileTreeBackend, IndexScope, StorageBackend};

/// Registries migrated when none are named: jobs followed by the metadata
/// registries of jobs, templates and preparable objects.
pub const DEFAULT_REGISTRIES: &[&str] = &[
    "jobs",
    "jobs.metadata",
    "templates.metadata",
    "prep.metadata",
];

/// Old and new id of one migrated top-level object and its sub-objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigratedObject {
    pub old_id: ObjectId,
    pub new_id: ObjectId,
    /// `(old, new)` id pairs of the sub-objects, in ascending old-id order.
    pub children: Vec<(ObjectId, ObjectId)>,
}

/// An object that could not be migrated.
#[derive(Debug)]
pub struct MigrationFailure {
    pub old_id: ObjectId,
    pub error: RepoError,
}

/// Outcome of migrating one registry.
#[derive(Debug, Default)]
pub struct MigrationReport {
    pub registry: String,
    pub migrated: Vec<MigratedObject>,
    pub failures: Vec<MigrationFailure>,
}

impl MigrationReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of objects written, sub-objects included.
    pub fn objects_written(&self) -> usize {
        self.migrated.iter().map(|m| 1 + m.children.len()).sum()
    }

    pub fn new_id_of(&self, old_id: ObjectId) -> Option<ObjectId> {
        self.migrated.iter().find_map(|m| {
            if m.old_id == old_id {
                return Some(m.new_id);
            }
            m.children
                .iter()
                .find(|(old, _)| *old == old_id)
                .map(|(_, new)| *new)
        })
    }
}

/// Copy every top-level object of `source`, with its sub-objects, into `dest`.
///
/// Per-object failures are collected in the report; only backend-wide
/// failures abort the migration.
pub async fn migrate(
    source: &dyn StorageBackend,
    dest: &dyn StorageBackend,
) -> Result<MigrationReport> {
    let mut report = MigrationReport {
        registry: source.registry().to_string(),
        ..Default::default()
    };

    let masters = source.list_index().await?;
    info!(
        registry = %report.registry,
        masters = masters.len(),
        "Starting migration"
    );

    for (&old_id, entry) in &masters {
        if let Some(reason) = &entry.error {
            report.failures.push(MigrationFailure {
                old_id,
                error: RepoError::inaccessible(
                    source.registry(),
                    old_id,
                    RepoError::corrupt(reason.clone()),
                ),
            });
            continue;
        }
        match migrate_master(source, dest, old_id, &mut report.failures).await {
            Ok(migrated) => report.migrated.push(migrated),
            Err(e) if e.is_fatal() => return Err(e),
            Err(error) => {
                warn!(registry = %report.registry, id = old_id, error = %error, "Skipping object");
                report.failures.push(MigrationFailure { old_id, error });
            }
        }
    }

    info!(
        registry = %report.registry,
        migrated = report.migrated.len(),
        objects = report.objects_written(),
        failed = report.failures.len(),
        "Migration finished"
    );
    Ok(report)
}

async fn migrate_master(
    source: &dyn StorageBackend,
    dest: &dyn StorageBackend,
    old_id: ObjectId,
    failures: &mut Vec<MigrationFailure>,
) -> Result<MigratedObject> {
    let mut loaded = source.load(&[old_id]).await?;
    if let Some(failure) = loaded.failed.pop() {
        return Err(failure.error);
    }
    let master = loaded
        .succeeded
        .pop()
        .and_then(|m| m.into_object())
        .ok_or_else(|| RepoError::not_found(source.registry(), old_id))?;

    let child_ids: Vec<ObjectId> = source
        .list_entries(IndexScope::ChildrenOf(old_id))
        .await?
        .into_keys()
        .collect();
    let children = source.load(&child_ids).await?;
    for failure in children.failed {
        warn!(
            registry = %source.registry(),
            id = failure.id,
            master = old_id,
            error = %failure.error,
            "Skipping unreadable sub-object"
        );
        failures.push(MigrationFailure {
            old_id: failure.id,
            error: failure.error,
        });
    }

    let new_id = dest
        .add(vec![NewObject::top_level(master)])
        .await?
        .pop()
        .ok_or_else(|| RepoError::repository(dest.registry(), "migrate", "no id assigned"))?;

    let mut old_child_ids = Vec::with_capacity(children.succeeded.len());
    let mut new_children = Vec::with_capacity(children.succeeded.len());
    for child in children.succeeded {
        let child_id = child.id();
        let Some(mut object) = child.into_object() else {
            continue;
        };
        object.remap_refs(old_id, new_id);
        old_child_ids.push(child_id);
        new_children.push(NewObject::child_of(new_id, object));
    }
    let new_child_ids = if new_children.is_empty() {
        Vec::new()
    } else {
        dest.add(new_children).await?
    };

    Ok(MigratedObject {
        old_id,
        new_id,
        children: old_child_ids.into_iter().zip(new_child_ids).collect(),
    })
}

/// Migrate `registries` (or [`DEFAULT_REGISTRIES`]) from the file tree at
/// `config.location` into the document store at `dest_url`.
///
/// Registries without a directory in the source are skipped.
pub async fn migrate_location(
    config: &RepositoryConfig,
    dest_url: &str,
    registries: &[String],
    plugins: Arc<PluginRegistry>,
) -> Result<Vec<MigrationReport>> {
    let registries: Vec<String> = if registries.is_empty() {
        DEFAULT_REGISTRIES.iter().map(|r| r.to_string()).collect()
    } else {
        registries.to_vec()
    };
    let store = DocumentStore::connect_lazy(dest_url)?;

    let mut reports = Vec::with_capacity(registries.len());
    for registry in &registries {
        let source = FileTreeBackend::new(
            &config.location,
            registry,
            plugins.clone(),
            config.retry.clone(),
        );
        if !tokio::fs::try_exists(source.root()).await? {
            info!(registry = %registry, "Nothing to migrate");
            continue;
        }
        let dest = DocumentBackend::new(store.clone(), registry, plugins.clone(), config.retry.clone());

        source.startup().await?;
        dest.startup().await?;
        let report = migrate(&source, &dest).await;
        source.shutdown().await?;
        reports.push(report?);
    }
    Ok(reports)
}
