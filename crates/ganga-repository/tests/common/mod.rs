// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for ganga-repository integration tests.
//!
//! Provides repository contexts rooted in temporary directories and
//! in-memory document stores.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;
use tempfile::TempDir;

use ganga_repository::retry::RetryPolicy;
use ganga_repository::schema::{FieldType, ObjectRef, Value};
use ganga_repository::storage::{DocumentBackend, DocumentStore, FileTreeBackend};
use ganga_repository::{GangaObject, PluginRegistry, Repository, RepositoryConfig, RepositoryContext};

/// File-tree context for session `name` with the heartbeat task disabled.
pub fn file_tree_context(dir: &TempDir, name: &str) -> RepositoryContext {
    let mut config = RepositoryConfig::file_tree(dir.path());
    config.session_name = Some(name.to_string());
    config.heartbeat_interval = Duration::ZERO;
    config.acquire_timeout = Duration::from_millis(200);
    config.retry = RetryPolicy::none();
    RepositoryContext::new(config)
}

/// Open and start a file-tree repository for `registry`.
pub async fn open_file_tree(ctx: &RepositoryContext, registry: &str) -> Arc<Repository> {
    let repo = Repository::open(ctx, registry)
        .await
        .expect("Failed to open repository");
    repo.startup().await.expect("Failed to start repository");
    repo
}

/// Bare file-tree backend over the same location as `ctx`, for poking at files.
pub fn file_tree_backend(ctx: &RepositoryContext, registry: &str) -> FileTreeBackend {
    FileTreeBackend::new(
        &ctx.config.location,
        registry,
        ctx.plugins.clone(),
        RetryPolicy::none(),
    )
}

/// Fresh in-memory document store.
///
/// A single connection keeps every query on the same in-memory database.
pub async fn memory_store() -> DocumentStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to open in-memory database");
    DocumentStore::from_pool(pool)
}

/// Document-store context for session `name`.
pub fn document_context(dir: &TempDir, name: &str) -> RepositoryContext {
    let mut ctx = file_tree_context(dir, name);
    ctx.config.backend = ganga_repository::BackendKind::DocumentStore;
    ctx
}

/// Open and start a document-store repository on `store`.
pub async fn open_document(
    ctx: &RepositoryContext,
    store: &DocumentStore,
    registry: &str,
) -> Arc<Repository> {
    let backend = DocumentBackend::new(
        store.clone(),
        registry,
        ctx.plugins.clone(),
        RetryPolicy::none(),
    )
    .with_lease_timeout(ctx.config.lease_timeout);
    let repo = Repository::with_backend(ctx, Arc::new(backend));
    repo.startup().await.expect("Failed to start repository");
    repo
}

/// A `Job` named `name` from the built-in plugin set.
pub fn job(plugins: &PluginRegistry, name: &str) -> GangaObject {
    let mut job = plugins
        .instantiate("jobs", "Job")
        .expect("Job class is built in");
    job.set("name", name).expect("name is a string field");
    job
}

/// `count` jobs named `job-0`, `job-1`, ...
pub fn jobs(plugins: &PluginRegistry, count: usize) -> Vec<GangaObject> {
    (0..count).map(|i| job(plugins, &format!("job-{}", i))).collect()
}

/// A representative value of one `ty` item.
fn sample_item(plugins: &PluginRegistry, ty: &FieldType, hint: &str, depth: usize) -> Value {
    match ty {
        FieldType::Bool => Value::Bool(true),
        FieldType::Int => Value::Int(-42),
        FieldType::Float => Value::Float(0.125),
        FieldType::Str => Value::from(format!("{} \u{e9}\"quoted\"", hint)),
        FieldType::Map => Value::Map(BTreeMap::from([
            ("count".to_string(), Value::Int(3)),
            ("ratio".to_string(), Value::Float(2.5)),
            ("flag".to_string(), Value::Bool(false)),
            ("empty".to_string(), Value::Null),
            ("files".to_string(), Value::List(vec![Value::from("a"), Value::from("b")])),
            (
                "nested".to_string(),
                Value::Map(BTreeMap::from([("key".to_string(), Value::from(hint))])),
            ),
        ])),
        FieldType::Component { category } => {
            let class = plugins
                .classes()
                .into_iter()
                .find(|c| &c.category == category)
                .expect("every component category has a class");
            if depth == 0 {
                Value::Null
            } else {
                Value::from(populated(plugins, category, &class.name, depth - 1))
            }
        }
        FieldType::BackRef { category } => Value::Ref(ObjectRef {
            id: 7,
            category: category.clone(),
        }),
    }
}

/// An instance of `category/name` with every persisted field set to a
/// non-default value; components are filled up to `depth` levels.
pub fn populated(plugins: &PluginRegistry, category: &str, name: &str, depth: usize) -> GangaObject {
    let class = plugins.resolve(category, name).expect("class is registered");
    let mut object = plugins.instantiate(category, name).expect("class is registered");
    for field in class.fields.iter().filter(|f| !f.transient) {
        let hint = format!("{}.{}", name, field.name);
        let value = if field.sequence {
            Value::List(vec![
                sample_item(plugins, &field.ty, &hint, depth),
                sample_item(plugins, &field.ty, &format!("{} #2", hint), depth),
            ])
        } else {
            sample_item(plugins, &field.ty, &hint, depth)
        };
        object.set(&field.name, value).expect("sample value fits the schema");
    }
    object
}
