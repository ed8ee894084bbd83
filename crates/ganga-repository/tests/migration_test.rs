// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Migration from a file-tree repository into a document store.

mod common;

use std::sync::Arc;

use tempfile::TempDir;

use common::{file_tree_backend, file_tree_context, job, jobs, open_file_tree};
use ganga_repository::migration::{self, DEFAULT_REGISTRIES};
use ganga_repository::retry::RetryPolicy;
use ganga_repository::storage::{DocumentBackend, DocumentStore};
use ganga_repository::{IndexScope, PluginRegistry, StorageBackend};

#[tokio::test]
async fn test_migrate_location_into_document_store() {
    let dir = TempDir::new().unwrap();
    let ctx = file_tree_context(&dir, "alpha");

    let (master, children, plain, broken) = {
        let repo = open_file_tree(&ctx, "jobs").await;
        let master = repo.add(vec![job(&ctx.plugins, "split")]).await.unwrap()[0];
        let children = repo
            .add_children(master, jobs(&ctx.plugins, 2))
            .await
            .unwrap();
        let rest = repo
            .add(vec![job(&ctx.plugins, "plain"), job(&ctx.plugins, "broken")])
            .await
            .unwrap();
        repo.modify(rest[0], |j| j.set("status", "completed"))
            .await
            .unwrap();
        repo.shutdown().await.unwrap();

        let metadata = open_file_tree(&ctx, "jobs.metadata").await;
        metadata.add(vec![job(&ctx.plugins, "meta")]).await.unwrap();
        metadata.shutdown().await.unwrap();

        (master, children, rest[0], rest[1])
    };

    let source = file_tree_backend(&ctx, "jobs");
    tokio::fs::write(source.data_path(broken), b"\x00\x01").await.unwrap();

    let url = format!("sqlite:{}", dir.path().join("migrated.sqlite").display());
    let reports = migration::migrate_location(
        &ctx.config,
        &url,
        &[],
        Arc::new(PluginRegistry::with_builtins()),
    )
    .await
    .unwrap();

    // Registries missing from the source are skipped.
    assert!(DEFAULT_REGISTRIES.len() > reports.len());
    let registries: Vec<&str> = reports.iter().map(|r| r.registry.as_str()).collect();
    assert_eq!(registries, vec!["jobs", "jobs.metadata"]);

    let jobs_report = &reports[0];
    assert_eq!(jobs_report.migrated.len(), 2);
    assert_eq!(jobs_report.objects_written(), 4);
    assert_eq!(jobs_report.failures.len(), 1);
    assert_eq!(jobs_report.failures[0].old_id, broken);
    assert!(!jobs_report.is_complete());
    assert_eq!(reports[1].objects_written(), 1);

    let dest = DocumentBackend::new(
        DocumentStore::connect_lazy(&url).unwrap(),
        "jobs",
        Arc::new(PluginRegistry::with_builtins()),
        RetryPolicy::none(),
    );
    dest.startup().await.unwrap();

    let new_master = jobs_report.new_id_of(master).unwrap();
    let new_plain = jobs_report.new_id_of(plain).unwrap();
    let top = dest.list_index().await.unwrap();
    assert_eq!(top.len(), 2);
    assert_eq!(top[&new_master].get_str("name"), Some("split"));
    assert_eq!(top[&new_plain].get_str("status"), Some("completed"));

    let migrated_children = dest
        .list_entries(IndexScope::ChildrenOf(new_master))
        .await
        .unwrap();
    let expected: Vec<_> = children
        .iter()
        .map(|c| jobs_report.new_id_of(*c).unwrap())
        .collect();
    assert_eq!(migrated_children.keys().copied().collect::<Vec<_>>(), expected);
    for entry in migrated_children.values() {
        assert_eq!(entry.master_id, Some(new_master));
    }

    let loaded = dest.load(&expected).await.unwrap();
    assert!(loaded.is_complete());
    assert_eq!(
        loaded.succeeded[1].object().unwrap().get_str("name"),
        Some("job-1")
    );
}

#[tokio::test]
async fn test_migrate_named_registry_only() {
    let dir = TempDir::new().unwrap();
    let ctx = file_tree_context(&dir, "alpha");
    for registry in ["jobs", "templates.metadata"] {
        let repo = open_file_tree(&ctx, registry).await;
        repo.add(jobs(&ctx.plugins, 2)).await.unwrap();
        repo.shutdown().await.unwrap();
    }

    let url = format!("sqlite:{}", dir.path().join("named.sqlite").display());
    let reports = migration::migrate_location(
        &ctx.config,
        &url,
        &["templates.metadata".to_string()],
        ctx.plugins.clone(),
    )
    .await
    .unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].registry, "templates.metadata");
    assert!(reports[0].is_complete());

    let store = DocumentStore::connect_lazy(&url).unwrap();
    let migrated: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE collection = 'jobs'")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(migrated, 0);
}
