// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lease protocol tests over the document-store lease tables.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use common::{file_tree_context, jobs, memory_store, open_file_tree};
use ganga_repository::{RepoError, StorageBackend};
use ganga_repository::lock::{LockSettings, SessionIdentity, SessionLockManager, SqliteLeaseStore};
use ganga_repository::storage::DocumentStore;

fn settings(lease_ms: u64, acquire_ms: u64) -> LockSettings {
    LockSettings {
        lease_timeout: Duration::from_millis(lease_ms),
        acquire_timeout: Duration::from_millis(acquire_ms),
        heartbeat_interval: Duration::ZERO,
    }
}

async fn migrated_store() -> DocumentStore {
    let store = memory_store().await;
    store.migrate().await.expect("Failed to run migrations");
    store
}

async fn manager(
    store: &DocumentStore,
    collection: &str,
    name: &str,
    settings: LockSettings,
) -> SessionLockManager {
    let leases = SqliteLeaseStore::new(store.pool().clone(), collection);
    let manager = SessionLockManager::new(
        collection,
        Arc::new(leases),
        SessionIdentity::named(name),
        settings,
    );
    manager.start().await.expect("Failed to register session");
    manager
}

#[tokio::test]
async fn test_lock_conflict_names_owner() {
    let store = migrated_store().await;
    let a = manager(&store, "jobs", "a", settings(30_000, 50)).await;
    let b = manager(&store, "jobs", "b", settings(30_000, 50)).await;

    a.acquire(7).await.unwrap();
    match b.acquire(7).await {
        Err(RepoError::Locked { id, owner, .. }) => {
            assert_eq!(id, 7);
            assert_eq!(owner, "a");
        }
        other => panic!("expected a lock conflict, got {:?}", other),
    }
    // Re-acquiring an own lock is fine.
    a.acquire(7).await.unwrap();

    a.release(7).await.unwrap();
    b.acquire(7).await.unwrap();
    assert_eq!(a.owner_of(7).await.unwrap().as_deref(), Some("b"));
}

#[tokio::test]
async fn test_expired_lease_taken_over_with_warning() {
    let store = migrated_store().await;
    let stale = manager(&store, "jobs", "stale", settings(100, 50)).await;
    stale.acquire_many(&[3, 4]).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let fresh = manager(&store, "jobs", "fresh", settings(100, 50)).await;
    fresh.acquire(4).await.unwrap();

    let warnings = fresh.warnings();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].id, 4);
    assert_eq!(warnings[0].previous_owner, "stale");
    assert_eq!(fresh.owner_of(4).await.unwrap().as_deref(), Some("fresh"));

    // The old holder learns about the takeover on its next heartbeat.
    stale.heartbeat().await.unwrap();
    assert_eq!(stale.held(), vec![3]);
}

#[tokio::test]
async fn test_collections_do_not_share_leases() {
    let store = migrated_store().await;
    let jobs = manager(&store, "jobs", "a", settings(30_000, 50)).await;
    let templates = manager(&store, "templates", "b", settings(30_000, 50)).await;

    jobs.acquire(1).await.unwrap();
    templates.acquire(1).await.unwrap();
    assert!(jobs.other_sessions().await.unwrap().is_empty());

    // Same session name in another collection is a separate registration.
    let other = manager(&store, "templates", "a", settings(30_000, 50)).await;
    assert_eq!(other.other_sessions().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_reap_clears_dead_sessions() {
    let store = migrated_store().await;
    let dead = manager(&store, "jobs", "dead", settings(100, 50)).await;
    dead.acquire_many(&[1, 2]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let live = manager(&store, "jobs", "live", settings(100, 50)).await;
    let others = live.other_sessions().await.unwrap();
    assert_eq!(others.len(), 1);
    assert!(!others[0].alive);
    assert_eq!(others[0].held_object_ids, vec![1, 2]);

    assert_eq!(live.reap().await.unwrap(), vec!["dead".to_string()]);
    assert!(live.other_sessions().await.unwrap().is_empty());
    assert_eq!(live.owner_of(1).await.unwrap(), None);
}

#[tokio::test]
async fn test_crashed_session_locks_reclaimed_on_restart() {
    let dir = TempDir::new().unwrap();
    let mut ctx = file_tree_context(&dir, "analysis");
    ctx.config.lease_timeout = Duration::from_millis(100);

    let repo = open_file_tree(&ctx, "jobs").await;
    let ids = repo.add(jobs(&ctx.plugins, 2)).await.unwrap();
    let crashed = SessionLockManager::new(
        "jobs",
        repo.backend().lease_store(),
        SessionIdentity::named("analysis"),
        settings(100, 50),
    );
    // Simulate a crash: the lock stays behind with no shutdown.
    crashed.try_acquire(ids[0]).await.unwrap();
    drop(crashed);
    drop(repo);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut ctx = file_tree_context(&dir, "analysis");
    ctx.config.lease_timeout = Duration::from_millis(100);
    let restarted = open_file_tree(&ctx, "jobs").await;
    assert_eq!(restarted.lock_owner(ids[0]).await.unwrap(), None);
    restarted
        .modify(ids[0], |j| j.set("comment", "after crash"))
        .await
        .unwrap();
    assert!(restarted.flush(&[ids[0]]).await.unwrap().is_complete());
}
