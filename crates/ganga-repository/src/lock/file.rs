// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lease records as plain files.
//!
//! Sessions are `<sessions>/<session_id>.session` JSON files, replaced by
//! rename on every heartbeat. Locks are `<locks>/<id>.lock` files created with
//! `O_EXCL` and holding the owner's session id. Taking over a stale lock
//! renames it aside first, so only one contender can win the takeover.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ClaimOutcome, LeaseStore, SessionRecord};
use crate::ObjectId;
use crate::error::Result;

const SESSION_SUFFIX: &str = ".session";
const LOCK_SUFFIX: &str = ".lock";
const CLAIM_ATTEMPTS: usize = 3;

/// File-based lease store for one registry.
#[derive(Debug, Clone)]
pub struct FileLeaseStore {
    sessions_dir: PathBuf,
    locks_dir: PathBuf,
}

impl FileLeaseStore {
    /// Both directories belong to a single registry, so every registry a
    /// process opens registers its own session file.
    pub fn new(sessions_dir: impl Into<PathBuf>, locks_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions_dir: sessions_dir.into(),
            locks_dir: locks_dir.into(),
        }
    }

    /// Create the directories if needed.
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.sessions_dir).await?;
        fs::create_dir_all(&self.locks_dir).await?;
        Ok(())
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir
            .join(format!("{}{}", session_id, SESSION_SUFFIX))
    }

    fn lock_path(&self, id: ObjectId) -> PathBuf {
        self.locks_dir.join(format!("{}{}", id, LOCK_SUFFIX))
    }

    /// Whether `owner`'s lease is still valid.
    async fn owner_alive(&self, owner: &str, stale_before: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .read_session(owner)
            .await?
            .is_some_and(|record| record.is_alive(stale_before)))
    }
}

async fn create_lock(path: &Path, session_id: &str) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(session_id.as_bytes()).await?;
    file.sync_all().await?;
    Ok(())
}

/// Owner recorded in a lock file, with the file's modification time.
async fn read_lock(path: &Path) -> Result<Option<(String, DateTime<Utc>)>> {
    let contents = match fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let modified = match fs::metadata(path).await {
        Ok(meta) => meta.modified().map(DateTime::<Utc>::from)?,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some((contents.trim().to_string(), modified)))
}

async fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl LeaseStore for FileLeaseStore {
    async fn write_session(&self, record: &SessionRecord) -> Result<()> {
        let path = self.session_path(&record.session_id);
        let tmp = self
            .sessions_dir
            .join(format!(".{}.{}.tmp", record.session_id, Uuid::new_v4().simple()));
        fs::write(&tmp, serde_json::to_vec(record)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let bytes = match fs::read(self.session_path(session_id)).await {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(session_id, error = %e, "Unreadable session file, treating session as dead");
                Ok(None)
            }
        }
    }

    async fn remove_session(&self, session_id: &str) -> Result<()> {
        remove_if_exists(&self.session_path(session_id)).await?;
        Ok(())
    }

    async fn sessions(&self) -> Result<Vec<SessionRecord>> {
        let mut records = Vec::new();
        let mut entries = match fs::read_dir(&self.sessions_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(session_id) = name.to_str().and_then(|n| n.strip_suffix(SESSION_SUFFIX))
            else {
                continue;
            };
            if let Some(record) = self.read_session(session_id).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(records)
    }

    async fn claim(
        &self,
        id: ObjectId,
        session_id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let path = self.lock_path(id);

        for _ in 0..CLAIM_ATTEMPTS {
            match create_lock(&path, session_id).await {
                Ok(()) => return Ok(ClaimOutcome::Acquired),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            let Some((owner, modified)) = read_lock(&path).await? else {
                continue;
            };
            if owner == session_id {
                return Ok(ClaimOutcome::AlreadyHeld);
            }
            // An empty lock file is still being written unless it is old.
            let stale = if owner.is_empty() {
                modified < stale_before
            } else {
                !self.owner_alive(&owner, stale_before).await?
            };
            if !stale {
                return Ok(ClaimOutcome::Held { owner });
            }

            let aside = self
                .locks_dir
                .join(format!(".{}.{}.stale", id, Uuid::new_v4().simple()));
            match fs::rename(&path, &aside).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
            let moved = fs::read_to_string(&aside).await.unwrap_or_default();
            if moved.trim() != owner {
                // Someone else reassigned the lock between our read and rename.
                if fs::hard_link(&aside, &path).await.is_err() {
                    debug!(id, "Lock slot refilled while restoring a moved lock");
                }
                remove_if_exists(&aside).await?;
                return Ok(ClaimOutcome::Held {
                    owner: moved.trim().to_string(),
                });
            }
            remove_if_exists(&aside).await?;

            match create_lock(&path, session_id).await {
                Ok(()) => return Ok(ClaimOutcome::Reassigned { previous: owner }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let owner = read_lock(&path)
            .await?
            .map(|(owner, _)| owner)
            .unwrap_or_default();
        Ok(ClaimOutcome::Held { owner })
    }

    async fn release(&self, id: ObjectId, session_id: &str) -> Result<bool> {
        let path = self.lock_path(id);
        match read_lock(&path).await? {
            Some((owner, _)) if owner == session_id => Ok(remove_if_exists(&path).await?),
            _ => Ok(false),
        }
    }

    async fn owner_of(&self, id: ObjectId) -> Result<Option<String>> {
        Ok(read_lock(&self.lock_path(id))
            .await?
            .map(|(owner, _)| owner)
            .filter(|owner| !owner.is_empty()))
    }

    async fn held_by(&self, session_id: &str) -> Result<Vec<ObjectId>> {
        let mut held = Vec::new();
        let mut entries = match fs::read_dir(&self.locks_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(held),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_suffix(LOCK_SUFFIX))
                .and_then(|n| n.parse::<ObjectId>().ok())
            else {
                continue;
            };
            if let Some((owner, _)) = read_lock(&entry.path()).await?
                && owner == session_id
            {
                held.push(id);
            }
        }
        held.sort_unstable();
        Ok(held)
    }

    async fn clear_session_locks(&self, session_id: &str) -> Result<Vec<ObjectId>> {
        let mut freed = Vec::new();
        for id in self.held_by(session_id).await? {
            if self.release(id, session_id).await? {
                freed.push(id);
            }
        }
        Ok(freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::SessionIdentity;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> FileLeaseStore {
        let store = FileLeaseStore::new(dir.path().join("sessions"), dir.path().join("locks"));
        store.init().await.unwrap();
        store
    }

    async fn register(store: &FileLeaseStore, name: &str, heartbeat: DateTime<Utc>) -> String {
        let mut record = SessionRecord::new(&SessionIdentity::named(name), heartbeat);
        record.heartbeat = heartbeat;
        store.write_session(&record).await.unwrap();
        record.session_id
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let a = register(&store, "alpha", Utc::now()).await;
        register(&store, "beta", Utc::now()).await;

        assert_eq!(store.read_session(&a).await.unwrap().unwrap().session_id, a);
        assert_eq!(store.sessions().await.unwrap().len(), 2);

        store.remove_session(&a).await.unwrap();
        assert!(store.read_session(&a).await.unwrap().is_none());
        store.remove_session(&a).await.unwrap();
    }

    #[tokio::test]
    async fn test_claim_and_release() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let now = Utc::now();
        let stale_before = now - chrono::Duration::seconds(30);
        let a = register(&store, "alpha", now).await;
        let b = register(&store, "beta", now).await;

        assert_eq!(store.claim(1, &a, stale_before).await.unwrap(), ClaimOutcome::Acquired);
        assert_eq!(store.claim(1, &a, stale_before).await.unwrap(), ClaimOutcome::AlreadyHeld);
        assert_eq!(
            store.claim(1, &b, stale_before).await.unwrap(),
            ClaimOutcome::Held { owner: a.clone() }
        );
        assert_eq!(store.owner_of(1).await.unwrap(), Some(a.clone()));
        assert_eq!(store.held_by(&a).await.unwrap(), vec![1]);

        assert!(!store.release(1, &b).await.unwrap());
        assert!(store.release(1, &a).await.unwrap());
        assert!(!store.release(1, &a).await.unwrap());
        assert_eq!(store.owner_of(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stale_owner_is_reassigned() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let now = Utc::now();
        let dead = register(&store, "dead", now - chrono::Duration::seconds(120)).await;
        let live = register(&store, "live", now).await;
        let stale_before = now - chrono::Duration::seconds(30);

        assert_eq!(
            store.claim(4, &dead, now - chrono::Duration::seconds(600)).await.unwrap(),
            ClaimOutcome::Acquired
        );
        assert_eq!(
            store.claim(4, &live, stale_before).await.unwrap(),
            ClaimOutcome::Reassigned { previous: dead.clone() }
        );
        assert_eq!(store.owner_of(4).await.unwrap(), Some(live));
        assert!(store.held_by(&dead).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_session_counts_as_dead() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let now = Utc::now();
        let live = register(&store, "live", now).await;
        fs::write(store.lock_path(9), "vanished-session").await.unwrap();

        assert_eq!(
            store
                .claim(9, &live, now - chrono::Duration::seconds(30))
                .await
                .unwrap(),
            ClaimOutcome::Reassigned {
                previous: "vanished-session".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_clear_session_locks() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let now = Utc::now();
        let stale_before = now - chrono::Duration::seconds(30);
        let a = register(&store, "alpha", now).await;
        let b = register(&store, "beta", now).await;
        for id in [3, 1, 2] {
            store.claim(id, &a, stale_before).await.unwrap();
        }
        store.claim(7, &b, stale_before).await.unwrap();

        assert_eq!(store.clear_session_locks(&a).await.unwrap(), vec![1, 2, 3]);
        assert_eq!(store.held_by(&b).await.unwrap(), vec![7]);
    }
}
