// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session lock manager.
//!
//! Sessions (one per process holding a repository open) advertise liveness by
//! refreshing a heartbeat stored next to the data they protect. Per-object
//! locks are leases: a lock held by a session whose heartbeat is older than
//! the lease timeout may be taken over by any other session.
//!
//! The lease records live in the storage medium itself, behind the
//! [`LeaseStore`] trait:
//! - [`FileLeaseStore`]: session files and `create_new` lock files
//! - [`SqliteLeaseStore`]: `sessions` and `locks` tables

mod file;
mod manager;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ObjectId;
use crate::error::Result;

pub use file::FileLeaseStore;
pub use manager::{LockSettings, SessionLockManager, SessionStatus, TakeoverWarning};
pub use sqlite::SqliteLeaseStore;

/// Identity of the current process's session.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    /// Stable session name; a restarted process reusing it reclaims its locks.
    pub session_id: String,
    /// Distinguishes this run from an earlier run under the same name.
    pub token: Uuid,
    pub host: String,
    pub pid: u32,
}

impl SessionIdentity {
    /// Fresh identity of the form `<host>.<pid>.<random>`.
    pub fn generate() -> Self {
        let host = hostname();
        let pid = std::process::id();
        let token = Uuid::new_v4();
        let short = token.simple().to_string();
        Self {
            session_id: format!("{}.{}.{}", host, pid, &short[..8]),
            token,
            host,
            pid,
        }
    }

    /// Identity with an explicit, stable name.
    pub fn named(name: &str) -> Self {
        let session_id = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        Self {
            session_id,
            token: Uuid::new_v4(),
            host: hostname(),
            pid: std::process::id(),
        }
    }
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .map(|h| h.to_string_lossy().into_owned())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Persisted liveness record of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub token: Uuid,
    pub host: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub heartbeat: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(identity: &SessionIdentity, now: DateTime<Utc>) -> Self {
        Self {
            session_id: identity.session_id.clone(),
            token: identity.token,
            host: identity.host.clone(),
            pid: identity.pid,
            started_at: now,
            heartbeat: now,
        }
    }

    /// A session is alive while its heartbeat is not older than `stale_before`.
    pub fn is_alive(&self, stale_before: DateTime<Utc>) -> bool {
        self.heartbeat >= stale_before
    }
}

/// Result of a single attempt to claim an object lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The lock was free and now belongs to the caller.
    Acquired,
    /// The caller already held the lock.
    AlreadyHeld,
    /// The previous owner's lease had expired; the lock was taken over.
    Reassigned { previous: String },
    /// A live session holds the lock.
    Held { owner: String },
}

/// Lease records persisted in the storage medium.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Create or overwrite a session record.
    async fn write_session(&self, record: &SessionRecord) -> Result<()>;

    async fn read_session(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    async fn remove_session(&self, session_id: &str) -> Result<()>;

    /// All session records, live or not.
    async fn sessions(&self) -> Result<Vec<SessionRecord>>;

    /// Attempt to claim the lock on `id` for `session_id`.
    ///
    /// Locks owned by sessions whose heartbeat is older than `stale_before`
    /// (or whose session record is gone) are taken over atomically.
    async fn claim(
        &self,
        id: ObjectId,
        session_id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<ClaimOutcome>;

    /// Release the lock if `session_id` owns it; returns whether it did.
    async fn release(&self, id: ObjectId, session_id: &str) -> Result<bool>;

    async fn owner_of(&self, id: ObjectId) -> Result<Option<String>>;

    async fn held_by(&self, session_id: &str) -> Result<Vec<ObjectId>>;

    /// Drop every lock owned by `session_id`; returns the freed ids.
    async fn clear_session_locks(&self, session_id: &str) -> Result<Vec<ObjectId>>;
}
