// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-registry lock manager bound to one session.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ClaimOutcome, LeaseStore, SessionIdentity, SessionRecord};
use crate::ObjectId;
use crate::config::RepositoryConfig;
use crate::error::{RepoError, Result};

/// Timing parameters of the lease protocol.
#[derive(Debug, Clone)]
pub struct LockSettings {
    /// Heartbeat age after which a session is considered dead.
    pub lease_timeout: Duration,
    /// How long `acquire` retries a lock held by a live session.
    pub acquire_timeout: Duration,
    /// Period of the background heartbeat; zero disables it.
    pub heartbeat_interval: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(3),
        }
    }
}

impl From<&RepositoryConfig> for LockSettings {
    fn from(config: &RepositoryConfig) -> Self {
        Self {
            lease_timeout: config.lease_timeout,
            acquire_timeout: config.acquire_timeout,
            heartbeat_interval: config.heartbeat_interval,
        }
    }
}

/// Record of a lock taken over from a session whose lease had expired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TakeoverWarning {
    pub id: ObjectId,
    pub previous_owner: String,
    pub at: DateTime<Utc>,
}

/// Another session as seen from this one.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub record: SessionRecord,
    pub alive: bool,
    pub held_object_ids: Vec<ObjectId>,
}

/// Lease-based lock manager for one registry.
pub struct SessionLockManager {
    registry: String,
    store: Arc<dyn LeaseStore>,
    identity: SessionIdentity,
    settings: LockSettings,
    started_at: DateTime<Utc>,
    held: Mutex<BTreeSet<ObjectId>>,
    warnings: Mutex<Vec<TakeoverWarning>>,
    heartbeat_cancel: Mutex<Option<CancellationToken>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionLockManager {
    pub fn new(
        registry: &str,
        store: Arc<dyn LeaseStore>,
        identity: SessionIdentity,
        settings: LockSettings,
    ) -> Self {
        Self {
            registry: registry.to_string(),
            store,
            identity,
            settings,
            started_at: Utc::now(),
            held: Mutex::new(BTreeSet::new()),
            warnings: Mutex::new(Vec::new()),
            heartbeat_cancel: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.identity.session_id
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    fn stale_before(&self) -> DateTime<Utc> {
        let timeout = chrono::Duration::from_std(self.settings.lease_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)));
        Utc::now()
            .checked_sub_signed(timeout)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn record(&self) -> SessionRecord {
        let mut record = SessionRecord::new(&self.identity, Utc::now());
        record.started_at = self.started_at;
        record
    }

    /// Register the session, reclaiming locks left by a crashed earlier run
    /// under the same session name.
    ///
    /// Returns the ids whose locks were released. Fails if a live session
    /// from another process already uses this name.
    pub async fn start(&self) -> Result<Vec<ObjectId>> {
        let mut reclaimed = Vec::new();
        if let Some(existing) = self.store.read_session(self.session_id()).await?
            && existing.token != self.identity.token
        {
            if existing.is_alive(self.stale_before()) {
                return Err(RepoError::repository(
                    &self.registry,
                    "startup",
                    format!(
                        "session '{}' is still active on {} (pid {})",
                        existing.session_id, existing.host, existing.pid
                    ),
                ));
            }
            reclaimed = self.store.clear_session_locks(self.session_id()).await?;
            warn!(
                registry = %self.registry,
                session_id = %self.session_id(),
                previous_host = %existing.host,
                previous_pid = existing.pid,
                released = reclaimed.len(),
                "Reclaimed locks left by a crashed session with the same identity"
            );
        }

        self.store.write_session(&self.record()).await?;
        info!(
            registry = %self.registry,
            session_id = %self.session_id(),
            "Session registered"
        );
        Ok(reclaimed)
    }

    /// Stop the heartbeat, release every lock and deregister the session.
    pub async fn stop(&self) -> Result<()> {
        if let Some(token) = guard(&self.heartbeat_cancel).take() {
            token.cancel();
        }
        let released = self.store.clear_session_locks(self.session_id()).await?;
        guard(&self.held).clear();
        self.store.remove_session(self.session_id()).await?;
        info!(
            registry = %self.registry,
            session_id = %self.session_id(),
            released = released.len(),
            "Session closed"
        );
        Ok(())
    }

    /// Refresh this session's liveness timestamp.
    ///
    /// Also notices locks that another session took over while this one was
    /// considered dead, and drops them from the local view.
    pub async fn heartbeat(&self) -> Result<()> {
        self.store.write_session(&self.record()).await?;

        let expected: Vec<ObjectId> = guard(&self.held).iter().copied().collect();
        if expected.is_empty() {
            return Ok(());
        }
        let actual: BTreeSet<ObjectId> = self
            .store
            .held_by(self.session_id())
            .await?
            .into_iter()
            .collect();
        let mut held = guard(&self.held);
        for id in expected {
            if !actual.contains(&id) && held.remove(&id) {
                warn!(
                    registry = %self.registry,
                    id,
                    "Lock was taken over by another session"
                );
            }
        }
        Ok(())
    }

    /// Spawn the background heartbeat task. No-op when the interval is zero.
    pub fn spawn_heartbeat(self: &Arc<Self>) {
        let interval = self.settings.heartbeat_interval;
        if interval.is_zero() {
            return;
        }
        let token = CancellationToken::new();
        if let Some(previous) = guard(&self.heartbeat_cancel).replace(token.clone()) {
            previous.cancel();
        }
        let weak: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            debug!(
                interval_ms = interval.as_millis() as u64,
                "Session heartbeat task started"
            );
            loop {
                tokio::select! {
                    biased;

                    _ = token.cancelled() => {
                        debug!("Session heartbeat task cancelled");
                        break;
                    }

                    _ = tokio::time::sleep(interval) => {
                        let Some(manager) = weak.upgrade() else {
                            break;
                        };
                        if let Err(e) = manager.heartbeat().await {
                            warn!(
                                registry = %manager.registry,
                                error = %e,
                                "Failed to refresh session heartbeat"
                            );
                        }
                    }
                }
            }
        });
    }

    /// Single claim attempt; `Ok(true)` when the lock was newly obtained.
    pub async fn try_acquire(&self, id: ObjectId) -> Result<bool> {
        match self
            .store
            .claim(id, self.session_id(), self.stale_before())
            .await?
        {
            ClaimOutcome::Acquired => {
                guard(&self.held).insert(id);
                debug!(registry = %self.registry, id, "Lock acquired");
                Ok(true)
            }
            ClaimOutcome::AlreadyHeld => {
                guard(&self.held).insert(id);
                Ok(false)
            }
            ClaimOutcome::Reassigned { previous } => {
                warn!(
                    registry = %self.registry,
                    id,
                    previous_owner = %previous,
                    "Took over lock from a session whose lease expired"
                );
                guard(&self.warnings).push(TakeoverWarning {
                    id,
                    previous_owner: previous,
                    at: Utc::now(),
                });
                guard(&self.held).insert(id);
                Ok(true)
            }
            ClaimOutcome::Held { owner } => Err(RepoError::Locked {
                registry: self.registry.clone(),
                id,
                owner,
            }),
        }
    }

    /// Acquire the lock on `id`, retrying contention until the acquire timeout.
    ///
    /// Returns `true` when the lock was newly obtained and `false` when this
    /// session already held it. Only a caller that got `true` releases it.
    pub async fn acquire(&self, id: ObjectId) -> Result<bool> {
        let deadline = Instant::now() + self.settings.acquire_timeout;
        loop {
            match self.try_acquire(id).await {
                Ok(newly) => return Ok(newly),
                Err(e @ RepoError::Locked { .. }) => {
                    if !self.backoff(deadline).await {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Release the lock on `id`. Releasing an unheld lock is not an error.
    pub async fn release(&self, id: ObjectId) -> Result<()> {
        let released = self.store.release(id, self.session_id()).await?;
        guard(&self.held).remove(&id);
        if released {
            debug!(registry = %self.registry, id, "Lock released");
        }
        Ok(())
    }

    /// Acquire all of `ids` or none of them.
    ///
    /// Ids are claimed in ascending order so overlapping bulk requests
    /// contend on the lowest shared id first; the loser backs off for a
    /// random interval and retries until the acquire timeout.
    ///
    /// Returns the ids that were newly locked; locks this session already
    /// held are left out and stay with their current holder.
    pub async fn acquire_many(&self, ids: &[ObjectId]) -> Result<Vec<ObjectId>> {
        let ordered: BTreeSet<ObjectId> = ids.iter().copied().collect();
        let deadline = Instant::now() + self.settings.acquire_timeout;

        'attempt: loop {
            let mut newly = Vec::new();
            for &id in &ordered {
                match self.try_acquire(id).await {
                    Ok(true) => newly.push(id),
                    Ok(false) => {}
                    Err(e) => {
                        self.release_many(&newly).await?;
                        if matches!(e, RepoError::Locked { .. }) && self.backoff(deadline).await {
                            continue 'attempt;
                        }
                        return Err(e);
                    }
                }
            }
            return Ok(newly);
        }
    }

    pub async fn release_many(&self, ids: &[ObjectId]) -> Result<()> {
        for &id in ids {
            self.release(id).await?;
        }
        Ok(())
    }

    /// Sleep a short random interval; false once the deadline has passed.
    async fn backoff(&self, deadline: Instant) -> bool {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(5..=50));
        tokio::time::sleep(jitter.min(deadline - now)).await;
        true
    }

    /// Forcibly clear the locks and records of every dead session.
    ///
    /// Returns the ids of the sessions that were reaped.
    pub async fn reap(&self) -> Result<Vec<String>> {
        let stale_before = self.stale_before();
        let mut reaped = Vec::new();
        for record in self.store.sessions().await? {
            if record.session_id == self.session_id() || record.is_alive(stale_before) {
                continue;
            }
            let freed = self.store.clear_session_locks(&record.session_id).await?;
            self.store.remove_session(&record.session_id).await?;
            info!(
                registry = %self.registry,
                session_id = %record.session_id,
                locks = freed.len(),
                "Reaped dead session"
            );
            reaped.push(record.session_id);
        }
        Ok(reaped)
    }

    /// Every session other than this one, with liveness and held locks.
    pub async fn other_sessions(&self) -> Result<Vec<SessionStatus>> {
        let stale_before = self.stale_before();
        let mut others = Vec::new();
        for record in self.store.sessions().await? {
            if record.session_id == self.session_id() {
                continue;
            }
            let held_object_ids = self.store.held_by(&record.session_id).await?;
            others.push(SessionStatus {
                alive: record.is_alive(stale_before),
                record,
                held_object_ids,
            });
        }
        Ok(others)
    }

    pub async fn owner_of(&self, id: ObjectId) -> Result<Option<String>> {
        self.store.owner_of(id).await
    }

    /// Ids this session believes it holds.
    pub fn held(&self) -> Vec<ObjectId> {
        guard(&self.held).iter().copied().collect()
    }

    /// Lock takeovers performed by this session so far.
    pub fn warnings(&self) -> Vec<TakeoverWarning> {
        guard(&self.warnings).clone()
    }
}

impl Drop for SessionLockManager {
    fn drop(&mut self) {
        if let Some(token) = guard(&self.heartbeat_cancel).take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::FileLeaseStore;
    use tempfile::TempDir;

    fn settings(lease_ms: u64, acquire_ms: u64) -> LockSettings {
        LockSettings {
            lease_timeout: Duration::from_millis(lease_ms),
            acquire_timeout: Duration::from_millis(acquire_ms),
            heartbeat_interval: Duration::ZERO,
        }
    }

    async fn manager(dir: &TempDir, name: &str, settings: LockSettings) -> SessionLockManager {
        let store = FileLeaseStore::new(dir.path().join("sessions"), dir.path().join("locks"));
        store.init().await.unwrap();
        let manager = SessionLockManager::new(
            "jobs",
            Arc::new(store),
            SessionIdentity::named(name),
            settings,
        );
        manager.start().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let dir = TempDir::new().unwrap();
        let a = manager(&dir, "a", settings(30_000, 50)).await;
        let b = manager(&dir, "b", settings(30_000, 50)).await;

        a.acquire(1).await.unwrap();
        assert_eq!(a.held(), vec![1]);

        let err = b.acquire(1).await.unwrap_err();
        assert!(matches!(err, RepoError::Locked { ref owner, .. } if owner == "a"));

        a.release(1).await.unwrap();
        a.release(1).await.unwrap();
        b.acquire(1).await.unwrap();
        assert_eq!(b.owner_of(1).await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_acquire_many_is_all_or_nothing() {
        let dir = TempDir::new().unwrap();
        let a = manager(&dir, "a", settings(30_000, 50)).await;
        let b = manager(&dir, "b", settings(30_000, 50)).await;

        b.acquire(3).await.unwrap();
        assert!(a.acquire_many(&[4, 1, 3, 2]).await.is_err());
        assert!(a.held().is_empty());
        for id in [1, 2, 4] {
            assert_eq!(a.owner_of(id).await.unwrap(), None);
        }

        b.release(3).await.unwrap();
        a.acquire_many(&[4, 1, 3, 2]).await.unwrap();
        assert_eq!(a.held(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_acquire_reports_only_new_locks() {
        let dir = TempDir::new().unwrap();
        let a = manager(&dir, "a", settings(30_000, 50)).await;

        assert!(a.acquire(1).await.unwrap());
        assert!(!a.acquire(1).await.unwrap());
        assert_eq!(a.acquire_many(&[2, 1, 3]).await.unwrap(), vec![2, 3]);

        a.release_many(&[2, 3]).await.unwrap();
        assert_eq!(a.held(), vec![1]);
        assert_eq!(a.owner_of(1).await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_stale_lock_taken_over_with_warning() {
        let dir = TempDir::new().unwrap();
        let a = manager(&dir, "a", settings(100, 50)).await;
        let b = manager(&dir, "b", settings(100, 50)).await;

        a.acquire(8).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        b.heartbeat().await.unwrap();

        b.acquire(8).await.unwrap();
        let warnings = b.warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].id, 8);
        assert_eq!(warnings[0].previous_owner, "a");

        a.heartbeat().await.unwrap();
        assert!(a.held().is_empty());
    }

    #[tokio::test]
    async fn test_restart_with_same_name_reclaims_locks() {
        let dir = TempDir::new().unwrap();
        let crashed = manager(&dir, "analysis", settings(100, 50)).await;
        crashed.acquire(5).await.unwrap();
        crashed.acquire(6).await.unwrap();
        drop(crashed);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let store = FileLeaseStore::new(dir.path().join("sessions"), dir.path().join("locks"));
        let restarted = SessionLockManager::new(
            "jobs",
            Arc::new(store),
            SessionIdentity::named("analysis"),
            settings(100, 50),
        );
        assert_eq!(restarted.start().await.unwrap(), vec![5, 6]);
    }

    #[tokio::test]
    async fn test_live_duplicate_name_rejected() {
        let dir = TempDir::new().unwrap();
        let _first = manager(&dir, "analysis", settings(30_000, 50)).await;

        let store = FileLeaseStore::new(dir.path().join("sessions"), dir.path().join("locks"));
        let second = SessionLockManager::new(
            "jobs",
            Arc::new(store),
            SessionIdentity::named("analysis"),
            settings(30_000, 50),
        );
        assert!(second.start().await.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn test_reap_dead_sessions() {
        let dir = TempDir::new().unwrap();
        let dead = manager(&dir, "dead", settings(100, 50)).await;
        dead.acquire(1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let live = manager(&dir, "live", settings(100, 50)).await;
        let others = live.other_sessions().await.unwrap();
        assert_eq!(others.len(), 1);
        assert!(!others[0].alive);
        assert_eq!(others[0].held_object_ids, vec![1]);

        assert_eq!(live.reap().await.unwrap(), vec!["dead".to_string()]);
        assert!(live.other_sessions().await.unwrap().is_empty());
        assert_eq!(live.owner_of(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stop_releases_everything() {
        let dir = TempDir::new().unwrap();
        let a = manager(&dir, "a", settings(30_000, 50)).await;
        let b = manager(&dir, "b", settings(30_000, 50)).await;
        a.acquire_many(&[1, 2]).await.unwrap();

        a.stop().await.unwrap();

        b.acquire_many(&[1, 2]).await.unwrap();
        assert!(b.other_sessions().await.unwrap().is_empty());
    }
}
