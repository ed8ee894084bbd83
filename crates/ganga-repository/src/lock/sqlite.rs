// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lease records in the document-store database.
//!
//! Session and lock rows are scoped by collection, so each registry opened by
//! a process registers on its own. Heartbeats are stored as epoch milliseconds so staleness checks are a
//! plain integer comparison. Lock takeover is a compare-and-swap `UPDATE`
//! conditioned on the previous owner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{ClaimOutcome, LeaseStore, SessionRecord};
use crate::ObjectId;
use crate::error::{RepoError, Result};

const CLAIM_ATTEMPTS: usize = 3;

/// SQLite-backed lease store for one collection.
#[derive(Clone)]
pub struct SqliteLeaseStore {
    pool: SqlitePool,
    collection: String,
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    session_id: String,
    token: String,
    host: String,
    pid: i64,
    started_at: DateTime<Utc>,
    heartbeat_ms: i64,
}

impl TryFrom<SessionRow> for SessionRecord {
    type Error = RepoError;

    fn try_from(row: SessionRow) -> Result<Self> {
        Ok(SessionRecord {
            session_id: row.session_id,
            token: Uuid::parse_str(&row.token)
                .map_err(|e| RepoError::corrupt(format!("session token: {}", e)))?,
            host: row.host,
            pid: u32::try_from(row.pid).unwrap_or_default(),
            started_at: row.started_at,
            heartbeat: DateTime::<Utc>::from_timestamp_millis(row.heartbeat_ms)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        })
    }
}

impl SqliteLeaseStore {
    /// Schema is created by the document-store migrations.
    pub fn new(pool: SqlitePool, collection: &str) -> Self {
        Self {
            pool,
            collection: collection.to_string(),
        }
    }
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    async fn write_session(&self, record: &SessionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (collection, session_id, token, host, pid, started_at, heartbeat_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (collection, session_id) DO UPDATE
            SET token = ?3, host = ?4, pid = ?5, started_at = ?6, heartbeat_ms = ?7
            "#,
        )
        .bind(&self.collection)
        .bind(&record.session_id)
        .bind(record.token.to_string())
        .bind(&record.host)
        .bind(i64::from(record.pid))
        .bind(record.started_at)
        .bind(record.heartbeat.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn read_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT session_id, token, host, pid, started_at, heartbeat_ms
            FROM sessions
            WHERE collection = ? AND session_id = ?
            "#,
        )
        .bind(&self.collection)
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SessionRecord::try_from).transpose()
    }

    async fn remove_session(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE collection = ? AND session_id = ?")
            .bind(&self.collection)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn sessions(&self) -> Result<Vec<SessionRecord>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT session_id, token, host, pid, started_at, heartbeat_ms
            FROM sessions
            WHERE collection = ?
            ORDER BY session_id
            "#,
        )
        .bind(&self.collection)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SessionRecord::try_from).collect()
    }

    async fn claim(
        &self,
        id: ObjectId,
        session_id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let key = id as i64;
        let stale_ms = stale_before.timestamp_millis();

        for _ in 0..CLAIM_ATTEMPTS {
            let inserted = sqlx::query(
                r#"
                INSERT INTO locks (collection, id, session_id, acquired_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (collection, id) DO NOTHING
                "#,
            )
            .bind(&self.collection)
            .bind(key)
            .bind(session_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
            if inserted.rows_affected() == 1 {
                return Ok(ClaimOutcome::Acquired);
            }

            let current: Option<(String, Option<i64>)> = sqlx::query_as(
                r#"
                SELECT l.session_id, s.heartbeat_ms
                FROM locks l
                LEFT JOIN sessions s
                    ON s.collection = l.collection AND s.session_id = l.session_id
                WHERE l.collection = ? AND l.id = ?
                "#,
            )
            .bind(&self.collection)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

            let Some((owner, heartbeat_ms)) = current else {
                continue;
            };
            if owner == session_id {
                return Ok(ClaimOutcome::AlreadyHeld);
            }
            if heartbeat_ms.is_some_and(|hb| hb >= stale_ms) {
                return Ok(ClaimOutcome::Held { owner });
            }

            let swapped = sqlx::query(
                r#"
                UPDATE locks
                SET session_id = ?, acquired_at = ?
                WHERE collection = ? AND id = ? AND session_id = ?
                "#,
            )
            .bind(session_id)
            .bind(Utc::now())
            .bind(&self.collection)
            .bind(key)
            .bind(&owner)
            .execute(&self.pool)
            .await?;
            if swapped.rows_affected() == 1 {
                return Ok(ClaimOutcome::Reassigned { previous: owner });
            }
        }

        let owner = self.owner_of(id).await?.unwrap_or_default();
        Ok(ClaimOutcome::Held { owner })
    }

    async fn release(&self, id: ObjectId, session_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM locks WHERE collection = ? AND id = ? AND session_id = ?",
        )
        .bind(&self.collection)
        .bind(id as i64)
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn owner_of(&self, id: ObjectId) -> Result<Option<String>> {
        let owner: Option<String> =
            sqlx::query_scalar("SELECT session_id FROM locks WHERE collection = ? AND id = ?")
                .bind(&self.collection)
                .bind(id as i64)
                .fetch_optional(&self.pool)
                .await?;
        Ok(owner)
    }

    async fn held_by(&self, session_id: &str) -> Result<Vec<ObjectId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM locks WHERE collection = ? AND session_id = ? ORDER BY id",
        )
        .bind(&self.collection)
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|id| id as ObjectId).collect())
    }

    async fn clear_session_locks(&self, session_id: &str) -> Result<Vec<ObjectId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            DELETE FROM locks
            WHERE collection = ? AND session_id = ?
            RETURNING id
            "#,
        )
        .bind(&self.collection)
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let mut freed: Vec<ObjectId> = ids.into_iter().map(|id| id as ObjectId).collect();
        freed.sort_unstable();
        Ok(freed)
    }
}
