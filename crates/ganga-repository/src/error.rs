// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the job repository.
//!
//! Failures fall into two groups. Per-object failures (missing ids, held
//! leases, undecodable payloads) are collected into a [`BatchReport`] so a
//! batch keeps making progress on the remaining ids. A [`RepoError::Repository`]
//! failure means the storage itself is unusable; the façade reacts by
//! disabling further mutation for the rest of the session.

use crate::ObjectId;
use crate::config::ConfigError;

/// Result type using RepoError
pub type Result<T> = std::result::Result<T, RepoError>;

/// Errors raised by the repository and its storage backends.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RepoError {
    /// One or more ids are unknown to the backend (never added, or deleted).
    #[error("{registry}: object(s) {ids:?} not found")]
    NotFound { registry: String, ids: Vec<ObjectId> },

    /// The lease on an object is held by another live session.
    #[error("{registry}: object #{id} is locked by session '{owner}'")]
    Locked {
        registry: String,
        id: ObjectId,
        owner: String,
    },

    /// A stored payload does not match the current schema or cannot be parsed.
    #[error("corrupt data: {reason}")]
    CorruptData { reason: String },

    /// The stored class name is no longer provided by any registered plugin.
    #[error("plugin class '{category}/{class_name}' is not registered")]
    PluginMissing {
        category: String,
        class_name: String,
    },

    /// A single object could not be read; wraps the underlying cause.
    #[error("{registry}: object #{id} is inaccessible: {source}")]
    Inaccessible {
        registry: String,
        id: ObjectId,
        #[source]
        source: Box<RepoError>,
    },

    /// Backend-wide failure: storage unreachable or broken beyond repair.
    #[error("repository error in '{registry}' during {operation}: {details}")]
    Repository {
        registry: String,
        operation: String,
        details: String,
    },

    /// The repository was disabled after a fatal error and refuses mutation.
    #[error(
        "repository '{registry}' is disabled after a fatal error; restart the session to reactivate it"
    )]
    Disabled { registry: String },

    /// Other live sessions use the registry, so it cannot be wiped.
    #[error("{registry}: cannot clean while other sessions are active: {sessions:?}")]
    SessionsActive {
        registry: String,
        sessions: Vec<String>,
    },

    /// The payload of a lazily listed object was accessed before loading it.
    #[error("object #{id} has only its index loaded")]
    NotLoaded { id: ObjectId },

    /// A field assignment violates the class schema.
    #[error("schema violation on {class_name}.{field}: {reason}")]
    Schema {
        class_name: String,
        field: String,
        reason: String,
    },

    /// The document-store container controller failed.
    #[error("container controller failed to {action}: {details}")]
    Container { action: String, details: String },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl RepoError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Locked { .. } => "LOCKED",
            Self::CorruptData { .. } => "CORRUPT_DATA",
            Self::PluginMissing { .. } => "PLUGIN_MISSING",
            Self::Inaccessible { .. } => "INACCESSIBLE_OBJECT",
            Self::Repository { .. } => "REPOSITORY_ERROR",
            Self::Disabled { .. } => "REPOSITORY_DISABLED",
            Self::SessionsActive { .. } => "SESSIONS_ACTIVE",
            Self::NotLoaded { .. } => "NOT_LOADED",
            Self::Schema { .. } => "SCHEMA_VIOLATION",
            Self::Container { .. } => "CONTAINER_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ResourceBusy
            ),
            Self::Database(e) => match e {
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
                // SQLITE_BUSY (5) and SQLITE_LOCKED (6)
                sqlx::Error::Database(db) => {
                    matches!(db.code().as_deref(), Some("5") | Some("6") | Some("517"))
                }
                _ => false,
            },
            _ => false,
        }
    }

    /// Whether the failure concerns a single object and belongs in a batch report.
    pub fn is_per_object(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::Locked { .. }
                | Self::CorruptData { .. }
                | Self::PluginMissing { .. }
                | Self::Inaccessible { .. }
                | Self::NotLoaded { .. }
                | Self::Schema { .. }
        )
    }

    /// Whether the failure makes the whole backend unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Repository { .. })
    }

    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptData {
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(registry: &str, id: ObjectId) -> Self {
        Self::NotFound {
            registry: registry.to_string(),
            ids: vec![id],
        }
    }

    pub(crate) fn inaccessible(registry: &str, id: ObjectId, source: RepoError) -> Self {
        Self::Inaccessible {
            registry: registry.to_string(),
            id,
            source: Box::new(source),
        }
    }

    pub(crate) fn repository(
        registry: &str,
        operation: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self::Repository {
            registry: registry.to_string(),
            operation: operation.into(),
            details: details.into(),
        }
    }
}

/// A single failed id inside a batch operation.
#[derive(Debug)]
pub struct ObjectFailure {
    pub id: ObjectId,
    pub error: RepoError,
}

/// Outcome of a batch operation: what worked, and what failed per id.
#[derive(Debug)]
pub struct BatchReport<T> {
    pub succeeded: Vec<T>,
    pub failed: Vec<ObjectFailure>,
}

impl<T> Default for BatchReport<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<T> BatchReport<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ok(&mut self, value: T) {
        self.succeeded.push(value);
    }

    pub fn fail(&mut self, id: ObjectId, error: RepoError) {
        self.failed.push(ObjectFailure { id, error });
    }

    /// True when no id failed.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_ids(&self) -> Vec<ObjectId> {
        self.failed.iter().map(|f| f.id).collect()
    }

    /// Look up the failure recorded for `id`, if any.
    pub fn failure(&self, id: ObjectId) -> Option<&RepoError> {
        self.failed.iter().find(|f| f.id == id).map(|f| &f.error)
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: BatchReport<T>) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
    }
}
