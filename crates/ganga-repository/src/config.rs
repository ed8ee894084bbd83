// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Which storage backend a repository uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Sharded directory tree of payload and index files.
    FileTree,
    /// Document collections in a SQLite database.
    DocumentStore,
}

/// How the document-store database process is managed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerKind {
    /// The database is managed outside the repository.
    Native,
    /// Run shell commands to start and stop the database.
    Command {
        start: Option<String>,
        stop: Option<String>,
    },
}

/// Connection parameters for the document-store backend.
#[derive(Debug, Clone)]
pub struct DocumentStoreConfig {
    /// Explicit connection URL; derived from the location when unset.
    pub url: Option<String>,
    /// Database name.
    pub name: String,
    pub controller: ControllerKind,
}

/// Job repository configuration
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Root directory of the repository (file tree, session files, SQLite file)
    pub location: PathBuf,
    pub backend: BackendKind,
    /// Explicit session identity; generated per process when unset
    pub session_name: Option<String>,
    /// Heartbeat age after which a session is considered dead
    pub lease_timeout: Duration,
    /// How long `acquire` keeps retrying a contended lease
    pub acquire_timeout: Duration,
    /// Background heartbeat period; zero disables the heartbeat task
    pub heartbeat_interval: Duration,
    /// Periodic flush of dirty objects; `None` disables the auto-flusher
    pub autoflush_interval: Option<Duration>,
    /// Auto-fail jobs left in transitional states at startup
    pub startup_check: bool,
    pub document: DocumentStoreConfig,
    pub retry: RetryPolicy,
}

impl RepositoryConfig {
    /// Defaults for a file-tree repository rooted at `location`.
    pub fn file_tree(location: impl AsRef<Path>) -> Self {
        Self {
            location: location.as_ref().to_path_buf(),
            backend: BackendKind::FileTree,
            session_name: None,
            lease_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(3),
            autoflush_interval: None,
            startup_check: true,
            document: DocumentStoreConfig {
                url: None,
                name: "ganga".to_string(),
                controller: ControllerKind::Native,
            },
            retry: RetryPolicy::default(),
        }
    }

    /// Defaults for a document-store repository reachable at `url`.
    pub fn document_store(location: impl AsRef<Path>, url: &str) -> Self {
        let mut config = Self::file_tree(location);
        config.backend = BackendKind::DocumentStore;
        config.document.url = Some(url.to_string());
        config
    }

    /// Load configuration from environment variables.
    ///
    /// All optional (with defaults):
    /// - `GANGA_REPOSITORY_LOCATION`: repository root (default: gangadir/repository)
    /// - `GANGA_REPOSITORY_BACKEND`: `file` or `document` (default: file)
    /// - `GANGA_SESSION_NAME`: explicit session identity
    /// - `GANGA_LOCK_LEASE_TIMEOUT_SECS`: lease timeout (default: 30)
    /// - `GANGA_LOCK_ACQUIRE_TIMEOUT_MS`: lock acquisition timeout (default: 5000)
    /// - `GANGA_HEARTBEAT_INTERVAL_MS`: heartbeat period, 0 disables (default: 3000)
    /// - `GANGA_AUTOFLUSH_INTERVAL_SECS`: auto-flush period, 0 disables (default: 0)
    /// - `GANGA_STARTUP_CHECK`: auto-fail interrupted jobs (default: true)
    /// - `GANGA_DB_URL`: document-store URL (default: sqlite file under the location)
    /// - `GANGA_DB_NAME`: document-store database name (default: ganga)
    /// - `GANGA_DB_CONTROLLER`: `native` or `command` (default: native)
    /// - `GANGA_DB_START_CMD` / `GANGA_DB_STOP_CMD`: commands for the `command` controller
    pub fn from_env() -> Result<Self, ConfigError> {
        let location = std::env::var("GANGA_REPOSITORY_LOCATION")
            .unwrap_or_else(|_| "gangadir/repository".to_string());
        if location.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "GANGA_REPOSITORY_LOCATION",
                "must not be empty",
            ));
        }

        let backend = match std::env::var("GANGA_REPOSITORY_BACKEND")
            .unwrap_or_else(|_| "file".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "file" | "xml" | "filetree" => BackendKind::FileTree,
            "document" | "sqlite" | "database" => BackendKind::DocumentStore,
            _ => {
                return Err(ConfigError::Invalid(
                    "GANGA_REPOSITORY_BACKEND",
                    "must be 'file' or 'document'",
                ));
            }
        };

        let lease_secs: u64 = parse_var(
            "GANGA_LOCK_LEASE_TIMEOUT_SECS",
            "30",
            "must be a positive integer",
        )?;
        if lease_secs == 0 {
            return Err(ConfigError::Invalid(
                "GANGA_LOCK_LEASE_TIMEOUT_SECS",
                "must be a positive integer",
            ));
        }
        let acquire_ms: u64 = parse_var(
            "GANGA_LOCK_ACQUIRE_TIMEOUT_MS",
            "5000",
            "must be a non-negative integer",
        )?;
        let heartbeat_ms: u64 = parse_var(
            "GANGA_HEARTBEAT_INTERVAL_MS",
            "3000",
            "must be a non-negative integer",
        )?;
        if heartbeat_ms >= lease_secs * 1000 {
            return Err(ConfigError::Invalid(
                "GANGA_HEARTBEAT_INTERVAL_MS",
                "must be shorter than the lease timeout",
            ));
        }
        let autoflush_secs: u64 = parse_var(
            "GANGA_AUTOFLUSH_INTERVAL_SECS",
            "0",
            "must be a non-negative integer",
        )?;
        let startup_check: bool =
            parse_var("GANGA_STARTUP_CHECK", "true", "must be 'true' or 'false'")?;

        let controller = match std::env::var("GANGA_DB_CONTROLLER")
            .unwrap_or_else(|_| "native".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "native" => ControllerKind::Native,
            "command" => ControllerKind::Command {
                start: std::env::var("GANGA_DB_START_CMD").ok(),
                stop: std::env::var("GANGA_DB_STOP_CMD").ok(),
            },
            _ => {
                return Err(ConfigError::Invalid(
                    "GANGA_DB_CONTROLLER",
                    "must be 'native' or 'command'",
                ));
            }
        };

        Ok(Self {
            location: PathBuf::from(location),
            backend,
            session_name: std::env::var("GANGA_SESSION_NAME")
                .ok()
                .filter(|s| !s.is_empty()),
            lease_timeout: Duration::from_secs(lease_secs),
            acquire_timeout: Duration::from_millis(acquire_ms),
            heartbeat_interval: Duration::from_millis(heartbeat_ms),
            autoflush_interval: (autoflush_secs > 0)
                .then(|| Duration::from_secs(autoflush_secs)),
            startup_check,
            document: DocumentStoreConfig {
                url: std::env::var("GANGA_DB_URL").ok().filter(|s| !s.is_empty()),
                name: std::env::var("GANGA_DB_NAME").unwrap_or_else(|_| "ganga".to_string()),
                controller,
            },
            retry: RetryPolicy::default(),
        })
    }

    /// Connection URL of the document store.
    pub fn document_url(&self) -> String {
        match &self.document.url {
            Some(url) => url.clone(),
            None => format!(
                "sqlite:{}?mode=rwc",
                self.location
                    .join(format!("{}.sqlite", self.document.name))
                    .to_string_lossy()
            ),
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    key: &'static str,
    default: &str,
    message: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(key, message))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
