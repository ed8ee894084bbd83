// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ganga Job Repository - persistent store for jobs and their metadata
//!
//! This crate stores plugin-typed objects (jobs, templates, job trees, ...)
//! so that several concurrently running sessions on one or more hosts can
//! share them safely. Objects survive restarts and crashes, are listed
//! cheaply through a denormalised index, and are loaded lazily.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Repository (per registry)                 │
//! │   cache · lazy load · locked flush/delete · partial reports  │
//! └──────────────────────────────────────────────────────────────┘
//!        │                        │                      │
//!        ▼                        ▼                      ▼
//! ┌──────────────┐   ┌──────────────────────┐   ┌────────────────┐
//! │ Object codec │   │ Session lock manager │   │ Index builder  │
//! │ tree <-> obj │   │ leases + heartbeats  │   │ summary fields │
//! └──────────────┘   └──────────────────────┘   └────────────────┘
//!        │                        │
//!        ▼                        ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     StorageBackend                           │
//! │   FileTreeBackend (directory tree)  ·  DocumentBackend (SQL) │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Error Model
//!
//! Batch operations return a [`BatchReport`]: ids that failed on their own
//! (unknown, locked, corrupt) are listed with their error while the rest
//! proceed. A [`RepoError::Repository`] error means the storage itself is
//! unusable; the repository then disables itself until restarted.
//!
//! # Modules
//!
//! - [`codec`]: object <-> storage-neutral tree conversion
//! - [`index`]: index entries built from object payloads
//! - [`lock`]: session registry and per-object leases
//! - [`storage`]: file-tree and document-store backends
//! - [`repository`]: the façade used by clients
//! - [`migration`]: copy registries between backends
//! - [`config`]: configuration from environment variables

pub mod codec;
pub mod config;
pub mod container;
pub mod error;
pub mod flusher;
pub mod index;
pub mod lock;
pub mod migration;
pub mod object;
pub mod plugins;
pub mod repository;
pub mod retry;
pub mod schema;
pub mod storage;

/// Numeric object identifier, unique within a registry and never reused.
pub type ObjectId = u64;

pub use config::{BackendKind, ConfigError, RepositoryConfig};
pub use error::{BatchReport, ObjectFailure, RepoError, Result};
pub use index::IndexEntry;
pub use object::{ManagedObject, NewObject};
pub use plugins::PluginRegistry;
pub use repository::{Repository, RepositoryContext};
pub use schema::{ClassDef, FieldSpec, GangaObject, Value};
pub use storage::{IndexScope, StorageBackend};
