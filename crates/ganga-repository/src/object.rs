// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The unit of persistence.

use crate::ObjectId;
use crate::error::{RepoError, Result};
use crate::index::{IndexCache, IndexEntry, build_index};
use crate::schema::GangaObject;

/// Whether the payload of a managed object is in memory.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Only the index cache is known; the payload is fetched on first access.
    IndexOnly,
    Full(GangaObject),
}

/// An object stored in a repository registry.
#[derive(Debug, Clone)]
pub struct ManagedObject {
    id: ObjectId,
    class_name: String,
    category: String,
    master_id: Option<ObjectId>,
    index_cache: IndexCache,
    payload: Payload,
    dirty: bool,
    generation: u64,
}

/// An object handed to a backend's `add`, before it has an id.
#[derive(Debug, Clone)]
pub struct NewObject {
    pub object: GangaObject,
    pub master_id: Option<ObjectId>,
}

impl NewObject {
    pub fn top_level(object: GangaObject) -> Self {
        Self {
            object,
            master_id: None,
        }
    }

    pub fn child_of(master_id: ObjectId, object: GangaObject) -> Self {
        Self {
            object,
            master_id: Some(master_id),
        }
    }
}

impl ManagedObject {
    /// A fully loaded, clean object.
    pub fn new(id: ObjectId, object: GangaObject, master_id: Option<ObjectId>) -> Self {
        Self {
            id,
            class_name: object.class_name().to_string(),
            category: object.category().to_string(),
            master_id,
            index_cache: build_index(&object),
            payload: Payload::Full(object),
            dirty: false,
            generation: 0,
        }
    }

    /// An index-only object built from a listing entry.
    pub fn from_entry(id: ObjectId, entry: &IndexEntry) -> Self {
        Self {
            id,
            class_name: entry.class_name.clone(),
            category: entry.category.clone(),
            master_id: entry.master_id,
            index_cache: entry.cache.clone(),
            payload: Payload::IndexOnly,
            dirty: false,
            generation: 0,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn master_id(&self) -> Option<ObjectId> {
        self.master_id
    }

    pub fn index_cache(&self) -> &IndexCache {
        &self.index_cache
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.payload, Payload::Full(_))
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Mutation counter, bumped on every change to the payload.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The decoded payload; fails for index-only objects.
    pub fn object(&self) -> Result<&GangaObject> {
        match &self.payload {
            Payload::Full(object) => Ok(object),
            Payload::IndexOnly => Err(RepoError::NotLoaded { id: self.id }),
        }
    }

    pub fn into_object(self) -> Option<GangaObject> {
        match self.payload {
            Payload::Full(object) => Some(object),
            Payload::IndexOnly => None,
        }
    }

    /// Apply `f` to a copy of the payload, then mark the object dirty and
    /// refresh its index.
    ///
    /// The copy replaces the payload only when `f` succeeds, so a failed
    /// mutation leaves no partial change behind.
    pub fn mutate<R>(&mut self, f: impl FnOnce(&mut GangaObject) -> Result<R>) -> Result<R> {
        let Payload::Full(object) = &mut self.payload else {
            return Err(RepoError::NotLoaded { id: self.id });
        };
        let mut draft = object.clone();
        let out = f(&mut draft)?;
        self.index_cache = build_index(&draft);
        *object = draft;
        self.dirty = true;
        self.generation += 1;
        Ok(out)
    }

    /// Index entry reflecting the in-memory state.
    pub fn index_entry(&self) -> IndexEntry {
        IndexEntry {
            class_name: self.class_name.clone(),
            category: self.category.clone(),
            master_id: self.master_id,
            cache: self.index_cache.clone(),
            error: None,
        }
    }

    /// Transition from index-only to full with a freshly loaded payload.
    pub(crate) fn fill_payload(&mut self, loaded: ManagedObject) {
        self.class_name = loaded.class_name;
        self.category = loaded.category;
        self.index_cache = loaded.index_cache;
        self.payload = loaded.payload;
        self.dirty = self.dirty || loaded.dirty;
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::PluginRegistry;

    #[test]
    fn test_mutate_marks_dirty_and_reindexes() {
        let plugins = PluginRegistry::with_builtins();
        let job = plugins.instantiate("jobs", "Job").unwrap();
        let mut managed = ManagedObject::new(7, job, None);
        assert!(!managed.is_dirty());
        assert_eq!(managed.index_cache()["status"], "new");

        managed.mutate(|job| job.set("status", "submitted")).unwrap();

        assert!(managed.is_dirty());
        assert_eq!(managed.generation(), 1);
        assert_eq!(managed.index_cache()["status"], "submitted");
    }

    #[test]
    fn test_index_only_rejects_payload_access() {
        let plugins = PluginRegistry::with_builtins();
        let job = plugins.instantiate("jobs", "Job").unwrap();
        let entry = IndexEntry::new(&job, None);

        let mut lazy = ManagedObject::from_entry(3, &entry);
        assert!(!lazy.is_loaded());
        assert_eq!(lazy.object().unwrap_err().error_code(), "NOT_LOADED");
        assert!(lazy.mutate(|_| Ok(())).is_err());

        lazy.fill_payload(ManagedObject::new(3, job, None));
        assert!(lazy.is_loaded());
        assert!(!lazy.is_dirty());
    }

    #[test]
    fn test_failed_mutation_leaves_object_clean() {
        let plugins = PluginRegistry::with_builtins();
        let job = plugins.instantiate("jobs", "Job").unwrap();
        let mut managed = ManagedObject::new(1, job, None);

        assert!(managed.mutate(|job| job.set("status", 1i64)).is_err());
        assert!(!managed.is_dirty());
        assert_eq!(managed.generation(), 0);
    }

    #[test]
    fn test_failed_mutation_discards_earlier_steps() {
        let plugins = PluginRegistry::with_builtins();
        let job = plugins.instantiate("jobs", "Job").unwrap();
        let mut managed = ManagedObject::new(1, job, None);

        let result = managed.mutate(|job| {
            job.set("status", "running")?;
            job.set("status", 1i64)
        });
        assert!(result.is_err());
        assert_eq!(managed.object().unwrap().get_str("status"), Some("new"));
        assert_eq!(managed.index_cache()["status"], "new");
        assert!(!managed.is_dirty());
    }
}
