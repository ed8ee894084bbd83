// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Index record builder.
//!
//! The index cache is a small denormalised summary of an object (status,
//! name, backend and application class, timestamps, dataset names) used for
//! listings. It is a pure projection of the payload and can always be
//! regenerated from it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::ObjectId;
use crate::schema::{GangaObject, Projection, Value};

/// Summary fields of one object, keyed by index key.
pub type IndexCache = BTreeMap<String, Json>;

/// Everything a listing needs about an object without decoding its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub class_name: String,
    pub category: String,
    pub master_id: Option<ObjectId>,
    pub cache: IndexCache,
    /// Set when the object cannot be read; listings show it as a placeholder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IndexEntry {
    pub fn new(object: &GangaObject, master_id: Option<ObjectId>) -> Self {
        Self {
            class_name: object.class_name().to_string(),
            category: object.category().to_string(),
            master_id,
            cache: build_index(object),
            error: None,
        }
    }

    /// Placeholder for an object whose payload could not be decoded.
    pub fn inaccessible(master_id: Option<ObjectId>, reason: impl Into<String>) -> Self {
        Self {
            class_name: "IncompleteObject".to_string(),
            category: String::new(),
            master_id,
            cache: IndexCache::new(),
            error: Some(reason.into()),
        }
    }

    pub fn is_top_level(&self) -> bool {
        self.master_id.is_none()
    }

    /// Convenience accessor for string-valued summary fields.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.cache.get(key).and_then(Json::as_str)
    }
}

/// Project the indexable fields of `object`.
///
/// Only the paths the class declares are visited, and nested components are
/// read in place; no other persisted object is consulted.
pub fn build_index(object: &GangaObject) -> IndexCache {
    object
        .class()
        .index
        .iter()
        .map(|spec| {
            let found = resolve_path(object, &spec.path);
            let value = match (spec.projection, found) {
                (_, None) => Json::Null,
                (Projection::ClassName, Some(Value::Object(o))) => {
                    Json::String(o.class_name().to_string())
                }
                (Projection::ClassName, Some(_)) => Json::Null,
                (Projection::Value, Some(v)) => to_json(v),
            };
            (spec.key.clone(), value)
        })
        .collect()
}

fn resolve_path<'a>(object: &'a GangaObject, path: &[String]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = object.get(first)?;
    for segment in rest {
        current = match current {
            Value::Object(o) => o.get(segment)?,
            Value::Map(entries) => entries.get(segment)?,
            _ => return None,
        };
    }
    Some(current)
}

fn to_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::Str(s) => Json::String(s.clone()),
        Value::List(items) => Json::Array(items.iter().map(to_json).collect()),
        Value::Map(entries) => Json::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), to_json(v)))
                .collect(),
        ),
        Value::Object(o) => Json::String(o.class_name().to_string()),
        Value::Ref(r) => Json::from(r.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::PluginRegistry;
    use serde_json::json;

    fn job() -> GangaObject {
        let plugins = PluginRegistry::with_builtins();
        let mut job = plugins.instantiate("jobs", "Job").unwrap();
        job.set("name", "fit").unwrap();
        job.set("status", "running").unwrap();
        job.set("backend", plugins.instantiate("backends", "Batch").unwrap())
            .unwrap();
        job.component_mut("backend")
            .unwrap()
            .set("actualCE", "lxbatch")
            .unwrap();
        let mut data = plugins.instantiate("datasets", "GenericDataset").unwrap();
        data.set(
            "names",
            Value::List(vec![Value::from("LFN:/a"), Value::from("LFN:/b")]),
        )
        .unwrap();
        job.set("inputdata", data).unwrap();
        job
    }

    #[test]
    fn test_job_index_fields() {
        let cache = build_index(&job());

        assert_eq!(cache["status"], json!("running"));
        assert_eq!(cache["name"], json!("fit"));
        assert_eq!(cache["display:backend"], json!("Batch"));
        assert_eq!(cache["display:application"], json!("Executable"));
        assert_eq!(cache["display:backend.actualCE"], json!("lxbatch"));
        assert_eq!(cache["inputdata"], json!(["LFN:/a", "LFN:/b"]));
        assert_eq!(cache["time.submitted"], Json::Null);
    }

    #[test]
    fn test_build_index_is_idempotent() {
        let job = job();
        assert_eq!(build_index(&job), build_index(&job));
    }

    #[test]
    fn test_unindexed_class_has_empty_cache() {
        let plugins = PluginRegistry::with_builtins();
        let meta = plugins.instantiate("metadata", "MetadataDict").unwrap();
        assert!(build_index(&meta).is_empty());
    }

    #[test]
    fn test_entry_serialization_omits_missing_error() {
        let entry = IndexEntry::new(&job(), Some(3));
        let text = serde_json::to_string(&entry).unwrap();
        assert!(!text.contains("error"));
        let back: IndexEntry = serde_json::from_str(&text).unwrap();
        assert_eq!(back, entry);
        assert!(!back.is_top_level());
    }
}
