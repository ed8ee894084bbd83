// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Plugin class registry.
//!
//! Maps `(category, class name)` to a [`ClassDef`]. Stored data names its
//! class by these two strings; decoding resolves them here and fails with
//! [`RepoError::PluginMissing`] when the class is no longer provided.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{RepoError, Result};
use crate::schema::{ClassDef, FieldSpec, FieldType, GangaObject, IndexSpec, Value};

/// Registry of the plugin classes the repository can instantiate.
#[derive(Debug, Default, Clone)]
pub struct PluginRegistry {
    classes: HashMap<(String, String), Arc<ClassDef>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the classes shipped with the repository.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for class in builtin_classes() {
            registry.register(class);
        }
        registry
    }

    /// Register (or replace) a class definition.
    pub fn register(&mut self, class: ClassDef) -> Arc<ClassDef> {
        let class = Arc::new(class);
        self.classes.insert(
            (class.category.clone(), class.name.clone()),
            class.clone(),
        );
        class
    }

    /// Remove a class, as happens when a plugin package is uninstalled.
    pub fn unregister(&mut self, category: &str, name: &str) -> Option<Arc<ClassDef>> {
        self.classes
            .remove(&(category.to_string(), name.to_string()))
    }

    pub fn resolve(&self, category: &str, name: &str) -> Result<Arc<ClassDef>> {
        self.classes
            .get(&(category.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| RepoError::PluginMissing {
                category: category.to_string(),
                class_name: name.to_string(),
            })
    }

    /// Create a fresh user-facing object, including default components.
    pub fn instantiate(&self, category: &str, name: &str) -> Result<GangaObject> {
        let class = self.resolve(category, name)?;
        let mut object = GangaObject::blank(class.clone());
        for field in &class.fields {
            let (FieldType::Component { category }, Some(default_class)) =
                (&field.ty, &field.default_class)
            else {
                continue;
            };
            let component = self.instantiate(category, default_class)?;
            object.insert_checked(&field.name, Value::from(component));
        }
        Ok(object)
    }

    /// Every registered class, ordered by category and name.
    pub fn classes(&self) -> Vec<Arc<ClassDef>> {
        let mut classes: Vec<_> = self.classes.values().cloned().collect();
        classes.sort_by(|a, b| (&a.category, &a.name).cmp(&(&b.category, &b.name)));
        classes
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// Job statuses the startup check treats as interrupted transitions.
pub const TRANSITIONAL_STATUSES: &[&str] = &["submitting", "completing"];

fn builtin_classes() -> Vec<ClassDef> {
    let job_index = |class: ClassDef| {
        class
            .indexed(IndexSpec::value("status", &["status"]))
            .indexed(IndexSpec::value("name", &["name"]))
            .indexed(IndexSpec::value("comment", &["comment"]))
            .indexed(IndexSpec::class_name("display:application", &["application"]))
            .indexed(IndexSpec::class_name("display:backend", &["backend"]))
    };

    vec![
        job_index(
            ClassDef::new("Job", "jobs")
                .version(2)
                .field(FieldSpec::string("name", ""))
                .field(FieldSpec::string("comment", ""))
                .field(FieldSpec::string("status", "new"))
                .field(FieldSpec::component(
                    "application",
                    "applications",
                    Some("Executable"),
                ))
                .field(FieldSpec::component("backend", "backends", Some("Local")))
                .field(FieldSpec::component("inputdata", "datasets", None))
                .field(FieldSpec::list("outputfiles", FieldType::Str))
                .field(FieldSpec::map("time"))
                .field(FieldSpec::back_ref("master", "jobs")),
        )
        .indexed(IndexSpec::value(
            "display:backend.actualCE",
            &["backend", "actualCE"],
        ))
        .indexed(IndexSpec::value("inputdata", &["inputdata", "names"]))
        .indexed(IndexSpec::value("time.submitted", &["time", "submitted"]))
        .indexed(IndexSpec::value("time.final", &["time", "final"])),
        job_index(
            ClassDef::new("JobTemplate", "jobs")
                .field(FieldSpec::string("name", ""))
                .field(FieldSpec::string("comment", ""))
                .field(FieldSpec::string("status", "template"))
                .field(FieldSpec::component(
                    "application",
                    "applications",
                    Some("Executable"),
                ))
                .field(FieldSpec::component("backend", "backends", Some("Local")))
                .field(FieldSpec::component("inputdata", "datasets", None)),
        ),
        ClassDef::new("Executable", "applications")
            .field(FieldSpec::string("exe", "echo"))
            .field(FieldSpec::list("args", FieldType::Str))
            .field(FieldSpec::map("env")),
        ClassDef::new("Local", "backends")
            .field(FieldSpec::int("nice", 0))
            .field(FieldSpec::string("workdir", ""))
            .field(FieldSpec::string("actualCE", ""))
            .field(FieldSpec::int("exitcode", 0).transient()),
        ClassDef::new("Batch", "backends")
            .field(FieldSpec::string("queue", ""))
            .field(FieldSpec::string("id", ""))
            .field(FieldSpec::string("actualCE", "")),
        ClassDef::new("GenericDataset", "datasets")
            .field(FieldSpec::list("names", FieldType::Str)),
        ClassDef::new("JobTree", "metadata")
            .field(FieldSpec::string("name", ""))
            .field(FieldSpec::map("folders"))
            .indexed(IndexSpec::value("name", &["name"])),
        ClassDef::new("MetadataDict", "metadata").field(FieldSpec::map("data")),
        ClassDef::new("ShareRef", "sharedfiles")
            .field(FieldSpec::map("name"))
            .indexed(IndexSpec::value("name", &["name"])),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_resolve() {
        let plugins = PluginRegistry::with_builtins();
        assert!(plugins.resolve("jobs", "Job").is_ok());
        assert!(plugins.resolve("backends", "Batch").is_ok());
        assert!(plugins.resolve("metadata", "JobTree").is_ok());
    }

    #[test]
    fn test_missing_plugin() {
        let plugins = PluginRegistry::with_builtins();
        let err = plugins.resolve("backends", "Dirac").unwrap_err();
        assert_eq!(err.error_code(), "PLUGIN_MISSING");
        assert_eq!(
            err.to_string(),
            "plugin class 'backends/Dirac' is not registered"
        );
    }

    #[test]
    fn test_instantiate_creates_default_components() {
        let plugins = PluginRegistry::with_builtins();
        let job = plugins.instantiate("jobs", "Job").unwrap();

        let backend = job.get("backend").and_then(Value::as_object).unwrap();
        assert_eq!(backend.class_name(), "Local");
        let app = job.get("application").and_then(Value::as_object).unwrap();
        assert_eq!(app.get_str("exe"), Some("echo"));
        assert_eq!(job.get("inputdata"), Some(&Value::Null));
    }

    #[test]
    fn test_classes_listed_in_order() {
        let plugins = PluginRegistry::with_builtins();
        let names: Vec<String> = plugins
            .classes()
            .iter()
            .map(|c| format!("{}/{}", c.category, c.name))
            .collect();
        assert_eq!(names.len(), plugins.len());
        assert_eq!(names[0], "applications/Executable");
        assert!(names.contains(&"sharedfiles/ShareRef".to_string()));
    }

    #[test]
    fn test_unregister() {
        let mut plugins = PluginRegistry::with_builtins();
        let before = plugins.len();
        assert!(plugins.unregister("backends", "Batch").is_some());
        assert_eq!(plugins.len(), before - 1);
        assert!(plugins.resolve("backends", "Batch").is_err());
    }
}
