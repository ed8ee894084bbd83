// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Declared schemas and live object values.
//!
//! A [`ClassDef`] lists the fields of a plugin class in declaration order,
//! the type each field accepts, and which values feed the index cache. A
//! [`GangaObject`] is an instance of such a class holding [`Value`]s.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::ObjectId;
use crate::error::{RepoError, Result};

/// A reference to another persisted object, recorded instead of following it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub id: ObjectId,
    pub category: String,
}

/// A field value of a live object.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Object(Box<GangaObject>),
    Ref(ObjectRef),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&GangaObject> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short name of the value's type, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
            Value::Ref(_) => "ref",
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<GangaObject> for Value {
    fn from(o: GangaObject) -> Self {
        Value::Object(Box::new(o))
    }
}

/// The type a field accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Bool,
    Int,
    Float,
    Str,
    /// String-keyed mapping of plain values.
    Map,
    /// A nested object whose class belongs to the given plugin category.
    Component { category: String },
    /// A back-reference to a persisted object; stored as a marker only.
    BackRef { category: String },
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Bool => write!(f, "bool"),
            FieldType::Int => write!(f, "int"),
            FieldType::Float => write!(f, "float"),
            FieldType::Str => write!(f, "str"),
            FieldType::Map => write!(f, "map"),
            FieldType::Component { category } => write!(f, "component<{}>", category),
            FieldType::BackRef { category } => write!(f, "ref<{}>", category),
        }
    }
}

/// Declaration of a single schema field.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub ty: FieldType,
    /// The field holds a list of `ty` values.
    pub sequence: bool,
    pub default: Value,
    /// Class instantiated for component fields of freshly created objects.
    pub default_class: Option<String>,
    /// Transient fields are never persisted.
    pub transient: bool,
}

impl FieldSpec {
    pub fn simple(name: &str, ty: FieldType, default: Value) -> Self {
        Self {
            name: name.to_string(),
            ty,
            sequence: false,
            default,
            default_class: None,
            transient: false,
        }
    }

    pub fn string(name: &str, default: &str) -> Self {
        Self::simple(name, FieldType::Str, Value::from(default))
    }

    pub fn int(name: &str, default: i64) -> Self {
        Self::simple(name, FieldType::Int, Value::Int(default))
    }

    pub fn boolean(name: &str, default: bool) -> Self {
        Self::simple(name, FieldType::Bool, Value::Bool(default))
    }

    pub fn map(name: &str) -> Self {
        Self::simple(name, FieldType::Map, Value::Map(BTreeMap::new()))
    }

    /// A list of values of type `ty`, empty by default.
    pub fn list(name: &str, ty: FieldType) -> Self {
        Self {
            sequence: true,
            default: Value::List(Vec::new()),
            ..Self::simple(name, ty, Value::Null)
        }
    }

    pub fn component(name: &str, category: &str, default_class: Option<&str>) -> Self {
        Self {
            default_class: default_class.map(str::to_string),
            ..Self::simple(
                name,
                FieldType::Component {
                    category: category.to_string(),
                },
                Value::Null,
            )
        }
    }

    pub fn back_ref(name: &str, category: &str) -> Self {
        Self::simple(
            name,
            FieldType::BackRef {
                category: category.to_string(),
            },
            Value::Null,
        )
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Check that `value` is acceptable for this field.
    pub fn check(&self, value: &Value) -> std::result::Result<(), String> {
        match value {
            Value::Null => Ok(()),
            Value::List(items) if self.sequence => {
                for (i, item) in items.iter().enumerate() {
                    self.check_item(item)
                        .map_err(|reason| format!("item {}: {}", i, reason))?;
                }
                Ok(())
            }
            other if self.sequence => Err(format!(
                "expected list of {}, found {}",
                self.ty,
                other.type_name()
            )),
            other => self.check_item(other),
        }
    }

    fn check_item(&self, value: &Value) -> std::result::Result<(), String> {
        let ok = match (&self.ty, value) {
            (_, Value::Null) => true,
            (FieldType::Bool, Value::Bool(_)) => true,
            (FieldType::Int, Value::Int(_)) => true,
            (FieldType::Float, Value::Float(f)) => {
                check_finite(*f)?;
                true
            }
            (FieldType::Str, Value::Str(_)) => true,
            (FieldType::Map, Value::Map(entries)) => {
                for (key, entry) in entries {
                    check_plain(entry).map_err(|reason| format!("key '{}': {}", key, reason))?;
                }
                true
            }
            (FieldType::Component { category }, Value::Object(obj)) => {
                if obj.category() != category {
                    return Err(format!(
                        "expected component of category '{}', found {}/{}",
                        category,
                        obj.category(),
                        obj.class_name()
                    ));
                }
                true
            }
            (FieldType::BackRef { category }, Value::Ref(r)) => r.category == *category,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(format!("expected {}, found {}", self.ty, value.type_name()))
        }
    }
}

/// JSON has no representation for NaN or the infinities.
fn check_finite(f: f64) -> std::result::Result<(), String> {
    if f.is_finite() {
        Ok(())
    } else {
        Err(format!("non-finite float {} cannot be stored", f))
    }
}

fn check_plain(value: &Value) -> std::result::Result<(), String> {
    match value {
        Value::Object(_) | Value::Ref(_) => {
            Err(format!("expected plain value, found {}", value.type_name()))
        }
        Value::Float(f) => check_finite(*f),
        Value::List(items) => items.iter().try_for_each(check_plain),
        Value::Map(entries) => entries.values().try_for_each(check_plain),
        _ => Ok(()),
    }
}

/// What an index entry takes from the value found at its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    /// The value itself (must be plain).
    Value,
    /// The class name of the component found at the path.
    ClassName,
}

/// One key of a class's index cache.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub key: String,
    /// Field names (and map keys) walked from the object root.
    pub path: Vec<String>,
    pub projection: Projection,
}

impl IndexSpec {
    pub fn value(key: &str, path: &[&str]) -> Self {
        Self {
            key: key.to_string(),
            path: path.iter().map(|p| p.to_string()).collect(),
            projection: Projection::Value,
        }
    }

    pub fn class_name(key: &str, path: &[&str]) -> Self {
        Self {
            projection: Projection::ClassName,
            ..Self::value(key, path)
        }
    }
}

/// A plugin class definition.
#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: String,
    pub category: String,
    pub version: u32,
    pub fields: Vec<FieldSpec>,
    pub index: Vec<IndexSpec>,
}

impl ClassDef {
    pub fn new(name: &str, category: &str) -> Self {
        Self {
            name: name.to_string(),
            category: category.to_string(),
            version: 1,
            fields: Vec::new(),
            index: Vec::new(),
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn indexed(mut self, spec: IndexSpec) -> Self {
        self.index.push(spec);
        self
    }

    pub fn field_spec(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A live instance of a plugin class.
#[derive(Debug, Clone)]
pub struct GangaObject {
    class: Arc<ClassDef>,
    fields: BTreeMap<String, Value>,
}

impl PartialEq for GangaObject {
    fn eq(&self, other: &Self) -> bool {
        self.class.name == other.class.name
            && self.class.category == other.class.category
            && self.fields == other.fields
    }
}

impl GangaObject {
    /// Instantiate `class` with schema defaults only.
    ///
    /// Component fields stay empty; this is the path used when decoding
    /// stored data, so no default sub-objects are created.
    pub fn blank(class: Arc<ClassDef>) -> Self {
        let fields = class
            .fields
            .iter()
            .map(|f| (f.name.clone(), f.default.clone()))
            .collect();
        Self { class, fields }
    }

    pub fn class(&self) -> &Arc<ClassDef> {
        &self.class
    }

    pub fn class_name(&self) -> &str {
        &self.class.name
    }

    pub fn category(&self) -> &str {
        &self.class.category
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    /// Assign a field after checking it against the schema.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let spec = self
            .class
            .field_spec(name)
            .ok_or_else(|| RepoError::Schema {
                class_name: self.class.name.clone(),
                field: name.to_string(),
                reason: "no such field".to_string(),
            })?;
        spec.check(&value).map_err(|reason| RepoError::Schema {
            class_name: self.class.name.clone(),
            field: name.to_string(),
            reason,
        })?;
        self.fields.insert(name.to_string(), value);
        Ok(())
    }

    /// Mutable access to a nested component.
    pub fn component_mut(&mut self, name: &str) -> Option<&mut GangaObject> {
        match self.fields.get_mut(name) {
            Some(Value::Object(o)) => Some(o),
            _ => None,
        }
    }

    /// Insert a value that was already validated by the caller.
    pub(crate) fn insert_checked(&mut self, name: &str, value: Value) {
        self.fields.insert(name.to_string(), value);
    }

    /// Point every reference to object `from` at `to`, including references
    /// inside nested components and collections. Returns how many changed.
    pub fn remap_refs(&mut self, from: ObjectId, to: ObjectId) -> usize {
        self.fields
            .values_mut()
            .map(|value| remap_value(value, from, to))
            .sum()
    }
}

fn remap_value(value: &mut Value, from: ObjectId, to: ObjectId) -> usize {
    match value {
        Value::Ref(r) if r.id == from => {
            r.id = to;
            1
        }
        Value::List(items) => items.iter_mut().map(|v| remap_value(v, from, to)).sum(),
        Value::Map(entries) => entries.values_mut().map(|v| remap_value(v, from, to)).sum(),
        Value::Object(inner) => inner.remap_refs(from, to),
        _ => 0,
    }
}
