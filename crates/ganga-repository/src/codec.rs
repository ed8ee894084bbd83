// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Object codec: live objects to a storage-neutral tree and back.
//!
//! Every field is written with an explicit type tag, components nest as
//! trees, and back-references become `{id, category}` markers that are never
//! followed. Field order follows the class declaration, so encoding the same
//! object twice produces identical bytes.
//!
//! The codec performs no I/O.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ObjectId;
use crate::error::{RepoError, Result};
use crate::plugins::PluginRegistry;
use crate::schema::{GangaObject, ObjectRef, Value};

/// Storage-neutral form of one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectTree {
    pub class: String,
    pub category: String,
    pub version: u32,
    pub fields: Vec<FieldEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEntry {
    pub name: String,
    pub value: TreeNode,
}

/// A type-tagged field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum TreeNode {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<TreeNode>),
    Map(BTreeMap<String, TreeNode>),
    Object(Box<ObjectTree>),
    Ref { id: ObjectId, category: String },
}

/// Convert a live object into its tree form, in schema declaration order.
pub fn serialize(object: &GangaObject) -> ObjectTree {
    let class = object.class();
    let fields = class
        .fields
        .iter()
        .filter(|spec| !spec.transient)
        .map(|spec| FieldEntry {
            name: spec.name.clone(),
            value: to_node(object.get(&spec.name).unwrap_or(&spec.default)),
        })
        .collect();

    ObjectTree {
        class: class.name.clone(),
        category: class.category.clone(),
        version: class.version,
        fields,
    }
}

fn to_node(value: &Value) -> TreeNode {
    match value {
        Value::Null => TreeNode::None,
        Value::Bool(b) => TreeNode::Bool(*b),
        Value::Int(i) => TreeNode::Int(*i),
        Value::Float(f) => TreeNode::Float(*f),
        Value::Str(s) => TreeNode::Str(s.clone()),
        Value::List(items) => TreeNode::List(items.iter().map(to_node).collect()),
        Value::Map(entries) => TreeNode::Map(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), to_node(v)))
                .collect(),
        ),
        Value::Object(obj) => TreeNode::Object(Box::new(serialize(obj))),
        Value::Ref(r) => TreeNode::Ref {
            id: r.id,
            category: r.category.clone(),
        },
    }
}

/// Rebuild a live object from its tree form.
///
/// The class is resolved through `plugins` and instantiated blank; stored
/// fields then overwrite the defaults after a type check against the current
/// schema. Fields the schema no longer declares are dropped.
pub fn deserialize(tree: &ObjectTree, plugins: &PluginRegistry) -> Result<GangaObject> {
    let class = plugins.resolve(&tree.category, &tree.class)?;
    if tree.version > class.version {
        return Err(RepoError::corrupt(format!(
            "{} was stored with schema version {} but only version {} is known",
            tree.class, tree.version, class.version
        )));
    }

    let mut object = GangaObject::blank(class.clone());
    for entry in &tree.fields {
        let Some(spec) = class.field_spec(&entry.name) else {
            debug!(
                class = %tree.class,
                field = %entry.name,
                "Dropping field no longer in schema"
            );
            continue;
        };
        if spec.transient {
            continue;
        }
        let value = from_node(&entry.value, plugins)?;
        spec.check(&value).map_err(|reason| {
            RepoError::corrupt(format!("{}.{}: {}", tree.class, entry.name, reason))
        })?;
        object.insert_checked(&entry.name, value);
    }
    Ok(object)
}

fn from_node(node: &TreeNode, plugins: &PluginRegistry) -> Result<Value> {
    Ok(match node {
        TreeNode::None => Value::Null,
        TreeNode::Bool(b) => Value::Bool(*b),
        TreeNode::Int(i) => Value::Int(*i),
        TreeNode::Float(f) => Value::Float(*f),
        TreeNode::Str(s) => Value::Str(s.clone()),
        TreeNode::List(items) => Value::List(
            items
                .iter()
                .map(|n| from_node(n, plugins))
                .collect::<Result<_>>()?,
        ),
        TreeNode::Map(entries) => Value::Map(
            entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), from_node(v, plugins)?)))
                .collect::<Result<_>>()?,
        ),
        TreeNode::Object(tree) => Value::from(deserialize(tree, plugins)?),
        TreeNode::Ref { id, category } => Value::Ref(ObjectRef {
            id: *id,
            category: category.clone(),
        }),
    })
}

/// Encode a tree as the pretty-printed JSON stored by the file-tree backend.
pub fn encode(tree: &ObjectTree) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(tree)?)
}

/// Parse stored bytes; malformed input is reported as corrupt data.
pub fn decode(bytes: &[u8]) -> Result<ObjectTree> {
    serde_json::from_slice(bytes)
        .map_err(|e| RepoError::corrupt(format!("unreadable payload: {}", e)))
}
