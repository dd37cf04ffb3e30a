//! Wire-level types shared by every component: the external snapshot shape the
//! OT server hands the adapter, the op shape it submits, and the reserved
//! field names used in the stored (document-database) representation.

use bson::oid::ObjectId;
use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved field names on the stored document. Never usable as a top-level
/// key in caller-supplied snapshot `data`.
pub const FIELD_ID: &str = "_id";
pub const FIELD_V: &str = "_v";
pub const FIELD_TYPE: &str = "_type";
pub const FIELD_M: &str = "_m";
pub const FIELD_O: &str = "_o";
pub const FIELD_DATA: &str = "_data";

pub const RESERVED_FIELDS: [&str; 6] =
    [FIELD_ID, FIELD_V, FIELD_TYPE, FIELD_M, FIELD_O, FIELD_DATA];

/// Reserved op fields, duplicated across every op row for indexing and linkage.
pub const OP_FIELD_ID: &str = "_id";
pub const OP_FIELD_D: &str = "d";
pub const OP_FIELD_O: &str = "o";
pub const OP_FIELD_V: &str = "v";
pub const OP_FIELD_SRC: &str = "src";
pub const OP_FIELD_SEQ: &str = "seq";

/// Logical document id. The store's primary key for a document's snapshot row.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocId(pub String);

impl From<&str> for DocId {
    fn from(s: &str) -> Self {
        DocId(s.to_string())
    }
}

impl From<String> for DocId {
    fn from(s: String) -> Self {
        DocId(s)
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A logical collection name, validated against the reserved names in §4.2
/// before it is ever turned into a store collection handle.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CollectionName(String);

impl CollectionName {
    /// Validate and wrap a caller-supplied collection name.
    ///
    /// Rejects `system` (reserved by the store itself) and any name starting
    /// with `o_` (reserved for this adapter's own op collections).
    pub fn parse(name: impl Into<String>) -> Result<Self, crate::error::AdapterError> {
        let name = name.into();
        if name == "system" || name.starts_with("o_") {
            return Err(crate::error::AdapterError::invalid_collection_name(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name of this collection's op log: `o_<name>`.
    pub fn op_collection_name(&self) -> String {
        format!("o_{}", self.0)
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The op's store-assigned identity, and the value a snapshot or op's `o`
/// field links back to. Opaque to everything above the store layer.
pub type OpLink = ObjectId;

/// The `create` mutation: establishes the OT type and optional initial data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateOp {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Bson>,
}

/// A single client-submitted operation, in external (caller-facing) form.
///
/// Exactly one of `create`, `del`, `op` should be set; the adapter does not
/// itself validate this (the OT engine is the authority on op well-formedness)
/// but the commit coordinator and polling optimizer both branch on which one
/// is present.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Op {
    /// The version this op was written at. The resulting snapshot version is
    /// `v + 1`.
    pub v: u64,
    /// Client-assigned source id, paired with `seq` for idempotency.
    pub src: String,
    pub seq: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub create: Option<CreateOp>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub del: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub op: Option<Vec<Document>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub m: Option<Bson>,
}

impl Op {
    pub fn is_create(&self) -> bool {
        self.create.is_some()
    }

    pub fn is_delete(&self) -> bool {
        self.del.unwrap_or(false)
    }

    /// First path component of each mutation entry, used by the polling
    /// optimizer. An entry with an empty path is reported as `None`, which
    /// callers must treat conservatively (it may touch any field).
    pub fn component_first_path_keys(&self) -> Vec<Option<String>> {
        match &self.op {
            None => Vec::new(),
            Some(components) => components
                .iter()
                .map(|component| {
                    component
                        .get_array("p")
                        .ok()
                        .and_then(|p| p.first())
                        .and_then(bson_to_field_key)
                })
                .collect(),
        }
    }
}

/// Render a path component (string or integer index) as the field-name key
/// the polling optimizer compares against a query's referenced fields.
fn bson_to_field_key(b: &Bson) -> Option<String> {
    match b {
        Bson::String(s) => Some(s.clone()),
        Bson::Int32(n) => Some(n.to_string()),
        Bson::Int64(n) => Some(n.to_string()),
        _ => None,
    }
}

/// An op as stored in the op log: the external `Op` plus the adapter-injected
/// document id and back-link to the previous op in this document's history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredOp {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none", default)]
    pub id: Option<OpLink>,
    pub d: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub o: Option<OpLink>,
    #[serde(flatten)]
    pub op: Op,
}

/// The materialized state of a document at a given version, in external form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub v: u64,
    /// `None` means the document is logically deleted.
    #[serde(rename = "type")]
    pub type_: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Bson>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub m: Option<Bson>,
    #[serde(rename = "_opLink", skip_serializing_if = "Option::is_none", default)]
    pub op_link: Option<OpLink>,
}

impl Snapshot {
    /// The deleted-style placeholder returned for a document id that has
    /// never been committed.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            v: 0,
            type_: None,
            data: None,
            m: None,
            op_link: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.type_.is_none()
    }
}
