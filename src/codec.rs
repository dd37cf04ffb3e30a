//! Doc Codec (§4.1): pure conversion between the external snapshot shape and
//! the stored document shape. No I/O, no store knowledge — this module only
//! knows about field names and BSON shapes.

use crate::model::{
    CreateOp, DocId, OpLink, Snapshot, FIELD_DATA, FIELD_ID, FIELD_M, FIELD_O, FIELD_TYPE, FIELD_V,
};
use bson::{Bson, Document};

/// Convert an external snapshot into the stored document form, stamping in
/// the reserved fields and the freshly-assigned op link.
///
/// If `snapshot.data` is a plain object it becomes the base document (so its
/// keys appear at the top level); otherwise the base is empty and, if `data`
/// is present, it is tucked under `_data`.
pub fn cast_to_doc(id: &DocId, snapshot: &Snapshot, op_link: OpLink) -> Document {
    let mut doc = match &snapshot.data {
        Some(Bson::Document(obj)) => obj.clone(),
        Some(scalar) => {
            let mut d = Document::new();
            d.insert(FIELD_DATA, scalar.clone());
            d
        }
        None => Document::new(),
    };

    doc.insert(FIELD_ID, id.0.clone());
    doc.insert(FIELD_TYPE, snapshot.type_.clone().map(Bson::String).unwrap_or(Bson::Null));
    doc.insert(FIELD_V, snapshot.v as i64);
    doc.insert(FIELD_M, snapshot.m.clone().unwrap_or(Bson::Null));
    doc.insert(FIELD_O, Bson::ObjectId(op_link));

    doc
}

/// Convert a stored document back into its external snapshot form.
///
/// `cast_to_snapshot(cast_to_doc(id, snapshot, link))` is the identity on
/// `(id, v, type, data, m, _opLink)` for every representable snapshot (P3).
pub fn cast_to_snapshot(doc: &Document) -> Snapshot {
    let id = doc.get_str(FIELD_ID).unwrap_or_default().to_string();
    let v = doc.get_i64(FIELD_V).unwrap_or(0) as u64;
    let m = match doc.get(FIELD_M) {
        Some(Bson::Null) | None => None,
        Some(other) => Some(other.clone()),
    };
    let op_link = doc.get_object_id(FIELD_O).ok();

    let type_ = match doc.get(FIELD_TYPE) {
        Some(Bson::String(t)) => Some(t.clone()),
        _ => None,
    };

    if type_.is_none() {
        return Snapshot {
            id,
            v,
            type_: None,
            data: None,
            m,
            op_link,
        };
    }

    let data = match doc.get(FIELD_DATA) {
        Some(value) => Some(value.clone()),
        None => {
            let mut rest = doc.clone();
            for reserved in crate::model::RESERVED_FIELDS {
                rest.remove(reserved);
            }
            Some(Bson::Document(rest))
        }
    };

    Snapshot {
        id,
        v,
        type_,
        data,
        m,
        op_link,
    }
}

/// Build the external snapshot a successful `create` op produces, before it
/// has been cast to a stored document. Used by the commit coordinator to
/// build the first version of a document.
pub fn snapshot_from_create(id: &DocId, v: u64, create: &CreateOp, m: Option<Bson>) -> Snapshot {
    Snapshot {
        id: id.0.clone(),
        v,
        type_: Some(create.type_.clone()),
        data: create.data.clone(),
        m,
        op_link: None,
    }
}
