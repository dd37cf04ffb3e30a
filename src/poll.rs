//! Polling Optimizer (§4.7): cheap, conservative checks that let a
//! subscription layer avoid re-running a query against the store when an
//! incoming op couldn't possibly change that query's result set.
//!
//! Both functions work on the raw query document rather than a
//! [`crate::query::ParsedQuery`] — they only need to recognize operator
//! *keys*, never evaluate the filter itself, so there is nothing to gain
//! from a full parse.

use bson::Document;

use crate::model::Op;
use crate::query::{is_collection_or_cursor_op_key, referenced_fields};

/// Ordering/paging operators that make a query dependent on the full result
/// set rather than any single document, and so unsuitable for per-document
/// poll evaluation even though they aren't collection/cursor ops themselves.
const PAGING_KEYS: [&str; 7] = ["$sort", "$orderby", "$limit", "$skip", "$max", "$min", "$returnKey"];

/// Whether `q` can be evaluated against a single document in isolation
/// (rather than requiring a full collection scan/sort to know if a document
/// is "in" the result set).
pub fn can_poll_doc(q: &Document) -> bool {
    !q.keys().any(|k| is_collection_or_cursor_op_key(k) || PAGING_KEYS.contains(&k.as_str()))
}

/// Whether re-evaluating `q` after `op` is applied is guaranteed to produce
/// the same membership verdict for `id` as before the op (P7). A `false`
/// result never loses correctness; it only means a caller must re-poll.
pub fn skip_poll(op: &Op, q: &Document) -> bool {
    if op.is_create() || op.is_delete() {
        return false;
    }

    if q.keys().any(|k| is_collection_or_cursor_op_key(k)) {
        return false;
    }

    let components = match &op.op {
        None => return true,
        Some(components) => components,
    };
    if components.is_empty() {
        return true;
    }

    let referenced = referenced_fields(q);
    let keys = op.component_first_path_keys();

    // An empty path is conservatively treated as touching every field.
    keys.into_iter().all(|key| match key {
        None => false,
        Some(field) => !referenced.contains(&field),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn mutate_op(paths: Vec<Vec<&str>>) -> Op {
        Op {
            v: 5,
            src: "c1".to_string(),
            seq: 1,
            create: None,
            del: None,
            op: Some(
                paths
                    .into_iter()
                    .map(|p| bson::doc! { "p": p, "oi": 1 })
                    .collect(),
            ),
            m: None,
        }
    }

    fn create_op() -> Op {
        Op {
            v: 0,
            src: "c1".to_string(),
            seq: 1,
            create: Some(crate::model::CreateOp { type_: "json0".to_string(), data: None }),
            del: None,
            op: None,
            m: None,
        }
    }

    fn delete_op() -> Op {
        Op { v: 5, src: "c1".to_string(), seq: 1, create: None, del: Some(true), op: None, m: None }
    }

    #[test]
    fn create_and_delete_always_require_repoll() {
        let q = doc! { "a": 1 };
        assert!(!skip_poll(&create_op(), &q));
        assert!(!skip_poll(&delete_op(), &q));
    }

    #[test]
    fn empty_mutation_is_always_skippable() {
        let op = Op { v: 5, src: "c1".to_string(), seq: 1, create: None, del: None, op: None, m: None };
        assert!(skip_poll(&op, &doc! { "a": 1 }));
    }

    #[test]
    fn disjoint_field_mutation_is_skippable() {
        let q = doc! { "a": 1 };
        let op = mutate_op(vec![vec!["b"]]);
        assert!(skip_poll(&op, &q));
    }

    #[test]
    fn referenced_field_mutation_requires_repoll() {
        let q = doc! { "a": 1 };
        let op = mutate_op(vec![vec!["a"]]);
        assert!(!skip_poll(&op, &q));
    }

    #[test]
    fn empty_path_component_requires_repoll() {
        let q = doc! { "a": 1 };
        let op = mutate_op(vec![vec![]]);
        assert!(!skip_poll(&op, &q));
    }

    #[test]
    fn sort_field_counts_as_referenced() {
        let q = doc! { "a": 1, "$sort": { "b": 1 } };
        // `b` is only mentioned via `$sort`, not the filter, but a mutation
        // to it still must force a re-poll since it could reorder results.
        let touches_sort_field = mutate_op(vec![vec!["b"]]);
        assert!(!skip_poll(&touches_sort_field, &q));

        let disjoint = mutate_op(vec![vec!["c"]]);
        assert!(skip_poll(&disjoint, &q));
    }

    #[test]
    fn can_poll_doc_rejects_collection_ops() {
        assert!(!can_poll_doc(&doc! { "$distinct": { "field": "x" } }));
    }

    #[test]
    fn can_poll_doc_rejects_paging_operators() {
        assert!(!can_poll_doc(&doc! { "a": 1, "$limit": 10 }));
        assert!(!can_poll_doc(&doc! { "a": 1, "$sort": { "a": 1 } }));
    }

    #[test]
    fn can_poll_doc_accepts_plain_filter() {
        assert!(can_poll_doc(&doc! { "a": 1, "b": { "$gt": 2 } }));
    }
}
