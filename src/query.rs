//! Query Engine (§4.6): parses the store's native query object extended with
//! `$`-prefixed adapter operators, validates and rewrites it for safety, and
//! dispatches it against a [`Store`].
//!
//! The three operator categories are kept disjoint by construction: a
//! [`ParsedQuery`] carries at most one [`CollectionOp`], any number of cursor
//! transforms (folded straight into a [`FindOptions`]), and at most one
//! [`CursorOp`]. The base filter is never translated — only ever a safety
//! rewrite (`make_query_safe`) is applied to it before it reaches the store.

use std::collections::HashSet;

use bson::{doc, Bson, Document};

use crate::error::{AdapterError, AdapterResult};
use crate::store::{FindOptions, MapReduceSpec, Store};

const COLLECTION_OP_KEYS: [&str; 3] = ["$distinct", "$aggregate", "$mapReduce"];
const CURSOR_OP_KEYS: [&str; 3] = ["$count", "$explain", "$map"];
const CURSOR_TRANSFORM_KEYS: [&str; 18] = [
    "$sort",
    "$skip",
    "$limit",
    "$hint",
    "$comment",
    "$batchSize",
    "$maxTimeMS",
    "$min",
    "$max",
    "$maxScan",
    "$readConcern",
    "$readPref",
    "$returnKey",
    "$snapshot",
    "$showRecordId",
    "$noCursorTimeout",
    "$orderby",
    "$showDiskLoc",
];

/// Every key that marks a query as "not a plain filter" — used by the
/// polling optimizer to decide a query can't be evaluated per-document.
pub(crate) fn is_collection_or_cursor_op_key(key: &str) -> bool {
    COLLECTION_OP_KEYS.contains(&key) || CURSOR_OP_KEYS.contains(&key)
}

#[derive(Clone, Debug)]
pub enum CollectionOp {
    Distinct(String),
    Aggregate(Vec<Document>),
    MapReduce(MapReduceSpec),
}

#[derive(Clone, Debug)]
pub enum CursorOp {
    Count,
    Explain,
    /// The raw `$map` payload. Applying it is the caller's concern — mapping
    /// over results with arbitrary code is exactly the "OT engine and
    /// transform functions" this adapter treats as out of scope.
    Map(Bson),
}

/// The scalar result of a collection op or a `$count`/`$explain`/`$map`
/// cursor op, returned alongside an (possibly empty) document list.
#[derive(Clone, Debug)]
pub enum QueryExtra {
    Distinct(Vec<Bson>),
    Aggregate(Vec<Document>),
    MapReduce(Vec<Document>),
    Count(u64),
    Explain(Document),
    Map(Bson),
}

#[derive(Clone, Debug, Default)]
pub struct ParsedQuery {
    pub filter: Document,
    pub collection_op: Option<CollectionOp>,
    pub find_options: FindOptions,
    pub cursor_op: Option<CursorOp>,
}

/// Validate a raw query document before it is parsed (§4.6 `checkQuery`).
pub fn check_query(q: &Document, allow_js_queries: bool, allow_aggregate_queries: bool) -> AdapterResult<()> {
    if q.contains_key("$query") {
        return Err(AdapterError::LegacyQueryWrapper);
    }

    if q.contains_key("$where") && !allow_js_queries {
        return Err(AdapterError::JsQueryDisabled);
    }

    let collection_ops: Vec<&str> = q
        .keys()
        .map(|k| k.as_str())
        .filter(|k| COLLECTION_OP_KEYS.contains(k))
        .collect();
    if collection_ops.len() > 1 {
        return Err(AdapterError::MultipleCollectionOps);
    }

    let cursor_ops: Vec<&str> = q
        .keys()
        .map(|k| k.as_str())
        .filter(|k| CURSOR_OP_KEYS.contains(k))
        .collect();
    if cursor_ops.len() > 1 {
        return Err(AdapterError::MultipleCursorOps);
    }

    if let Some(&op) = collection_ops.first() {
        if q.keys().any(|k| CURSOR_TRANSFORM_KEYS.contains(&k.as_str()) || CURSOR_OP_KEYS.contains(&k.as_str())) {
            return Err(AdapterError::CollectionOpWithCursorMethod);
        }
        match op {
            "$mapReduce" if !allow_js_queries => return Err(AdapterError::MapReduceDisabled),
            "$aggregate" if !allow_aggregate_queries => return Err(AdapterError::AggregateDisabled),
            _ => {}
        }
    }

    Ok(())
}

/// Partition a validated query into its four buckets (§4.6 `parseQuery`).
/// Callers must run [`check_query`] first; this function focuses on shape
/// errors within an individual operator's payload.
pub fn parse_query(q: &Document) -> AdapterResult<ParsedQuery> {
    let mut parsed = ParsedQuery::default();

    for (key, value) in q {
        match key.as_str() {
            "$distinct" => {
                let field = value
                    .as_document()
                    .and_then(|d| d.get_str("field").ok())
                    .or_else(|| value.as_str())
                    .ok_or_else(|| AdapterError::MalformedQueryOperator("$distinct".to_string()))?;
                parsed.collection_op = Some(CollectionOp::Distinct(field.to_string()));
            }
            "$aggregate" => {
                let pipeline = value
                    .as_array()
                    .ok_or_else(|| AdapterError::MalformedQueryOperator("$aggregate".to_string()))?
                    .iter()
                    .map(|stage| {
                        stage
                            .as_document()
                            .cloned()
                            .ok_or_else(|| AdapterError::MalformedQueryOperator("$aggregate".to_string()))
                    })
                    .collect::<AdapterResult<Vec<_>>>()?;
                parsed.collection_op = Some(CollectionOp::Aggregate(pipeline));
            }
            "$mapReduce" => {
                let spec = value
                    .as_document()
                    .ok_or_else(|| AdapterError::MalformedQueryOperator("$mapReduce".to_string()))?;
                let map = spec
                    .get_str("map")
                    .map_err(|_| AdapterError::MalformedQueryOperator("$mapReduce.map".to_string()))?
                    .to_string();
                let reduce = spec
                    .get_str("reduce")
                    .map_err(|_| AdapterError::MalformedQueryOperator("$mapReduce.reduce".to_string()))?
                    .to_string();
                let scope = spec.get_document("scope").ok().cloned();
                parsed.collection_op = Some(CollectionOp::MapReduce(MapReduceSpec { map, reduce, scope }));
            }
            "$count" => parsed.cursor_op = Some(CursorOp::Count),
            "$explain" => parsed.cursor_op = Some(CursorOp::Explain),
            "$map" => parsed.cursor_op = Some(CursorOp::Map(value.clone())),
            "$sort" | "$orderby" => {
                let sort = value
                    .as_document()
                    .cloned()
                    .ok_or_else(|| AdapterError::MalformedQueryOperator(key.clone()))?;
                parsed.find_options.sort = Some(sort);
            }
            "$skip" => parsed.find_options.skip = as_i64(value, key)?,
            "$limit" => parsed.find_options.limit = as_i64(value, key)?,
            "$hint" => parsed.find_options.hint = Some(value.clone()),
            "$comment" => {
                parsed.find_options.comment =
                    Some(value.as_str().ok_or_else(|| AdapterError::MalformedQueryOperator(key.clone()))?.to_string())
            }
            "$batchSize" => {
                parsed.find_options.batch_size =
                    as_i64(value, key)?.map(|n| n.max(0) as u32)
            }
            "$maxTimeMS" => parsed.find_options.max_time_ms = as_i64(value, key)?,
            "$min" => {
                parsed.find_options.min =
                    Some(value.as_document().cloned().ok_or_else(|| AdapterError::MalformedQueryOperator(key.clone()))?)
            }
            "$max" => {
                parsed.find_options.max =
                    Some(value.as_document().cloned().ok_or_else(|| AdapterError::MalformedQueryOperator(key.clone()))?)
            }
            "$maxScan" => parsed.find_options.max_scan = as_i64(value, key)?,
            "$readConcern" => {
                parsed.find_options.read_concern =
                    Some(value.as_str().ok_or_else(|| AdapterError::MalformedQueryOperator(key.clone()))?.to_string())
            }
            "$readPref" => {
                parsed.find_options.read_pref =
                    Some(value.as_document().cloned().ok_or_else(|| AdapterError::MalformedQueryOperator(key.clone()))?)
            }
            "$returnKey" => parsed.find_options.return_key = as_bool(value, key)?,
            "$snapshot" => parsed.find_options.snapshot = as_bool(value, key)?,
            "$showRecordId" | "$showDiskLoc" => parsed.find_options.show_record_id = as_bool(value, key)?,
            "$noCursorTimeout" => parsed.find_options.no_cursor_timeout = as_bool(value, key)?,
            _ => {
                parsed.filter.insert(key.clone(), value.clone());
            }
        }
    }

    Ok(parsed)
}

fn as_i64(value: &Bson, key: &str) -> AdapterResult<Option<i64>> {
    match value {
        Bson::Int32(n) => Ok(Some(*n as i64)),
        Bson::Int64(n) => Ok(Some(*n)),
        Bson::Double(n) => Ok(Some(*n as i64)),
        _ => Err(AdapterError::MalformedQueryOperator(key.to_string())),
    }
}

fn as_bool(value: &Bson, key: &str) -> AdapterResult<Option<bool>> {
    match value {
        Bson::Boolean(b) => Ok(Some(*b)),
        _ => Err(AdapterError::MalformedQueryOperator(key.to_string())),
    }
}

/// Rewrite `filter` so it can never match a logically-deleted document
/// unless the caller explicitly asked for `_type`. Conjoins
/// `{_type: {$ne: null}}` only when the filter *could* match a deleted
/// document (§4.6 `makeQuerySafe`).
pub fn make_query_safe(filter: &Document) -> Document {
    // A filter that already constrains `_type` is explicitly managing
    // deletion visibility itself (e.g. `{_type: null}` to find deleted
    // documents, or `{_type: {$ne: null}}` already excluding them) — the
    // conjunction the guard would add could otherwise make such a query
    // self-contradictory.
    if filter.contains_key("_type") || !could_match_deleted(filter) {
        return filter.clone();
    }
    if filter.is_empty() {
        return doc! { "_type": { "$ne": Bson::Null } };
    }
    doc! { "$and": [Bson::Document(filter.clone()), Bson::Document(doc! { "_type": { "$ne": Bson::Null } })] }
}

fn could_match_deleted(filter: &Document) -> bool {
    filter.iter().all(|(key, clause)| match key.as_str() {
        "$and" => match clause {
            Bson::Array(items) => items.iter().all(|item| match item.as_document() {
                Some(d) => could_match_deleted(d),
                None => true,
            }),
            _ => true,
        },
        "$or" => match clause {
            Bson::Array(items) => items.iter().any(|item| match item.as_document() {
                Some(d) => could_match_deleted(d),
                None => true,
            }),
            _ => true,
        },
        k if k.starts_with('$') => true,
        _ => could_match_null(clause),
    })
}

/// Whether `clause`, matched against a single field, could match that
/// field's absence (which is how a logically-deleted document's data fields
/// present themselves — `cast_to_doc` never writes them).
fn could_match_null(clause: &Bson) -> bool {
    match clause {
        Bson::Null => true,
        Bson::Document(d) if !d.is_empty() && d.keys().all(|k| k.starts_with('$')) => {
            d.iter().all(|(op, value)| match op.as_str() {
                // `$ne: null` can never match a missing/null field; any other
                // `$ne` target (including non-scalars) can, since null != x.
                "$ne" => !matches!(value, Bson::Null),
                "$exists" => !matches!(value, Bson::Boolean(true)),
                "$in" => match value.as_array() {
                    Some(arr) => arr.iter().any(|v| matches!(v, Bson::Null)),
                    None => true,
                },
                "$gt" | "$gte" | "$lt" | "$lte" => matches!(value, Bson::Null),
                _ => true,
            })
        }
        Bson::Document(_) => true,
        _ => false,
    }
}

/// Projection applied to a query's documents (§4.6 `getProjection`). `_m`
/// and `_o` are never returned unless explicitly requested (P6); `$submit`
/// signals the OT commit path's own callback shape and gets no projection.
pub fn get_projection(fields: Option<&Document>) -> Option<Document> {
    match fields {
        None => Some(doc! { "_m": 0, "_o": 0 }),
        Some(f) if f.contains_key("$submit") => None,
        Some(f) => {
            let mut projection = Document::new();
            for key in f.keys() {
                projection.insert(key.clone(), 1);
            }
            projection.insert("_type", 1);
            projection.insert("_v", 1);
            Some(projection)
        }
    }
}

/// Narrow `filter` to a single document id for `query_poll_doc` (§4.6).
/// Returns `None` when the filter's existing `_id` constraint already
/// excludes `id`, short-circuiting the caller to a `false` result without a
/// round trip to the store.
pub fn restrict_filter_to_id(filter: &Document, id: &str) -> Option<Document> {
    match filter.get("_id") {
        None => {
            let mut narrowed = filter.clone();
            narrowed.insert("_id", id);
            Some(narrowed)
        }
        Some(Bson::String(existing)) => {
            if existing == id {
                Some(filter.clone())
            } else {
                None
            }
        }
        Some(Bson::Document(constraint)) if constraint.len() == 1 && constraint.contains_key("$in") => {
            match constraint.get_array("$in") {
                Ok(candidates) if candidates.iter().any(|v| v.as_str() == Some(id)) => Some(filter.clone()),
                Ok(_) => None,
                Err(_) => Some(filter.clone()),
            }
        }
        Some(_) => Some(doc! { "$and": [Bson::Document(filter.clone()), Bson::Document(doc! { "_id": id })] }),
    }
}

/// Execute a parsed, already-safety-rewritten query against `collection`.
/// Dispatches a collection op if present; otherwise builds a cursor with the
/// base filter and projection and applies every cursor transform, then
/// either the terminal cursor op or materializes the full result.
pub async fn execute<S: Store>(
    store: &S,
    collection: &str,
    parsed: &ParsedQuery,
    projection: Option<Document>,
) -> AdapterResult<(Vec<Document>, Option<QueryExtra>)> {
    if let Some(collection_op) = &parsed.collection_op {
        let extra = match collection_op {
            CollectionOp::Distinct(field) => {
                QueryExtra::Distinct(store.distinct(collection, field, parsed.filter.clone()).await?)
            }
            CollectionOp::Aggregate(pipeline) => {
                QueryExtra::Aggregate(store.aggregate(collection, pipeline.clone()).await?)
            }
            CollectionOp::MapReduce(spec) => {
                QueryExtra::MapReduce(store.map_reduce(collection, spec.clone()).await?)
            }
        };
        return Ok((Vec::new(), Some(extra)));
    }

    let mut options = parsed.find_options.clone();
    options.projection = projection;

    match &parsed.cursor_op {
        Some(CursorOp::Count) => {
            let count = store.count(collection, parsed.filter.clone(), options).await?;
            Ok((Vec::new(), Some(QueryExtra::Count(count))))
        }
        Some(CursorOp::Explain) => {
            let plan = store.explain(collection, parsed.filter.clone(), options).await?;
            Ok((Vec::new(), Some(QueryExtra::Explain(plan))))
        }
        Some(CursorOp::Map(raw)) => {
            let docs = store.find(collection, parsed.filter.clone(), options).await?;
            Ok((docs, Some(QueryExtra::Map(raw.clone()))))
        }
        None => {
            let docs = store.find(collection, parsed.filter.clone(), options).await?;
            Ok((docs, None))
        }
    }
}

/// Top-level non-`$` field names referenced by a query's base filter, `$sort`
/// and `$orderby` (used by the polling optimizer, §4.7). Descends into
/// `$and`/`$or` arrays but never into other operators.
pub(crate) fn referenced_fields(q: &Document) -> HashSet<String> {
    let mut fields = HashSet::new();
    collect_filter_fields(q, &mut fields);
    for key in ["$sort", "$orderby"] {
        if let Some(Bson::Document(ordering)) = q.get(key) {
            for k in ordering.keys() {
                if !k.starts_with('$') {
                    fields.insert(k.clone());
                }
            }
        }
    }
    fields
}

fn collect_filter_fields(filter: &Document, out: &mut HashSet<String>) {
    for (key, value) in filter {
        if key == "$and" || key == "$or" {
            if let Bson::Array(items) = value {
                for item in items {
                    if let Some(d) = item.as_document() {
                        collect_filter_fields(d, out);
                    }
                }
            }
        } else if !key.starts_with('$') {
            out.insert(key.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_legacy_query_wrapper() {
        let q = doc! { "$query": { "x": 1 } };
        assert_eq!(check_query(&q, true, true).unwrap_err(), AdapterError::LegacyQueryWrapper);
    }

    #[test]
    fn rejects_where_when_js_disabled() {
        let q = doc! { "$where": "true" };
        assert_eq!(check_query(&q, false, true).unwrap_err(), AdapterError::JsQueryDisabled);
    }

    #[test]
    fn allows_where_when_js_enabled() {
        let q = doc! { "$where": "true" };
        assert!(check_query(&q, true, true).is_ok());
    }

    #[test]
    fn rejects_multiple_collection_ops() {
        let q = doc! { "$distinct": { "field": "x" }, "$aggregate": [] };
        assert_eq!(check_query(&q, true, true).unwrap_err(), AdapterError::MultipleCollectionOps);
    }

    #[test]
    fn rejects_collection_op_with_cursor_method() {
        let q = doc! { "$distinct": { "field": "x" }, "$limit": 10 };
        assert_eq!(
            check_query(&q, true, true).unwrap_err(),
            AdapterError::CollectionOpWithCursorMethod
        );
    }

    #[test]
    fn rejects_aggregate_when_disabled() {
        let q = doc! { "$aggregate": [] };
        assert_eq!(check_query(&q, true, false).unwrap_err(), AdapterError::AggregateDisabled);
    }

    #[test]
    fn parses_filter_and_transforms() {
        let q = doc! { "x": 5, "$sort": { "y": -1 }, "$limit": 10 };
        let parsed = parse_query(&q).unwrap();
        assert_eq!(parsed.filter, doc! { "x": 5 });
        assert_eq!(parsed.find_options.sort, Some(doc! { "y": -1 }));
        assert_eq!(parsed.find_options.limit, Some(10));
        assert!(parsed.collection_op.is_none());
        assert!(parsed.cursor_op.is_none());
    }

    #[test]
    fn orderby_is_an_alias_for_sort() {
        let q = doc! { "$orderby": { "y": 1 } };
        let parsed = parse_query(&q).unwrap();
        assert_eq!(parsed.find_options.sort, Some(doc! { "y": 1 }));
    }

    #[test]
    fn safe_rewrite_is_noop_for_non_null_equality() {
        let filter = doc! { "x": 5 };
        assert_eq!(make_query_safe(&filter), filter);
    }

    #[test]
    fn safe_rewrite_is_noop_for_plain_equality_filter() {
        // Plain equality on a non-null value can never match a deleted
        // document, which has no data fields at all — no guard needed.
        let filter = doc! { "x": 5, "y": 6 };
        assert_eq!(make_query_safe(&filter), filter);
    }

    #[test]
    fn safe_rewrite_applies_for_exists_false() {
        let filter = doc! { "x": { "$exists": false } };
        let safe = make_query_safe(&filter);
        assert!(safe.contains_key("$and"));
    }

    #[test]
    fn safe_rewrite_is_noop_when_type_is_explicitly_constrained() {
        // Even though `_type` itself could match null via an unrelated key,
        // a filter that explicitly excludes null leaves no gap to guard.
        let filter = doc! { "_type": { "$ne": Bson::Null } };
        assert_eq!(make_query_safe(&filter), filter);
    }

    #[test]
    fn safe_rewrite_is_noop_for_ne_null_clause() {
        let filter = doc! { "x": { "$ne": Bson::Null } };
        assert_eq!(make_query_safe(&filter), filter);
    }

    #[test]
    fn safe_rewrite_applies_for_ne_non_null_clause() {
        let filter = doc! { "x": { "$ne": 5 } };
        let safe = make_query_safe(&filter);
        assert!(safe.contains_key("$and"));
    }

    #[test]
    fn safe_rewrite_applies_for_in_with_null() {
        let filter = doc! { "x": { "$in": [Bson::Null, Bson::Int32(1)] } };
        let safe = make_query_safe(&filter);
        assert!(safe.contains_key("$and"));
    }

    #[test]
    fn safe_rewrite_is_noop_for_in_without_null() {
        let filter = doc! { "x": { "$in": [1, 2, 3] } };
        assert_eq!(make_query_safe(&filter), filter);
    }

    #[test]
    fn safe_rewrite_is_noop_when_filter_explicitly_queries_deleted_docs() {
        let filter = doc! { "_type": Bson::Null };
        assert_eq!(make_query_safe(&filter), filter);
    }

    #[test]
    fn safe_rewrite_empty_filter_matches_everything() {
        let filter = Document::new();
        let safe = make_query_safe(&filter);
        assert_eq!(safe, doc! { "_type": { "$ne": Bson::Null } });
    }

    #[test]
    fn safe_rewrite_or_needs_any_child_unsafe() {
        let filter = doc! { "$or": [ { "x": { "$ne": 5 } }, { "y": 1 } ] };
        let safe = make_query_safe(&filter);
        // the `x` branch could match a doc missing `x` entirely, so the
        // `$or` as a whole could match a deleted document via that branch.
        assert!(safe.contains_key("$and"));
    }

    #[test]
    fn safe_rewrite_and_needs_all_children_unsafe() {
        let filter = doc! { "$and": [ { "x": { "$ne": Bson::Null } }, { "y": 1 } ] };
        let safe = make_query_safe(&filter);
        assert_eq!(safe, filter);
    }

    #[test]
    fn projection_defaults_exclude_meta_and_op_link() {
        let projection = get_projection(None).unwrap();
        assert_eq!(projection, doc! { "_m": 0, "_o": 0 });
    }

    #[test]
    fn projection_with_fields_always_includes_type_and_version() {
        let fields = doc! { "x": 1 };
        let projection = get_projection(Some(&fields)).unwrap();
        assert_eq!(projection, doc! { "x": 1, "_type": 1, "_v": 1 });
    }

    #[test]
    fn projection_is_unspecified_for_submit_callback() {
        let fields = doc! { "$submit": true };
        assert!(get_projection(Some(&fields)).is_none());
    }

    #[test]
    fn restrict_filter_to_id_adds_constraint_when_absent() {
        let filter = doc! { "x": 1 };
        let restricted = restrict_filter_to_id(&filter, "doc-1").unwrap();
        assert_eq!(restricted.get_str("_id").unwrap(), "doc-1");
    }

    #[test]
    fn restrict_filter_to_id_short_circuits_on_disagreeing_equality() {
        let filter = doc! { "_id": "other" };
        assert!(restrict_filter_to_id(&filter, "doc-1").is_none());
    }

    #[test]
    fn restrict_filter_to_id_short_circuits_on_excluding_in_list() {
        let filter = doc! { "_id": { "$in": ["a", "b"] } };
        assert!(restrict_filter_to_id(&filter, "doc-1").is_none());
    }

    #[test]
    fn restrict_filter_to_id_keeps_matching_in_list() {
        let filter = doc! { "_id": { "$in": ["a", "doc-1"] } };
        assert!(restrict_filter_to_id(&filter, "doc-1").is_some());
    }

    #[test]
    fn referenced_fields_descends_into_and_or() {
        let q = doc! { "$and": [ { "a": 1 }, { "$or": [ { "b": 2 }, { "c": 3 } ] } ] };
        let fields = referenced_fields(&q);
        assert!(fields.contains("a"));
        assert!(fields.contains("b"));
        assert!(fields.contains("c"));
    }
}
