//! In-process [`Store`] used by the test suite, modeled on the teacher's
//! `RwLock<HashMap<...>>`-backed memory store: every collection is a vector
//! of documents guarded by its own lock, with no persistence or network
//! round-trip. Query support is intentionally partial — enough to drive the
//! commit coordinator, op log reader, and polling tests without a live
//! MongoDB instance.

use std::collections::HashMap;
use std::sync::RwLock;

use bson::{Bson, Document};

use super::{
    Connect, DeleteOutcome, FindOptions, MapReduceSpec, ReplaceOutcome, Store, StoreError, StoreResult,
};

#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[trait_variant::make(Send)]
impl Connect for MemoryStore {
    async fn connect(_uri: &str, _options: Option<&Document>) -> StoreResult<Self> {
        Ok(MemoryStore::new())
    }
}

impl MemoryStore {
    /// Evaluates a filter against a document, including the `$or`/`$and`
    /// combinators and the handful of field-level operators the adapter's
    /// own internal queries actually emit (`$gte`, `$in`, plus `$gt`/`$lt`/
    /// `$lte`/`$ne`/`$exists` for completeness). This is not a general query
    /// engine — arbitrary caller-supplied `$where`-shaped operators outside
    /// this set are a real query-engine concern (§4.6) this fixture does not
    /// attempt to emulate — but the op log reader and bulk snapshot lookups
    /// (§4.5, §6) route their own filters straight through [`Store::find`],
    /// so this layer has to understand them to exercise those algorithms at
    /// all.
    fn matches(filter: &Document, doc: &Document) -> bool {
        filter.iter().all(|(key, expected)| match key.as_str() {
            "$or" => match expected.as_array() {
                Some(clauses) => clauses
                    .iter()
                    .any(|clause| clause.as_document().map_or(false, |d| Self::matches(d, doc))),
                None => false,
            },
            "$and" => match expected.as_array() {
                Some(clauses) => clauses
                    .iter()
                    .all(|clause| clause.as_document().map_or(true, |d| Self::matches(d, doc))),
                None => true,
            },
            _ => field_matches(expected, doc.get(key)),
        })
    }
}

/// Matches a single field's clause, which is either a plain equality value
/// or a document of `$`-prefixed comparison operators.
fn field_matches(expected: &Bson, actual: Option<&Bson>) -> bool {
    match expected {
        Bson::Document(ops) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) => {
            ops.iter().all(|(op, value)| match op.as_str() {
                "$gte" => compare(actual, value).map_or(false, |o| o != std::cmp::Ordering::Less),
                "$gt" => compare(actual, value) == Some(std::cmp::Ordering::Greater),
                "$lte" => compare(actual, value).map_or(false, |o| o != std::cmp::Ordering::Greater),
                "$lt" => compare(actual, value) == Some(std::cmp::Ordering::Less),
                "$ne" => !bson_equals(actual, value),
                "$exists" => actual.is_some() == matches!(value, Bson::Boolean(true)),
                "$in" => match value.as_array() {
                    Some(candidates) => candidates.iter().any(|c| bson_equals(actual, c)),
                    None => false,
                },
                _ => true,
            })
        }
        _ => match actual {
            Some(actual) => bson_matches(expected, actual),
            None => matches!(expected, Bson::Null),
        },
    }
}

fn bson_equals(actual: Option<&Bson>, expected: &Bson) -> bool {
    match actual {
        Some(actual) => bson_matches(expected, actual),
        None => matches!(expected, Bson::Null),
    }
}

/// Orders `actual` against `expected` for the range operators. `None` (field
/// absent) never compares equal or orders against anything.
fn compare(actual: Option<&Bson>, expected: &Bson) -> Option<std::cmp::Ordering> {
    let actual = actual?;
    if let (Some(a), Some(b)) = (as_f64(actual), as_f64(expected)) {
        return a.partial_cmp(&b);
    }
    match (actual, expected) {
        (Bson::String(a), Bson::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Equality match only; numeric types compare by value — BSON's int32/int64/
/// double distinction is a wire-size detail callers should not have to match
/// exactly.
fn bson_matches(expected: &Bson, actual: &Bson) -> bool {
    if let (Some(a), Some(b)) = (as_f64(expected), as_f64(actual)) {
        return a == b;
    }
    expected == actual
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

fn next_object_id() -> bson::oid::ObjectId {
    bson::oid::ObjectId::new()
}

#[trait_variant::make(Send)]
impl Store for MemoryStore {
    async fn insert_one(&self, collection: &str, mut doc: Document) -> StoreResult<Bson> {
        let id = if doc.contains_key("_id") {
            doc.get("_id").cloned().unwrap()
        } else {
            let oid = next_object_id();
            doc.insert("_id", oid);
            Bson::ObjectId(oid)
        };

        let mut collections = self.collections.write().unwrap();
        let entries = collections.entry(collection.to_string()).or_default();

        if entries.iter().any(|existing| existing.get("_id") == Some(&id)) {
            return Err(StoreError::DuplicateKey);
        }

        entries.push(doc);
        Ok(id)
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
        projection: Option<Document>,
    ) -> StoreResult<Option<Document>> {
        let collections = self.collections.read().unwrap();
        let found = collections
            .get(collection)
            .and_then(|entries| entries.iter().find(|doc| Self::matches(&filter, doc)))
            .cloned();
        Ok(found.map(|doc| apply_projection(doc, projection.as_ref())))
    }

    async fn find(
        &self,
        collection: &str,
        filter: Document,
        options: FindOptions,
    ) -> StoreResult<Vec<Document>> {
        let collections = self.collections.read().unwrap();
        let mut results: Vec<Document> = collections
            .get(collection)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|doc| Self::matches(&filter, doc))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(sort) = &options.sort {
            sort_documents(&mut results, sort);
        }

        let skip = options.skip.unwrap_or(0).max(0) as usize;
        if skip > 0 {
            results = results.into_iter().skip(skip).collect();
        }
        if let Some(limit) = options.limit {
            if limit >= 0 {
                results.truncate(limit as usize);
            }
        }

        Ok(results
            .into_iter()
            .map(|doc| apply_projection(doc, options.projection.as_ref()))
            .collect())
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: Document,
        replacement: Document,
    ) -> StoreResult<ReplaceOutcome> {
        let mut collections = self.collections.write().unwrap();
        let entries = collections.entry(collection.to_string()).or_default();

        match entries.iter_mut().find(|doc| Self::matches(&filter, doc)) {
            Some(slot) => {
                *slot = replacement;
                Ok(ReplaceOutcome { matched_count: 1 })
            }
            None => Ok(ReplaceOutcome { matched_count: 0 }),
        }
    }

    async fn delete_one(&self, collection: &str, filter: Document) -> StoreResult<DeleteOutcome> {
        let mut collections = self.collections.write().unwrap();
        let entries = collections.entry(collection.to_string()).or_default();

        match entries.iter().position(|doc| Self::matches(&filter, doc)) {
            Some(index) => {
                entries.remove(index);
                Ok(DeleteOutcome { deleted_count: 1 })
            }
            None => Ok(DeleteOutcome { deleted_count: 0 }),
        }
    }

    async fn count(&self, collection: &str, filter: Document, _options: FindOptions) -> StoreResult<u64> {
        let collections = self.collections.read().unwrap();
        let count = collections
            .get(collection)
            .map(|entries| entries.iter().filter(|doc| Self::matches(&filter, doc)).count())
            .unwrap_or(0);
        Ok(count as u64)
    }

    async fn create_index(&self, _collection: &str, _keys: Document, _background: bool) -> StoreResult<()> {
        Ok(())
    }

    async fn distinct(&self, collection: &str, field: &str, filter: Document) -> StoreResult<Vec<Bson>> {
        let collections = self.collections.read().unwrap();
        let mut seen = Vec::new();
        if let Some(entries) = collections.get(collection) {
            for doc in entries.iter().filter(|doc| Self::matches(&filter, doc)) {
                if let Some(value) = doc.get(field) {
                    if !seen.contains(value) {
                        seen.push(value.clone());
                    }
                }
            }
        }
        Ok(seen)
    }

    async fn aggregate(&self, _collection: &str, _pipeline: Vec<Document>) -> StoreResult<Vec<Document>> {
        Err(StoreError::Other("aggregate is not supported by MemoryStore".to_string()))
    }

    async fn map_reduce(&self, _collection: &str, _spec: MapReduceSpec) -> StoreResult<Vec<Document>> {
        Err(StoreError::Other("map_reduce is not supported by MemoryStore".to_string()))
    }

    /// No real query planner to report on; returns a stub shaped enough like
    /// a server explain response (`executionStats.nReturned`) that tests can
    /// assert against it without a live database.
    async fn explain(&self, collection: &str, filter: Document, _options: FindOptions) -> StoreResult<Document> {
        let count = self.count(collection, filter, FindOptions::default()).await?;
        Ok(bson::doc! { "executionStats": { "nReturned": count as i64 } })
    }
}

fn apply_projection(doc: Document, projection: Option<&Document>) -> Document {
    let Some(projection) = projection else {
        return doc;
    };
    if projection.is_empty() {
        return doc;
    }

    let inclusive = projection
        .iter()
        .filter(|(key, _)| *key != "_id")
        .any(|(_, value)| truthy(value));

    if !inclusive {
        let mut out = doc;
        for (key, value) in projection {
            if key != "_id" && !truthy(value) {
                out.remove(key);
            }
        }
        out
    } else {
        let mut out = Document::new();
        if let Some(id) = doc.get("_id") {
            out.insert("_id", id.clone());
        }
        for (key, value) in projection {
            if key != "_id" && truthy(value) {
                if let Some(field_value) = doc.get(key) {
                    out.insert(key.clone(), field_value.clone());
                }
            }
        }
        out
    }
}

fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Int32(i) => *i != 0,
        Bson::Int64(i) => *i != 0,
        Bson::Double(d) => *d != 0.0,
        _ => true,
    }
}

fn sort_documents(docs: &mut [Document], sort: &Document) {
    docs.sort_by(|a, b| {
        for (key, direction) in sort {
            let dir = match direction {
                Bson::Int32(i) => *i as i64,
                Bson::Int64(i) => *i,
                Bson::Double(d) => *d as i64,
                _ => 1,
            };
            let ordering = compare_bson(a.get(key), b.get(key));
            let ordering = if dir < 0 { ordering.reverse() } else { ordering };
            if ordering != std::cmp::Ordering::Equal {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    });
}

fn compare_bson(a: Option<&Bson>, b: Option<&Bson>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a, b) {
            (Bson::Int32(x), Bson::Int32(y)) => x.cmp(y),
            (Bson::Int64(x), Bson::Int64(y)) => x.cmp(y),
            (Bson::Double(x), Bson::Double(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
            (Bson::String(x), Bson::String(y)) => x.cmp(y),
            _ => Ordering::Equal,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[tokio::test]
    async fn insert_and_find_one_round_trip() {
        let store = MemoryStore::new();
        store
            .insert_one("docs", doc! { "_id": "a", "value": 1 })
            .await
            .unwrap();

        let found = store
            .find_one("docs", doc! { "_id": "a" }, None)
            .await
            .unwrap();
        assert_eq!(found.unwrap().get_i32("value").unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let store = MemoryStore::new();
        store.insert_one("docs", doc! { "_id": "a" }).await.unwrap();
        let err = store.insert_one("docs", doc! { "_id": "a" }).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey));
    }

    #[tokio::test]
    async fn replace_one_reports_unmatched() {
        let store = MemoryStore::new();
        let outcome = store
            .replace_one("docs", doc! { "_id": "missing" }, doc! { "_id": "missing" })
            .await
            .unwrap();
        assert_eq!(outcome.matched_count, 0);
    }

    #[tokio::test]
    async fn find_respects_sort_skip_limit() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .insert_one("docs", doc! { "_id": i.to_string(), "n": i })
                .await
                .unwrap();
        }

        let mut opts = FindOptions::default();
        opts.sort = Some(doc! { "n": -1 });
        opts.skip = Some(1);
        opts.limit = Some(2);

        let results = store.find("docs", Document::new(), opts).await.unwrap();
        let values: Vec<i32> = results.iter().map(|d| d.get_i32("n").unwrap()).collect();
        assert_eq!(values, vec![3, 2]);
    }

    #[tokio::test]
    async fn gte_filters_by_value() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.insert_one("docs", doc! { "_id": i.to_string(), "v": i }).await.unwrap();
        }

        let results = store
            .find("docs", doc! { "v": { "$gte": 3 } }, FindOptions::default())
            .await
            .unwrap();
        let mut values: Vec<i32> = results.iter().map(|d| d.get_i32("v").unwrap()).collect();
        values.sort();
        assert_eq!(values, vec![3, 4]);
    }

    #[tokio::test]
    async fn in_filters_by_membership() {
        let store = MemoryStore::new();
        for id in ["a", "b", "c"] {
            store.insert_one("docs", doc! { "_id": id }).await.unwrap();
        }

        let results = store
            .find("docs", doc! { "_id": { "$in": ["a", "c", "missing"] } }, FindOptions::default())
            .await
            .unwrap();
        let mut ids: Vec<&str> = results.iter().map(|d| d.get_str("_id").unwrap()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn or_matches_either_branch() {
        let store = MemoryStore::new();
        store.insert_one("docs", doc! { "_id": "a", "d": "x", "v": 1 }).await.unwrap();
        store.insert_one("docs", doc! { "_id": "b", "d": "y", "v": 5 }).await.unwrap();
        store.insert_one("docs", doc! { "_id": "c", "d": "z", "v": 9 }).await.unwrap();

        let filter = doc! { "$or": [
            { "d": "x" },
            { "d": "y", "v": { "$gte": 5 } },
        ] };
        let results = store.find("docs", filter, FindOptions::default()).await.unwrap();
        let mut ids: Vec<&str> = results.iter().map(|d| d.get_str("_id").unwrap()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
