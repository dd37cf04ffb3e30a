//! Op Log Reader (§4.5): recovers the canonical, linearly-linked op sequence
//! for a document from the raw (possibly duplicate-laden) contents of its op
//! collection.

use std::collections::HashMap;

use bson::doc;

use crate::error::{AdapterError, AdapterResult};
use crate::model::{DocId, Op, OpLink, Snapshot, StoredOp};
use crate::store::{FindOptions, Store};

/// Fetch a document's op sequence over `[from, to)`. `to` of `None` means
/// open-ended.
pub async fn get_ops<S: Store>(
    store: &S,
    collection: &str,
    op_collection: &str,
    id: &DocId,
    from: Option<u64>,
    to: Option<u64>,
) -> AdapterResult<Vec<Op>> {
    let snapshot_doc = store
        .find_one(collection, doc! { "_id": &id.0 }, Some(doc! { "_v": 1, "_o": 1 }))
        .await?;

    match snapshot_doc {
        Some(doc) => {
            let v = doc.get_i64("_v").unwrap_or(0) as u64;
            if let Some(from_v) = from {
                if v == from_v {
                    return Ok(Vec::new());
                }
            }
            let Some(link) = doc.get_object_id("_o").ok() else {
                return Err(AdapterError::missing_last_operation());
            };

            let candidates = fetch_candidates(store, op_collection, id, from).await?;
            let filtered = link_filter(candidates, link, to);
            gap_check(&filtered, from)?;
            Ok(filtered.into_iter().map(|stored| stored.op).collect())
        }
        None => {
            // No snapshot row: either never created, or created-then-deleted
            // with its history still intact. The latest delete op (if any)
            // anchors the same link-filter walk.
            let candidates = fetch_candidates(store, op_collection, id, from).await?;
            let delete_link = candidates.iter().rev().find(|stored| stored.op.is_delete()).and_then(|s| s.id);

            match delete_link {
                Some(link) => {
                    let filtered = link_filter(candidates, link, to);
                    gap_check(&filtered, from)?;
                    Ok(filtered.into_iter().map(|stored| stored.op).collect())
                }
                None => Ok(Vec::new()),
            }
        }
    }
}

/// Link-filters against a specific snapshot's op link rather than reading a
/// live snapshot row — used by the commit coordinator's idempotency check,
/// which already has the snapshot it cares about in hand.
pub async fn get_ops_to_snapshot<S: Store>(
    store: &S,
    op_collection: &str,
    id: &DocId,
    from: Option<u64>,
    snapshot: &Snapshot,
) -> AdapterResult<Vec<Op>> {
    let Some(link) = snapshot.op_link else {
        return Ok(Vec::new());
    };

    let candidates = fetch_candidates(store, op_collection, id, from).await?;
    let filtered = link_filter(candidates, link, None);
    gap_check(&filtered, from)?;
    Ok(filtered.into_iter().map(|stored| stored.op).collect())
}

/// Bulk form of [`get_ops`]: one snapshot query and one op query cover every
/// requested id.
pub async fn get_ops_bulk<S: Store>(
    store: &S,
    collection: &str,
    op_collection: &str,
    from_map: &HashMap<DocId, Option<u64>>,
    to_map: &HashMap<DocId, Option<u64>>,
) -> AdapterResult<HashMap<DocId, Vec<Op>>> {
    let ids: Vec<bson::Bson> = from_map.keys().map(|id| bson::Bson::String(id.0.clone())).collect();
    let snapshot_docs = store
        .find(
            collection,
            doc! { "_id": { "$in": ids } },
            FindOptions {
                projection: Some(doc! { "_v": 1, "_o": 1 }),
                ..Default::default()
            },
        )
        .await?;

    let mut snapshots: HashMap<String, (u64, Option<OpLink>)> = HashMap::new();
    for doc in snapshot_docs {
        let id = doc.get_str("_id").unwrap_or_default().to_string();
        let v = doc.get_i64("_v").unwrap_or(0) as u64;
        let link = doc.get_object_id("_o").ok();
        snapshots.insert(id, (v, link));
    }

    let needed: Vec<&DocId> = from_map
        .keys()
        .filter(|id| {
            let from = from_map.get(*id).copied().flatten();
            !snapshots.get(&id.0).map(|(v, _)| Some(*v) == from).unwrap_or(false)
        })
        .collect();

    let mut grouped: HashMap<String, Vec<StoredOp>> = HashMap::new();
    if !needed.is_empty() {
        let or_clauses: Vec<bson::Bson> = needed
            .iter()
            .map(|id| match from_map.get(*id).copied().flatten() {
                Some(from_v) => bson::Bson::Document(doc! { "d": &id.0, "v": { "$gte": from_v as i64 } }),
                None => bson::Bson::Document(doc! { "d": &id.0 }),
            })
            .collect();

        let op_docs = store
            .find(
                op_collection,
                doc! { "$or": or_clauses },
                FindOptions {
                    projection: Some(doc! { "m": 0 }),
                    sort: Some(doc! { "v": 1 }),
                    ..Default::default()
                },
            )
            .await?;

        for raw in op_docs {
            let stored: StoredOp = bson::from_document(raw).map_err(|e| AdapterError::Store(e.to_string()))?;
            grouped.entry(stored.d.clone()).or_default().push(stored);
        }
    }

    let mut result = HashMap::new();
    for id in from_map.keys() {
        let from = from_map.get(id).copied().flatten();
        let to = to_map.get(id).copied().flatten();
        let candidates = grouped.remove(&id.0).unwrap_or_default();

        let filtered = match snapshots.get(&id.0) {
            Some((_, Some(link))) => {
                let filtered = link_filter(candidates, *link, to);
                gap_check(&filtered, from)?;
                filtered
            }
            Some((_, None)) => Vec::new(),
            None => match candidates.iter().rev().find(|s| s.op.is_delete()).and_then(|s| s.id) {
                Some(link) => {
                    let filtered = link_filter(candidates, link, to);
                    gap_check(&filtered, from)?;
                    filtered
                }
                None => Vec::new(),
            },
        };

        result.insert(id.clone(), filtered.into_iter().map(|stored| stored.op).collect());
    }

    Ok(result)
}

async fn fetch_candidates<S: Store>(
    store: &S,
    op_collection: &str,
    id: &DocId,
    from: Option<u64>,
) -> AdapterResult<Vec<StoredOp>> {
    let filter = match from {
        Some(from_v) => doc! { "d": &id.0, "v": { "$gte": from_v as i64 } },
        None => doc! { "d": &id.0 },
    };
    let options = FindOptions {
        projection: Some(doc! { "m": 0 }),
        sort: Some(doc! { "v": 1 }),
        ..Default::default()
    };

    let docs = store.find(op_collection, filter, options).await?;
    docs.into_iter()
        .map(|d| bson::from_document(d).map_err(|e| AdapterError::Store(e.to_string())))
        .collect()
}

/// Walk `candidates` (ascending by `v`) from newest to oldest, keeping only
/// ops reachable from `link` through each op's own `.o` back-pointer. This is
/// what makes duplicate `(d, v)` rows from lost commit races harmless: only
/// the one actually linked from the snapshot survives the filter.
///
/// Chain advancement and the `to` upper bound are independent tests: the
/// canonical chain is defined purely by `_id`/`.o` links and has to be
/// walked in full regardless of `to`, or a bounded read whose head op's `v`
/// happens to be `>= to` would never advance past it and spuriously return
/// nothing. `to` only controls which reachable ops are *kept* in the output.
fn link_filter(candidates: Vec<StoredOp>, link: OpLink, to: Option<u64>) -> Vec<StoredOp> {
    let mut current = Some(link);
    let mut kept = Vec::new();

    for stored in candidates.into_iter().rev() {
        let Some(want) = current else { break };
        if stored.id == Some(want) {
            current = stored.o;
            if to.map_or(true, |to_v| stored.op.v < to_v) {
                kept.push(stored);
            }
        }
    }

    kept.reverse();
    kept
}

fn gap_check(filtered: &[StoredOp], from: Option<u64>) -> AdapterResult<()> {
    if let (Some(first), Some(from_v)) = (filtered.first(), from) {
        if first.op.v != from_v {
            return Err(AdapterError::MissingOps);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::cast_to_doc;
    use crate::model::CreateOp;
    use crate::store::memory::MemoryStore;

    fn op(v: u64, del: Option<bool>) -> Op {
        Op {
            v,
            src: "c1".to_string(),
            seq: v,
            create: if v == 0 {
                Some(CreateOp { type_: "json0".to_string(), data: None })
            } else {
                None
            },
            del,
            op: if v == 0 || del.is_some() { None } else { Some(vec![]) },
            m: None,
        }
    }

    async fn write_chain<S: Store>(store: &S, id: &DocId, versions: &[(u64, Option<bool>)]) {
        let mut link: Option<OpLink> = None;
        for (v, del) in versions {
            let stored = StoredOp { id: None, d: id.0.clone(), o: link, op: op(*v, *del) };
            let inserted = store
                .insert_one("o_docs", bson::to_document(&stored).unwrap())
                .await
                .unwrap();
            let op_id = inserted.as_object_id().unwrap();

            let snapshot = Snapshot {
                id: id.0.clone(),
                v: v + 1,
                type_: if del.unwrap_or(false) { None } else { Some("json0".to_string()) },
                data: None,
                m: None,
                op_link: None,
            };
            let doc = cast_to_doc(id, &snapshot, op_id);
            if *v == 0 {
                store.insert_one("docs", doc).await.unwrap();
            } else {
                store
                    .replace_one("docs", bson::doc! { "_id": &id.0, "_v": *v as i64 }, doc)
                    .await
                    .unwrap();
            }
            link = Some(op_id);
        }
    }

    #[tokio::test]
    async fn full_history_round_trip() {
        let store = MemoryStore::new();
        let id = DocId::from("doc-1");
        write_chain(&store, &id, &[(0, None), (1, None), (2, Some(true))]).await;

        let ops = get_ops(&store, "docs", "o_docs", &id, Some(0), None).await.unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].v, 0);
        assert_eq!(ops[2].v, 2);
    }

    #[tokio::test]
    async fn missing_op_is_detected() {
        let store = MemoryStore::new();
        let id = DocId::from("doc-2");
        write_chain(&store, &id, &[(0, None), (1, None)]).await;

        store.delete_one("o_docs", doc! { "d": "doc-2", "v": 0 }).await.unwrap();

        let err = get_ops(&store, "docs", "o_docs", &id, Some(0), None).await.unwrap_err();
        assert_eq!(err.code(), 5103);
    }

    #[tokio::test]
    async fn up_to_date_caller_gets_empty_result() {
        let store = MemoryStore::new();
        let id = DocId::from("doc-3");
        write_chain(&store, &id, &[(0, None)]).await;

        let ops = get_ops(&store, "docs", "o_docs", &id, Some(1), None).await.unwrap();
        assert!(ops.is_empty());
    }

    #[tokio::test]
    async fn bounded_to_still_walks_the_full_chain() {
        let store = MemoryStore::new();
        let id = DocId::from("doc-4");
        write_chain(&store, &id, &[(0, None), (1, None), (2, None)]).await;

        // The head op (v=2) is outside the `to` bound and must be excluded
        // from the result, but the walk still has to cross it to reach v=0
        // and v=1 — chain advancement cannot stop just because an op fails
        // the `v < to` test.
        let ops = get_ops(&store, "docs", "o_docs", &id, Some(0), Some(2)).await.unwrap();
        assert_eq!(ops.iter().map(|op| op.v).collect::<Vec<_>>(), vec![0, 1]);
    }
}
