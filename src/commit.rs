//! Commit Coordinator (§4.4): the two-phase write that advances a document's
//! version while keeping the op log and snapshot mutually consistent under
//! concurrent writers.

use bson::{doc, Bson};
use tracing::{instrument, warn};

use crate::codec::cast_to_doc;
use crate::error::{AdapterError, AdapterResult};
use crate::model::{DocId, Op, OpLink, Snapshot, StoredOp};
use crate::oplog;
use crate::store::{Store, StoreError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The snapshot advanced; this writer won the race (if any).
    Applied,
    /// A concurrent writer won instead. Not an error: the caller retries
    /// with a fresh snapshot read, per the OT layer's own conflict handling.
    Conflict,
}

/// `previous_op_link` is the op link of the snapshot state this commit is
/// advancing *from* (`None` for a document's first op). `snapshot` carries
/// the already-computed post-commit state; its own `op_link` field is not
/// read here — the id this function assigns to the newly inserted op
/// becomes the new link, via [`cast_to_doc`].
#[instrument(skip(store, op, snapshot), fields(%collection, doc_id = %id))]
pub async fn commit<S: Store>(
    store: &S,
    collection: &str,
    op_collection: &str,
    id: &DocId,
    op: Op,
    previous_op_link: Option<OpLink>,
    snapshot: &Snapshot,
) -> AdapterResult<CommitOutcome> {
    let stored = StoredOp {
        id: None,
        d: id.0.clone(),
        o: previous_op_link,
        op,
    };
    let op_doc = bson::to_document(&stored).map_err(|e| AdapterError::Store(e.to_string()))?;
    let inserted = store.insert_one(op_collection, op_doc).await?;
    let op_id = extract_object_id(&inserted)?;

    let doc = cast_to_doc(id, snapshot, op_id);

    let outcome = if snapshot.v == 1 {
        match store.insert_one(collection, doc).await {
            Ok(_) => Ok(CommitOutcome::Applied),
            Err(StoreError::DuplicateKey) => Ok(CommitOutcome::Conflict),
            Err(other) => Err(AdapterError::from(other)),
        }
    } else {
        let filter = doc! { "_id": id.0.clone(), "_v": (snapshot.v - 1) as i64 };
        match store.replace_one(collection, filter, doc).await {
            Ok(result) if result.matched_count == 1 => Ok(CommitOutcome::Applied),
            Ok(_) => Ok(CommitOutcome::Conflict),
            Err(other) => Err(AdapterError::from(other)),
        }
    };

    if !matches!(outcome, Ok(CommitOutcome::Applied)) {
        cleanup_op(store, op_collection, op_id).await;
    }

    outcome
}

/// Best-effort removal of the op row written in step 1 once the snapshot
/// CAS has failed or been contended. A cleanup failure is logged but never
/// propagated — readers already tolerate orphan ops (§4.5).
async fn cleanup_op<S: Store>(store: &S, op_collection: &str, op_id: OpLink) {
    if let Err(err) = store.delete_one(op_collection, doc! { "_id": op_id }).await {
        warn!(%err, op_collection, "failed to clean up orphaned op after contended commit");
    }
}

fn extract_object_id(value: &Bson) -> AdapterResult<OpLink> {
    value
        .as_object_id()
        .ok_or_else(|| AdapterError::Store("store assigned a non-ObjectId op id".to_string()))
}

/// Idempotency check (§4.4): was a client-retried `(src, seq)` submission
/// already committed, possibly under a different physical op row? Walks the
/// canonical chain reachable from `snapshot`'s op link and looks for a match,
/// rather than trusting the first op row with a matching `(src, seq)` —
/// duplicate rows from lost commit races are exactly what the chain walk is
/// built to see through.
pub async fn get_committed_op_version<S: Store>(
    store: &S,
    op_collection: &str,
    id: &DocId,
    snapshot: &Snapshot,
    op: &Op,
) -> AdapterResult<Option<u64>> {
    let chain = oplog::get_ops_to_snapshot(store, op_collection, id, None, snapshot).await?;
    Ok(chain
        .into_iter()
        .find(|committed| committed.src == op.src && committed.seq == op.seq)
        .map(|committed| committed.v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CreateOp;
    use crate::store::memory::MemoryStore;

    fn create_op(v: u64, seq: u64) -> Op {
        Op {
            v,
            src: "client-1".to_string(),
            seq,
            create: Some(CreateOp {
                type_: "json0".to_string(),
                data: None,
            }),
            del: None,
            op: None,
            m: None,
        }
    }

    #[tokio::test]
    async fn first_commit_applies() {
        let store = MemoryStore::new();
        let id = DocId::from("doc-1");
        let snapshot = Snapshot {
            id: id.0.clone(),
            v: 1,
            type_: Some("json0".to_string()),
            data: None,
            m: None,
            op_link: None,
        };

        let outcome = commit(&store, "docs", "o_docs", &id, create_op(0, 1), None, &snapshot)
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Applied);

        let count = store.count("docs", doc! { "_id": "doc-1" }, Default::default()).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn concurrent_create_race_has_one_winner() {
        let store = MemoryStore::new();
        let id = DocId::from("doc-race");
        let snapshot = Snapshot {
            id: id.0.clone(),
            v: 1,
            type_: Some("json0".to_string()),
            data: None,
            m: None,
            op_link: None,
        };

        let first = commit(&store, "docs", "o_docs", &id, create_op(0, 1), None, &snapshot)
            .await
            .unwrap();
        let second = commit(&store, "docs", "o_docs", &id, create_op(0, 2), None, &snapshot)
            .await
            .unwrap();

        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|o| **o == CommitOutcome::Applied).count(), 1);
        assert_eq!(outcomes.iter().filter(|o| **o == CommitOutcome::Conflict).count(), 1);

        let count = store.count("docs", doc! { "_id": "doc-race" }, Default::default()).await.unwrap();
        assert_eq!(count, 1);
    }
}
