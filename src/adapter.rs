//! Public Adapter API (§6): the surface the OT server actually calls.
//!
//! Everything else in this crate — the codec, connection manager, op
//! collection manager, commit coordinator, op log reader, query engine, and
//! polling optimizer — is an internal collaborator wired together here.
//! Callers never see the `Store` trait or any physical collection name.

use std::collections::HashMap;
use std::sync::Arc;

use bson::{doc, Document};
use tokio::time::sleep;
use tracing::instrument;

use crate::codec::{cast_to_snapshot, snapshot_from_create};
use crate::collections::OpCollectionManager;
use crate::commit::{self, CommitOutcome};
use crate::config::AdapterConfig;
use crate::connection::ConnectionManager;
use crate::error::{AdapterError, AdapterResult};
use crate::model::{CollectionName, DocId, Op, Snapshot};
use crate::oplog;
use crate::poll;
use crate::query::{self, ParsedQuery, QueryExtra};
use crate::store::Store;

/// The storage adapter. Generic over the backend `Store` so the same wiring
/// drives both the MongoDB-backed implementation and the in-memory test
/// fixture; [`crate::MongoAdapter`] fixes this to the production backend.
pub struct Adapter<S> {
    connection: ConnectionManager<S>,
    collections: OpCollectionManager,
    config: AdapterConfig,
}

impl<S: Store + 'static> Adapter<S> {
    pub fn new(config: AdapterConfig) -> Self {
        Self {
            connection: ConnectionManager::new(config.clone()),
            collections: OpCollectionManager::new(),
            config,
        }
    }

    /// Build an adapter around already-connected handles, bypassing the
    /// lazy-connect path. Used by tests wired against [`crate::store::memory::MemoryStore`].
    pub fn from_handles(config: AdapterConfig, primary: Arc<S>, poll: Option<Arc<S>>) -> Self {
        Self {
            connection: ConnectionManager::from_handles(config.clone(), primary, poll),
            collections: OpCollectionManager::new(),
            config,
        }
    }

    async fn op_collection(&self, store: &S, name: &CollectionName) -> AdapterResult<String> {
        self.collections
            .ensure_indexes(store, name, self.config.disable_index_creation)
            .await
    }

    #[instrument(skip(self, op, snapshot), fields(%collection, doc_id = %id))]
    pub async fn commit(
        &self,
        collection: &str,
        id: &DocId,
        op: Op,
        snapshot: &Snapshot,
    ) -> AdapterResult<CommitOutcome> {
        if op.create.is_none() && op.del.is_none() && op.op.is_none() {
            return Err(AdapterError::invalid_op_version(op.v));
        }

        let name = CollectionName::parse(collection)?;
        let store = self.connection.primary().await?;
        let op_collection = self.op_collection(&store, &name).await?;

        commit::commit(
            &store,
            name.as_str(),
            &op_collection,
            id,
            op,
            snapshot.op_link,
            snapshot,
        )
        .await
    }

    pub async fn get_committed_op_version(
        &self,
        collection: &str,
        id: &DocId,
        snapshot: &Snapshot,
        op: &Op,
    ) -> AdapterResult<Option<u64>> {
        let name = CollectionName::parse(collection)?;
        let store = self.connection.primary().await?;
        let op_collection = name.op_collection_name();
        commit::get_committed_op_version(&store, &op_collection, id, snapshot, op).await
    }

    #[instrument(skip(self), fields(%collection, doc_id = %id))]
    pub async fn get_snapshot(&self, collection: &str, id: &DocId, fields: Option<&Document>) -> AdapterResult<Snapshot> {
        let name = CollectionName::parse(collection)?;
        let store = self.connection.primary().await?;
        let projection = query::get_projection(fields);

        let doc = store
            .find_one(name.as_str(), doc! { "_id": &id.0 }, projection)
            .await?;

        Ok(match doc {
            Some(doc) => cast_to_snapshot(&doc),
            None => Snapshot::not_found(id.0.clone()),
        })
    }

    pub async fn get_snapshot_bulk(
        &self,
        collection: &str,
        ids: &[DocId],
        fields: Option<&Document>,
    ) -> AdapterResult<HashMap<DocId, Snapshot>> {
        let name = CollectionName::parse(collection)?;
        let store = self.connection.primary().await?;
        let projection = query::get_projection(fields);

        let id_values: Vec<bson::Bson> = ids.iter().map(|id| bson::Bson::String(id.0.clone())).collect();
        let found = store
            .find(
                name.as_str(),
                doc! { "_id": { "$in": id_values } },
                crate::store::FindOptions { projection, ..Default::default() },
            )
            .await?;

        let mut by_id: HashMap<String, Snapshot> = found
            .into_iter()
            .map(|doc| {
                let snapshot = cast_to_snapshot(&doc);
                (snapshot.id.clone(), snapshot)
            })
            .collect();

        Ok(ids
            .iter()
            .map(|id| {
                let snapshot = by_id.remove(&id.0).unwrap_or_else(|| Snapshot::not_found(id.0.clone()));
                (id.clone(), snapshot)
            })
            .collect())
    }

    pub async fn get_ops(
        &self,
        collection: &str,
        id: &DocId,
        from: Option<u64>,
        to: Option<u64>,
    ) -> AdapterResult<Vec<Op>> {
        let name = CollectionName::parse(collection)?;
        let store = self.connection.primary().await?;
        let op_collection = name.op_collection_name();
        oplog::get_ops(&store, name.as_str(), &op_collection, id, from, to).await
    }

    pub async fn get_ops_to_snapshot(
        &self,
        collection: &str,
        id: &DocId,
        from: Option<u64>,
        snapshot: &Snapshot,
    ) -> AdapterResult<Vec<Op>> {
        let name = CollectionName::parse(collection)?;
        let store = self.connection.primary().await?;
        let op_collection = name.op_collection_name();
        oplog::get_ops_to_snapshot(&store, &op_collection, id, from, snapshot).await
    }

    pub async fn get_ops_bulk(
        &self,
        collection: &str,
        from_map: &HashMap<DocId, Option<u64>>,
        to_map: &HashMap<DocId, Option<u64>>,
    ) -> AdapterResult<HashMap<DocId, Vec<Op>>> {
        let name = CollectionName::parse(collection)?;
        let store = self.connection.primary().await?;
        let op_collection = name.op_collection_name();
        oplog::get_ops_bulk(&store, name.as_str(), &op_collection, from_map, to_map).await
    }

    /// Authoritative query against the primary handle (§4.6).
    pub async fn query(
        &self,
        collection: &str,
        q: &Document,
        fields: Option<&Document>,
    ) -> AdapterResult<(Vec<Snapshot>, Option<QueryExtra>)> {
        let name = CollectionName::parse(collection)?;
        let store = self.connection.primary().await?;
        let (docs, extra) = self.run_query(&store, &name, q, fields).await?;
        Ok((docs.iter().map(cast_to_snapshot).collect(), extra))
    }

    /// Like [`Adapter::query`] but against the poll handle (possibly
    /// lagging, per `pollDelay`) and projecting only document ids.
    pub async fn query_poll(
        &self,
        collection: &str,
        q: &Document,
    ) -> AdapterResult<(Vec<String>, Option<QueryExtra>)> {
        let name = CollectionName::parse(collection)?;
        self.delay_for_poll_lag().await;
        let store = self.connection.poll().await?;
        let id_only = Some(doc! { "_id": 1 });
        let (docs, extra) = self.run_query(&store, &name, q, id_only).await?;
        let ids = docs
            .into_iter()
            .filter_map(|doc| doc.get_str("_id").ok().map(|s| s.to_string()))
            .collect();
        Ok((ids, extra))
    }

    /// Whether `id` currently satisfies `q`, via the poll handle (§4.6).
    pub async fn query_poll_doc(&self, collection: &str, id: &DocId, q: &Document) -> AdapterResult<bool> {
        let name = CollectionName::parse(collection)?;
        crate::query::check_query(q, self.config.js_queries_allowed(), self.config.aggregate_queries_allowed())?;
        let parsed = query::parse_query(q)?;

        let Some(restricted) = query::restrict_filter_to_id(&parsed.filter, &id.0) else {
            return Ok(false);
        };

        self.delay_for_poll_lag().await;
        let store = self.connection.poll().await?;
        let safe_filter = query::make_query_safe(&restricted);

        let found = store
            .find_one(name.as_str(), safe_filter, Some(doc! { "_id": 1 }))
            .await?;
        Ok(found.is_some())
    }

    /// Whether `q` can be decided per-document without a full collection
    /// scan (§4.7).
    pub fn can_poll_doc(&self, q: &Document) -> bool {
        poll::can_poll_doc(q)
    }

    /// Whether `op` could change `q`'s result set for `id` (§4.7).
    /// `id` is accepted for interface symmetry with the OT server's call
    /// site even though the decision itself doesn't depend on it.
    pub fn skip_poll(&self, _id: &DocId, op: &Op, q: &Document) -> bool {
        poll::skip_poll(op, q)
    }

    pub async fn close(&self) -> AdapterResult<()> {
        self.connection.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    async fn delay_for_poll_lag(&self) {
        let delay = self.connection.poll_delay();
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }

    async fn run_query(
        &self,
        store: &S,
        name: &CollectionName,
        q: &Document,
        fields: Option<&Document>,
    ) -> AdapterResult<(Vec<Document>, Option<QueryExtra>)> {
        query::check_query(q, self.config.js_queries_allowed(), self.config.aggregate_queries_allowed())?;
        let mut parsed: ParsedQuery = query::parse_query(q)?;
        parsed.filter = query::make_query_safe(&parsed.filter);

        let projection = query::get_projection(fields);
        query::execute(store, name.as_str(), &parsed, projection).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CreateOp;
    use crate::store::memory::MemoryStore;

    fn adapter() -> Adapter<MemoryStore> {
        let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter("ot_mongo_adapter=debug").try_init();
        Adapter::from_handles(AdapterConfig::new("memory://unused"), Arc::new(MemoryStore::new()), None)
    }

    fn create_op(v: u64, seq: u64) -> Op {
        Op {
            v,
            src: "client-1".to_string(),
            seq,
            create: Some(CreateOp { type_: "json0".to_string(), data: None }),
            del: None,
            op: None,
            m: None,
        }
    }

    fn update_op(v: u64, seq: u64, path: &str) -> Op {
        Op {
            v,
            src: "client-1".to_string(),
            seq,
            create: None,
            del: None,
            op: Some(vec![doc! { "p": [path], "oi": 5 }]),
            m: None,
        }
    }

    fn delete_op(v: u64, seq: u64) -> Op {
        Op { v, src: "client-1".to_string(), seq, create: None, del: Some(true), op: None, m: None }
    }

    fn snapshot_for(id: &str, v: u64, op_link: Option<bson::oid::ObjectId>, deleted: bool) -> Snapshot {
        Snapshot {
            id: id.to_string(),
            v,
            type_: if deleted { None } else { Some("json0".to_string()) },
            data: None,
            m: None,
            op_link,
        }
    }

    /// The `$submit` marker is how the OT commit path itself reads a
    /// snapshot (§4.6 `getProjection`): unlike a plain read, it gets no
    /// projection at all, so `_o` survives and the returned snapshot's
    /// `op_link` is the real prior-op link the next commit must chain off
    /// of. A plain `get_snapshot(..., None)` excludes `_o`/`_m` and always
    /// reports `op_link: None`, which would silently thread a broken link
    /// into every subsequent commit.
    fn submit_fields() -> Document {
        doc! { "$submit": true }
    }

    #[tokio::test]
    async fn create_update_delete_recreate_cycle() {
        let adapter = adapter();
        let id = DocId::from("doc-1");

        adapter
            .commit("docs", &id, create_op(0, 1), &snapshot_for("doc-1", 1, None, false))
            .await
            .unwrap();
        let after_create = adapter.get_snapshot("docs", &id, Some(&submit_fields())).await.unwrap();
        assert_eq!(after_create.v, 1);
        assert!(after_create.op_link.is_some());

        adapter
            .commit("docs", &id, update_op(1, 2, "x"), &snapshot_for("doc-1", 2, after_create.op_link, false))
            .await
            .unwrap();
        let after_update = adapter.get_snapshot("docs", &id, Some(&submit_fields())).await.unwrap();
        assert_eq!(after_update.v, 2);
        assert_ne!(after_update.op_link, after_create.op_link);

        adapter
            .commit("docs", &id, delete_op(2, 3), &snapshot_for("doc-1", 3, after_update.op_link, true))
            .await
            .unwrap();
        let after_delete = adapter.get_snapshot("docs", &id, Some(&submit_fields())).await.unwrap();
        assert_eq!(after_delete.v, 3);
        assert!(after_delete.is_deleted());
        assert!(after_delete.data.is_none());

        let ops = adapter.get_ops("docs", &id, Some(0), None).await.unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops.iter().map(|op| op.v).collect::<Vec<_>>(), vec![0, 1, 2]);

        adapter
            .commit("docs", &id, create_op(3, 4), &snapshot_for("doc-1", 4, after_delete.op_link, false))
            .await
            .unwrap();
        let after_recreate = adapter.get_snapshot("docs", &id, Some(&submit_fields())).await.unwrap();
        assert_eq!(after_recreate.v, 4);

        let ops = adapter.get_ops("docs", &id, Some(0), None).await.unwrap();
        assert_eq!(ops.len(), 4);
        assert_eq!(ops[3].v, 3);
    }

    #[tokio::test]
    async fn rejects_reserved_collection_names() {
        let adapter = adapter();
        let id = DocId::from("doc-1");
        let err = adapter
            .commit("system", &id, create_op(0, 1), &snapshot_for("doc-1", 1, None, false))
            .await
            .unwrap_err();
        assert_eq!(err.code(), 4102);
    }

    #[tokio::test]
    async fn query_excludes_deleted_docs_by_default() {
        let adapter = adapter();
        let id = DocId::from("doc-1");
        adapter
            .commit("docs", &id, create_op(0, 1), &snapshot_for("doc-1", 1, None, false))
            .await
            .unwrap();
        let after_create = adapter.get_snapshot("docs", &id, Some(&submit_fields())).await.unwrap();
        adapter
            .commit("docs", &id, delete_op(1, 2), &snapshot_for("doc-1", 2, after_create.op_link, true))
            .await
            .unwrap();

        let (results, _) = adapter.query("docs", &doc! {}, None).await.unwrap();
        assert!(results.is_empty());

        let (deleted_only, _) =
            adapter.query("docs", &doc! { "_type": bson::Bson::Null }, None).await.unwrap();
        assert_eq!(deleted_only.len(), 1);
    }

    #[tokio::test]
    async fn forbidden_js_query_is_rejected() {
        let adapter = adapter();
        let err = adapter.query("docs", &doc! { "$where": "true" }, None).await.unwrap_err();
        assert_eq!(err.code(), 4103);
    }
}
