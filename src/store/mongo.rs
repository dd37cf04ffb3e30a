//! MongoDB-backed implementation of [`super::Store`]. Thin wrapper: every
//! method is a near-direct call into the `mongodb` driver, with the only
//! adapter-specific behavior being the duplicate-key classification the
//! commit coordinator depends on (§4.4, §7) and the hand-built `mapReduce`
//! command (the driver exposes no typed helper for it).

use bson::{doc, Bson, Document};
use futures_util::TryStreamExt;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{
    AggregateOptions, CountOptions, CreateIndexOptions, DistinctOptions, FindOneOptions,
    FindOptions as DriverFindOptions, IndexOptions, InsertOneOptions, ReplaceOptions,
};
use mongodb::{Database, IndexModel};

use super::{
    Connect, DeleteOutcome, FindOptions, MapReduceSpec, ReplaceOutcome, Store, StoreError, StoreResult,
};

const DUPLICATE_KEY_CODE: i32 = 11000;

pub struct MongoStore {
    db: Database,
}

impl MongoStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn collection(&self, name: &str) -> mongodb::Collection<Document> {
        self.db.collection::<Document>(name)
    }
}

#[trait_variant::make(Send)]
impl Connect for MongoStore {
    /// The connection string must name a default database (the usual
    /// `mongodb://host/dbname` shape); there is no separate database-name
    /// configuration field. `options` is the `mongo_options`/
    /// `mongo_poll_options` passthrough (§6): recognized keys are layered
    /// onto whatever `ClientOptions::parse` derives from the URI, letting a
    /// caller tune pool sizing and timeouts without the adapter having to
    /// model the driver's entire options surface.
    async fn connect(uri: &str, options: Option<&Document>) -> StoreResult<Self> {
        let mut client_options = mongodb::options::ClientOptions::parse(uri).await.map_err(map_err)?;
        if let Some(overrides) = options {
            apply_option_overrides(&mut client_options, overrides);
        }

        let client = mongodb::Client::with_options(client_options).map_err(map_err)?;
        let db = client
            .default_database()
            .ok_or_else(|| StoreError::Other("connection string has no default database".to_string()))?;
        Ok(MongoStore::new(db))
    }
}

fn apply_option_overrides(options: &mut mongodb::options::ClientOptions, overrides: &Document) {
    if let Ok(app_name) = overrides.get_str("app_name") {
        options.app_name = Some(app_name.to_string());
    }
    if let Ok(n) = overrides.get_i32("max_pool_size") {
        options.max_pool_size = Some(n.max(0) as u32);
    }
    if let Ok(n) = overrides.get_i32("min_pool_size") {
        options.min_pool_size = Some(n.max(0) as u32);
    }
    if let Ok(ms) = overrides.get_i64("connect_timeout_ms") {
        options.connect_timeout = Some(std::time::Duration::from_millis(ms.max(0) as u64));
    }
    if let Ok(ms) = overrides.get_i64("server_selection_timeout_ms") {
        options.server_selection_timeout = Some(std::time::Duration::from_millis(ms.max(0) as u64));
    }
}

fn map_err(err: mongodb::error::Error) -> StoreError {
    if let ErrorKind::Write(WriteFailure::WriteError(ref write_error)) = *err.kind {
        if write_error.code == DUPLICATE_KEY_CODE {
            return StoreError::DuplicateKey;
        }
    }
    StoreError::Other(err.to_string())
}

fn into_driver_find_options(options: FindOptions) -> DriverFindOptions {
    DriverFindOptions::builder()
        .projection(options.projection)
        .sort(options.sort)
        .skip(options.skip.map(|v| v.max(0) as u64))
        .limit(options.limit)
        .hint(options.hint.map(mongodb::options::Hint::Keys))
        .comment(options.comment)
        .batch_size(options.batch_size)
        .max_time(options.max_time_ms.map(|ms| std::time::Duration::from_millis(ms as u64)))
        .min(options.min)
        .max(options.max)
        .return_key(options.return_key)
        .show_record_id(options.show_record_id)
        .no_cursor_timeout(options.no_cursor_timeout)
        .build()
}

#[trait_variant::make(Send)]
impl Store for MongoStore {
    async fn insert_one(&self, collection: &str, doc: Document) -> StoreResult<Bson> {
        let result = self
            .collection(collection)
            .insert_one(doc, InsertOneOptions::builder().build())
            .await
            .map_err(map_err)?;
        Ok(result.inserted_id)
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
        projection: Option<Document>,
    ) -> StoreResult<Option<Document>> {
        let opts = FindOneOptions::builder().projection(projection).build();
        self.collection(collection)
            .find_one(filter, opts)
            .await
            .map_err(map_err)
    }

    async fn find(
        &self,
        collection: &str,
        filter: Document,
        options: FindOptions,
    ) -> StoreResult<Vec<Document>> {
        let cursor = self
            .collection(collection)
            .find(filter, into_driver_find_options(options))
            .await
            .map_err(map_err)?;
        cursor.try_collect().await.map_err(map_err)
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: Document,
        replacement: Document,
    ) -> StoreResult<ReplaceOutcome> {
        let result = self
            .collection(collection)
            .replace_one(filter, replacement, ReplaceOptions::builder().build())
            .await
            .map_err(map_err)?;
        Ok(ReplaceOutcome {
            matched_count: result.matched_count,
        })
    }

    async fn delete_one(&self, collection: &str, filter: Document) -> StoreResult<DeleteOutcome> {
        let result = self
            .collection(collection)
            .delete_one(filter, None)
            .await
            .map_err(map_err)?;
        Ok(DeleteOutcome {
            deleted_count: result.deleted_count,
        })
    }

    async fn count(&self, collection: &str, filter: Document, options: FindOptions) -> StoreResult<u64> {
        let opts = CountOptions::builder()
            .skip(options.skip.map(|v| v.max(0) as u64))
            .limit(options.limit.map(|v| v.max(0) as u64))
            .hint(options.hint.map(mongodb::options::Hint::Keys))
            .max_time(options.max_time_ms.map(|ms| std::time::Duration::from_millis(ms as u64)))
            .build();
        self.collection(collection)
            .count_documents(filter, opts)
            .await
            .map_err(map_err)
    }

    async fn create_index(&self, collection: &str, keys: Document, background: bool) -> StoreResult<()> {
        let index = IndexModel::builder()
            .keys(keys)
            .options(IndexOptions::builder().background(background).build())
            .build();
        self.collection(collection)
            .create_index(index, CreateIndexOptions::builder().build())
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn distinct(&self, collection: &str, field: &str, filter: Document) -> StoreResult<Vec<Bson>> {
        self.collection(collection)
            .distinct(field, filter, DistinctOptions::builder().build())
            .await
            .map_err(map_err)
    }

    async fn aggregate(&self, collection: &str, pipeline: Vec<Document>) -> StoreResult<Vec<Document>> {
        let cursor = self
            .collection(collection)
            .aggregate(pipeline, AggregateOptions::builder().build())
            .await
            .map_err(map_err)?;
        cursor.try_collect().await.map_err(map_err)
    }

    /// The driver dropped its typed `map_reduce` helper; the command is
    /// still a server feature, so it is issued directly via `run_command`.
    async fn map_reduce(&self, collection: &str, spec: MapReduceSpec) -> StoreResult<Vec<Document>> {
        let mut cmd = doc! {
            "mapReduce": collection,
            "map": Bson::JavaScriptCode(spec.map),
            "reduce": Bson::JavaScriptCode(spec.reduce),
            "out": { "inline": 1 },
        };
        if let Some(scope) = spec.scope {
            cmd.insert("scope", scope);
        }

        let response = self.db.run_command(cmd, None).await.map_err(map_err)?;
        match response.get_array("results") {
            Ok(results) => Ok(results
                .iter()
                .filter_map(|b| b.as_document().cloned())
                .collect()),
            Err(_) => Ok(Vec::new()),
        }
    }

    /// No typed `explain` helper on the driver either; `explain` is issued as
    /// its own command wrapping the equivalent `find` command.
    async fn explain(&self, collection: &str, filter: Document, options: FindOptions) -> StoreResult<Document> {
        let mut find_cmd = doc! { "find": collection, "filter": filter };
        if let Some(sort) = options.sort {
            find_cmd.insert("sort", sort);
        }
        if let Some(skip) = options.skip {
            find_cmd.insert("skip", skip);
        }
        if let Some(limit) = options.limit {
            find_cmd.insert("limit", limit);
        }
        let cmd = doc! { "explain": find_cmd };
        self.db.run_command(cmd, None).await.map_err(map_err)
    }
}
