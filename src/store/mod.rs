//! The narrow store abstraction every component above is written against.
//!
//! The production implementation ([`mongo::MongoStore`]) wraps the real
//! `mongodb` driver; the in-memory implementation ([`memory::MemoryStore`])
//! backs the test suite so the concurrency and linkage algorithms in
//! [`crate::commit`] and [`crate::oplog`] can be verified without a live
//! database. Callers of [`crate::adapter::Adapter`] never see this trait.

pub mod memory;
pub mod mongo;

use bson::{Bson, Document};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// A unique-index violation, surfaced distinctly because the commit
    /// coordinator treats it as a benign create-create race rather than an
    /// unexpected failure (§7).
    #[error("duplicate key")]
    DuplicateKey,

    #[error("{0}")]
    Other(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Cursor-level options, mirroring the cursor transforms of §4.6. Modeled as
/// a struct of independent fields (rather than an ordered list of method
/// calls) since at most one of each transform may appear in a query and
/// struct fields compose regardless of the order they were set in.
#[derive(Clone, Debug, Default)]
pub struct FindOptions {
    pub projection: Option<Document>,
    pub sort: Option<Document>,
    pub skip: Option<i64>,
    pub limit: Option<i64>,
    pub hint: Option<Bson>,
    pub comment: Option<String>,
    pub batch_size: Option<u32>,
    pub max_time_ms: Option<i64>,
    pub min: Option<Document>,
    pub max: Option<Document>,
    pub max_scan: Option<i64>,
    pub return_key: Option<bool>,
    pub show_record_id: Option<bool>,
    pub no_cursor_timeout: Option<bool>,
    /// `$readConcern` / `$readPref` / `$snapshot`. Accepted and carried so the
    /// query safety layer never has to drop a recognized cursor transform,
    /// but not wired into the driver `FindOptions` below: per-query read
    /// preference/concern is a collection-level `SelectionCriteria` concern
    /// in the `mongodb` driver, not a find-options field, and `$snapshot` has
    /// no modern server equivalent. Honoring the non-goal that the adapter
    /// does not guarantee to abstract the store's query language, these ride
    /// along unused rather than being silently rejected.
    pub read_concern: Option<String>,
    pub read_pref: Option<Document>,
    pub snapshot: Option<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct ReplaceOutcome {
    pub matched_count: u64,
}

#[derive(Clone, Debug, Default)]
pub struct DeleteOutcome {
    pub deleted_count: u64,
}

#[derive(Clone, Debug)]
pub struct MapReduceSpec {
    pub map: String,
    pub reduce: String,
    pub scope: Option<Document>,
}

/// Backend-agnostic collection operations. Every method may suspend (§5);
/// implementations are expected to be cheap to clone/share (`Arc`-backed).
#[trait_variant::make(Send)]
pub trait Store: Send + Sync {
    async fn insert_one(&self, collection: &str, doc: Document) -> StoreResult<Bson>;

    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
        projection: Option<Document>,
    ) -> StoreResult<Option<Document>>;

    async fn find(
        &self,
        collection: &str,
        filter: Document,
        options: FindOptions,
    ) -> StoreResult<Vec<Document>>;

    async fn replace_one(
        &self,
        collection: &str,
        filter: Document,
        replacement: Document,
    ) -> StoreResult<ReplaceOutcome>;

    async fn delete_one(&self, collection: &str, filter: Document) -> StoreResult<DeleteOutcome>;

    async fn count(
        &self,
        collection: &str,
        filter: Document,
        options: FindOptions,
    ) -> StoreResult<u64>;

    async fn create_index(&self, collection: &str, keys: Document, background: bool) -> StoreResult<()>;

    async fn distinct(&self, collection: &str, field: &str, filter: Document) -> StoreResult<Vec<Bson>>;

    async fn aggregate(&self, collection: &str, pipeline: Vec<Document>) -> StoreResult<Vec<Document>>;

    async fn map_reduce(&self, collection: &str, spec: MapReduceSpec) -> StoreResult<Vec<Document>>;

    /// Backing for `$explain`. Returns whatever shape the store reports for
    /// its own query plan; the adapter does not interpret it.
    async fn explain(&self, collection: &str, filter: Document, options: FindOptions) -> StoreResult<Document>;
}

/// Establishes a handle from a connection string, plus an optional
/// passthrough document of backend-specific client option overrides
/// (`mongo_options`/`mongo_poll_options`, §6). Split out from [`Store`]
/// itself so the trait object callers actually depend on stays free of
/// construction concerns.
#[trait_variant::make(Send)]
pub trait Connect: Sized {
    async fn connect(uri: &str, options: Option<&Document>) -> StoreResult<Self>;
}
