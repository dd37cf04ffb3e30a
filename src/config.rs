//! Adapter configuration (§6). A plain, `serde`-deserializable struct so the
//! embedding process can load it from whatever configuration source it
//! already uses — this crate only ever consumes the parsed result.

use serde::{Deserialize, Serialize};

/// Default poll delay applied to poll-handle reads when a separate poll
/// store is configured (§4.2, §5).
pub const DEFAULT_POLL_DELAY_MS: u64 = 300;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Connection string for the primary store.
    pub mongo: String,

    /// Connection string for an optional read-only poll store. Query-poll
    /// traffic (`query_poll`, `query_poll_doc`) is routed here when set.
    #[serde(default)]
    pub mongo_poll: Option<String>,

    /// Passthrough overrides applied on top of whatever `mongo` itself
    /// parses into client options (pool sizes, timeouts, app name). The
    /// adapter does not validate these; unrecognized keys are ignored by the
    /// store layer rather than rejected, per the non-goal that this crate
    /// does not guarantee to abstract the store's own configuration surface.
    #[serde(default)]
    pub mongo_options: Option<bson::Document>,

    /// Same as `mongo_options`, applied to the poll connection only.
    #[serde(default)]
    pub mongo_poll_options: Option<bson::Document>,

    /// Delay applied before each poll-handle read, to tolerate replication
    /// lag. Defaults to `DEFAULT_POLL_DELAY_MS` when `mongo_poll` is set,
    /// else 0.
    #[serde(default)]
    pub poll_delay_ms: Option<u64>,

    /// Skip creating the op-log indexes (§4.3). Intended for deployments
    /// that provision indexes out-of-band.
    #[serde(default)]
    pub disable_index_creation: bool,

    /// Allow `$where` and `$mapReduce` queries.
    #[serde(default)]
    pub allow_js_queries: bool,

    /// Allow `$aggregate` queries.
    #[serde(default)]
    pub allow_aggregate_queries: bool,

    /// Shorthand for enabling both of the above.
    #[serde(default)]
    pub allow_all_queries: bool,
}

impl AdapterConfig {
    pub fn new(mongo: impl Into<String>) -> Self {
        Self {
            mongo: mongo.into(),
            mongo_poll: None,
            mongo_options: None,
            mongo_poll_options: None,
            poll_delay_ms: None,
            disable_index_creation: false,
            allow_js_queries: false,
            allow_aggregate_queries: false,
            allow_all_queries: false,
        }
    }

    pub fn with_poll(mut self, mongo_poll: impl Into<String>) -> Self {
        self.mongo_poll = Some(mongo_poll.into());
        self
    }

    pub fn effective_poll_delay_ms(&self) -> u64 {
        self.poll_delay_ms.unwrap_or(if self.mongo_poll.is_some() {
            DEFAULT_POLL_DELAY_MS
        } else {
            0
        })
    }

    pub fn js_queries_allowed(&self) -> bool {
        self.allow_js_queries || self.allow_all_queries
    }

    pub fn aggregate_queries_allowed(&self) -> bool {
        self.allow_aggregate_queries || self.allow_all_queries
    }
}
