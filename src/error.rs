//! Stable, coded error taxonomy consumed by callers (§7).
//!
//! Client errors (41xx) signal a caller mistake — bad collection name,
//! disallowed query operator, malformed query shape. Internal errors (51xx)
//! signal an adapter/store inconsistency the caller cannot have caused
//! directly (a missing op link, a gap in the op log).

use thiserror::Error;

pub type AdapterResult<T> = Result<T, AdapterError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdapterError {
    #[error("invalid op version: {0}")]
    InvalidOpVersion(u64),

    #[error("invalid collection name: {0}")]
    InvalidCollectionName(String),

    #[error("$where queries are disabled")]
    JsQueryDisabled,

    #[error("$mapReduce queries are disabled")]
    MapReduceDisabled,

    #[error("$aggregate queries are disabled")]
    AggregateDisabled,

    #[error("legacy $query wrapper is not supported")]
    LegacyQueryWrapper,

    #[error("malformed query operator: {0}")]
    MalformedQueryOperator(String),

    #[error("a query may contain at most one collection operation")]
    MultipleCollectionOps,

    #[error("a query may contain at most one cursor operation")]
    MultipleCursorOps,

    #[error("a collection operation cannot be combined with cursor methods")]
    CollectionOpWithCursorMethod,

    #[error("failed to parse query: {0}")]
    QueryParseFailure(String),

    #[error("the adapter has already been closed")]
    AlreadyClosed,

    #[error("snapshot has no op link but ops exist for this document")]
    MissingLastOperation,

    #[error("missing ops in the requested version range")]
    MissingOps,

    #[error("store error: {0}")]
    Store(String),
}

impl AdapterError {
    /// The stable numeric code callers branch on, per §7.
    pub fn code(&self) -> u32 {
        match self {
            AdapterError::InvalidOpVersion(_) => 4101,
            AdapterError::InvalidCollectionName(_) => 4102,
            AdapterError::JsQueryDisabled => 4103,
            AdapterError::MapReduceDisabled => 4104,
            AdapterError::AggregateDisabled => 4105,
            AdapterError::LegacyQueryWrapper => 4106,
            AdapterError::MalformedQueryOperator(_) => 4107,
            AdapterError::MultipleCollectionOps => 4108,
            AdapterError::MultipleCursorOps => 4109,
            AdapterError::CollectionOpWithCursorMethod => 4110,
            AdapterError::QueryParseFailure(_) => 4111,
            AdapterError::AlreadyClosed => 5101,
            AdapterError::MissingLastOperation => 5102,
            AdapterError::MissingOps => 5103,
            AdapterError::Store(_) => 5199,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.code() < 5000
    }

    pub fn invalid_collection_name(name: impl Into<String>) -> Self {
        AdapterError::InvalidCollectionName(name.into())
    }

    /// Per Design Notes: the source's constructor for this error historically
    /// referenced an undefined value instead of its `v` argument. Here `v` is
    /// always taken directly from the caller-supplied op version.
    pub fn invalid_op_version(v: u64) -> Self {
        AdapterError::InvalidOpVersion(v)
    }

    /// Always returns the same variant regardless of caller context, per the
    /// fix to the source's stray `this`-referencing free function.
    pub fn missing_last_operation() -> Self {
        AdapterError::MissingLastOperation
    }
}

impl From<crate::store::StoreError> for AdapterError {
    fn from(err: crate::store::StoreError) -> Self {
        AdapterError::Store(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_spec() {
        assert_eq!(AdapterError::JsQueryDisabled.code(), 4103);
        assert_eq!(AdapterError::MissingOps.code(), 5103);
    }

    #[test]
    fn client_vs_internal_classification() {
        assert!(AdapterError::InvalidOpVersion(3).is_client_error());
        assert!(!AdapterError::MissingOps.is_client_error());
    }
}
