use std::time::Duration;

use thiserror::Error;

/// Error type for query and mutation operations.
///
/// Fetch failures and usage errors are recorded in the query state and passed
/// to the error callback. They are never returned from `fetch` itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The fetch function failed.
    #[error("Fetch failed: {0}")]
    Fetch(String),

    /// Polling was started with a zero interval.
    #[error("Invalid polling interval: {0:?}")]
    InvalidInterval(Duration),

    /// Options could not be encoded into a key.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// A query with different data or option types is already registered under this key.
    #[error("Query '{key}' is already registered with different types")]
    TypeMismatch { key: String },
}

impl QueryError {
    /// Shorthand for building a [`QueryError::Fetch`] from any displayable error.
    pub fn fetch(err: impl std::fmt::Display) -> Self {
        Self::Fetch(err.to_string())
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
