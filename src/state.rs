//! Observable lifecycle state shared by queries and mutations.

use crate::error::QueryError;

/// Lifecycle status of a query or mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    /// Nothing has been fetched yet, or the state was reset.
    #[default]
    Idle,
    /// A fetch is in progress.
    Loading,
    /// The last fetch succeeded.
    Success,
    /// The last fetch failed.
    Error,
}

/// A snapshot of the observable fields of a query or mutation.
///
/// Every write to these fields is published to subscribers, so a UI layer can
/// re-render from the latest snapshot.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
    pub status: Status,
    pub data: Option<T>,
    pub error: Option<QueryError>,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            status: Status::Idle,
            data: None,
            error: None,
        }
    }
}

impl<T> QueryState<T> {
    /// Returns the data if any has been received.
    pub const fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    /// Returns `true` if nothing has been fetched yet.
    pub fn is_idle(&self) -> bool {
        self.status == Status::Idle
    }

    /// Returns `true` if a fetch is in progress.
    pub fn is_loading(&self) -> bool {
        self.status == Status::Loading
    }

    /// Returns `true` if the last fetch succeeded.
    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// Returns `true` if the last fetch failed.
    pub fn is_error(&self) -> bool {
        self.status == Status::Error
    }
}
