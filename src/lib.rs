//! # Query Toolkit - asynchronous data fetching with caching
//!
//! Query Toolkit wraps arbitrary async fetch functions with observable status
//! tracking, result caching, deduplication, invalidation and polling, similar
//! to SWR or TanStack Query. It is meant to sit under a reactive UI layer that
//! re-renders whenever a query's state changes.
//!
//! ## Core Components
//!
//! - [`Toolkit`]: Owns the cache and hands out deduplicated queries
//! - [`Query`]: The fetch lifecycle (`Idle → Loading → Success / Error`) for one key
//! - [`QueryCache`]: Keyed result storage with expiry and invalidation-triggered refetch
//! - [`Mutation`]: One-shot operations with the same lifecycle but no caching
//!
//! ## Reactivity
//!
//! Queries and mutations publish their [`QueryState`] through a
//! [`tokio::sync::watch`] channel. Call `subscribe()` and re-render whenever
//! the receiver reports a change.
//!
//! ## Example
//!
//! ```rust
//! use futures::FutureExt;
//! use query_toolkit::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), QueryError> {
//! let toolkit = Toolkit::new();
//!
//! let todos = toolkit.create_query(QuerySpec::<Vec<String>>::new("todos", |_| {
//!     async { Ok::<_, QueryError>(vec!["write docs".to_string()]) }.boxed()
//! }))?;
//!
//! let data = todos.fetch(None).await;
//! assert_eq!(data, Some(vec!["write docs".to_string()]));
//! assert!(todos.is_success());
//!
//! // Drop the cached value and refetch every "todos" query.
//! toolkit.invalidate_query(&QueryKey::new("todos")).await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod key;
pub mod mutation;
mod poll;
pub mod prelude;
pub mod query;
pub mod state;
pub mod toolkit;

// Re-export main types
pub use cache::QueryCache;
pub use config::{DefaultErrorHook, DefaultSuccessHook, ToolkitConfig};
pub use error::QueryError;
pub use key::{QueryKey, canonicalize};
pub use mutation::{Mutation, MutationSpec};
pub use query::{Query, QueryData, QuerySpec};
pub use state::{QueryState, Status};
pub use toolkit::Toolkit;
