//! Prelude module for convenient imports.
//!
//! ```
//! use query_toolkit::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`Toolkit`] and [`ToolkitConfig`] - The registry and its configuration
//! - [`Query`] and [`QuerySpec`] - Cached, deduplicated fetches
//! - [`Mutation`] and [`MutationSpec`] - One-shot operations
//! - [`QueryKey`] - Cache and registry addressing
//! - [`QueryState`], [`Status`] and [`QueryError`] - Observable state

pub use crate::config::ToolkitConfig;
pub use crate::error::QueryError;
pub use crate::key::QueryKey;
pub use crate::mutation::{Mutation, MutationSpec};
pub use crate::query::{Query, QuerySpec};
pub use crate::state::{QueryState, Status};
pub use crate::toolkit::Toolkit;
