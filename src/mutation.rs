//! One-shot operations for creating, updating, or deleting resources.
//!
//! A [`Mutation`] tracks the same `Idle → Loading → Success / Error` lifecycle
//! as a query, but it is never cached or registered. After a successful
//! mutation you typically invalidate the queries it affected.
//!
//! # Example
//!
//! ```rust,ignore
//! use query_toolkit::prelude::*;
//!
//! let update = toolkit.create_mutation(MutationSpec::new(|todo: Todo| {
//!     Box::pin(async move { update_todo_api(todo).await.map_err(QueryError::fetch) })
//! }));
//!
//! if update.mutate(todo).await.is_some() {
//!     toolkit.invalidate_query(&QueryKey::new("todos")).await;
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::watch;
use tracing::warn;

use crate::config::{ToolkitConfig, typed_error_hook, typed_success_hook};
use crate::error::QueryError;
use crate::state::{QueryState, Status};

/// The async function a mutation runs.
pub type Mutator<T, I> = Arc<dyn Fn(I) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync>;

/// Everything needed to create a mutation.
pub struct MutationSpec<T, I> {
    mutator: Mutator<T, I>,
    on_success: Option<Arc<dyn Fn(&T, Option<&I>) + Send + Sync>>,
    on_error: Option<Arc<dyn Fn(&QueryError, Option<&I>) + Send + Sync>>,
}

impl<T, I> MutationSpec<T, I> {
    pub fn new<F>(mutator: F) -> Self
    where
        F: Fn(I) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync + 'static,
    {
        Self {
            mutator: Arc::new(mutator),
            on_success: None,
            on_error: None,
        }
    }

    #[must_use]
    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&T, Option<&I>) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&QueryError, Option<&I>) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

struct Inner<T, I> {
    mutator: Mutator<T, I>,
    on_success: Option<Arc<dyn Fn(&T, Option<&I>) + Send + Sync>>,
    on_error: Option<Arc<dyn Fn(&QueryError, Option<&I>) + Send + Sync>>,
    state: watch::Sender<QueryState<T>>,
}

/// A mutation with observable status. Cloning is cheap and shares state.
pub struct Mutation<T, I> {
    inner: Arc<Inner<T, I>>,
}

impl<T, I> Clone for Mutation<T, I> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, I> Mutation<T, I>
where
    T: Clone + Serialize + Send + Sync + 'static,
    I: Clone + Serialize + Send + Sync + 'static,
{
    /// Creates a mutation, falling back to the config's default hooks.
    pub fn new(spec: MutationSpec<T, I>, config: &ToolkitConfig) -> Self {
        let (state, _) = watch::channel(QueryState::default());
        Self {
            inner: Arc::new(Inner {
                mutator: spec.mutator,
                on_success: spec
                    .on_success
                    .or_else(|| config.on_success.clone().map(typed_success_hook)),
                on_error: spec
                    .on_error
                    .or_else(|| config.on_error.clone().map(typed_error_hook)),
                state,
            }),
        }
    }

    /// Runs the mutation with `input`.
    ///
    /// Returns the result on success. On failure returns `None`; the error is
    /// recorded in the state and passed to the error callback.
    pub async fn mutate(&self, input: I) -> Option<T> {
        self.inner.state.send_modify(|state| {
            state.status = Status::Loading;
            state.error = None;
        });

        match (self.inner.mutator)(input.clone()).await {
            Ok(data) => {
                self.inner.state.send_modify(|state| {
                    state.status = Status::Success;
                    state.data = Some(data.clone());
                });
                if let Some(on_success) = &self.inner.on_success {
                    on_success(&data, Some(&input));
                }
                Some(data)
            }
            Err(err) => {
                warn!(error = %err, "Mutation failed");
                self.inner.state.send_modify(|state| {
                    state.status = Status::Error;
                    state.error = Some(err.clone());
                });
                if let Some(on_error) = &self.inner.on_error {
                    on_error(&err, Some(&input));
                }
                None
            }
        }
    }

    /// Clears data and error and returns to `Idle`.
    pub fn reset(&self) {
        self.inner.state.send_replace(QueryState::default());
    }

    pub fn subscribe(&self) -> watch::Receiver<QueryState<T>> {
        self.inner.state.subscribe()
    }

    pub fn state(&self) -> QueryState<T> {
        self.inner.state.borrow().clone()
    }

    pub fn status(&self) -> Status {
        self.inner.state.borrow().status
    }

    pub fn data(&self) -> Option<T> {
        self.inner.state.borrow().data.clone()
    }

    pub fn error(&self) -> Option<QueryError> {
        self.inner.state.borrow().error.clone()
    }

    pub fn is_idle(&self) -> bool {
        self.status() == Status::Idle
    }

    pub fn is_loading(&self) -> bool {
        self.status() == Status::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status() == Status::Success
    }

    pub fn is_error(&self) -> bool {
        self.status() == Status::Error
    }
}

impl<T: fmt::Debug, I> fmt::Debug for Mutation<T, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("state", &*self.inner.state.borrow())
            .finish_non_exhaustive()
    }
}
