//! Query lifecycle with cache read-through, single-flight fetching and polling.
//!
//! A [`Query`] wraps a caller-supplied fetch function and tracks its progress
//! in an observable [`QueryState`]:
//!
//! ```text
//! Idle ──fetch──▶ Loading ──ok──▶ Success
//!                    │              │
//!                    └──err──▶ Error │
//!                                ▲   │
//!        Success / Error ──fetch─┴───┘ back to Loading
//! ```
//!
//! 1. A fetch while another fetch is loading returns immediately (single-flight)
//! 2. A cached value for the query's key is adopted without calling the fetch function
//! 3. On a miss the fetch function runs and its result is written to the cache
//!
//! Failures never escape `fetch`; they are recorded in the state and reported
//! to the error callback.
//!
//! # Example
//!
//! ```rust,ignore
//! use query_toolkit::prelude::*;
//!
//! let toolkit = Toolkit::new();
//! let todos = toolkit.create_query(QuerySpec::<Vec<Todo>>::new("todos", |_| {
//!     Box::pin(async { fetch_todos().await.map_err(QueryError::fetch) })
//! }))?;
//!
//! let mut state = todos.subscribe();
//! todos.fetch(None).await;
//! assert!(state.borrow_and_update().is_success());
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cache::QueryCache;
use crate::config::{ToolkitConfig, typed_error_hook, typed_success_hook};
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::poll::PollHandle;
use crate::state::{QueryState, Status};
use crate::toolkit::ErasedQuery;

/// Bounds required of query data and options.
///
/// Both are stored in the cache and handed to hooks as JSON.
pub trait QueryData: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> QueryData for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// The async function a query calls on a cache miss.
pub type Fetcher<T, O> =
    Arc<dyn Fn(Option<O>) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync>;

/// Called with the data and effective options after a successful fetch.
pub type SuccessCallback<T, O> = Arc<dyn Fn(&T, Option<&O>) + Send + Sync>;

/// Called with the error and effective options after a failed fetch.
pub type ErrorCallback<O> = Arc<dyn Fn(&QueryError, Option<&O>) + Send + Sync>;

/// Everything needed to create a query.
pub struct QuerySpec<T, O = ()> {
    pub(crate) base_key: String,
    pub(crate) options: Option<O>,
    pub(crate) fetcher: Fetcher<T, O>,
    pub(crate) cache_time: Option<Duration>,
    pub(crate) keep_previous_data: Option<bool>,
    pub(crate) on_success: Option<SuccessCallback<T, O>>,
    pub(crate) on_error: Option<ErrorCallback<O>>,
}

impl<T, O> QuerySpec<T, O>
where
    T: QueryData,
    O: QueryData,
{
    /// Creates a query description with the given base key and fetch function.
    ///
    /// # Arguments
    ///
    /// * `base_key` - The resource family this query belongs to (used for caching)
    /// * `fetcher` - An async function that fetches the data for the given options
    pub fn new<F>(base_key: impl Into<String>, fetcher: F) -> Self
    where
        F: Fn(Option<O>) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync + 'static,
    {
        Self {
            base_key: base_key.into(),
            options: None,
            fetcher: Arc::new(fetcher),
            cache_time: None,
            keep_previous_data: None,
            on_success: None,
            on_error: None,
        }
    }

    /// Fixes the options this query is registered and cached under.
    #[must_use]
    pub fn options(mut self, options: O) -> Self {
        self.options = Some(options);
        self
    }

    /// Overrides the toolkit's cache time for this query.
    #[must_use]
    pub const fn cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = Some(cache_time);
        self
    }

    /// Overrides the toolkit's `keep_previous_data` for this query.
    ///
    /// Only the previous *error* is affected: with `false` it is cleared as a
    /// fetch starts, with `true` it stays visible while loading. Previous data
    /// is always kept until a new success replaces it.
    #[must_use]
    pub const fn keep_previous_data(mut self, keep: bool) -> Self {
        self.keep_previous_data = Some(keep);
        self
    }

    #[must_use]
    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&T, Option<&O>) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&QueryError, Option<&O>) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

struct Inner<T, O> {
    key: QueryKey,
    options: Option<O>,
    fetcher: Fetcher<T, O>,
    on_success: Option<SuccessCallback<T, O>>,
    on_error: Option<ErrorCallback<O>>,
    cache: QueryCache,
    cache_time: Duration,
    keep_previous_data: bool,
    state: watch::Sender<QueryState<T>>,
    fetch_id: AtomicU64,
    poll: Mutex<Option<PollHandle>>,
}

/// Puts the state back to what it was before `Loading` if the fetch holding
/// this guard is dropped before it settles.
struct LoadingGuard<'a, T> {
    state: &'a watch::Sender<QueryState<T>>,
    fetch_id: &'a AtomicU64,
    id: u64,
    previous: Option<(Status, Option<QueryError>)>,
}

impl<T> LoadingGuard<'_, T> {
    fn disarm(mut self) {
        self.previous = None;
    }
}

impl<T> Drop for LoadingGuard<'_, T> {
    fn drop(&mut self) {
        let Some((status, error)) = self.previous.take() else {
            return;
        };
        // A newer fetch owns the Loading state after a reset.
        let restored = self.state.send_if_modified(|state| {
            if state.status != Status::Loading || self.fetch_id.load(Ordering::Acquire) != self.id
            {
                return false;
            }
            state.status = status;
            state.error = error;
            true
        });
        if restored {
            debug!(?status, "Fetch dropped before settling, restored previous status");
        }
    }
}

/// A fetch lifecycle bound to one cache key.
///
/// Cloning is cheap; clones share state, cache binding and poll timer.
pub struct Query<T, O = ()> {
    inner: Arc<Inner<T, O>>,
}

impl<T, O> Clone for Query<T, O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, O> Query<T, O>
where
    T: QueryData,
    O: QueryData,
{
    /// Creates a query bound to `cache`, outside of any toolkit registry.
    ///
    /// Queries created this way are not refetched by cache invalidation; use
    /// [`Toolkit::create_query`](crate::Toolkit::create_query) for that.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Serialization`] if the query options cannot be encoded.
    pub fn new(
        spec: QuerySpec<T, O>,
        cache: QueryCache,
        config: &ToolkitConfig,
    ) -> Result<Self, QueryError> {
        let key = QueryKey::from_options(&spec.base_key, spec.options.as_ref())?;
        Ok(Self::build(key, spec, cache, config))
    }

    pub(crate) fn build(
        key: QueryKey,
        spec: QuerySpec<T, O>,
        cache: QueryCache,
        config: &ToolkitConfig,
    ) -> Self {
        let on_success = spec
            .on_success
            .or_else(|| config.on_success.clone().map(typed_success_hook));
        let on_error = spec
            .on_error
            .or_else(|| config.on_error.clone().map(typed_error_hook));
        let (state, _) = watch::channel(QueryState::default());

        Self {
            inner: Arc::new(Inner {
                key,
                options: spec.options,
                fetcher: spec.fetcher,
                on_success,
                on_error,
                cache,
                cache_time: spec.cache_time.unwrap_or(config.cache_time),
                keep_previous_data: spec.keep_previous_data.unwrap_or(config.keep_previous_data),
                state,
                fetch_id: AtomicU64::new(0),
                poll: Mutex::new(None),
            }),
        }
    }

    /// The key this query is cached and registered under.
    pub fn key(&self) -> &QueryKey {
        &self.inner.key
    }

    pub fn base_key(&self) -> &str {
        &self.inner.key.base_key
    }

    /// Returns `true` if both handles refer to the same query.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The options fixed at creation.
    pub fn options(&self) -> Option<&O> {
        self.inner.options.as_ref()
    }

    /// Subscribes to state changes.
    ///
    /// The receiver is notified after every write to status, data or error.
    pub fn subscribe(&self) -> watch::Receiver<QueryState<T>> {
        self.inner.state.subscribe()
    }

    /// Returns a snapshot of the current state.
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

    /// Fetches data, preferring the cache.
    ///
    /// `overrides` are merged over the query's fixed options and passed to the
    /// fetch function. The cache slot is always the one for the fixed options.
    ///
    /// Returns `None` without side effects if a fetch is already loading, and
    /// `None` if the fetch fails (the error is in the state).
    pub async fn fetch(&self, overrides: Option<O>) -> Option<T> {
        let Some(guard) = self.begin_loading() else {
            debug!(key = %self.inner.key, "Fetch already in flight, skipping");
            return None;
        };

        let options = merge_options(self.inner.options.as_ref(), overrides);

        if let Some(cached) = self.inner.cache.read::<T>(&self.inner.key) {
            debug!(key = %self.inner.key, "Cache hit");
            guard.disarm();
            self.inner.state.send_modify(|state| {
                state.status = Status::Success;
                state.data = Some(cached.clone());
                state.error = None;
            });
            return Some(cached);
        }

        debug!(key = %self.inner.key, "Cache miss, fetching");
        self.run(options, guard).await
    }

    /// Fetches data from the fetch function, bypassing the cache.
    ///
    /// If a fetch is already loading, waits for it to settle first so the
    /// result always comes from a call started after this one.
    pub async fn refetch(&self) -> Option<T> {
        let mut state = self.inner.state.subscribe();
        let guard = loop {
            if let Some(guard) = self.begin_loading() {
                break guard;
            }
            if state.wait_for(|state| !state.is_loading()).await.is_err() {
                return None;
            }
        };

        self.run(self.inner.options.clone(), guard).await
    }

    /// Drops this query's cached slot and refetches through the cache.
    ///
    /// Unlike [`refetch`](Self::refetch), this goes through the registry, so
    /// every registered query sharing this key is refetched.
    pub async fn invalidate(&self) {
        self.inner.cache.invalidate(&self.inner.key).await;
    }

    /// Clears data and error and returns to `Idle`.
    ///
    /// The cache and any poll timer are left untouched.
    pub fn reset(&self) {
        self.inner.state.send_replace(QueryState::default());
    }

    /// Fetches once now, then every `interval` until [`stop_polling`](Self::stop_polling).
    ///
    /// Replaces any previous poll timer. A zero interval is a usage error: the
    /// query moves to `Error` with [`QueryError::InvalidInterval`] and nothing is
    /// fetched or scheduled.
    pub async fn start_polling(&self, interval: Duration, overrides: Option<O>) -> Option<T> {
        if interval.is_zero() {
            warn!(key = %self.inner.key, "Polling requires a non-zero interval");
            let options = merge_options(self.inner.options.as_ref(), overrides);
            self.fail(QueryError::InvalidInterval(interval), options.as_ref());
            return None;
        }

        let weak: Weak<Inner<T, O>> = Arc::downgrade(&self.inner);
        let tick_options = overrides.clone();
        let handle = PollHandle::spawn(interval, move || {
            let query = Query {
                inner: weak.upgrade()?,
            };
            let options = tick_options.clone();
            Some(
                async move {
                    query.fetch(options).await;
                }
                .boxed(),
            )
        });

        if let Some(previous) = self.inner.poll.lock().replace(handle) {
            previous.cancel();
        }
        debug!(key = %self.inner.key, ?interval, "Started polling");

        self.fetch(overrides).await
    }

    /// Cancels the poll timer, if any. A fetch already started by it still completes.
    pub fn stop_polling(&self) {
        if let Some(handle) = self.inner.poll.lock().take() {
            handle.cancel();
            debug!(key = %self.inner.key, "Stopped polling");
        }
    }

    pub fn is_polling(&self) -> bool {
        self.inner
            .poll
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// The interval of the active poll timer.
    pub fn poll_interval(&self) -> Option<Duration> {
        self.inner.poll.lock().as_ref().map(PollHandle::period)
    }

    // Atomic transition into Loading: fails if a fetch is already loading.
    fn begin_loading(&self) -> Option<LoadingGuard<'_, T>> {
        let keep_previous = self.inner.keep_previous_data;
        let mut previous = None;
        let mut id = 0;
        let started = self.inner.state.send_if_modified(|state| {
            if state.status == Status::Loading {
                return false;
            }
            id = self.inner.fetch_id.fetch_add(1, Ordering::AcqRel) + 1;
            previous = Some((state.status, state.error.clone()));
            state.status = Status::Loading;
            if !keep_previous {
                state.error = None;
            }
            true
        });

        started.then(|| LoadingGuard {
            state: &self.inner.state,
            fetch_id: &self.inner.fetch_id,
            id,
            previous,
        })
    }

    async fn run(&self, options: Option<O>, guard: LoadingGuard<'_, T>) -> Option<T> {
        let result = (self.inner.fetcher)(options.clone()).await;
        guard.disarm();
        match result {
            Ok(data) => {
                self.inner
                    .cache
                    .write(&self.inner.key, &data, self.inner.cache_time);
                self.inner.state.send_modify(|state| {
                    state.status = Status::Success;
                    state.data = Some(data.clone());
                    state.error = None;
                });
                if let Some(on_success) = &self.inner.on_success {
                    on_success(&data, options.as_ref());
                }
                Some(data)
            }
            Err(err) => {
                warn!(key = %self.inner.key, error = %err, "Query fetch failed");
                self.fail(err, options.as_ref());
                None
            }
        }
    }

    fn fail(&self, err: QueryError, options: Option<&O>) {
        self.inner.state.send_modify(|state| {
            state.status = Status::Error;
            state.error = Some(err.clone());
        });
        if let Some(on_error) = &self.inner.on_error {
            on_error(&err, options);
        }
    }
}

impl<T, O> ErasedQuery for Query<T, O>
where
    T: QueryData,
    O: QueryData,
{
    fn refetch_boxed(&self) -> BoxFuture<'static, ()> {
        let query = self.clone();
        async move {
            query.refetch().await;
        }
        .boxed()
    }

    fn stop_polling(&self) {
        Query::stop_polling(self);
    }
}

impl<T, O> fmt::Debug for Query<T, O>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.inner.key)
            .field("state", &*self.inner.state.borrow())
            .field("cache_time", &self.inner.cache_time)
            .finish_non_exhaustive()
    }
}

/// Merges override options over the fixed ones.
///
/// When both encode as JSON objects their fields are merged, with the override
/// winning; otherwise the override replaces the fixed options entirely.
fn merge_options<O: QueryData>(fixed: Option<&O>, overrides: Option<O>) -> Option<O> {
    let Some(overrides) = overrides else {
        return fixed.cloned();
    };
    let Some(fixed) = fixed else {
        return Some(overrides);
    };

    let (Ok(Value::Object(mut merged)), Ok(Value::Object(extra))) =
        (serde_json::to_value(fixed), serde_json::to_value(&overrides))
    else {
        return Some(overrides);
    };
    merged.extend(extra);

    match serde_json::from_value(Value::Object(merged)) {
        Ok(options) => Some(options),
        Err(err) => {
            debug!(error = %err, "Merged options did not decode, using overrides as-is");
            Some(overrides)
        }
    }
}
