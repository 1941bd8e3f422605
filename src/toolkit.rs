//! Toolkit registry - hands out deduplicated queries over one shared cache.

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::cache::QueryCache;
use crate::config::ToolkitConfig;
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::mutation::{Mutation, MutationSpec};
use crate::query::{Query, QueryData, QuerySpec};

/// Type-erased view of a registered query, used by cache invalidation and teardown.
pub(crate) trait ErasedQuery: Send + Sync {
    fn refetch_boxed(&self) -> BoxFuture<'static, ()>;

    fn stop_polling(&self);
}

/// Internal registry entry storing a type-erased query.
struct Registered {
    base_key: String,
    query: Box<dyn Any + Send + Sync>,
    handle: Arc<dyn ErasedQuery>,
    type_name: &'static str,
}

/// Live queries keyed by canonical key.
///
/// Only the toolkit inserts or removes entries; the cache reads it to find
/// the queries an invalidation must refetch.
#[derive(Default)]
pub(crate) struct Registry {
    queries: DashMap<String, Registered>,
}

impl Registry {
    /// Queries affected by invalidating `key`: every query under the base key
    /// when `key` has no options, otherwise only the exact match.
    pub(crate) fn refetch_targets(&self, key: &QueryKey) -> Vec<Arc<dyn ErasedQuery>> {
        let canonical = key.options.as_ref().map(|_| key.canonical());
        self.queries
            .iter()
            .filter(|entry| {
                entry.base_key == key.base_key
                    && canonical.as_ref().is_none_or(|canonical| canonical == entry.key())
            })
            .map(|entry| Arc::clone(&entry.handle))
            .collect()
    }
}

/// Entry point for creating queries and mutations.
///
/// The toolkit owns a [`QueryCache`] and a registry of live queries. Asking
/// for a query whose canonical key is already registered returns the existing
/// instance, so every consumer of that key shares one state and one poll timer.
///
/// # Example
///
/// ```rust
/// use query_toolkit::{Toolkit, ToolkitConfig};
/// use std::time::Duration;
///
/// let toolkit = Toolkit::with_config(ToolkitConfig::new(Duration::from_secs(30)));
/// assert_eq!(toolkit.query_count(), 0);
/// ```
#[derive(Clone)]
pub struct Toolkit {
    registry: Arc<Registry>,
    cache: QueryCache,
    config: ToolkitConfig,
}

impl Toolkit {
    /// Creates a toolkit with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ToolkitConfig::default())
    }

    /// Creates a toolkit with the given configuration.
    #[must_use]
    pub fn with_config(config: ToolkitConfig) -> Self {
        let registry = Arc::new(Registry::default());
        let cache = QueryCache::with_registry(Arc::downgrade(&registry));
        info!(cache_time = ?config.cache_time, "Query toolkit initialized");
        Self {
            registry,
            cache,
            config,
        }
    }

    /// Returns the query registered under the key described by `spec`, creating it if needed.
    ///
    /// The first registration for a key wins: a later call with the same key
    /// returns the existing query and ignores the new fetch function,
    /// callbacks and settings.
    ///
    /// # Errors
    ///
    /// - [`QueryError::Serialization`] if the query options cannot be encoded
    /// - [`QueryError::TypeMismatch`] if the key is registered with different types
    pub fn create_query<T, O>(&self, spec: QuerySpec<T, O>) -> Result<Query<T, O>, QueryError>
    where
        T: QueryData,
        O: QueryData,
    {
        let key = QueryKey::from_options(&spec.base_key, spec.options.as_ref())?;

        match self.registry.queries.entry(key.canonical()) {
            Entry::Occupied(existing) => {
                let Some(query) = existing.get().query.downcast_ref::<Query<T, O>>() else {
                    debug!(
                        key = %existing.key(),
                        registered = existing.get().type_name,
                        requested = std::any::type_name::<Query<T, O>>(),
                        "Query key registered with different types"
                    );
                    return Err(QueryError::TypeMismatch {
                        key: existing.key().clone(),
                    });
                };
                debug!(key = %existing.key(), "Reusing registered query");
                Ok(query.clone())
            }
            Entry::Vacant(vacant) => {
                debug!(key = %vacant.key(), "Registering query");
                let query = Query::build(key.clone(), spec, self.cache.clone(), &self.config);
                vacant.insert(Registered {
                    base_key: key.base_key,
                    query: Box::new(query.clone()),
                    handle: Arc::new(query.clone()),
                    type_name: std::any::type_name::<Query<T, O>>(),
                });
                Ok(query)
            }
        }
    }

    /// Creates a new mutation. Mutations are never registered or shared.
    pub fn create_mutation<T, I>(&self, spec: MutationSpec<T, I>) -> Mutation<T, I>
    where
        T: Clone + Serialize + Send + Sync + 'static,
        I: Clone + Serialize + Send + Sync + 'static,
    {
        Mutation::new(spec, &self.config)
    }

    /// Unregisters the query at `key`, stopping its polling.
    ///
    /// A fetch already in flight still completes and updates the removed query.
    /// Returns `true` if a query was removed.
    pub fn remove_query(&self, key: &QueryKey) -> bool {
        let Some((canonical, removed)) = self.registry.queries.remove(&key.canonical()) else {
            return false;
        };
        removed.handle.stop_polling();
        debug!(key = %canonical, "Removed query");
        true
    }

    /// Unregisters every query, stopping their polling, and clears the cache.
    pub fn reset(&self) {
        self.registry.queries.retain(|_, registered| {
            registered.handle.stop_polling();
            false
        });
        self.cache.clear();
        debug!("Toolkit reset");
    }

    /// Drops cached data for `key` and refetches the affected queries.
    ///
    /// See [`QueryCache::invalidate`].
    pub async fn invalidate_query(&self, key: &QueryKey) {
        self.cache.invalidate(key).await;
    }

    /// Reads cached data for `key`.
    pub fn get_query_data<T: DeserializeOwned>(&self, key: &QueryKey) -> Option<T> {
        self.cache.read(key)
    }

    /// Writes data for `key` into the cache using the configured cache time.
    pub fn set_query_data<T: Serialize>(&self, key: &QueryKey, data: &T) {
        self.cache.write(key, data, self.config.cache_time);
    }

    /// Returns `true` if a query is registered under `key`.
    pub fn contains(&self, key: &QueryKey) -> bool {
        self.registry.queries.contains_key(&key.canonical())
    }

    /// Get the number of registered queries.
    pub fn query_count(&self) -> usize {
        self.registry.queries.len()
    }

    /// Get a list of all registered canonical keys.
    pub fn query_keys(&self) -> Vec<String> {
        self.registry
            .queries
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub const fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub const fn config(&self) -> &ToolkitConfig {
        &self.config
    }
}

impl Default for Toolkit {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Toolkit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toolkit")
            .field("query_count", &self.registry.queries.len())
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish()
    }
}
