use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::QueryError;

/// Success hook applied to queries and mutations that don't supply their own.
///
/// Receives the data and the effective options encoded as JSON, so a single
/// hook can serve every query type.
pub type DefaultSuccessHook = Arc<dyn Fn(&Value, Option<&Value>) + Send + Sync>;

/// Error hook applied to queries and mutations that don't supply their own.
pub type DefaultErrorHook = Arc<dyn Fn(&QueryError, Option<&Value>) + Send + Sync>;

/// Configuration for a [`Toolkit`](crate::Toolkit).
///
/// This controls how long fetched data is cached and which callbacks run by default.
#[derive(Clone)]
pub struct ToolkitConfig {
    /// How long fetched data stays in the cache.
    ///
    /// A zero duration disables caching: every fetch goes to the fetch function.
    pub cache_time: Duration,

    /// Keep the previous error visible while a new fetch is loading.
    ///
    /// Despite the name this only governs `error`. Data is never cleared by
    /// starting a fetch, so a failed refetch still leaves the last good value.
    pub keep_previous_data: bool,

    pub on_success: Option<DefaultSuccessHook>,
    pub on_error: Option<DefaultErrorHook>,
}

impl Default for ToolkitConfig {
    fn default() -> Self {
        Self {
            cache_time: Duration::from_secs(60),
            keep_previous_data: false,
            on_success: None,
            on_error: None,
        }
    }
}

impl ToolkitConfig {
    /// Creates a configuration with the given cache time.
    #[must_use]
    pub fn new(cache_time: Duration) -> Self {
        Self {
            cache_time,
            ..Self::default()
        }
    }

    /// Set the cache time (builder pattern).
    #[must_use]
    pub const fn cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }

    #[must_use]
    pub const fn keep_previous_data(mut self, keep: bool) -> Self {
        self.keep_previous_data = keep;
        self
    }

    /// Set the default success hook.
    #[must_use]
    pub fn on_success<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Value, Option<&Value>) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(hook));
        self
    }

    /// Set the default error hook.
    #[must_use]
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&QueryError, Option<&Value>) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for ToolkitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolkitConfig")
            .field("cache_time", &self.cache_time)
            .field("keep_previous_data", &self.keep_previous_data)
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Adapts a type-erased success hook to a typed `(data, options)` callback.
pub(crate) fn typed_success_hook<T, O>(
    hook: DefaultSuccessHook,
) -> Arc<dyn Fn(&T, Option<&O>) + Send + Sync>
where
    T: Serialize,
    O: Serialize,
{
    Arc::new(move |data: &T, options: Option<&O>| match serde_json::to_value(data) {
        Ok(data) => {
            let options = options.and_then(|options| serde_json::to_value(options).ok());
            hook(&data, options.as_ref());
        }
        Err(err) => warn!(error = %err, "Default success hook skipped, data is not serializable"),
    })
}

/// Adapts a type-erased error hook to a typed `(error, options)` callback.
pub(crate) fn typed_error_hook<O>(
    hook: DefaultErrorHook,
) -> Arc<dyn Fn(&QueryError, Option<&O>) + Send + Sync>
where
    O: Serialize,
{
    Arc::new(move |error: &QueryError, options: Option<&O>| {
        let options = options.and_then(|options| serde_json::to_value(options).ok());
        hook(error, options.as_ref());
    })
}
