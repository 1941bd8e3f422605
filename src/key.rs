//! Query keys and their canonical string form.
//!
//! A [`QueryKey`] names a resource family (`base_key`) and, optionally, the
//! options that select one member of it. The canonical form is used both to
//! address cache slots and to deduplicate queries in the toolkit registry, so
//! two keys with deep-equal options must always canonicalize identically no
//! matter the order their object fields were built in.

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::QueryError;

/// Identity of a query: a base key plus optional options.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryKey {
    pub base_key: String,
    pub options: Option<Value>,
}

impl QueryKey {
    /// Creates a key without options.
    pub fn new(base_key: impl Into<String>) -> Self {
        Self {
            base_key: base_key.into(),
            options: None,
        }
    }

    /// Creates a key with already encoded options.
    pub fn with_options(base_key: impl Into<String>, options: Value) -> Self {
        Self {
            base_key: base_key.into(),
            options: Some(options),
        }
    }

    /// Creates a key by serializing typed options.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Serialization`] if the options cannot be encoded as JSON.
    pub fn from_options<O: Serialize>(
        base_key: impl Into<String>,
        options: Option<&O>,
    ) -> Result<Self, QueryError> {
        let options = options.map(serde_json::to_value).transpose()?;
        Ok(Self {
            base_key: base_key.into(),
            options,
        })
    }

    /// Returns the canonical string for this key.
    pub fn canonical(&self) -> String {
        canonicalize(self)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Canonicalizes a key into a stable, field-order independent string.
///
/// Keys without options encode as a one-element array (`["todos"]`), keys with
/// options as a two-element array (`["todos",{"id":1}]`), so the no-options
/// form never collides with any options value, `null` included.
pub fn canonicalize(key: &QueryKey) -> String {
    let mut parts = vec![Value::String(key.base_key.clone())];
    if let Some(options) = &key.options {
        parts.push(sorted(options));
    }
    Value::Array(parts).to_string()
}

/// Canonical encoding of an options value alone, used to address child slots.
pub(crate) fn canonical_options(options: &Value) -> String {
    sorted(options).to_string()
}

// Rebuilds objects with their fields inserted in sorted order, so the output
// does not depend on whether `serde_json` preserves insertion order.
fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut out = Map::new();
            for (k, v) in entries {
                out.insert(k.clone(), sorted(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}
