//! Canonical query keys.
//!
//! This module provides [`QueryKey`], the canonical identifier of a
//! `{path, method, options}` triple.
//!
//! ## Canonical form
//!
//! A query key is the JSON serialization of the request identity with every
//! object's keys recursively sorted. Two semantically equal requests produce
//! byte-equal keys regardless of the order their properties were assembled
//! in:
//!
//! ```
//! use fetchbox_core::{Method, QueryKey, RequestOptions};
//! use serde_json::json;
//!
//! let a = RequestOptions::new().query(json!({"page": 1, "limit": 10}));
//! let b = RequestOptions::new().query(json!({"limit": 10, "page": 1}));
//!
//! let ka = QueryKey::for_request("/posts", Method::Get, &a);
//! let kb = QueryKey::for_request("/posts", Method::Get, &b);
//! assert_eq!(ka, kb);
//! ```
//!
//! Only the serializable identity participates: `path`, `method`, and the
//! `query` / `params` / `body` portions of the options. Headers, abort
//! signals, and plugin options never enter the key.
//!
//! ## Performance
//!
//! `QueryKey` stores the canonical string behind an `Arc`, so cloning a key
//! only bumps a reference count. Keys are passed around constantly during
//! cache operations.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde_json::{Map, Value};
use smol_str::SmolStr;

use crate::request::{Method, RequestOptions};

/// Marker value stored under the `"type"` field of infinite tracker keys.
pub const INFINITE_TRACKER_TYPE: &str = "infinite-tracker";

/// The canonical identifier of a `{path, method, options}` triple.
///
/// # Cheap cloning
///
/// The canonical string is stored behind an [`Arc`]; `clone()` is O(1).
///
/// # Opaque keys
///
/// Keys built with [`QueryKey::from_raw`] are allowed to carry any string.
/// Such keys simply fail to [`parse`](QueryKey::parse) and carry no
/// self-tag, which is safe: exact-target lookups will find nothing.
#[derive(Clone, Debug)]
pub struct QueryKey {
    inner: Arc<str>,
}

impl QueryKey {
    /// Builds the canonical key for a request.
    pub fn for_request(path: &str, method: Method, options: &RequestOptions) -> Self {
        Self::build(path, method, options, None)
    }

    /// Builds the canonical key for an infinite tracker entry.
    ///
    /// The key carries a `type: "infinite-tracker"` marker so tracker
    /// entries never collide with ordinary request keys.
    pub fn for_tracker(path: &str, method: Method, options: &RequestOptions) -> Self {
        Self::build(path, method, options, Some(INFINITE_TRACKER_TYPE))
    }

    fn build(path: &str, method: Method, options: &RequestOptions, kind: Option<&str>) -> Self {
        let mut root = Map::new();
        root.insert("method".into(), Value::String(method.as_str().to_owned()));
        root.insert("options".into(), options.key_payload());
        root.insert("path".into(), Value::String(path.to_owned()));
        if let Some(kind) = kind {
            root.insert("type".into(), Value::String(kind.to_owned()));
        }
        let canonical = canonicalize(&Value::Object(root));
        QueryKey {
            inner: Arc::from(canonical.to_string().as_str()),
        }
    }

    /// Wraps an externally produced key verbatim.
    pub fn from_raw(raw: impl AsRef<str>) -> Self {
        QueryKey {
            inner: Arc::from(raw.as_ref()),
        }
    }

    /// Returns the canonical string form.
    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// Decodes the key back into its request identity.
    ///
    /// Returns `None` for opaque keys that do not parse as a JSON object
    /// with a `path` field.
    pub fn parse(&self) -> Option<DecodedKey> {
        let value: Value = serde_json::from_str(&self.inner).ok()?;
        let object = value.as_object()?;
        let path = object.get("path")?.as_str()?.to_owned();
        let method = object
            .get("method")
            .and_then(Value::as_str)
            .and_then(|m| m.parse().ok())
            .unwrap_or(Method::Get);
        let options = object.get("options").cloned().unwrap_or(Value::Null);
        let is_tracker = object.get("type").and_then(Value::as_str) == Some(INFINITE_TRACKER_TYPE);
        Some(DecodedKey {
            path,
            method,
            options,
            is_tracker,
        })
    }

    /// Derives the self-tag for this key: the `path` field of a parseable
    /// key, or `None` for opaque keys.
    pub fn self_tag(&self) -> Option<SmolStr> {
        self.parse().map(|decoded| SmolStr::new(decoded.path))
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        // Fast path: same Arc pointer
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner == other.inner
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.hash(state);
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner)
    }
}

impl From<&str> for QueryKey {
    fn from(raw: &str) -> Self {
        QueryKey::from_raw(raw)
    }
}

/// A query key decoded back into its request identity.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedKey {
    /// The request path, with `:param` placeholders unexpanded.
    pub path: String,
    /// The HTTP method.
    pub method: Method,
    /// The serializable options (`query` / `params` / `body`), or
    /// `Value::Null` when the key carried none.
    pub options: Value,
    /// Whether this key identifies an infinite tracker entry.
    pub is_tracker: bool,
}

impl DecodedKey {
    /// Returns the `query` portion of the decoded options, if any.
    pub fn query(&self) -> Option<&Value> {
        self.options.get("query")
    }

    /// Returns the `params` portion of the decoded options, if any.
    pub fn params(&self) -> Option<&Value> {
        self.options.get("params")
    }

    /// Returns the `body` portion of the decoded options, if any.
    pub fn body(&self) -> Option<&Value> {
        self.options.get("body")
    }
}

/// Recursively sorts every object's keys.
///
/// `serde_json` is built with `preserve_order`, so inserting keys in sorted
/// order yields a sorted serialization.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                if let Some(inner) = map.get(key) {
                    sorted.insert(key.clone(), canonicalize(inner));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_independence() {
        let a = RequestOptions::new().query(json!({"b": 2, "a": 1}));
        let b = RequestOptions::new().query(json!({"a": 1, "b": 2}));
        let ka = QueryKey::for_request("/posts", Method::Get, &a);
        let kb = QueryKey::for_request("/posts", Method::Get, &b);
        assert_eq!(ka, kb);
        assert_eq!(ka.as_str(), kb.as_str());
    }

    #[test]
    fn test_key_nested_order_independence() {
        let a = RequestOptions::new().body(json!({"outer": {"y": [1, {"q": 1, "p": 2}], "x": 0}}));
        let b = RequestOptions::new().body(json!({"outer": {"x": 0, "y": [1, {"p": 2, "q": 1}]}}));
        let ka = QueryKey::for_request("/posts", Method::Post, &a);
        let kb = QueryKey::for_request("/posts", Method::Post, &b);
        assert_eq!(ka, kb);
    }

    #[test]
    fn test_different_requests_differ() {
        let options = RequestOptions::new().query(json!({"page": 1}));
        let ka = QueryKey::for_request("/posts", Method::Get, &options);
        let kb = QueryKey::for_request("/posts", Method::Get, &RequestOptions::new());
        let kc = QueryKey::for_request("/users", Method::Get, &options);
        let kd = QueryKey::for_request("/posts", Method::Post, &options);
        assert_ne!(ka, kb);
        assert_ne!(ka, kc);
        assert_ne!(ka, kd);
    }

    #[test]
    fn test_parse_roundtrip() {
        let options = RequestOptions::new().query(json!({"page": 3}));
        let key = QueryKey::for_request("/posts/:id", Method::Get, &options);
        let decoded = key.parse().expect("canonical keys parse");
        assert_eq!(decoded.path, "/posts/:id");
        assert_eq!(decoded.method, Method::Get);
        assert_eq!(decoded.query(), Some(&json!({"page": 3})));
        assert!(!decoded.is_tracker);
    }

    #[test]
    fn test_opaque_key_has_no_self_tag() {
        let key = QueryKey::from_raw("not-json");
        assert!(key.parse().is_none());
        assert!(key.self_tag().is_none());
    }

    #[test]
    fn test_self_tag_is_path() {
        let key = QueryKey::for_request("/posts", Method::Get, &RequestOptions::new());
        assert_eq!(key.self_tag().as_deref(), Some("/posts"));
    }

    #[test]
    fn test_tracker_key_is_marked() {
        let options = RequestOptions::new();
        let plain = QueryKey::for_request("/posts", Method::Get, &options);
        let tracker = QueryKey::for_tracker("/posts", Method::Get, &options);
        assert_ne!(plain, tracker);
        assert!(tracker.parse().expect("parses").is_tracker);
    }
}
