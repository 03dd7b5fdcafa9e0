//! Query keys: canonical, hashable identifiers for cached requests.
//!
//! A [`QueryKey`] is the pair `(path, options)` where the options carry the
//! method, query parameters, headers, body and host of the request. Keys are
//! normalized on construction so that logically identical requests collide in
//! the cache:
//!
//! - absent options are omitted, so "no query" and "query left unset" agree;
//! - object keys are sorted at every depth, so insertion order never matters;
//! - an explicit `GET` is the same as no method at all.
//!
//! The canonical JSON string doubles as the key's identity for `Eq`, `Hash`,
//! `Ord` and `Display`, which makes it usable as a change-detection token.
//!
//! ```
//! use rquery::key::{QueryKey, QueryOptions};
//! use serde_json::json;
//!
//! let a = QueryKey::with_options(
//!     "/organizations/acme/issues/",
//!     QueryOptions::new().query(json!({"limit": 2, "sort": "date"}))?,
//! )?;
//! let b = QueryKey::with_options(
//!     "/organizations/acme/issues/",
//!     QueryOptions::new().query(json!({"sort": "date", "limit": 2}))?,
//! )?;
//! assert_eq!(a, b);
//! # Ok::<(), rquery::key::KeyError>(())
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::http::Method;

/// Configuration errors raised synchronously while building keys or requests.
///
/// These never reach the cache: no entry is created for an invalid key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("query key path must not be empty")]
    EmptyPath,

    #[error("query option `{field}` is not serializable: {reason}")]
    NotSerializable { field: &'static str, reason: String },

    #[error("query option `{field}` must be a JSON object")]
    NotAnObject { field: &'static str },

    #[error("method {method} cannot be used for a mutation")]
    ReadOnlyMethod { method: Method },
}

/// Request options that take part in a key's identity.
///
/// Every field is optional; unset fields are left out of the canonical form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    method: Option<Method>,
    query: Option<Value>,
    headers: Option<Value>,
    data: Option<Value>,
    host: Option<String>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Sets the query parameters from any serializable map-like value.
    ///
    /// `null` members (such as `None` fields) count as unset and are dropped,
    /// so `{"cursor": null}` and `{}` name the same query.
    ///
    /// # Errors
    ///
    /// [`KeyError::NotSerializable`] if serialization fails and
    /// [`KeyError::NotAnObject`] if the value is not a map.
    pub fn query(mut self, query: impl Serialize) -> Result<Self, KeyError> {
        self.query = without_nulls(to_object("query", query)?);
        Ok(self)
    }

    /// Sets the request headers from any serializable map-like value.
    ///
    /// # Errors
    ///
    /// Same as [`QueryOptions::query`].
    pub fn headers(mut self, headers: impl Serialize) -> Result<Self, KeyError> {
        self.headers = Some(to_object("headers", headers)?);
        Ok(self)
    }

    /// Adds a single header, creating the header object if needed.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let headers = self
            .headers
            .get_or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = headers {
            map.insert(name.into(), Value::String(value.into()));
        }
        self
    }

    /// Sets the request body.
    ///
    /// # Errors
    ///
    /// [`KeyError::NotSerializable`] if serialization fails.
    pub fn data(mut self, data: impl Serialize) -> Result<Self, KeyError> {
        let value = serde_json::to_value(data).map_err(|err| KeyError::NotSerializable {
            field: "data",
            reason: err.to_string(),
        })?;
        self.data = Some(value);
        Ok(self)
    }

    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// The request method, defaulting to `GET`.
    pub fn effective_method(&self) -> Method {
        self.method.clone().unwrap_or_default()
    }

    pub fn query_params(&self) -> Option<&Value> {
        self.query.as_ref()
    }

    pub fn header_values(&self) -> Option<&Value> {
        self.headers.as_ref()
    }

    pub fn body(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    pub fn host_override(&self) -> Option<&str> {
        self.host.as_deref()
    }

    fn canonical(&self) -> Value {
        let mut map = Map::new();
        if let Some(method) = self.method.as_ref().filter(|m| **m != Method::Get) {
            map.insert("method".to_owned(), Value::String(method.as_str().to_owned()));
        }
        if let Some(query) = &self.query {
            map.insert("query".to_owned(), canonicalize(query));
        }
        if let Some(headers) = &self.headers {
            map.insert("headers".to_owned(), canonicalize(headers));
        }
        if let Some(data) = &self.data {
            map.insert("data".to_owned(), canonicalize(data));
        }
        if let Some(host) = &self.host {
            map.insert("host".to_owned(), Value::String(host.clone()));
        }
        sorted_object(map)
    }
}

/// A normalized `(path, options)` pair identifying one cached request.
///
/// Cloning is cheap; the canonical form is shared.
#[derive(Clone)]
pub struct QueryKey {
    inner: Arc<KeyInner>,
}

struct KeyInner {
    path: String,
    options: QueryOptions,
    canonical: Value,
    repr: String,
}

impl QueryKey {
    /// Builds a key for `path` with no options.
    ///
    /// # Errors
    ///
    /// [`KeyError::EmptyPath`] if `path` is empty or whitespace.
    pub fn new(path: impl Into<String>) -> Result<Self, KeyError> {
        Self::with_options(path, QueryOptions::default())
    }

    /// Builds a key for `path` with the given options.
    ///
    /// # Errors
    ///
    /// [`KeyError::EmptyPath`] if `path` is empty or whitespace.
    pub fn with_options(path: impl Into<String>, options: QueryOptions) -> Result<Self, KeyError> {
        let path = path.into();
        if path.trim().is_empty() {
            return Err(KeyError::EmptyPath);
        }

        let options_value = options.canonical();
        let canonical = match &options_value {
            Value::Object(map) if map.is_empty() => Value::Array(vec![Value::String(path.clone())]),
            _ => Value::Array(vec![Value::String(path.clone()), options_value]),
        };
        let repr = canonical.to_string();

        Ok(Self {
            inner: Arc::new(KeyInner {
                path,
                options,
                canonical,
                repr,
            }),
        })
    }

    /// The resource path.
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// The options exactly as supplied.
    pub fn options(&self) -> &QueryOptions {
        &self.inner.options
    }

    /// The canonical `[path, options?]` JSON value.
    pub fn canonical(&self) -> &Value {
        &self.inner.canonical
    }

    /// The canonical form serialized as compact JSON.
    pub fn as_str(&self) -> &str {
        &self.inner.repr
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.inner.repr == other.inner.repr
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.repr.hash(state);
    }
}

impl PartialOrd for QueryKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueryKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.inner.repr.cmp(&other.inner.repr)
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("QueryKey").field(&self.inner.repr).finish()
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.repr)
    }
}

/// Selects cache entries for invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPattern {
    /// Exactly one key.
    Exact(QueryKey),
    /// Every key for this resource path, whatever its options.
    Path(String),
    /// Every key whose path starts with this prefix.
    PathPrefix(String),
}

impl KeyPattern {
    pub fn matches(&self, key: &QueryKey) -> bool {
        match self {
            Self::Exact(exact) => exact == key,
            Self::Path(path) => key.path() == path,
            Self::PathPrefix(prefix) => key.path().starts_with(prefix.as_str()),
        }
    }
}

impl From<QueryKey> for KeyPattern {
    fn from(key: QueryKey) -> Self {
        Self::Exact(key)
    }
}

impl From<&QueryKey> for KeyPattern {
    fn from(key: &QueryKey) -> Self {
        Self::Exact(key.clone())
    }
}

/// The keys a mutation marks stale: the union of its patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationSet {
    patterns: Vec<KeyPattern>,
}

impl InvalidationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pattern, builder style.
    #[must_use]
    pub fn with(mut self, pattern: impl Into<KeyPattern>) -> Self {
        self.push(pattern);
        self
    }

    /// Adds a pattern unless an identical one is already present.
    pub fn push(&mut self, pattern: impl Into<KeyPattern>) {
        let pattern = pattern.into();
        if !self.patterns.contains(&pattern) {
            self.patterns.push(pattern);
        }
    }

    pub fn matches(&self, key: &QueryKey) -> bool {
        self.patterns.iter().any(|pattern| pattern.matches(key))
    }

    pub fn patterns(&self) -> &[KeyPattern] {
        &self.patterns
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl FromIterator<KeyPattern> for InvalidationSet {
    fn from_iter<I: IntoIterator<Item = KeyPattern>>(iter: I) -> Self {
        let mut set = Self::new();
        for pattern in iter {
            set.push(pattern);
        }
        set
    }
}

fn to_object(field: &'static str, value: impl Serialize) -> Result<Value, KeyError> {
    let value = serde_json::to_value(value).map_err(|err| KeyError::NotSerializable {
        field,
        reason: err.to_string(),
    })?;
    match value {
        Value::Object(_) => Ok(value),
        _ => Err(KeyError::NotAnObject { field }),
    }
}

fn without_nulls(value: Value) -> Option<Value> {
    match value {
        Value::Object(mut map) => {
            map.retain(|_, v| !v.is_null());
            (!map.is_empty()).then_some(Value::Object(map))
        }
        other => Some(other),
    }
}

/// Rebuilds `value` with object keys sorted at every depth.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let map = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect::<Map<_, _>>();
            sorted_object(map)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

// `serde_json::Map` only iterates in key order without `preserve_order`; sort
// explicitly so the canonical form never depends on that feature.
fn sorted_object(map: Map<String, Value>) -> Value {
    let mut entries: Vec<_> = map.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Value::Object(entries.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use serde_json::json;

    use super::*;

    fn issues(query: Value) -> QueryKey {
        QueryKey::with_options(
            "/organizations/acme/issues/",
            QueryOptions::new().query(query).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn key_order_does_not_matter() {
        let a = issues(json!({"limit": 2, "filter": {"b": 1, "a": [1, {"y": 0, "x": 1}]}}));
        let b = issues(json!({"filter": {"a": [1, {"x": 1, "y": 0}], "b": 1}, "limit": 2}));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), b.as_str());
    }

    #[test]
    fn array_order_matters() {
        assert_ne!(
            issues(json!({"project": [1, 2]})),
            issues(json!({"project": [2, 1]}))
        );
    }

    #[test]
    fn unset_options_match_no_options() {
        let bare = QueryKey::new("/projects/").unwrap();
        let empty = QueryKey::with_options("/projects/", QueryOptions::new()).unwrap();
        let get = QueryKey::with_options("/projects/", QueryOptions::new().method(Method::Get))
            .unwrap();
        assert_eq!(bare, empty);
        assert_eq!(bare, get);
        assert_eq!(bare.as_str(), r#"["/projects/"]"#);
    }

    #[test]
    fn options_distinguish_keys() {
        let get = QueryKey::new("/projects/").unwrap();
        let head =
            QueryKey::with_options("/projects/", QueryOptions::new().method(Method::Head)).unwrap();
        let other_host =
            QueryKey::with_options("/projects/", QueryOptions::new().host("eu.example")).unwrap();
        assert_ne!(get, head);
        assert_ne!(get, other_host);
    }

    #[test]
    fn hash_map_and_btree_map_normalize_alike() {
        let mut unordered = HashMap::new();
        unordered.insert("statsPeriod", "24h");
        unordered.insert("query", "is:unresolved");
        let ordered: BTreeMap<_, _> = unordered.clone().into_iter().collect();

        let a = QueryKey::with_options("/x/", QueryOptions::new().query(unordered).unwrap())
            .unwrap();
        let b =
            QueryKey::with_options("/x/", QueryOptions::new().query(ordered).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[derive(Serialize)]
    struct IssueQuery {
        limit: u32,
        cursor: Option<String>,
    }

    #[test]
    fn none_query_fields_are_omitted() {
        let typed = QueryKey::with_options(
            "/organizations/acme/issues/",
            QueryOptions::new()
                .query(IssueQuery { limit: 2, cursor: None })
                .unwrap(),
        )
        .unwrap();
        assert_eq!(typed, issues(json!({"limit": 2})));
        assert_eq!(typed, issues(json!({"limit": 2, "cursor": null})));

        let all_unset = issues(json!({"cursor": null}));
        assert_eq!(all_unset, QueryKey::new("/organizations/acme/issues/").unwrap());
        assert!(all_unset.options().query_params().is_none());
    }

    #[test]
    fn empty_path_is_rejected() {
        assert_eq!(QueryKey::new("").unwrap_err(), KeyError::EmptyPath);
        assert_eq!(QueryKey::new("   ").unwrap_err(), KeyError::EmptyPath);
    }

    #[test]
    fn non_object_query_is_rejected() {
        let err = QueryOptions::new().query(vec![1, 2]).unwrap_err();
        assert_eq!(err, KeyError::NotAnObject { field: "query" });
    }

    #[test]
    fn non_string_map_keys_are_not_serializable() {
        let mut weird = HashMap::new();
        weird.insert(vec![1u8], "x");
        let err = QueryOptions::new().query(weird).unwrap_err();
        assert!(matches!(err, KeyError::NotSerializable { field: "query", .. }));
    }

    #[test]
    fn header_builder_merges() {
        let options = QueryOptions::new()
            .header("Accept", "application/json")
            .header("X-Sentry-Org", "acme");
        let key = QueryKey::with_options("/x/", options).unwrap();
        assert_eq!(
            key.canonical(),
            &json!(["/x/", {"headers": {"Accept": "application/json", "X-Sentry-Org": "acme"}}])
        );
    }

    #[test]
    fn patterns_match() {
        let key = issues(json!({"limit": 2}));
        assert!(KeyPattern::from(&key).matches(&key));
        assert!(KeyPattern::Path("/organizations/acme/issues/".into()).matches(&key));
        assert!(KeyPattern::PathPrefix("/organizations/acme/".into()).matches(&key));
        assert!(!KeyPattern::Path("/organizations/acme/".into()).matches(&key));
        assert!(!KeyPattern::from(issues(json!({"limit": 3}))).matches(&key));
    }

    #[test]
    fn invalidation_set_deduplicates() {
        let set = InvalidationSet::new()
            .with(KeyPattern::Path("/a/".into()))
            .with(KeyPattern::Path("/a/".into()))
            .with(KeyPattern::PathPrefix("/b".into()));
        assert_eq!(set.len(), 2);
        assert!(set.matches(&QueryKey::new("/b/c/").unwrap()));
        assert!(!set.matches(&QueryKey::new("/c/").unwrap()));
    }
}
