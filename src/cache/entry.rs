//! Per-key cache state and the snapshots handed to consumers.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;

use crate::http::PageLinks;
use crate::key::QueryKey;
use crate::query::{ApiResponse, Fetcher, QueryError, ResponseMeta};

/// Lifecycle of a cache entry.
///
/// `Idle -> Loading -> Success | Error`, and back to `Loading` on refetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStatus {
    /// Never fetched.
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Success => "success",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

pub(crate) type Listener = Arc<dyn Fn(&EntrySnapshot) + Send + Sync>;

/// Mutable state for one key. Lives inside the store lock.
pub(crate) struct CacheEntry {
    pub(crate) data: Option<Value>,
    pub(crate) meta: Option<ResponseMeta>,
    pub(crate) fetched_at: Option<Instant>,
    pub(crate) status: QueryStatus,
    pub(crate) error: Option<QueryError>,
    pub(crate) invalidated: bool,
    pub(crate) version: u64,
    pub(crate) fetcher: Option<Arc<dyn Fetcher>>,
    pub(crate) subscribers: Vec<(u64, Listener)>,
    pub(crate) inactive_since: Option<Instant>,
}

impl CacheEntry {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            data: None,
            meta: None,
            fetched_at: None,
            status: QueryStatus::Idle,
            error: None,
            invalidated: false,
            version: 0,
            fetcher: None,
            subscribers: Vec::new(),
            inactive_since: Some(now),
        }
    }

    /// Fresh entries are served without touching the network.
    pub(crate) fn is_fresh(&self, stale_time: Duration, now: Instant) -> bool {
        self.status == QueryStatus::Success
            && !self.invalidated
            && self
                .fetched_at
                .is_some_and(|at| now.saturating_duration_since(at) < stale_time)
    }

    pub(crate) fn record_success(&mut self, response: ApiResponse, version: u64, now: Instant) {
        self.data = Some(response.data);
        self.meta = Some(response.meta);
        self.fetched_at = Some(now);
        self.status = QueryStatus::Success;
        self.error = None;
        self.invalidated = false;
        self.version = version;
    }

    /// Stale-while-error: previous data stays put.
    pub(crate) fn record_error(&mut self, error: QueryError) {
        self.status = QueryStatus::Error;
        self.error = Some(error);
    }

    pub(crate) fn listeners(&self) -> Vec<Listener> {
        self.subscribers
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    pub(crate) fn snapshot(
        &self,
        key: &QueryKey,
        stale_time: Duration,
        is_fetching: bool,
        now: Instant,
    ) -> EntrySnapshot {
        EntrySnapshot {
            key: key.clone(),
            data: self.data.clone(),
            status: self.status,
            error: self.error.clone(),
            meta: self.meta.clone(),
            fetched_at: self.fetched_at,
            is_stale: !self.is_fresh(stale_time, now),
            is_fetching,
            version: self.version,
        }
    }
}

/// Immutable view of a cache entry at one point in time.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub key: QueryKey,
    pub data: Option<Value>,
    pub status: QueryStatus,
    pub error: Option<QueryError>,
    pub meta: Option<ResponseMeta>,
    pub fetched_at: Option<Instant>,
    pub is_stale: bool,
    /// A request for this key was in flight when the snapshot was taken.
    pub is_fetching: bool,
    /// Stamp of the last data write; grows monotonically across the store.
    pub version: u64,
}

impl EntrySnapshot {
    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    /// Deserializes the cached data into a typed view. `None` before the
    /// first successful fetch.
    pub fn data_as<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        self.data.as_ref().map(|data| T::deserialize(data))
    }

    pub fn status_text(&self) -> Option<&str> {
        self.meta.as_ref().map(|meta| meta.status_text())
    }

    /// Header from the response that produced the cached data.
    pub fn get_response_header(&self, name: &str) -> Option<&str> {
        self.meta.as_ref()?.get_response_header(name)
    }

    pub fn links(&self) -> PageLinks {
        self.meta.as_ref().map(|meta| meta.links()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::http::{Headers, StatusCode};

    fn response(data: Value) -> ApiResponse {
        let mut headers = Headers::new();
        headers.insert("X-Hits", "2");
        ApiResponse::new(data, ResponseMeta::new(StatusCode::OK, "OK", headers))
    }

    #[tokio::test(start_paused = true)]
    async fn freshness_follows_stale_time() {
        let start = Instant::now();
        let mut entry = CacheEntry::new(start);
        assert!(!entry.is_fresh(Duration::MAX, start));

        entry.record_success(response(json!([1])), 1, start);
        assert!(entry.is_fresh(Duration::from_secs(10), start));
        assert!(!entry.is_fresh(Duration::ZERO, start));

        tokio::time::advance(Duration::from_secs(11)).await;
        let now = Instant::now();
        assert!(!entry.is_fresh(Duration::from_secs(10), now));
        assert!(entry.is_fresh(Duration::MAX, now));

        entry.invalidated = true;
        assert!(!entry.is_fresh(Duration::MAX, now));
    }

    #[tokio::test]
    async fn error_keeps_previous_data() {
        let now = Instant::now();
        let mut entry = CacheEntry::new(now);
        entry.record_success(response(json!({"id": "1"})), 3, now);
        entry.record_error(QueryError::Disposed);

        let key = QueryKey::new("/issues/1/").unwrap();
        let snap = entry.snapshot(&key, Duration::MAX, false, now);
        assert!(snap.is_error());
        assert!(snap.is_stale);
        assert_eq!(snap.data, Some(json!({"id": "1"})));
        assert_eq!(snap.version, 3);
        assert_eq!(snap.get_response_header("x-hits"), Some("2"));
        assert_eq!(snap.status_text(), Some("OK"));
    }

    #[test]
    fn typed_data() {
        let snap = EntrySnapshot {
            key: QueryKey::new("/projects/").unwrap(),
            data: Some(json!(["a", "b"])),
            status: QueryStatus::Success,
            error: None,
            meta: None,
            fetched_at: None,
            is_stale: false,
            is_fetching: false,
            version: 1,
        };
        let slugs: Vec<String> = snap.data_as().unwrap().unwrap();
        assert_eq!(slugs, ["a", "b"]);
        assert!(snap.links().is_empty());
    }
}
