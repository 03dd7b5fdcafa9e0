//! The query cache, one shared store of server data keyed by [`QueryKey`].
//!
//! ## Behaviour
//!
//! - [`QueryCache::ensure`] serves fresh entries from memory and otherwise
//!   fetches, with at most one request in flight per key. Concurrent callers
//!   join the running request and all receive the same result.
//! - [`QueryCache::invalidate`] marks entries stale. Entries somebody is
//!   subscribed to are refetched in the background; the rest refetch on
//!   their next `ensure`.
//! - [`QueryCache::set_data`] writes optimistically and notifies at once.
//! - Subscribers are called in registration order after every state change,
//!   never while the store lock is held.
//! - When the last subscriber of a key leaves, its in-flight request is
//!   aborted and the entry settles in `Error` with a cancellation error.
//!
//! Every data write takes a stamp from a store-wide counter. A fetch that
//! started before a later optimistic write does not overwrite it; the entry
//! is left stale instead so the next `ensure` re-reads the server. A fetch
//! that was running when its key got invalidated writes its data but leaves
//! the entry stale, and observed entries get one follow-up fetch.
//!
//! Fetches are spawned onto the current Tokio runtime, so `ensure` and
//! background refetches must run inside one.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::{AbortHandle, Abortable, Aborted, BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::TransportError;
use crate::key::{InvalidationSet, KeyPattern, QueryKey};
use crate::query::{ApiResponse, Fetcher, QueryError};

mod config;
mod entry;
mod lock;

pub use config::CacheConfig;
pub use entry::{EntrySnapshot, QueryStatus};

use entry::{CacheEntry, Listener};
use lock::mutex_lock;

type FetchOutcome = Result<EntrySnapshot, QueryError>;
type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

/// Per-call options for [`QueryCache::ensure`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnsureOptions {
    /// Overrides [`CacheConfig::default_stale_time`] for this call.
    pub stale_time: Option<Duration>,
}

impl EnsureOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Duration::ZERO` always refetches; `Duration::MAX` never refetches a
    /// successful, non-invalidated entry.
    #[must_use]
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }
}

struct InFlight {
    id: u64,
    started_version: u64,
    /// Set when the key is invalidated while this request runs.
    invalidated: bool,
    future: SharedFetch,
    abort: AbortHandle,
}

#[derive(Default)]
struct State {
    entries: HashMap<QueryKey, CacheEntry>,
    in_flight: HashMap<QueryKey, InFlight>,
    disposed: bool,
}

struct Inner {
    config: CacheConfig,
    state: Mutex<State>,
    versions: AtomicU64,
    ids: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        for flight in state.in_flight.values() {
            flight.abort.abort();
        }
    }
}

/// Listeners to call once the lock is released.
struct Notification {
    listeners: Vec<Listener>,
    snapshot: EntrySnapshot,
}

impl Notification {
    fn for_entry(entry: &CacheEntry, snapshot: EntrySnapshot) -> Option<Self> {
        if entry.subscribers.is_empty() {
            return None;
        }
        Some(Self {
            listeners: entry.listeners(),
            snapshot,
        })
    }

    fn deliver(self) {
        for listener in &self.listeners {
            listener(&self.snapshot);
        }
    }
}

fn cancelled() -> QueryError {
    QueryError::Transport(TransportError::Cancelled)
}

/// Shared, explicitly constructed store of query results.
///
/// Cloning is cheap; all clones address the same store.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use rquery::cache::{CacheConfig, EnsureOptions, QueryCache};
/// use rquery::client::HttpClient;
/// use rquery::key::QueryKey;
/// use rquery::query::{Fetcher, QueryExecutor};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let cache = QueryCache::new(CacheConfig::default());
/// let fetcher: Arc<dyn Fetcher> = Arc::new(QueryExecutor::new(Arc::new(HttpClient::default())));
/// let key = QueryKey::new("/organizations/acme/issues/")?;
///
/// let options = EnsureOptions::new().stale_time(Duration::from_secs(30));
/// let first = cache.ensure(&key, Arc::clone(&fetcher), options).await?;
/// // Served from memory for the next 30 seconds.
/// let again = cache.ensure(&key, fetcher, options).await?;
/// assert_eq!(first.version, again.version);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

impl QueryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
                versions: AtomicU64::new(0),
                ids: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    fn lock(&self, op: &'static str) -> MutexGuard<'_, State> {
        mutex_lock(&self.inner.state, op)
    }

    fn next_version(&self) -> u64 {
        self.inner.versions.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn next_id(&self) -> u64 {
        self.inner.ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn default_stale_time(&self) -> Duration {
        self.inner.config.default_stale_time
    }

    /// Current state of `key` without fetching. `is_stale` is relative to
    /// the store's default stale time.
    pub fn get(&self, key: &QueryKey) -> Option<EntrySnapshot> {
        let state = self.lock("get");
        let entry = state.entries.get(key)?;
        Some(entry.snapshot(
            key,
            self.default_stale_time(),
            state.in_flight.contains_key(key),
            Instant::now(),
        ))
    }

    /// Returns the entry for `key`, fetching it through `fetcher` unless it
    /// is fresh.
    ///
    /// Callers that arrive while a request for the same key is running share
    /// that request. The fetch keeps running (and writes its result back)
    /// even if every caller stops waiting.
    ///
    /// # Errors
    ///
    /// The fetcher's error, also recorded on the entry next to any data
    /// from an earlier success. [`QueryError::Disposed`] once the store has
    /// been disposed.
    pub async fn ensure(
        &self,
        key: &QueryKey,
        fetcher: Arc<dyn Fetcher>,
        options: EnsureOptions,
    ) -> FetchOutcome {
        let stale_time = options.stale_time.unwrap_or(self.default_stale_time());

        let (future, loading, created) = {
            let mut guard = self.lock("ensure");
            let state = &mut *guard;
            if state.disposed {
                return Err(QueryError::Disposed);
            }

            let now = Instant::now();
            let created = !state.entries.contains_key(key);
            let entry = state
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(now));
            entry.fetcher = Some(Arc::clone(&fetcher));

            if entry.is_fresh(stale_time, now) {
                debug!(key = %key, "cache hit");
                return Ok(entry.snapshot(
                    key,
                    self.default_stale_time(),
                    state.in_flight.contains_key(key),
                    now,
                ));
            }

            match state.in_flight.get(key) {
                Some(flight) => {
                    debug!(key = %key, fetch_id = flight.id, "joining in-flight request");
                    (flight.future.clone(), None, created)
                }
                None => {
                    let (future, loading) = self.start_fetch(state, key, fetcher, now);
                    (future, loading, created)
                }
            }
        };

        if created {
            self.schedule_gc();
        }
        if let Some(notification) = loading {
            notification.deliver();
        }
        future.await
    }

    /// Like [`ensure`](Self::ensure) with a zero stale time: always goes to
    /// the network unless a request is already running.
    pub async fn refetch(&self, key: &QueryKey, fetcher: Arc<dyn Fetcher>) -> FetchOutcome {
        self.ensure(key, fetcher, EnsureOptions::new().stale_time(Duration::ZERO))
            .await
    }

    /// Registers and spawns a new fetch for `key`. Must be called with the
    /// lock held and no fetch for `key` in flight.
    fn start_fetch(
        &self,
        state: &mut State,
        key: &QueryKey,
        fetcher: Arc<dyn Fetcher>,
        now: Instant,
    ) -> (SharedFetch, Option<Notification>) {
        let id = self.next_id();
        let entry = state
            .entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(now));
        entry.status = QueryStatus::Loading;
        let started_version = entry.version;

        let (abort, registration) = AbortHandle::new_pair();
        let request = Abortable::new(fetcher.fetch(key), registration);
        let store = Arc::downgrade(&self.inner);
        let task_key = key.clone();

        let future = async move {
            let outcome = match request.await {
                Ok(outcome) => outcome,
                Err(Aborted) => Err(cancelled()),
            };
            match store.upgrade() {
                Some(inner) => QueryCache { inner }.settle(&task_key, id, outcome),
                None => Err(QueryError::Disposed),
            }
        }
        .boxed()
        .shared();

        tokio::spawn(future.clone());
        debug!(key = %key, fetch_id = id, "fetch started");

        let loading = if self.inner.config.notify_on_loading {
            let snapshot = entry.snapshot(key, self.default_stale_time(), true, now);
            Notification::for_entry(entry, snapshot)
        } else {
            None
        };

        state.in_flight.insert(
            key.clone(),
            InFlight {
                id,
                started_version,
                invalidated: false,
                future: future.clone(),
                abort,
            },
        );

        (future, loading)
    }

    /// Writes a finished fetch back into its entry.
    fn settle(
        &self,
        key: &QueryKey,
        id: u64,
        outcome: Result<ApiResponse, QueryError>,
    ) -> FetchOutcome {
        let now = Instant::now();

        let (result, notifications, unobserved) = {
            let mut guard = self.lock("settle");
            let state = &mut *guard;

            let current = state
                .in_flight
                .get(key)
                .filter(|flight| flight.id == id)
                .map(|flight| (flight.started_version, flight.invalidated));
            // Cancelled, removed or disposed while running: nothing to write.
            let Some((started_version, invalidated_while_running)) = current else {
                if state.disposed {
                    return Err(QueryError::Disposed);
                }
                return Err(outcome.err().unwrap_or_else(cancelled));
            };
            state.in_flight.remove(key);

            let Some(entry) = state.entries.get_mut(key) else {
                return Err(cancelled());
            };

            let result = match outcome {
                Ok(_) if entry.version != started_version => {
                    debug!(
                        key = %key,
                        fetch_id = id,
                        "local write landed during fetch; keeping it and marking stale"
                    );
                    entry.invalidated = true;
                    Ok(())
                }
                Ok(response) => {
                    entry.record_success(response, self.next_version(), now);
                    debug!(key = %key, fetch_id = id, version = entry.version, "fetch succeeded");
                    Ok(())
                }
                Err(err) => {
                    warn!(key = %key, fetch_id = id, error = %err, "fetch failed");
                    entry.record_error(err.clone());
                    Err(err)
                }
            };

            if invalidated_while_running {
                entry.invalidated = true;
            }
            let follow_up = match &entry.fetcher {
                Some(fetcher)
                    if invalidated_while_running
                        && result.is_ok()
                        && !entry.subscribers.is_empty()
                        && Handle::try_current().is_ok() =>
                {
                    Some(Arc::clone(fetcher))
                }
                _ => None,
            };
            let unobserved = entry.subscribers.is_empty();
            if unobserved {
                entry.inactive_since = Some(now);
            }

            let snapshot = entry.snapshot(key, self.default_stale_time(), follow_up.is_some(), now);
            let settled = Notification::for_entry(entry, snapshot.clone());

            let loading = follow_up.and_then(|fetcher| {
                debug!(key = %key, fetch_id = id, "invalidated during fetch; refetching");
                self.start_fetch(state, key, fetcher, now).1
            });
            (result.map(|()| snapshot), settled.into_iter().chain(loading), unobserved)
        };

        if unobserved {
            self.schedule_gc();
        }
        for notification in notifications {
            notification.deliver();
        }
        result
    }

    /// Optimistically replaces the data for `key` with `update(previous)`.
    ///
    /// Subscribers are notified before this returns. `update` runs while the
    /// store is locked and must not call back into the cache.
    ///
    /// # Errors
    ///
    /// [`QueryError::Disposed`] once the store has been disposed.
    pub fn set_data<F>(&self, key: &QueryKey, update: F) -> FetchOutcome
    where
        F: FnOnce(Option<&Value>) -> Value,
    {
        let now = Instant::now();

        let (snapshot, notification, created) = {
            let mut guard = self.lock("set_data");
            let state = &mut *guard;
            if state.disposed {
                return Err(QueryError::Disposed);
            }

            let created = !state.entries.contains_key(key);
            let entry = state
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(now));

            let data = update(entry.data.as_ref());
            entry.data = Some(data);
            entry.status = QueryStatus::Success;
            entry.error = None;
            entry.fetched_at = Some(now);
            entry.invalidated = false;
            entry.version = self.next_version();
            debug!(key = %key, version = entry.version, "optimistic write");

            let snapshot = entry.snapshot(
                key,
                self.default_stale_time(),
                state.in_flight.contains_key(key),
                now,
            );
            let notification = Notification::for_entry(entry, snapshot.clone());
            (snapshot, notification, created)
        };

        if created {
            self.schedule_gc();
        }
        if let Some(notification) = notification {
            notification.deliver();
        }
        Ok(snapshot)
    }

    /// Marks every entry matching `pattern` stale and returns how many were
    /// marked.
    pub fn invalidate(&self, pattern: &KeyPattern) -> usize {
        self.invalidate_where(|key| pattern.matches(key))
    }

    /// [`invalidate`](Self::invalidate) for the union of a set of patterns.
    pub fn invalidate_set(&self, set: &InvalidationSet) -> usize {
        self.invalidate_where(|key| set.matches(key))
    }

    fn invalidate_where(&self, matches: impl Fn(&QueryKey) -> bool) -> usize {
        let can_spawn = Handle::try_current().is_ok();
        let now = Instant::now();
        let mut notifications = Vec::new();

        let (marked, refetching) = {
            let mut guard = self.lock("invalidate");
            let state = &mut *guard;
            if state.disposed {
                return 0;
            }

            let mut marked = 0;
            let mut refetch = Vec::new();
            for (key, entry) in state.entries.iter_mut() {
                if !matches(key) {
                    continue;
                }
                entry.invalidated = true;
                marked += 1;

                if let Some(flight) = state.in_flight.get_mut(key) {
                    flight.invalidated = true;
                    continue;
                }
                if entry.subscribers.is_empty() {
                    continue;
                }
                if let Some(fetcher) = &entry.fetcher {
                    refetch.push((key.clone(), Arc::clone(fetcher)));
                }
            }

            if !can_spawn && !refetch.is_empty() {
                debug!(
                    deferred = refetch.len(),
                    "no runtime available; refetching on next access"
                );
                refetch.clear();
            }

            let refetching = refetch.len();
            for (key, fetcher) in refetch {
                let (_, loading) = self.start_fetch(state, &key, fetcher, now);
                notifications.extend(loading);
            }
            (marked, refetching)
        };

        info!(marked, refetching, "invalidated queries");
        for notification in notifications {
            notification.deliver();
        }
        marked
    }

    /// Registers `listener` for every state change of `key`.
    ///
    /// Dropping the returned [`Subscription`] unsubscribes. After
    /// [`dispose`](Self::dispose) the subscription is inert.
    pub fn subscribe<F>(&self, key: &QueryKey, listener: F) -> Subscription
    where
        F: Fn(&EntrySnapshot) + Send + Sync + 'static,
    {
        let id = self.next_id();
        let mut state = self.lock("subscribe");
        if state.disposed {
            return Subscription {
                store: Weak::new(),
                key: key.clone(),
                id,
                active: false,
            };
        }

        let entry = state
            .entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(Instant::now()));
        entry.subscribers.push((id, Arc::new(listener)));
        entry.inactive_since = None;
        debug!(key = %key, subscribers = entry.subscribers.len(), "subscribed");

        Subscription {
            store: Arc::downgrade(&self.inner),
            key: key.clone(),
            id,
            active: true,
        }
    }

    fn unsubscribe(&self, key: &QueryKey, id: u64) {
        let now = Instant::now();
        {
            let mut guard = self.lock("unsubscribe");
            let state = &mut *guard;
            let Some(entry) = state.entries.get_mut(key) else {
                return;
            };

            let before = entry.subscribers.len();
            entry.subscribers.retain(|(subscriber, _)| *subscriber != id);
            if entry.subscribers.len() == before || !entry.subscribers.is_empty() {
                return;
            }

            entry.inactive_since = Some(now);
            if let Some(flight) = state.in_flight.remove(key) {
                flight.abort.abort();
                entry.record_error(cancelled());
                warn!(key = %key, fetch_id = flight.id, "last subscriber left; request aborted");
            }
        }
        self.schedule_gc();
    }

    /// Drops entries that have had no subscriber for at least
    /// [`CacheConfig::gc_time`] and no request in flight. Returns how many
    /// were dropped.
    pub fn collect_garbage(&self) -> usize {
        if !self.inner.config.gc_enabled() {
            return 0;
        }
        let gc_time = self.inner.config.gc_time;
        let now = Instant::now();

        let mut guard = self.lock("collect_garbage");
        let State {
            entries, in_flight, ..
        } = &mut *guard;

        let before = entries.len();
        entries.retain(|key, entry| {
            let expired = entry.subscribers.is_empty()
                && !in_flight.contains_key(key)
                && entry
                    .inactive_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= gc_time);
            !expired
        });
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "collected inactive queries");
        }
        removed
    }

    fn schedule_gc(&self) {
        if !self.inner.config.gc_enabled() {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            return;
        };
        let store = Arc::downgrade(&self.inner);
        let delay = self.inner.config.gc_time;
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = store.upgrade() {
                QueryCache { inner }.collect_garbage();
            }
        });
    }

    /// Removes `key`, aborting its request if one is running.
    pub fn remove(&self, key: &QueryKey) -> bool {
        let mut state = self.lock("remove");
        if let Some(flight) = state.in_flight.remove(key) {
            flight.abort.abort();
        }
        state.entries.remove(key).is_some()
    }

    /// Removes every entry and aborts every running request.
    pub fn clear(&self) {
        let mut state = self.lock("clear");
        for (_, flight) in state.in_flight.drain() {
            flight.abort.abort();
        }
        state.entries.clear();
    }

    /// Tears the store down: aborts running requests and drops all entries
    /// and subscriptions. Later calls to `ensure` and `set_data` fail with
    /// [`QueryError::Disposed`].
    pub fn dispose(&self) {
        let (entries, aborted) = {
            let mut state = self.lock("dispose");
            if state.disposed {
                return;
            }
            state.disposed = true;
            let aborted = state.in_flight.len();
            for (_, flight) in state.in_flight.drain() {
                flight.abort.abort();
            }
            (std::mem::take(&mut state.entries), aborted)
        };
        info!(entries = entries.len(), aborted, "query cache disposed");
        // Listeners are dropped outside the lock.
        drop(entries);
    }

    pub fn is_disposed(&self) -> bool {
        self.lock("is_disposed").disposed
    }

    pub fn len(&self) -> usize {
        self.lock("len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All cached keys in canonical order.
    pub fn keys(&self) -> Vec<QueryKey> {
        let mut keys: Vec<_> = self.lock("keys").entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        self.lock("subscriber_count")
            .entries
            .get(key)
            .map_or(0, |entry| entry.subscribers.len())
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock("in_flight_count").in_flight.len()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock("debug");
        f.debug_struct("QueryCache")
            .field("config", &self.inner.config)
            .field("entries", &state.entries.len())
            .field("in_flight", &state.in_flight.len())
            .field("disposed", &state.disposed)
            .finish()
    }
}

/// Handle returned by [`QueryCache::subscribe`]; unsubscribes on drop.
#[derive(Debug)]
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    store: Weak<Inner>,
    key: QueryKey,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn is_active(&self) -> bool {
        self.active && self.store.strong_count() > 0
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(inner) = self.store.upgrade() {
            QueryCache { inner }.unsubscribe(&self.key, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
