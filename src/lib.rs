//! # rquery
//!
//! A request cache for JSON APIs: canonical query keys, one shared store
//! with request coalescing, stale-time control, invalidation, optimistic
//! writes and subscriptions, on top of a from-scratch async HTTP/1.1 client.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rquery::{ApiClient, CacheConfig, ClientConfig, EnsureOptions, QueryKey, QueryOptions};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let api = ApiClient::new(ClientConfig::new("127.0.0.1:8000"), CacheConfig::default());
//!
//!     let key = QueryKey::with_options(
//!         "/organizations/acme/issues/",
//!         QueryOptions::new().query(json!({"limit": 25}))?,
//!     )?;
//!     let issues = api.query(&key, EnsureOptions::default()).await?;
//!     println!("{:?} next={:?}", issues.data, issues.links().next());
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`http`]: wire types (status, method, headers, request, response, `Link` parsing)
//! - [`client`]: the [`Transport`] boundary and the bundled [`HttpClient`]
//! - [`key`]: [`QueryKey`] normalization and invalidation patterns
//! - [`query`]: turns a key into a request and classifies the response
//! - [`cache`]: the [`QueryCache`] store
//! - [`mutation`]: one-off writes and their state tracker

use std::sync::Arc;

use serde_json::Value;

pub mod cache;
pub mod client;
pub mod http;
pub mod key;
pub mod mutation;
pub mod query;

pub use cache::{CacheConfig, EnsureOptions, EntrySnapshot, QueryCache, QueryStatus, Subscription};
pub use client::{ClientConfig, HttpClient, Transport, TransportError};
pub use http::{Headers, Method, PageLink, PageLinks, Request, Response, StatusCode};
pub use key::{InvalidationSet, KeyError, KeyPattern, QueryKey, QueryOptions};
pub use mutation::{Mutation, MutationExecutor, MutationRequest, MutationState};
pub use query::{ApiResponse, Fetcher, QueryError, QueryExecutor, ResponseMeta};

/// One transport, one executor and one cache wired together.
///
/// Queries go through the cache; mutations go straight to the transport and
/// leave cache updates to the caller.
#[derive(Clone)]
pub struct ApiClient {
    cache: QueryCache,
    fetcher: Arc<dyn Fetcher>,
    mutations: MutationExecutor,
}

impl ApiClient {
    /// Talks to the API over [`HttpClient`].
    pub fn new(client: ClientConfig, cache: CacheConfig) -> Self {
        Self::with_transport(Arc::new(HttpClient::new(client)), cache)
    }

    pub fn with_transport(transport: Arc<dyn Transport>, cache: CacheConfig) -> Self {
        Self::with_executor(QueryExecutor::new(transport), cache)
    }

    pub fn with_executor(executor: QueryExecutor, cache: CacheConfig) -> Self {
        Self {
            cache: QueryCache::new(cache),
            fetcher: Arc::new(executor.clone()),
            mutations: MutationExecutor::new(executor),
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// [`QueryCache::ensure`] with this client's executor.
    pub async fn query(
        &self,
        key: &QueryKey,
        options: EnsureOptions,
    ) -> Result<EntrySnapshot, QueryError> {
        self.cache
            .ensure(key, Arc::clone(&self.fetcher), options)
            .await
    }

    pub async fn mutate(&self, request: MutationRequest) -> Result<Value, QueryError> {
        self.mutations.mutate(request).await
    }

    /// Runs `request` through a [`Mutation`] tracker.
    pub async fn run_mutation(
        &self,
        mutation: &Mutation,
        request: MutationRequest,
    ) -> Result<Value, QueryError> {
        mutation.run(&self.mutations, request).await
    }

    pub fn invalidate(&self, pattern: &KeyPattern) -> usize {
        self.cache.invalidate(pattern)
    }

    pub fn subscribe<F>(&self, key: &QueryKey, listener: F) -> Subscription
    where
        F: Fn(&EntrySnapshot) + Send + Sync + 'static,
    {
        self.cache.subscribe(key, listener)
    }

    pub fn dispose(&self) {
        self.cache.dispose();
    }
}
