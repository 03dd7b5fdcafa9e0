//! Writes against the API: POST, PUT, PATCH and DELETE.
//!
//! Mutations are one-off requests. They are never cached, never retried and
//! never touch the [`QueryCache`](crate::cache::QueryCache) on their own;
//! call sites pair a successful mutation with an explicit invalidation or
//! optimistic write.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rquery::client::HttpClient;
//! use rquery::key::KeyPattern;
//! use rquery::mutation::{Mutation, MutationExecutor, MutationRequest};
//! use rquery::query::QueryExecutor;
//!
//! # async fn run(cache: rquery::cache::QueryCache) -> Result<(), Box<dyn std::error::Error>> {
//! let executor = MutationExecutor::new(QueryExecutor::new(Arc::new(HttpClient::default())));
//! let resolve = MutationRequest::put("/organizations/acme/issues/")?
//!     .query(serde_json::json!({"id": "1"}))?
//!     .data(serde_json::json!({"status": "resolved"}))?;
//!
//! let mutation = Mutation::new();
//! mutation.run(&executor, resolve).await?;
//! cache.invalidate(&KeyPattern::Path("/organizations/acme/issues/".into()));
//! # Ok(())
//! # }
//! ```

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::http::{Headers, Method, Request};
use crate::key::KeyError;
use crate::query::{ApiResponse, QueryError, QueryExecutor};

/// Description of one write request.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRequest {
    method: Method,
    path: String,
    query: Option<Value>,
    headers: Headers,
    data: Option<Value>,
    host: Option<String>,
}

fn to_value(field: &'static str, value: impl Serialize) -> Result<Value, KeyError> {
    serde_json::to_value(value).map_err(|err| KeyError::NotSerializable {
        field,
        reason: err.to_string(),
    })
}

impl MutationRequest {
    /// # Errors
    ///
    /// [`KeyError::ReadOnlyMethod`] for GET, HEAD, OPTIONS and TRACE;
    /// [`KeyError::EmptyPath`] for a blank path.
    pub fn new(method: Method, path: impl Into<String>) -> Result<Self, KeyError> {
        if method.is_safe() {
            return Err(KeyError::ReadOnlyMethod { method });
        }
        let path = path.into();
        if path.trim().is_empty() {
            return Err(KeyError::EmptyPath);
        }
        Ok(Self {
            method,
            path,
            query: None,
            headers: Headers::new(),
            data: None,
            host: None,
        })
    }

    pub fn post(path: impl Into<String>) -> Result<Self, KeyError> {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Result<Self, KeyError> {
        Self::new(Method::Put, path)
    }

    pub fn patch(path: impl Into<String>) -> Result<Self, KeyError> {
        Self::new(Method::Patch, path)
    }

    pub fn delete(path: impl Into<String>) -> Result<Self, KeyError> {
        Self::new(Method::Delete, path)
    }

    /// Query-string parameters; must serialize to a JSON object.
    pub fn query(mut self, query: impl Serialize) -> Result<Self, KeyError> {
        let value = to_value("query", query)?;
        if !value.is_object() {
            return Err(KeyError::NotAnObject { field: "query" });
        }
        self.query = Some(value);
        Ok(self)
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    /// JSON request body.
    pub fn data(mut self, data: impl Serialize) -> Result<Self, KeyError> {
        self.data = Some(to_value("data", data)?);
        Ok(self)
    }

    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn into_request(self) -> Request {
        let mut request = Request::new(self.method, self.path);
        if let Some(query) = &self.query {
            request = request.query(query);
        }
        for (name, value) in self.headers.iter() {
            request = request.header(name, value);
        }
        if let Some(data) = &self.data {
            request = request.json(data);
        }
        if let Some(host) = self.host {
            request = request.host(host);
        }
        request
    }
}

/// Sends [`MutationRequest`]s through the same transport as queries.
#[derive(Clone)]
pub struct MutationExecutor {
    executor: QueryExecutor,
}

impl MutationExecutor {
    pub fn new(executor: QueryExecutor) -> Self {
        Self { executor }
    }

    /// Performs the write and returns the parsed response body.
    ///
    /// # Errors
    ///
    /// Same classification as queries: [`QueryError::Transport`] or
    /// [`QueryError::Response`].
    pub async fn mutate(&self, request: MutationRequest) -> Result<Value, QueryError> {
        self.mutate_with_meta(request)
            .await
            .map(|response| response.data)
    }

    /// Like [`mutate`](Self::mutate), keeping status text and headers.
    pub async fn mutate_with_meta(
        &self,
        request: MutationRequest,
    ) -> Result<ApiResponse, QueryError> {
        let method = request.method.clone();
        let path = request.path.clone();

        match self.executor.execute(request.into_request()).await {
            Ok(response) => {
                info!(method = %method, path = %path, status = response.meta.status().as_u16(), "mutation applied");
                Ok(response)
            }
            Err(err) => {
                warn!(method = %method, path = %path, error = %err, "mutation failed");
                Err(err)
            }
        }
    }
}

/// Observable state of a [`Mutation`].
#[derive(Debug, Clone, Default)]
pub enum MutationState {
    #[default]
    Idle,
    Loading,
    Success(Value),
    Error(QueryError),
}

impl MutationState {
    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Success(data) => Some(data),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&QueryError> {
        match self {
            Self::Error(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Tracks the lifecycle of one mutation call site.
///
/// UI code holds a receiver from [`watch`](Self::watch) and re-renders on
/// every change.
#[derive(Debug)]
pub struct Mutation {
    state: watch::Sender<MutationState>,
}

impl Mutation {
    pub fn new() -> Self {
        Self {
            state: watch::Sender::new(MutationState::Idle),
        }
    }

    pub fn state(&self) -> MutationState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<MutationState> {
        self.state.subscribe()
    }

    /// Back to [`MutationState::Idle`].
    pub fn reset(&self) {
        self.state.send_replace(MutationState::Idle);
    }

    /// Runs `request`, moving through `Loading` to `Success` or `Error`.
    pub async fn run(
        &self,
        executor: &MutationExecutor,
        request: MutationRequest,
    ) -> Result<Value, QueryError> {
        self.state.send_replace(MutationState::Loading);
        let result = executor.mutate(request).await;
        self.state.send_replace(match &result {
            Ok(data) => MutationState::Success(data.clone()),
            Err(err) => MutationState::Error(err.clone()),
        });
        result
    }
}

impl Default for Mutation {
    fn default() -> Self {
        Self::new()
    }
}
