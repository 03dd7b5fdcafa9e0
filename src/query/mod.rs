//! Query execution: turning a [`QueryKey`] into a network call.
//!
//! [`QueryExecutor`] is the adapter between the cache and a [`Transport`]:
//! it builds the request from the key's options, awaits the transport and
//! classifies the outcome. Successful calls yield an [`ApiResponse`], the
//! `(data, status text, response meta)` triple; the meta keeps response
//! headers reachable so pagination cursors survive caching.
//!
//! The cache only depends on the [`Fetcher`] trait, so any async closure
//! taking a `&QueryKey` can stand in for the executor.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::client::{Transport, TransportError};
use crate::http::{Headers, PageLinks, Request, Response, StatusCode, parse_link_header};
use crate::key::{KeyError, QueryKey};

/// Every way a query or mutation can fail.
///
/// Cloned out to every caller that shared a coalesced request.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// The request never produced a usable response: network failure,
    /// timeout, undecodable body or cancellation.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The server answered with a non-2xx status.
    #[error("request failed with {status}: {status_text}")]
    Response {
        status: StatusCode,
        status_text: String,
        /// The error body, parsed as JSON when possible, otherwise the raw text.
        body: Value,
        meta: ResponseMeta,
    },

    /// The key or request was invalid; raised before any I/O.
    #[error("invalid request: {0}")]
    Config(#[from] KeyError),

    #[error("query cache has been disposed")]
    Disposed,
}

impl QueryError {
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Self::Response { .. })
    }

    /// `true` when the request was aborted because nobody was listening any more.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Cancelled))
    }

    /// The HTTP status of a non-2xx response.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Response { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Status and headers of a response, kept next to the cached data.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMeta {
    status: StatusCode,
    status_text: String,
    headers: Headers,
}

impl ResponseMeta {
    pub fn new(status: StatusCode, status_text: impl Into<String>, headers: Headers) -> Self {
        Self {
            status,
            status_text: status_text.into(),
            headers,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Case-insensitive lookup of a response header, exactly as sent.
    pub fn get_response_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Pagination links from the `Link` header (empty when absent).
    pub fn links(&self) -> PageLinks {
        self.get_response_header("link")
            .map(parse_link_header)
            .unwrap_or_default()
    }
}

/// A successful response: parsed body, status text and meta.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub data: Value,
    pub status_text: String,
    pub meta: ResponseMeta,
}

impl ApiResponse {
    pub fn new(data: Value, meta: ResponseMeta) -> Self {
        Self {
            data,
            status_text: meta.status_text.clone(),
            meta,
        }
    }

    /// The `(data, status text, meta)` triple.
    pub fn into_parts(self) -> (Value, String, ResponseMeta) {
        (self.data, self.status_text, self.meta)
    }

    /// Deserializes the body into a typed view.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}

/// Future returned by [`Fetcher::fetch`].
pub type FetchFuture = Pin<Box<dyn Future<Output = Result<ApiResponse, QueryError>> + Send>>;

/// Produces the response for a key. Implemented by [`QueryExecutor`] and by
/// any `Fn(&QueryKey) -> impl Future<Output = Result<ApiResponse, QueryError>>`.
pub trait Fetcher: Send + Sync + 'static {
    fn fetch(&self, key: &QueryKey) -> FetchFuture;
}

impl<T, F> Fetcher for T
where
    T: Fn(&QueryKey) -> F + Send + Sync + 'static,
    F: Future<Output = Result<ApiResponse, QueryError>> + Send + 'static,
{
    fn fetch(&self, key: &QueryKey) -> FetchFuture {
        Box::pin((self)(key))
    }
}

/// Adapter that performs the HTTP call for a [`QueryKey`].
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rquery::client::{ClientConfig, HttpClient};
/// use rquery::key::QueryKey;
/// use rquery::query::{Fetcher, QueryExecutor};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let executor = QueryExecutor::new(Arc::new(HttpClient::new(ClientConfig::new("127.0.0.1:8000"))));
/// let key = QueryKey::new("/organizations/acme/projects/")?;
/// let (data, status_text, meta) = executor.fetch(&key).await?.into_parts();
/// println!("{status_text}: {data} next={:?}", meta.links().next());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct QueryExecutor {
    transport: Arc<dyn Transport>,
    timeout: Option<Duration>,
}

impl QueryExecutor {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            timeout: None,
        }
    }

    /// Fails requests that take longer than `timeout` with
    /// [`TransportError::Timeout`].
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Builds the transport request described by `key`.
    pub fn build_request(key: &QueryKey) -> Request {
        let options = key.options();
        let method = options.effective_method();
        let mut request = Request::new(method, key.path());

        if let Some(query) = options.query_params() {
            request = request.query(query);
        }
        if let Some(Value::Object(headers)) = options.header_values() {
            for (name, value) in headers {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                request = request.header(name.clone(), value);
            }
        }
        if let Some(data) = options.body() {
            request = request.json(data);
        }
        if let Some(host) = options.host_override() {
            request = request.host(host);
        }
        request
    }

    /// Sends `request` and classifies the response.
    ///
    /// # Errors
    ///
    /// [`QueryError::Transport`] for network, timeout and decode failures;
    /// [`QueryError::Response`] for non-2xx statuses.
    pub async fn execute(&self, request: Request) -> Result<ApiResponse, QueryError> {
        let method = request.method().clone();
        let target = request.target();

        let sending = self.transport.request(request);
        let response = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, sending).await.map_err(|_| {
                TransportError::Timeout {
                    timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                }
            })??,
            None => sending.await?,
        };

        debug!(
            method = %method,
            target = %target,
            status = response.status().as_u16(),
            "query executed"
        );

        classify(response)
    }
}

impl Fetcher for QueryExecutor {
    fn fetch(&self, key: &QueryKey) -> FetchFuture {
        let executor = self.clone();
        let request = Self::build_request(key);
        Box::pin(async move { executor.execute(request).await })
    }
}

fn classify(response: Response) -> Result<ApiResponse, QueryError> {
    let (status, status_text, headers, body) = response.into_parts();
    let meta = ResponseMeta::new(status, status_text.clone(), headers);

    if !status.is_success() {
        let body = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()))
        };
        return Err(QueryError::Response {
            status,
            status_text,
            body,
            meta,
        });
    }

    let data = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(&body).map_err(|err| TransportError::Decode(Arc::new(err)))?
    };

    Ok(ApiResponse::new(data, meta))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::http::Method;
    use crate::key::QueryOptions;

    fn canned(response: Response) -> (Arc<dyn Transport>, Arc<Mutex<Vec<Request>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let transport = move |request: Request| {
            log.lock().unwrap().push(request);
            let response = response.clone();
            async move { Ok::<_, TransportError>(response) }
        };
        (Arc::new(transport), seen)
    }

    #[tokio::test]
    async fn success_yields_triple() {
        let response = Response::json(StatusCode::OK, &json!([{"id": "1"}, {"id": "2"}]))
            .with_header("Link", r#"<http://x/?cursor=0:2:0>; rel="next"; results="true"; cursor="0:2:0""#);
        let (transport, _) = canned(response);
        let executor = QueryExecutor::new(transport);

        let key = QueryKey::new("/organizations/acme/issues/").unwrap();
        let (data, status_text, meta) = executor.fetch(&key).await.unwrap().into_parts();

        assert_eq!(data, json!([{"id": "1"}, {"id": "2"}]));
        assert_eq!(status_text, "OK");
        assert_eq!(meta.links().next().unwrap().cursor, "0:2:0");
    }

    #[tokio::test]
    async fn request_is_built_from_key_options() {
        let (transport, seen) = canned(Response::json(StatusCode::OK, &json!({})));
        let executor = QueryExecutor::new(transport);

        let options = QueryOptions::new()
            .method(Method::Post)
            .query(json!({"limit": 2}))
            .unwrap()
            .header("X-Org", "acme")
            .data(json!({"name": "web"}))
            .unwrap()
            .host("eu.sentry.local:9000");
        let key = QueryKey::with_options("/projects/", options).unwrap();
        executor.fetch(&key).await.unwrap();

        let seen = seen.lock().unwrap();
        let request = &seen[0];
        assert_eq!(request.method(), &Method::Post);
        assert_eq!(request.target(), "/projects/?limit=2");
        assert_eq!(request.headers().get("x-org"), Some("acme"));
        assert_eq!(&request.body()[..], br#"{"name":"web"}"#);
        assert_eq!(request.host_override(), Some("eu.sentry.local:9000"));
    }

    #[tokio::test]
    async fn non_2xx_is_a_response_error() {
        let response = Response::json(StatusCode::NOT_FOUND, &json!({"detail": "Not found"}));
        let (transport, _) = canned(response);
        let executor = QueryExecutor::new(transport);

        let err = executor
            .fetch(&QueryKey::new("/missing/").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_response());
        assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
        match err {
            QueryError::Response { body, .. } => assert_eq!(body, json!({"detail": "Not found"})),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_json_error_body_is_kept_as_text() {
        let response = Response::new(StatusCode::BAD_GATEWAY, Headers::new(), "upstream down");
        let (transport, _) = canned(response);
        let err = QueryExecutor::new(transport)
            .fetch(&QueryKey::new("/x/").unwrap())
            .await
            .unwrap_err();
        match err {
            QueryError::Response { body, .. } => assert_eq!(body, json!("upstream down")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn undecodable_success_is_a_transport_error() {
        let response = Response::new(StatusCode::OK, Headers::new(), "<html>");
        let (transport, _) = canned(response);
        let err = QueryExecutor::new(transport)
            .fetch(&QueryKey::new("/x/").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueryError::Transport(TransportError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn empty_success_body_is_null() {
        let response = Response::new(StatusCode::NO_CONTENT, Headers::new(), "");
        let (transport, _) = canned(response);
        let api = QueryExecutor::new(transport)
            .fetch(&QueryKey::new("/x/").unwrap())
            .await
            .unwrap();
        assert_eq!(api.data, Value::Null);
        assert_eq!(api.status_text, "No Content");
    }

    #[tokio::test]
    async fn transport_failures_pass_through() {
        let transport: Arc<dyn Transport> =
            Arc::new(|_request: Request| async { Err::<Response, _>(TransportError::Cancelled) });
        let err = QueryExecutor::new(transport)
            .fetch(&QueryKey::new("/x/").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert!(err.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_wrapper() {
        let transport: Arc<dyn Transport> = Arc::new(|_request: Request| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, TransportError>(Response::json(StatusCode::OK, &json!(null)))
        });
        let err = QueryExecutor::new(transport)
            .with_timeout(Duration::from_millis(500))
            .fetch(&QueryKey::new("/slow/").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueryError::Transport(TransportError::Timeout { timeout_ms: 500 })
        ));
    }

    #[test]
    fn typed_view() {
        #[derive(Deserialize)]
        struct Issue {
            id: String,
        }
        let api = ApiResponse::new(
            json!([{"id": "7"}]),
            ResponseMeta::new(StatusCode::OK, "OK", Headers::new()),
        );
        let issues: Vec<Issue> = api.data_as().unwrap();
        assert_eq!(issues[0].id, "7");
    }
}
