//! Transport boundary and a minimal async HTTP/1.1 client using Tokio.
//!
//! The cache never talks to the network directly: it goes through the
//! [`Transport`] trait. [`HttpClient`] is the bundled implementation, one
//! `Connection: close` request per TCP connection. Any
//! `Fn(Request) -> impl Future<Output = Result<Response, TransportError>>`
//! closure is also a transport, which is how tests stub the API.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::http::response::ResponseError;
use crate::http::{Method, Request, Response};

mod config;

pub use config::ClientConfig;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 8 * 1024;

/// Failures that happen before a complete response is in hand.
///
/// Cheap to clone so one failure can be handed to every caller sharing a
/// coalesced request.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("failed to connect to {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    #[error("connect to {host} timed out")]
    ConnectTimeout { host: String },

    #[error("request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("malformed response: {0}")]
    Malformed(Arc<ResponseError>),

    #[error("response exceeds maximum allowed size of {max_bytes} bytes")]
    TooLarge { max_bytes: usize },

    #[error("failed to decode response body: {0}")]
    Decode(Arc<serde_json::Error>),

    #[error("request was cancelled")]
    Cancelled,
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<ResponseError> for TransportError {
    fn from(err: ResponseError) -> Self {
        Self::Malformed(Arc::new(err))
    }
}

/// Future returned by [`Transport::request`].
pub type TransportFuture = Pin<Box<dyn Future<Output = Result<Response, TransportError>> + Send>>;

/// Anything that can turn a [`Request`] into a [`Response`].
///
/// Non-2xx responses are *not* errors at this layer; the query executor
/// classifies them.
pub trait Transport: Send + Sync + 'static {
    fn request(&self, request: Request) -> TransportFuture;
}

impl<T, F> Transport for T
where
    T: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Result<Response, TransportError>> + Send + 'static,
{
    fn request(&self, request: Request) -> TransportFuture {
        Box::pin((self)(request))
    }
}

/// A from-scratch HTTP/1.1 client over plain TCP.
///
/// # Examples
///
/// ```rust,no_run
/// use rquery::client::{ClientConfig, HttpClient, Transport};
/// use rquery::http::{Method, Request};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = HttpClient::new(ClientConfig::new("127.0.0.1:8000"));
///     let response = client
///         .request(Request::new(Method::Get, "/api/0/projects/"))
///         .await?;
///     println!("{} {}", response.status(), response.body().len());
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    config: Arc<ClientConfig>,
}

impl HttpClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn send(config: Arc<ClientConfig>, mut request: Request) -> Result<Response, TransportError> {
        let host = normalize_host(request.host_override().unwrap_or(&config.host));
        request.headers_mut().merge_missing(&config.base_headers());

        let mut stream = connect(&host, &config).await?;

        debug!(
            host = %host,
            method = %request.method(),
            target = %request.target(),
            "sending request"
        );

        stream.write_all(&request.write_to(&host)).await?;
        stream.flush().await?;

        let response = read_response(&mut stream, request.method(), config.max_response_bytes).await?;

        debug!(
            host = %host,
            status = response.status().as_u16(),
            bytes = response.body().len(),
            "response received"
        );

        Ok(response)
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl Transport for HttpClient {
    fn request(&self, request: Request) -> TransportFuture {
        Box::pin(Self::send(Arc::clone(&self.config), request))
    }
}

async fn connect(host: &str, config: &ClientConfig) -> Result<TcpStream, TransportError> {
    let connecting = TcpStream::connect(host);
    let result = match config.connect_timeout_duration() {
        Some(limit) => tokio::time::timeout(limit, connecting)
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                host: host.to_owned(),
            })?,
        None => connecting.await,
    };

    result.map_err(|source| {
        warn!(host = %host, error = %source, "connect failed");
        TransportError::Connect {
            host: host.to_owned(),
            source: Arc::new(source),
        }
    })
}

/// Reads until a complete response has been buffered or the peer closes.
async fn read_response(
    stream: &mut TcpStream,
    method: &Method,
    max_bytes: usize,
) -> Result<Response, TransportError> {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let bytes_read = stream.read_buf(&mut buf).await?;
        let at_eof = bytes_read == 0;

        if buf.len() > max_bytes {
            warn!(max_bytes, "response too large, giving up");
            return Err(TransportError::TooLarge { max_bytes });
        }

        let parsed = if *method == Method::Head {
            Response::parse_head_only(&buf)
        } else {
            Response::parse_limited(&buf, at_eof, max_bytes)
        };

        match parsed {
            Ok(response) => return Ok(response),
            Err(ResponseError::BodyTooLarge { max_bytes }) => {
                warn!(max_bytes, "declared body too large, giving up");
                return Err(TransportError::TooLarge { max_bytes });
            }
            Err(ResponseError::Incomplete) if !at_eof => continue,
            Err(ResponseError::Incomplete) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before the response was complete",
                )
                .into());
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Strips an `http://` scheme and trailing path, and adds port 80 if none is given.
fn normalize_host(host: &str) -> String {
    let host = host.strip_prefix("http://").unwrap_or(host);
    let host = host.split('/').next().unwrap_or(host);
    let has_port = match host.rfind(']') {
        // [v6]:port
        Some(end) => host[end..].contains(':'),
        None => host.contains(':'),
    };
    if has_port {
        host.to_owned()
    } else {
        format!("{host}:80")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;
    use crate::http::StatusCode;

    /// Serves exactly one connection with a canned reply and returns the raw request.
    async fn serve_once(reply: &'static [u8]) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut received = Vec::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
                if n == 0 || received.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            socket.write_all(reply).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8(received).unwrap()
        });
        (addr, handle)
    }

    #[test]
    fn host_normalization() {
        assert_eq!(normalize_host("example.com"), "example.com:80");
        assert_eq!(normalize_host("http://example.com:8080/api"), "example.com:8080");
        assert_eq!(normalize_host("[::1]"), "[::1]:80");
        assert_eq!(normalize_host("[::1]:9000"), "[::1]:9000");
    }

    #[tokio::test]
    async fn round_trip_over_tcp() {
        let (addr, server) = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nLink: <http://x/?cursor=1>; rel=\"next\"; results=\"true\"; cursor=\"1\"\r\nContent-Length: 12\r\n\r\n[{\"id\":\"1\"}]",
        )
        .await;

        let client = HttpClient::new(ClientConfig::new(addr.clone()));
        let response = client
            .request(
                Request::new(Method::Get, "/organizations/acme/issues/")
                    .query(&json!({"limit": 1})),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(&response.body()[..], b"[{\"id\":\"1\"}]");
        assert!(response.headers().get("link").is_some());

        let raw = server.await.unwrap();
        assert!(raw.starts_with("GET /organizations/acme/issues/?limit=1 HTTP/1.1\r\n"));
        assert!(raw.contains(&format!("Host: {addr}\r\n")));
        assert!(raw.contains("Accept: application/json\r\n"));
        assert!(raw.contains("User-Agent: rquery/"));
    }

    #[tokio::test]
    async fn body_until_close_is_read_to_eof() {
        let (addr, server) = serve_once(b"HTTP/1.1 200 OK\r\n\r\n{\"ok\":true}").await;
        let client = HttpClient::new(ClientConfig::new(addr));
        let response = client
            .request(Request::new(Method::Get, "/health/"))
            .await
            .unwrap();
        assert_eq!(&response.body()[..], b"{\"ok\":true}");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_response_is_rejected() {
        let (addr, server) =
            serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 64\r\n\r\n0123456789012345678901234567890123456789").await;
        let client = HttpClient::new(ClientConfig::new(addr).max_response_bytes(32));
        let err = client
            .request(Request::new(Method::Get, "/big/"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::TooLarge { max_bytes: 32 }));
        let _ = server.await;
    }

    #[tokio::test]
    async fn connection_refused_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = HttpClient::new(ClientConfig::new(addr));
        let err = client
            .request(Request::new(Method::Get, "/"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }

    #[tokio::test]
    async fn closures_are_transports() {
        let transport = |request: Request| async move {
            assert_eq!(request.path(), "/ping/");
            Ok::<_, TransportError>(Response::json(StatusCode::OK, &json!("pong")))
        };
        let response = transport
            .request(Request::new(Method::Get, "/ping/"))
            .await
            .unwrap();
        assert_eq!(&response.body()[..], b"\"pong\"");
    }
}
