//! Outgoing HTTP/1.1 requests.
//!
//! A [`Request`] is what the query and mutation layers hand to a
//! [`Transport`](crate::client::Transport). It is built with a fluent API and
//! serialized to wire bytes by [`Request::write_to`].

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;

use super::{Headers, Method};

/// An HTTP request, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use rquery::http::{Method, Request};
/// use serde_json::json;
///
/// let request = Request::new(Method::Get, "/organizations/acme/issues/")
///     .query(&json!({"limit": 2, "project": [1, 2]}))
///     .header("Accept", "application/json");
///
/// assert_eq!(request.target(), "/organizations/acme/issues/?limit=2&project=1&project=2");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    method: Method,
    path: String,
    query: Option<String>,
    headers: Headers,
    body: Bytes,
    host: Option<String>,
}

impl Request {
    /// Creates a bodiless request for `path`.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: Headers::new(),
            body: Bytes::new(),
            host: None,
        }
    }

    /// Sets the query string from a JSON object.
    ///
    /// Object keys are emitted in sorted order; arrays repeat the key once per
    /// element, `null` members are skipped and nested objects are sent as
    /// compact JSON. Anything other than an object is ignored.
    #[must_use]
    pub fn query(mut self, query: &Value) -> Self {
        let encoded = encode_query(query);
        self.query = (!encoded.is_empty()).then_some(encoded);
        self
    }

    /// Appends a request header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets a JSON body and the matching `Content-Type`.
    #[must_use]
    pub fn json(mut self, body: &Value) -> Self {
        self.body = Bytes::from(body.to_string());
        self.headers.set("Content-Type", "application/json");
        self
    }

    /// Sets a raw body without touching `Content-Type`.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Targets a host other than the transport's default (`host[:port]`).
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

    /// Returns the encoded query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Mutable access for transports that layer in default headers.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the per-request host override, if any.
    pub fn host_override(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Returns the request target: path plus encoded query string.
    pub fn target(&self) -> String {
        match &self.query {
            Some(query) if self.path.contains('?') => format!("{}&{query}", self.path),
            Some(query) => format!("{}?{query}", self.path),
            None => self.path.clone(),
        }
    }

    /// Serializes the request using HTTP/1.1 wire format.
    ///
    /// Automatically adds:
    /// - `Host: <host>` unless already present.
    /// - `Content-Length: <n>` when the body is non-empty or the method carries one.
    /// - `Connection: close`; the transport opens one connection per request.
    pub fn write_to(&self, host: &str) -> BytesMut {
        let estimated_size = 128 + self.headers.len() * 64 + self.body.len();
        let mut buf = BytesMut::with_capacity(estimated_size);

        // Request line
        buf.put(format!("{} {} HTTP/1.1\r\n", self.method, self.target()).as_bytes());

        if !self.headers.contains("host") {
            buf.put(format!("Host: {host}\r\n").as_bytes());
        }

        for (name, value) in self.headers.iter() {
            if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("connection")
            {
                continue;
            }
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        if !self.body.is_empty() || self.method.allows_body() {
            buf.put(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        buf.put(&b"Connection: close\r\n\r\n"[..]);

        if !self.body.is_empty() {
            buf.put(self.body.as_ref());
        }

        buf
    }
}

/// Encodes a JSON object as an `application/x-www-form-urlencoded` query string.
pub fn encode_query(query: &Value) -> String {
    let Value::Object(map) = query else {
        return String::new();
    };

    let mut pairs: Vec<_> = map.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in pairs {
        match value {
            Value::Null => {}
            Value::Array(items) => {
                for item in items {
                    serializer.append_pair(key, &scalar_to_string(item));
                }
            }
            other => {
                serializer.append_pair(key, &scalar_to_string(other));
            }
        }
    }
    serializer.finish()
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        nested => nested.to_string(),
    }
}
