//! HTTP/1.1 response parsing using the [`httparse`] crate.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use super::{Headers, StatusCode};

/// Errors that can occur while parsing an HTTP/1.1 response.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("response is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length header: {value}")]
    InvalidContentLength { value: String },

    #[error("invalid chunked transfer encoding")]
    InvalidChunk,

    #[error("body exceeds maximum allowed size of {max_bytes} bytes")]
    BodyTooLarge { max_bytes: usize },

    #[error("connection closed before the body was complete ({received} of {expected} bytes)")]
    Truncated { received: usize, expected: usize },
}

/// How the body of a response is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Empty,
    Length(usize),
    Chunked,
    UntilClose,
}

/// A fully received HTTP/1.1 response.
///
/// Created by [`Response::parse`] from the bytes read off a connection. The
/// body is stored as a [`Bytes`] buffer with any chunked framing removed.
///
/// # Examples
///
/// ```
/// use rquery::http::Response;
///
/// let raw = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n[]";
/// let response = Response::parse(raw, false).unwrap();
///
/// assert_eq!(response.status().as_u16(), 200);
/// assert_eq!(response.status_text(), "OK");
/// assert_eq!(response.headers().get("content-type"), Some("application/json"));
/// assert_eq!(&response.body()[..], b"[]");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    status: StatusCode,
    status_text: String,
    headers: Headers,
    body: Bytes,
}

impl Response {
    /// Maximum number of headers we accept per response.
    const MAX_HEADERS: usize = 96;

    /// Builds a response directly, e.g. from a test double transport.
    pub fn new(status: StatusCode, headers: Headers, body: impl Into<Bytes>) -> Self {
        let status_text = status.canonical_reason().unwrap_or_default().to_owned();
        Self {
            status,
            status_text,
            headers,
            body: body.into(),
        }
    }

    /// Builds a JSON response with `Content-Type: application/json`.
    pub fn json(status: StatusCode, body: &serde_json::Value) -> Self {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "application/json");
        Self::new(status, headers, body.to_string())
    }

    /// Overrides the reason phrase.
    #[must_use]
    pub fn with_status_text(mut self, status_text: impl Into<String>) -> Self {
        self.status_text = status_text.into();
        self
    }

    /// Appends a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Parses a complete response from `buf`.
    ///
    /// `at_eof` tells the parser the peer has closed the connection, which is
    /// what terminates bodies that carry neither `Content-Length` nor chunked
    /// framing.
    ///
    /// # Errors
    ///
    /// - [`ResponseError::Incomplete`]: more data is needed.
    /// - [`ResponseError::Parse`]: the status line or headers are malformed.
    /// - [`ResponseError::Truncated`]: the peer closed before the declared length.
    /// - [`ResponseError::InvalidChunk`]: chunked framing is malformed.
    pub fn parse(buf: &[u8], at_eof: bool) -> Result<Self, ResponseError> {
        Self::parse_limited(buf, at_eof, usize::MAX)
    }

    /// [`parse`](Self::parse) that fails with [`ResponseError::BodyTooLarge`]
    /// as soon as the declared body size passes `max_body`, without waiting
    /// for the bytes to arrive.
    pub fn parse_limited(buf: &[u8], at_eof: bool, max_body: usize) -> Result<Self, ResponseError> {
        let (mut response, body_offset, framing) = Self::parse_head(buf)?;
        let rest = &buf[body_offset..];

        response.body = match framing {
            Framing::Empty => Bytes::new(),
            Framing::Length(expected) if expected > max_body => {
                return Err(ResponseError::BodyTooLarge { max_bytes: max_body });
            }
            Framing::Length(expected) if rest.len() >= expected => {
                Bytes::copy_from_slice(&rest[..expected])
            }
            Framing::Length(expected) if at_eof => {
                return Err(ResponseError::Truncated {
                    received: rest.len(),
                    expected,
                });
            }
            Framing::Length(_) => return Err(ResponseError::Incomplete),
            Framing::Chunked => decode_chunked(rest, max_body)?,
            Framing::UntilClose if at_eof => Bytes::copy_from_slice(rest),
            Framing::UntilClose => return Err(ResponseError::Incomplete),
        };

        Ok(response)
    }

    /// Parses only the status line and headers, ignoring any body.
    ///
    /// Used for `HEAD` requests, whose responses advertise a length they never send.
    pub fn parse_head_only(buf: &[u8]) -> Result<Self, ResponseError> {
        Self::parse_head(buf).map(|(response, _, _)| response)
    }

    fn parse_head(buf: &[u8]) -> Result<(Self, usize, Framing), ResponseError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw = httparse::Response::new(&mut headers);

        let body_offset = match raw.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(ResponseError::Incomplete),
        };

        let status = StatusCode::from_u16(
            raw.code
                .ok_or(ResponseError::MissingField { field: "status" })?,
        );
        let status_text = match raw.reason {
            Some(reason) if !reason.is_empty() => reason.to_owned(),
            _ => status.canonical_reason().unwrap_or_default().to_owned(),
        };

        let mut header_map = Headers::with_capacity(raw.headers.len());
        for header in raw.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let framing = framing_for(status, &header_map)?;

        Ok((
            Self {
                status,
                status_text,
                headers: header_map,
                body: Bytes::new(),
            },
            body_offset,
            framing,
        ))
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the reason phrase sent by the server (or the canonical one).
    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Splits the response into its parts.
    pub fn into_parts(self) -> (StatusCode, String, Headers, Bytes) {
        (self.status, self.status_text, self.headers, self.body)
    }
}

fn framing_for(status: StatusCode, headers: &Headers) -> Result<Framing, ResponseError> {
    let code = status.as_u16();
    if (100..200).contains(&code) || code == 204 || code == 304 {
        return Ok(Framing::Empty);
    }

    if headers
        .get("transfer-encoding")
        .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"))
    {
        return Ok(Framing::Chunked);
    }

    match headers.get("content-length") {
        Some(value) => value
            .trim()
            .parse()
            .map(Framing::Length)
            .map_err(|_| ResponseError::InvalidContentLength {
                value: value.to_owned(),
            }),
        None => Ok(Framing::UntilClose),
    }
}

/// Removes chunked transfer framing, returning `Incomplete` until the
/// terminating zero-length chunk (and trailer section) has arrived.
fn decode_chunked(mut buf: &[u8], max_body: usize) -> Result<Bytes, ResponseError> {
    let mut body = BytesMut::new();

    loop {
        let (consumed, size) = match httparse::parse_chunk_size(buf) {
            Ok(httparse::Status::Complete(pair)) => pair,
            Ok(httparse::Status::Partial) => return Err(ResponseError::Incomplete),
            Err(_) => return Err(ResponseError::InvalidChunk),
        };
        buf = &buf[consumed..];

        if size == 0 {
            // Optional trailers, then an empty line.
            if buf.starts_with(b"\r\n") {
                return Ok(body.freeze());
            }
            return match buf.windows(4).position(|w| w == b"\r\n\r\n") {
                Some(_) => Ok(body.freeze()),
                None => Err(ResponseError::Incomplete),
            };
        }

        let size = usize::try_from(size).map_err(|_| ResponseError::InvalidChunk)?;
        let end = size.checked_add(2).ok_or(ResponseError::InvalidChunk)?;
        if body.len().saturating_add(size) > max_body {
            return Err(ResponseError::BodyTooLarge { max_bytes: max_body });
        }
        if buf.len() < end {
            return Err(ResponseError::Incomplete);
        }
        if &buf[size..end] != b"\r\n" {
            return Err(ResponseError::InvalidChunk);
        }
        body.extend_from_slice(&buf[..size]);
        buf = &buf[end..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_content_length_body() {
        let raw = b"HTTP/1.1 201 Created\r\nContent-Length: 10\r\n\r\n{\"id\":\"1\"}";
        let r = Response::parse(raw, false).unwrap();
        assert_eq!(r.status(), StatusCode::CREATED);
        assert_eq!(r.status_text(), "Created");
        assert_eq!(&r.body()[..], b"{\"id\":\"1\"}");
    }

    #[test]
    fn incomplete_headers() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Le";
        assert!(matches!(
            Response::parse(raw, false),
            Err(ResponseError::Incomplete)
        ));
    }

    #[test]
    fn incomplete_body_then_truncated_at_eof() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc";
        assert!(matches!(
            Response::parse(raw, false),
            Err(ResponseError::Incomplete)
        ));
        assert!(matches!(
            Response::parse(raw, true),
            Err(ResponseError::Truncated {
                received: 3,
                expected: 10
            })
        ));
    }

    #[test]
    fn chunked_body() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\n[{\"i\r\n6\r\nd\":1}]\r\n0\r\n\r\n";
        let r = Response::parse(raw, false).unwrap();
        assert_eq!(&r.body()[..], b"[{\"id\":1}]");
    }

    #[test]
    fn huge_chunk_size_is_invalid() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nab";
        assert!(matches!(
            Response::parse(raw, false),
            Err(ResponseError::InvalidChunk)
        ));
    }

    #[test]
    fn oversized_chunk_is_rejected_before_it_arrives() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\n[1,2\r\n100000\r\n";
        assert!(matches!(
            Response::parse_limited(raw, false, 1024),
            Err(ResponseError::BodyTooLarge { max_bytes: 1024 })
        ));
        assert!(matches!(
            Response::parse(raw, false),
            Err(ResponseError::Incomplete)
        ));
    }

    #[test]
    fn declared_length_over_limit_is_rejected() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 4096\r\n\r\n[]";
        assert!(matches!(
            Response::parse_limited(raw, false, 1024),
            Err(ResponseError::BodyTooLarge { max_bytes: 1024 })
        ));
    }

    #[test]
    fn chunked_waits_for_terminator() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\n[]\r\n";
        assert!(matches!(
            Response::parse(raw, false),
            Err(ResponseError::Incomplete)
        ));
    }

    #[test]
    fn body_until_close() {
        let raw = b"HTTP/1.1 200 OK\r\n\r\nnull";
        assert!(matches!(
            Response::parse(raw, false),
            Err(ResponseError::Incomplete)
        ));
        assert_eq!(&Response::parse(raw, true).unwrap().body()[..], b"null");
    }

    #[test]
    fn no_content_has_empty_body() {
        let raw = b"HTTP/1.1 204 No Content\r\n\r\n";
        let r = Response::parse(raw, false).unwrap();
        assert!(r.body().is_empty());
    }

    #[test]
    fn missing_reason_falls_back_to_canonical() {
        let raw = b"HTTP/1.1 404 \r\nContent-Length: 0\r\n\r\n";
        let r = Response::parse(raw, false).unwrap();
        assert_eq!(r.status_text(), "Not Found");
    }

    #[test]
    fn head_only_ignores_declared_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 512\r\n\r\n";
        let r = Response::parse_head_only(raw).unwrap();
        assert!(r.body().is_empty());
    }
}
