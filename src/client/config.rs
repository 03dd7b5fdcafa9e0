//! Transport configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::http::Headers;

const DEFAULT_HOST: &str = "127.0.0.1:80";
const DEFAULT_MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Settings for [`HttpClient`](super::HttpClient).
///
/// Deserializable so host applications can embed it in their own config
/// files; durations are given in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Default `host[:port]` for requests without a host override.
    pub host: String,
    /// Value of the `User-Agent` header.
    pub user_agent: String,
    /// Headers sent with every request unless the request sets them itself.
    pub default_headers: Vec<(String, String)>,
    /// Responses larger than this are rejected.
    pub max_response_bytes: usize,
    /// Connect timeout (ms). `0` disables it.
    pub connect_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            user_agent: concat!("rquery/", env!("CARGO_PKG_VERSION")).to_owned(),
            default_headers: vec![("Accept".to_owned(), "application/json".to_owned())],
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl ClientConfig {
    /// Default configuration pointed at `host`.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    #[must_use]
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn max_response_bytes(mut self, max: usize) -> Self {
        self.max_response_bytes = max;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// The connect timeout, or `None` when disabled.
    pub fn connect_timeout_duration(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }

    /// Default headers plus `User-Agent`, as a header map.
    pub fn base_headers(&self) -> Headers {
        let mut headers: Headers = self.default_headers.iter().cloned().collect();
        if !self.user_agent.is_empty() && !headers.contains("user-agent") {
            headers.insert("User-Agent", self.user_agent.clone());
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = ClientConfig::default();
        assert_eq!(config.host, "127.0.0.1:80");
        assert_eq!(config.max_response_bytes, 16 * 1024 * 1024);
        assert_eq!(
            config.connect_timeout_duration(),
            Some(Duration::from_secs(10))
        );
        assert!(config.user_agent.starts_with("rquery/"));
    }

    #[test]
    fn zero_timeout_disables() {
        let config = ClientConfig::default().connect_timeout(Duration::ZERO);
        assert_eq!(config.connect_timeout_duration(), None);
    }

    #[test]
    fn base_headers_include_user_agent() {
        let headers = ClientConfig::new("api.local:8000")
            .default_header("X-Client", "demo")
            .base_headers();
        assert_eq!(headers.get("accept"), Some("application/json"));
        assert_eq!(headers.get("x-client"), Some("demo"));
        assert!(headers.get("user-agent").is_some());
    }

    #[test]
    fn deserializes_partial_config() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"host": "sentry.local:9000", "connect_timeout_ms": 250}"#)
                .unwrap();
        assert_eq!(config.host, "sentry.local:9000");
        assert_eq!(config.connect_timeout_ms, 250);
        assert_eq!(config.max_response_bytes, DEFAULT_MAX_RESPONSE_BYTES);
    }
}
