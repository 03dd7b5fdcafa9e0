//! Case-insensitive header list shared by outgoing requests and parsed responses.
//!
//! Names compare case-insensitively and entries keep arrival order (RFC 9110 §5).
//! Response headers are what [`ResponseMeta::get_response_header`] reads, so
//! pagination (`Link`) and rate-limit headers survive caching untouched.
//!
//! [`ResponseMeta::get_response_header`]: crate::query::ResponseMeta::get_response_header

use std::fmt;

/// Header fields of one request or response, in wire order.
///
/// A name may repeat (several `Link` lines, for instance). Lookups ignore
/// ASCII case.
///
/// # Examples
///
/// ```
/// use rquery::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Link", "<https://example.com/?cursor=1>; rel=\"next\"");
/// headers.insert("X-Hits", "1");
/// headers.set("x-hits", "2");
///
/// assert!(headers.get("link").is_some());
/// assert_eq!(headers.get("X-HITS"), Some("2"));
/// assert_eq!(headers.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sized for a parsed response head.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    /// Adds a field after the existing ones, keeping earlier values of `name`.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// Leaves `name` with the single `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.fields.push((name, value.into()));
    }

    /// First value sent for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Every value sent for `name`, in wire order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Drops every field called `name`; `false` if there was none.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.fields.len();
        self.fields.retain(|(field, _)| !field.eq_ignore_ascii_case(name));
        self.fields.len() < before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Layers client-wide defaults under per-request headers: fields of
    /// `defaults` are copied only when their name is absent here.
    pub fn merge_missing(&mut self, defaults: &Headers) {
        for (name, value) in defaults.iter() {
            if !self.contains(name) {
                self.insert(name, value);
            }
        }
    }

    /// Number of fields, counting repeated names separately.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// Request-head form: one `Name: value\r\n` line per field.
impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.fields {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_case() {
        let h: Headers = [("Content-Type", "application/json")].into_iter().collect();
        assert_eq!(h.get("content-type"), Some("application/json"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("application/json"));
        assert!(h.contains("Content-type"));
        assert_eq!(h.get("accept"), None);
    }

    #[test]
    fn repeated_link_fields_keep_order() {
        let h: Headers = [
            ("Link", "<https://example.com/?cursor=0:0:1>; rel=\"previous\""),
            ("link", "<https://example.com/?cursor=0:2:0>; rel=\"next\""),
        ]
        .into_iter()
        .collect();
        let links: Vec<_> = h.get_all("LINK").collect();
        assert_eq!(links.len(), 2);
        assert!(links[1].ends_with("rel=\"next\""));
        assert_eq!(h.get("link"), Some(links[0]));
    }

    #[test]
    fn set_replaces_all_values() {
        let mut h = Headers::new();
        h.insert("Accept", "text/html");
        h.insert("accept", "text/plain");
        h.set("ACCEPT", "application/json");
        let vals: Vec<_> = h.get_all("accept").collect();
        assert_eq!(vals, vec!["application/json"]);
    }

    #[test]
    fn merge_missing_keeps_existing() {
        let mut request: Headers = [("Accept", "text/csv")].into_iter().collect();
        let defaults: Headers = [("Accept", "application/json"), ("User-Agent", "rquery")]
            .into_iter()
            .collect();
        request.merge_missing(&defaults);
        assert_eq!(request.get("accept"), Some("text/csv"));
        assert_eq!(request.get("user-agent"), Some("rquery"));
    }

    #[test]
    fn remove_reports_whether_anything_went() {
        let mut h: Headers = [("X-Hits", "1"), ("x-hits", "2")].into_iter().collect();
        assert!(h.remove("X-HITS"));
        assert!(h.is_empty());
        assert!(!h.remove("x-hits"));
    }

    #[test]
    fn request_head_lines() {
        let h: Headers = [("Host", "localhost"), ("Accept", "application/json")]
            .into_iter()
            .collect();
        assert_eq!(h.to_string(), "Host: localhost\r\nAccept: application/json\r\n");
    }
}
