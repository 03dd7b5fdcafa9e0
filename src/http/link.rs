//! Cursor pagination carried in the `Link` response header.
//!
//! The API paginates list endpoints with a header of the form:
//!
//! ```text
//! <https://api.example.com/issues/?cursor=0:0:1>; rel="previous"; results="false"; cursor="0:0:1",
//! <https://api.example.com/issues/?cursor=0:100:0>; rel="next"; results="true"; cursor="0:100:0"
//! ```
//!
//! Each comma-separated entry is a `<href>` followed by `;`-separated
//! `key="value"` attributes. The `rel` attribute names the relation; `results`
//! and `cursor` describe the page on the other side of the link.

use std::collections::BTreeMap;

/// One relation parsed from a `Link` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLink {
    /// Absolute URL of the linked page.
    pub href: String,
    /// Whether the linked page has any results. Only the literal `"true"` counts.
    pub results: bool,
    /// Opaque cursor to pass back as the `cursor` query parameter.
    pub cursor: String,
}

/// All relations of a `Link` header, keyed by `rel`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageLinks {
    links: BTreeMap<String, PageLink>,
}

impl PageLinks {
    /// The `rel="previous"` link, if present.
    pub fn previous(&self) -> Option<&PageLink> {
        self.links.get("previous")
    }

    /// The `rel="next"` link, if present.
    pub fn next(&self) -> Option<&PageLink> {
        self.links.get("next")
    }

    /// Looks up an arbitrary relation.
    pub fn get(&self, rel: &str) -> Option<&PageLink> {
        self.links.get(rel)
    }

    /// `true` when the `next` relation exists and reports results.
    pub fn has_next_page(&self) -> bool {
        self.next().is_some_and(|link| link.results)
    }

    /// `true` when the `previous` relation exists and reports results.
    pub fn has_previous_page(&self) -> bool {
        self.previous().is_some_and(|link| link.results)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PageLink)> {
        self.links.iter().map(|(rel, link)| (rel.as_str(), link))
    }
}

/// Parses a `Link` header into its named relations.
///
/// Parsing is lenient: entries without an `<href>` or a `rel` attribute are
/// skipped, a missing `cursor` becomes an empty string and a missing
/// `results` counts as `false`. Later entries win when a `rel` repeats.
///
/// # Examples
///
/// ```
/// use rquery::http::parse_link_header;
///
/// let links = parse_link_header(
///     r#"<https://x/?cursor=0:0:1>; rel="previous"; results="false"; cursor="0:0:1", <https://x/?cursor=0:2:0>; rel="next"; results="true"; cursor="0:2:0""#,
/// );
/// assert!(!links.has_previous_page());
/// assert_eq!(links.next().unwrap().cursor, "0:2:0");
/// ```
pub fn parse_link_header(header: &str) -> PageLinks {
    let mut links = BTreeMap::new();

    for entry in split_entries(header) {
        if let Some((rel, link)) = parse_entry(entry) {
            links.insert(rel, link);
        }
    }

    PageLinks { links }
}

// Splits on commas that are not inside `<...>` or a quoted attribute value;
// cursors and hrefs may legitimately contain commas.
fn split_entries(header: &str) -> Vec<&str> {
    let mut entries = Vec::new();
    let mut in_angle = false;
    let mut in_quote = false;
    let mut start = 0;

    for (idx, ch) in header.char_indices() {
        match ch {
            '<' if !in_quote => in_angle = true,
            '>' if !in_quote => in_angle = false,
            '"' if !in_angle => in_quote = !in_quote,
            ',' if !in_angle && !in_quote => {
                entries.push(&header[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    entries.push(&header[start..]);

    entries
        .into_iter()
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .collect()
}

fn parse_entry(entry: &str) -> Option<(String, PageLink)> {
    let rest = entry.strip_prefix('<')?;
    let close = rest.find('>')?;
    let href = rest[..close].trim().to_owned();

    let mut rel = None;
    let mut results = false;
    let mut cursor = String::new();

    for attribute in rest[close + 1..].split(';') {
        let Some((name, value)) = attribute.split_once('=') else {
            continue;
        };
        let value = unquote(value.trim());
        match name.trim().to_ascii_lowercase().as_str() {
            "rel" => rel = Some(value.to_owned()),
            "results" => results = value == "true",
            "cursor" => cursor = value.to_owned(),
            _ => {}
        }
    }

    let rel = rel.filter(|rel| !rel.is_empty())?;
    Some((
        rel,
        PageLink {
            href,
            results,
            cursor,
        },
    ))
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = concat!(
        r#"<https://sentry.example/api/0/organizations/acme/issues/?cursor=1700000000000:0:1>; "#,
        r#"rel="previous"; results="false"; cursor="1700000000000:0:1", "#,
        r#"<https://sentry.example/api/0/organizations/acme/issues/?cursor=1700000000000:100:0>; "#,
        r#"rel="next"; results="true"; cursor="1700000000000:100:0""#,
    );

    #[test]
    fn parses_previous_and_next() {
        let links = parse_link_header(HEADER);
        assert_eq!(links.len(), 2);

        let prev = links.previous().unwrap();
        assert!(!prev.results);
        assert_eq!(prev.cursor, "1700000000000:0:1");

        let next = links.next().unwrap();
        assert!(next.results);
        assert_eq!(next.cursor, "1700000000000:100:0");
        assert!(next.href.ends_with("cursor=1700000000000:100:0"));
        assert!(links.has_next_page());
        assert!(!links.has_previous_page());
    }

    #[test]
    fn empty_header_has_no_links() {
        assert!(parse_link_header("").is_empty());
        assert!(parse_link_header("   ").is_empty());
    }

    #[test]
    fn commas_inside_href_do_not_split() {
        let links = parse_link_header(
            r#"<https://x/?project=1,2&cursor=a>; rel="next"; results="true"; cursor="a""#,
        );
        assert_eq!(links.next().unwrap().href, "https://x/?project=1,2&cursor=a");
    }

    #[test]
    fn entries_without_rel_are_skipped() {
        let links = parse_link_header(r#"<https://x/>; results="true", <https://y/>; rel="next""#);
        assert_eq!(links.len(), 1);
        let next = links.next().unwrap();
        assert_eq!(next.href, "https://y/");
        assert!(!next.results);
        assert_eq!(next.cursor, "");
    }

    #[test]
    fn results_only_true_for_literal_true() {
        let links = parse_link_header(r#"<https://x/>; rel="next"; results="yes"; cursor="c""#);
        assert!(!links.next().unwrap().results);
    }
}
