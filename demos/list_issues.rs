//! Walks through the query cache against a tiny in-process issues API.
//!
//! Run with `cargo run --example list_issues`; set `RUST_LOG=rquery=debug`
//! to watch cache hits, coalescing and refetches.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use futures::future::join_all;
use rquery::{
    ApiClient, CacheConfig, ClientConfig, EnsureOptions, KeyPattern, Mutation, MutationRequest,
    QueryKey, QueryOptions,
};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const ISSUES_PATH: &str = "/organizations/acme/issues/";
const PAGE_SIZE: usize = 2;

type Issues = Arc<Mutex<Vec<Value>>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("list_issues=info,rquery=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let issues: Issues = Arc::new(Mutex::new(
        (1..=5)
            .map(|id| json!({"id": id.to_string(), "title": format!("Issue {id}"), "status": "unresolved"}))
            .collect(),
    ));
    let addr = serve(Arc::clone(&issues)).await?;

    let api = ApiClient::new(
        ClientConfig::new(addr.to_string()),
        CacheConfig::default().default_stale_time(Duration::from_secs(30)),
    );

    // Concurrent readers of the same page share one request.
    let first_page = QueryKey::with_options(
        ISSUES_PATH,
        QueryOptions::new().query(json!({"limit": PAGE_SIZE}))?,
    )?;
    let results = join_all((0..3).map(|_| api.query(&first_page, EnsureOptions::default()))).await;
    for result in results {
        let snap = result?;
        info!(version = snap.version, data = %snap.data.clone().unwrap_or_default(), "page 1");
    }

    // Follow the Link header to the next page.
    let mut key = first_page.clone();
    loop {
        let snap = api.query(&key, EnsureOptions::default()).await?;
        let links = snap.links();
        let Some(next) = links.next().filter(|_| links.has_next_page()) else {
            break;
        };
        info!(cursor = %next.cursor, "following next page");
        key = QueryKey::with_options(
            ISSUES_PATH,
            QueryOptions::new().query(json!({"limit": PAGE_SIZE, "cursor": next.cursor}))?,
        )?;
    }

    // Watch page 1, resolve issue 1, then invalidate so the watcher refetches.
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _subscription = api.subscribe(&first_page, move |snap| {
        let _ = tx.send(snap.data.clone());
    });

    let mutation = Mutation::new();
    api.run_mutation(
        &mutation,
        MutationRequest::put(format!("{ISSUES_PATH}1/"))?.data(json!({"status": "resolved"}))?,
    )
    .await?;
    info!(state = ?mutation.state(), "mutation finished");

    let marked = api.invalidate(&KeyPattern::Path(ISSUES_PATH.to_owned()));
    info!(marked, "issue lists invalidated");
    if let Some(Some(data)) = rx.recv().await {
        info!(data = %data, "page 1 refetched");
    }

    api.dispose();
    Ok(())
}

/// Starts the issues API on an ephemeral port.
async fn serve(issues: Issues) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    info!(address = %addr, "issues API listening");

    tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    continue;
                }
            };
            let issues = Arc::clone(&issues);
            tokio::spawn(async move {
                if let Err(e) = handle(stream, issues).await {
                    warn!(peer = %peer, error = %e, "connection closed with error");
                }
            });
        }
    });

    Ok(addr)
}

/// Reads one request, answers it and closes the connection.
async fn handle(mut stream: TcpStream, issues: Issues) -> std::io::Result<()> {
    let mut buf = BytesMut::with_capacity(4096);

    let (method, target, body) = loop {
        if stream.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut request = httparse::Request::new(&mut headers);
        let offset = match request.parse(&buf) {
            Ok(httparse::Status::Complete(offset)) => offset,
            Ok(httparse::Status::Partial) => continue,
            Err(e) => return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        };

        let length = request
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("content-length"))
            .and_then(|h| std::str::from_utf8(h.value).ok()?.trim().parse().ok())
            .unwrap_or(0usize);
        if buf.len() < offset + length {
            continue;
        }

        break (
            request.method.unwrap_or("GET").to_owned(),
            request.path.unwrap_or("/").to_owned(),
            buf[offset..offset + length].to_vec(),
        );
    };

    let (status, link, payload) = route(&method, &target, &body, &issues);
    let body = payload.to_string();
    let mut head = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
        body.len()
    );
    if let Some(link) = link {
        head.push_str(&format!("Link: {link}\r\n"));
    }
    head.push_str("\r\n");

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body.as_bytes()).await?;
    stream.shutdown().await
}

fn route(
    method: &str,
    target: &str,
    body: &[u8],
    issues: &Issues,
) -> (&'static str, Option<String>, Value) {
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let Ok(mut issues) = issues.lock() else {
        return ("500 Internal Server Error", None, json!({"detail": "poisoned"}));
    };

    match (method, path) {
        ("GET", ISSUES_PATH) => {
            let mut offset = 0;
            let mut limit = PAGE_SIZE;
            for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
                match name.as_ref() {
                    "cursor" => offset = value.rsplit(':').nth(1).and_then(|v| v.parse().ok()).unwrap_or(0),
                    "limit" => limit = value.parse().unwrap_or(PAGE_SIZE),
                    _ => {}
                }
            }
            let page: Vec<Value> = issues.iter().skip(offset).take(limit).cloned().collect();
            let next = offset + limit;
            let previous = offset.saturating_sub(limit);
            let link = format!(
                r#"<http://local{ISSUES_PATH}?cursor=0:{previous}:1>; rel="previous"; results="{}"; cursor="0:{previous}:1", <http://local{ISSUES_PATH}?cursor=0:{next}:0>; rel="next"; results="{}"; cursor="0:{next}:0""#,
                offset > 0,
                next < issues.len(),
            );
            ("200 OK", Some(link), Value::Array(page))
        }
        ("PUT", path) if path.starts_with(ISSUES_PATH) => {
            let id = path[ISSUES_PATH.len()..].trim_end_matches('/');
            let Ok(update) = serde_json::from_slice::<Value>(body) else {
                return ("400 Bad Request", None, json!({"detail": "invalid JSON"}));
            };
            match issues.iter_mut().find(|issue| issue["id"] == id) {
                Some(issue) => {
                    if let (Some(target), Some(changes)) = (issue.as_object_mut(), update.as_object()) {
                        for (field, value) in changes {
                            target.insert(field.clone(), value.clone());
                        }
                    }
                    ("200 OK", None, issue.clone())
                }
                None => ("404 Not Found", None, json!({"detail": "Not found"})),
            }
        }
        _ => ("404 Not Found", None, json!({"detail": "Not found"})),
    }
}
