//! The serving surface: a plain HTTP/1.1 loop over a `TcpListener`. One
//! connection, one request. Requests resolve host and path to an
//! application, pick a version, re-validate or build the cache entry, and
//! answer from local disk or through the CDN.

use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::acquire::Acquirer;
use crate::cache::{CacheDir, CacheEntry, CacheKey, ContentHandler};
use crate::cdn::content_type_for;
use crate::config::OriginConfig;
use crate::mode::{self, Decision};
use crate::store::{AppRecord, MetadataStore, VersionRecord};
use crate::sync::{self, Broadcaster, METHOD_DELETE_CACHE};
use crate::{Error, Result};

pub const VERSION_HEADER: &str = "X-Front3-Ver";

/// Everything one replica needs to answer requests.
pub struct Origin {
    pub config: OriginConfig,
    pub store: Arc<dyn MetadataStore>,
    pub dir: Arc<CacheDir>,
    pub acquirer: Acquirer,
    pub broadcaster: Option<Arc<Broadcaster>>,
    http: reqwest::Client,
}

impl Origin {
    pub fn new(
        config: OriginConfig,
        store: Arc<dyn MetadataStore>,
        dir: Arc<CacheDir>,
        acquirer: Acquirer,
        broadcaster: Option<Arc<Broadcaster>>,
    ) -> Self {
        Self {
            config,
            store,
            dir,
            acquirer,
            broadcaster,
            http: reqwest::Client::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Request/response plumbing
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub host: String,
    pub referer: String,
    pub body: Vec<u8>,
}

impl Request {
    pub fn query_get(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub content_type: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/html; charset=utf-8".to_string(),
            headers: Vec::new(),
            body: body.into().into_bytes(),
        }
    }

    pub fn from_error(err: &Error) -> Self {
        Self::text(err.status(), err.to_string())
    }

    fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        301 => "Moved Permanently",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        _ => "Internal Server Error",
    }
}

/// Percent-decoding-free query split; version strings and sync parameters
/// never carry reserved characters.
fn parse_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Listener loop
// ---------------------------------------------------------------------------

pub async fn serve(origin: Arc<Origin>) -> Result<()> {
    let listener = TcpListener::bind(&origin.config.listen).await?;
    info!(listen = %origin.config.listen, "origin listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let origin = Arc::clone(&origin);
        tokio::spawn(async move {
            if let Err(e) = handle_stream(stream, origin).await {
                debug!(peer = %peer, error = %e, "connection error");
            }
        });
    }
}

async fn handle_stream(mut stream: TcpStream, origin: Arc<Origin>) -> Result<()> {
    let mut buf = vec![0u8; 64 * 1024];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(());
    }

    let req = match parse_request(&buf[..n]) {
        Some(r) => r,
        None => {
            write_response(&mut stream, Response::text(400, "bad request")).await?;
            return Ok(());
        }
    };

    let resp = route(&origin, &req).await;
    write_response(&mut stream, resp).await
}

fn parse_request(raw: &[u8]) -> Option<Request> {
    let head_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
        .unwrap_or(raw.len());
    let head = String::from_utf8_lossy(&raw[..head_end]);
    let mut lines = head.lines();

    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?;
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), parse_query(q)),
        None => (target.to_string(), Vec::new()),
    };

    let mut host = String::new();
    let mut referer = String::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            match name.trim().to_ascii_lowercase().as_str() {
                "host" => host = value.trim().to_string(),
                "referer" => referer = value.trim().to_string(),
                _ => {}
            }
        }
    }

    Some(Request {
        method,
        path,
        query,
        host,
        referer,
        body: raw[head_end..].to_vec(),
    })
}

async fn write_response(stream: &mut TcpStream, resp: Response) -> Result<()> {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        resp.status,
        reason(resp.status),
        resp.content_type,
        resp.body.len()
    );
    for (name, value) in &resp.headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&resp.body).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

pub async fn route(origin: &Origin, req: &Request) -> Response {
    if req.method == "GET" && req.path == "/healthz" {
        return Response {
            status: 200,
            content_type: "text/plain; charset=utf-8".to_string(),
            headers: Vec::new(),
            body: b"ok".to_vec(),
        };
    }
    if req.method == "POST" && req.path == origin.config.sync.path {
        // Replica-to-replica sync always answers 200; the body says what
        // happened so the sender's log is useful.
        let method = req.query_get("method").unwrap_or_default();
        let source = req.query_get("source").unwrap_or_default();
        let text = sync::apply_sync(
            &origin.dir,
            &origin.config.sync.token,
            method,
            source,
            &req.body,
        );
        return Response {
            status: 200,
            content_type: "text/plain; charset=utf-8".to_string(),
            headers: Vec::new(),
            body: text.into_bytes(),
        };
    }

    match serve_content(origin, req).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(host = %req.host, path = %req.path, error = %e, "request failed");
            Response::from_error(&e)
        }
    }
}

async fn serve_content(origin: &Origin, req: &Request) -> Result<Response> {
    let apps = origin
        .store
        .apps_by_domain(&req.host)
        .await
        .map_err(|e| Error::Store(format!("application query: {}: {}", req.host, e)))?;
    if apps.is_empty() {
        return Err(Error::NotFound(format!("application not found: {}", req.host)));
    }

    let app = select_app(apps, &req.path)
        .ok_or_else(|| Error::NotFound(format!("application path not found: {}", req.host)))?;
    if app.disabled {
        return Err(Error::NotFound(format!("application disabled: {}", req.host)));
    }

    // Version: explicit query beats the referring page's query beats the
    // pinned version beats latest.
    let mut selector = req.query_get("version").unwrap_or_default().to_string();
    if selector.is_empty() {
        selector = referer_version(&req.referer);
    }
    if selector.is_empty() {
        selector = app.version.clone();
    }
    let version = origin
        .store
        .version(app.group(), &selector)
        .await?
        .ok_or_else(|| {
            Error::NotFound(format!(
                "application version not found: {}, {}",
                req.host, selector
            ))
        })?;

    let ver_header = format!("{}; version={}", version.vpp, version.version);

    // An inline index document answers directly, no content tree involved.
    if !version.index_html.is_empty() {
        return Ok(Response::text(200, version.index_html.clone()).header(VERSION_HEADER, &ver_header));
    }

    let key = CacheKey::new(app.group(), &version.version);
    let entry = resolve_entry(origin, &key, &app, &version).await?;
    entry.touch();

    let resp = match &entry.handler {
        ContentHandler::Local => serve_local(origin, &entry, req).await?,
        ContentHandler::CdnRedirect { public_prefix } => {
            serve_cdn(origin, public_prefix, req).await?
        }
    };
    Ok(resp.header(VERSION_HEADER, &ver_header))
}

/// Highest-priority application whose root claims the request path.
fn select_app(mut apps: Vec<AppRecord>, path: &str) -> Option<AppRecord> {
    apps.sort_by(|l, r| r.priority.cmp(&l.priority));
    apps.into_iter().find(|app| {
        let root = app.root_dir.trim_end_matches('/');
        root.is_empty() || path == root || path.starts_with(&format!("{}/", root))
    })
}

fn referer_version(referer: &str) -> String {
    let Some((_, q)) = referer.split_once('?') else {
        return String::new();
    };
    parse_query(q)
        .into_iter()
        .find(|(k, _)| k == "version")
        .map(|(_, v)| v)
        .unwrap_or_default()
}

/// Get a live entry for `key`, re-validating hits and building misses.
/// Builds serialize on the directory's population lock with a re-check
/// inside, so a thundering herd produces exactly one build.
async fn resolve_entry(
    origin: &Origin,
    key: &CacheKey,
    app: &AppRecord,
    version: &VersionRecord,
) -> Result<Arc<CacheEntry>> {
    if let Some(entry) = origin.dir.lookup(key) {
        if mode::decide(&entry, version) == Decision::Reuse {
            return Ok(entry);
        }
    }

    let _guard = origin.dir.build_lock.lock().await;
    // Someone else may have built while we waited, and that build may have
    // cleared the very flags that sent us here. Re-read the record and
    // re-decide with fresh state, never the caller's snapshot.
    let version = origin
        .store
        .version(&version.vpp, &version.version)
        .await?
        .ok_or_else(|| {
            Error::NotFound(format!("application version not found: {}", key))
        })?;
    let mut wipe = false;
    if let Some(entry) = origin.dir.lookup(key) {
        match mode::decide(&entry, &version) {
            Decision::Reuse => return Ok(entry),
            Decision::Rebuild { wipe: w } => {
                info!(key = %key, wipe = w, "cache entry invalidated");
                origin.dir.remove(key);
                wipe = w;
            }
        }
    }

    let had_force = version.force_recache;
    let entry = origin.acquirer.build(key, app, &version, wipe).await?;
    origin.dir.insert(Arc::clone(&entry));

    // A forced rebuild here means siblings still hold the old content.
    if had_force {
        if let Some(b) = &origin.broadcaster {
            b.notify_detached(METHOD_DELETE_CACHE, key.to_string());
        }
    }
    Ok(entry)
}

// ---------------------------------------------------------------------------
// Content delivery
// ---------------------------------------------------------------------------

/// Serve off the local tree. Paths with an extension map to files;
/// everything else gets the index document, which keeps client-side routers
/// working on deep links.
async fn serve_local(origin: &Origin, entry: &CacheEntry, req: &Request) -> Result<Response> {
    let rel = strip_app_root(&entry.app.root_dir, &req.path);
    let file = if has_extension(rel) {
        rel.to_string()
    } else {
        origin.config.index.clone()
    };

    let target = crate::archive::safe_join(&entry.abs_path, Path::new(&file))
        .map_err(|_| Error::NotFound(format!("object not found: {}", req.path)))?;
    let data = tokio::fs::read(&target)
        .await
        .map_err(|_| Error::NotFound(format!("object not found: {}", req.path)))?;

    Ok(Response {
        status: 200,
        content_type: content_type_for(Path::new(&file)).to_string(),
        headers: Vec::new(),
        body: data,
    })
}

/// Serve through the CDN: proxy the object, falling back to a redirect when
/// the CDN is unreachable. Extension-less documents come back from object
/// storage as octet-stream and are rewritten to HTML.
async fn serve_cdn(origin: &Origin, public_prefix: &str, req: &Request) -> Result<Response> {
    let rel = req.path.trim_start_matches('/');
    let file = if has_extension(rel) {
        rel.to_string()
    } else {
        origin.config.index.clone()
    };
    let url = format!("https:{}/{}", public_prefix, file);

    match origin.http.get(&url).send().await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            let mut content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/octet-stream")
                .to_string();
            if content_type.starts_with("application/octet-stream") {
                content_type = "text/html; charset=utf-8".to_string();
            }
            let body = resp.bytes().await?.to_vec();
            Ok(Response {
                status,
                content_type,
                headers: Vec::new(),
                body,
            })
        }
        Err(e) => {
            error!(url = %url, error = %e, "cdn fetch failed, redirecting client");
            Ok(Response {
                status: 301,
                content_type: "text/html; charset=utf-8".to_string(),
                headers: vec![("Location".to_string(), url)],
                body: Vec::new(),
            })
        }
    }
}

fn strip_app_root<'a>(root_dir: &str, path: &'a str) -> &'a str {
    let root = root_dir.trim_end_matches('/');
    let stripped = if !root.is_empty() && root != "/" {
        path.strip_prefix(root).unwrap_or(path)
    } else {
        path
    };
    stripped.trim_start_matches('/')
}

fn has_extension(path: &str) -> bool {
    Path::new(path)
        .extension()
        .map(|e| !e.is_empty())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdn::MemoryCdnStore;
    use crate::store::MemoryStore;
    use std::path::PathBuf;

    fn app(domain: &str, root_dir: &str, priority: &str) -> AppRecord {
        AppRecord {
            app: "site".to_string(),
            domain: domain.to_string(),
            root_dir: root_dir.to_string(),
            priority: priority.to_string(),
            ..Default::default()
        }
    }

    fn origin_with(
        store: Arc<MemoryStore>,
        output_root: PathBuf,
    ) -> Origin {
        let mut config = OriginConfig::default();
        config.output_root = output_root;
        let dir = Arc::new(CacheDir::new());
        let cdn: Option<Arc<dyn crate::cdn::CdnStore>> = Some(Arc::new(MemoryCdnStore::new()));
        let acquirer = Acquirer::new(config.clone(), store.clone(), cdn);
        Origin::new(config, store, dir, acquirer, None)
    }

    fn get(host: &str, path: &str) -> Request {
        Request {
            method: "GET".to_string(),
            path: path.to_string(),
            host: host.to_string(),
            ..Default::default()
        }
    }

    fn seed_tree(root: &Path, group: &str, ver: &str) {
        let tree = root.join(group).join(ver);
        std::fs::create_dir_all(tree.join("static")).unwrap();
        std::fs::write(tree.join("index.html"), format!("index-{}", ver)).unwrap();
        std::fs::write(tree.join("static/app.js"), b"1;").unwrap();
    }

    #[test]
    fn request_parsing() {
        let raw = b"GET /a/b.js?version=1.2 HTTP/1.1\r\nHost: site.example.com\r\nReferer: http://x/?version=9\r\n\r\n";
        let req = parse_request(raw).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/a/b.js");
        assert_eq!(req.query_get("version"), Some("1.2"));
        assert_eq!(req.host, "site.example.com");
        assert_eq!(referer_version(&req.referer), "9");
    }

    #[test]
    fn app_selection_honors_priority_and_root() {
        let apps = vec![
            app("h", "", "10"),
            app("h", "/admin", "50"),
        ];
        let picked = select_app(apps.clone(), "/admin/index.html").unwrap();
        assert_eq!(picked.root_dir, "/admin");

        let picked = select_app(apps, "/other").unwrap();
        assert_eq!(picked.root_dir, "");
    }

    #[test]
    fn root_claims_need_a_segment_boundary() {
        let apps = vec![app("h", "/admin", "50")];
        assert!(select_app(apps, "/administrator").is_none());
    }

    #[tokio::test]
    async fn unknown_host_is_404() {
        let root = tempfile::tempdir().unwrap();
        let origin = origin_with(Arc::new(MemoryStore::new()), root.path().to_path_buf());
        let resp = route(&origin, &get("nope.example.com", "/")).await;
        assert_eq!(resp.status, 404);
    }

    #[tokio::test]
    async fn disabled_app_is_404() {
        let store = Arc::new(MemoryStore::new());
        store.add_app(AppRecord {
            disabled: true,
            ..app("h", "", "")
        });
        let root = tempfile::tempdir().unwrap();
        let origin = origin_with(store, root.path().to_path_buf());
        let resp = route(&origin, &get("h", "/")).await;
        assert_eq!(resp.status, 404);
    }

    #[tokio::test]
    async fn inline_index_short_circuits() {
        let store = Arc::new(MemoryStore::new());
        store.add_app(app("h", "", ""));
        store.add_version(VersionRecord {
            vpp: "site".to_string(),
            version: "1.0".to_string(),
            index_html: "<html>inline</html>".to_string(),
            ..Default::default()
        });
        let root = tempfile::tempdir().unwrap();
        let origin = origin_with(store, root.path().to_path_buf());

        let resp = route(&origin, &get("h", "/anything")).await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"<html>inline</html>");
        assert!(resp
            .headers
            .iter()
            .any(|(k, v)| k == VERSION_HEADER && v == "site; version=1.0"));
    }

    #[tokio::test]
    async fn serves_local_files_and_index_fallback() {
        let store = Arc::new(MemoryStore::new());
        store.add_app(app("h", "", ""));
        store.add_version(VersionRecord {
            vpp: "site".to_string(),
            version: "1.0".to_string(),
            ..Default::default()
        });
        let root = tempfile::tempdir().unwrap();
        seed_tree(root.path(), "site", "1.0");
        let origin = origin_with(store, root.path().to_path_buf());

        let resp = route(&origin, &get("h", "/static/app.js")).await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"1;");
        assert!(resp.content_type.starts_with("text/javascript"));

        // Deep link without extension falls back to the index document.
        let resp = route(&origin, &get("h", "/users/42/profile")).await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"index-1.0");
    }

    #[tokio::test]
    async fn traversal_is_refused() {
        let store = Arc::new(MemoryStore::new());
        store.add_app(app("h", "", ""));
        store.add_version(VersionRecord {
            vpp: "site".to_string(),
            version: "1.0".to_string(),
            ..Default::default()
        });
        let root = tempfile::tempdir().unwrap();
        seed_tree(root.path(), "site", "1.0");
        std::fs::write(root.path().join("secret.txt"), b"no").unwrap();
        let origin = origin_with(store, root.path().to_path_buf());

        let resp = route(&origin, &get("h", "/../../secret.txt")).await;
        assert_eq!(resp.status, 404);
    }

    #[tokio::test]
    async fn query_version_overrides_latest() {
        let store = Arc::new(MemoryStore::new());
        store.add_app(app("h", "", ""));
        for v in ["1.0", "2.0"] {
            store.add_version(VersionRecord {
                vpp: "site".to_string(),
                version: v.to_string(),
                ..Default::default()
            });
        }
        let root = tempfile::tempdir().unwrap();
        seed_tree(root.path(), "site", "1.0");
        seed_tree(root.path(), "site", "2.0");
        let origin = origin_with(store, root.path().to_path_buf());

        let resp = route(&origin, &get("h", "/")).await;
        assert_eq!(resp.body, b"index-2.0");

        let mut req = get("h", "/");
        req.query = vec![("version".to_string(), "1.0".to_string())];
        let resp = route(&origin, &req).await;
        assert_eq!(resp.body, b"index-1.0");

        // Assets referenced by an old page follow its referer version.
        let mut req = get("h", "/static/app.js");
        req.referer = "http://h/?version=1.0".to_string();
        let resp = route(&origin, &req).await;
        assert_eq!(resp.status, 200);
    }

    #[tokio::test]
    async fn sync_endpoint_always_answers_200() {
        let store = Arc::new(MemoryStore::new());
        let root = tempfile::tempdir().unwrap();
        let mut origin = origin_with(store, root.path().to_path_buf());
        origin.config.sync.token = "shh".to_string();

        let mut req = Request {
            method: "POST".to_string(),
            path: "/-/sync".to_string(),
            query: vec![
                ("method".to_string(), METHOD_DELETE_CACHE.to_string()),
                ("source".to_string(), "10.0.0.9".to_string()),
            ],
            ..Default::default()
        };
        req.body = serde_json::to_vec(&sync::SyncPayload {
            token: "wrong".to_string(),
            key: "site@1.0".to_string(),
        })
        .unwrap();

        let resp = route(&origin, &req).await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"sync token is not equal");
    }

    #[tokio::test]
    async fn healthz() {
        let store = Arc::new(MemoryStore::new());
        let root = tempfile::tempdir().unwrap();
        let origin = origin_with(store, root.path().to_path_buf());
        let resp = route(&origin, &get("any", "/healthz")).await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"ok");
    }
}
