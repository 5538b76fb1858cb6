use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{Error, Result};

// ---------------------------------------------------------------------------
// Object store seam
// ---------------------------------------------------------------------------

/// Minimal object-store surface the origin needs: fetch a key, store a key.
/// The bucket is pre-checked at startup by whichever implementation backs
/// this; keys are relative to it.
#[async_trait]
pub trait CdnStore: Send + Sync {
    /// Fetch an object, `None` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store an object, overwriting any existing one.
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<()>;
}

/// In-memory object store for tests and local development.
#[derive(Default)]
pub struct MemoryCdnStore {
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
}

impl MemoryCdnStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut v: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        v.sort();
        v
    }
}

#[async_trait]
impl CdnStore for MemoryCdnStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .map(|(d, _)| d.clone()))
    }

    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (data, content_type.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Key and prefix helpers
// ---------------------------------------------------------------------------

/// Object key prefix one version's tree lives under.
pub fn tree_prefix(root_dir: &str, vpp: &str, ver: &str) -> String {
    join_key(&[root_dir.trim_start_matches('/'), vpp, ver])
}

/// Object key of the reusable compressed archive for one version.
pub fn archive_key(root_dir: &str, vpp: &str, ver: &str) -> String {
    format!(
        "{}.tgz",
        join_key(&[root_dir.trim_start_matches('/'), vpp, ver])
    )
}

/// The scheme-relative public prefix recorded in the sentinel and persisted
/// as `cdn_name`: `//<domain>/<prefix>` regardless of how the configured
/// domain spells its scheme.
pub fn public_prefix(domain: &str, prefix: &str) -> String {
    let mut text = format!("{}/{}", domain, prefix);
    if let Some(rest) = text.strip_prefix("https:") {
        text = rest.to_string();
    } else if let Some(rest) = text.strip_prefix("http:") {
        text = rest.to_string();
    }
    if !text.starts_with("//") {
        text = format!("//{}", text);
    }
    text
}

fn join_key(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("/")
}

// ---------------------------------------------------------------------------
// Tree upload
// ---------------------------------------------------------------------------

/// Upload one version's extracted tree under `tree_prefix(root_dir, vpp, ver)`.
///
/// A `cname` sentinel object marks a completed upload: when it already holds
/// the expected public prefix and `rewrite` is off, the whole upload is
/// skipped. Returns the public prefix to persist as `cdn_name`.
pub async fn upload_tree(
    store: &dyn CdnStore,
    local_root: &Path,
    root_dir: &str,
    vpp: &str,
    ver: &str,
    domain: &str,
    rewrite: bool,
) -> Result<String> {
    if domain.is_empty() {
        return Err(Error::Config("cdn domain is empty".to_string()));
    }
    let prefix = tree_prefix(root_dir, vpp, ver);
    let cname_key = format!("{}/cname", prefix);
    let cname_text = public_prefix(domain, &prefix);

    if !rewrite {
        match store.get(&cname_key).await? {
            Some(existing) if existing == cname_text.as_bytes() => {
                debug!(key = %cname_key, "cdn tree already uploaded, skipping");
                return Ok(cname_text);
            }
            Some(_) => {
                warn!(key = %cname_key, "cdn sentinel mismatch, re-uploading");
            }
            None => {}
        }
    }

    store
        .put(&cname_key, cname_text.clone().into_bytes(), "text/plain")
        .await?;

    let mut files = Vec::new();
    collect_files(local_root, PathBuf::new(), &mut files)?;
    let total = files.len();
    for rel in files {
        // The sentinel owns its key.
        if rel.as_os_str() == "cname" {
            continue;
        }
        let data = fs::read(local_root.join(&rel))?;
        let key = format!("{}/{}", prefix, key_of(&rel));
        store
            .put(&key, data, content_type_for(&rel))
            .await
            .map_err(|e| Error::Cdn(format!("put {}: {}", key, e)))?;
    }

    info!(prefix = %prefix, files = total, "uploaded tree to cdn");
    Ok(cname_text)
}

fn collect_files(root: &Path, rel: PathBuf, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(root.join(&rel))? {
        let entry = entry?;
        let child = rel.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            collect_files(root, child, out)?;
        } else {
            out.push(child);
        }
    }
    Ok(())
}

fn key_of(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

// ---------------------------------------------------------------------------
// Content types
// ---------------------------------------------------------------------------

/// Content type by file extension. Unknown extensions fall back to
/// octet-stream; the serving side rewrites that to HTML for extension-less
/// documents.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" | "map" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "gz" | "tgz" => "application/gzip",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}
