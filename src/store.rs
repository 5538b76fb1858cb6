use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::Result;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// An application bound to a hostname. Immutable snapshot from the metadata
/// repository; entries copy it at build time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppRecord {
    /// Stable application name.
    pub app: String,
    /// Version-group name; empty falls back to `app`.
    #[serde(default)]
    pub vpp: String,
    /// Pinned version; empty means "latest".
    #[serde(default)]
    pub version: String,
    /// Hostname this application answers on.
    pub domain: String,
    /// Path prefix this application claims ("" or "/" claims everything).
    #[serde(default)]
    pub root_dir: String,
    /// Candidates for one host are tried in descending priority order.
    #[serde(default)]
    pub priority: String,
    #[serde(default)]
    pub disabled: bool,
}

impl AppRecord {
    /// The version-group this application's versions are looked up under.
    pub fn group(&self) -> &str {
        if self.vpp.is_empty() {
            &self.app
        } else {
            &self.vpp
        }
    }
}

/// One servable version of an application. The four serving flags drive the
/// mode resolver; `force_recache` and `cdn_renew` are cleared in the backing
/// store once consumed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionRecord {
    pub vpp: String,
    pub version: String,
    /// Image reference or http(s) archive URL the content comes from.
    #[serde(default)]
    pub image: String,
    /// Sub-path inside the image to materialize (e.g. "www").
    #[serde(default)]
    pub image_path: String,
    /// Wipe and rebuild local content on next access.
    #[serde(default)]
    pub force_recache: bool,
    /// Content should live behind the CDN.
    #[serde(default)]
    pub cdn_push: bool,
    /// The CDN copy is stale and must be rewritten.
    #[serde(default)]
    pub cdn_renew: bool,
    /// Previously uploaded compressed archives may be reused for cold fill.
    #[serde(default)]
    pub cdn_cache_reuse: bool,
    /// CDN domain recorded after a successful push.
    #[serde(default)]
    pub cdn_name: String,
    /// CDN key prefix recorded after a successful push.
    #[serde(default)]
    pub cdn_path: String,
    /// Inline index document; served directly when present.
    #[serde(default)]
    pub index_html: String,
    #[serde(default)]
    pub disabled: bool,
}

// ---------------------------------------------------------------------------
// MetadataStore
// ---------------------------------------------------------------------------

/// Read/write access to application and version metadata. The relational
/// implementation lives outside this crate; the core only issues these calls.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// All non-deleted applications registered for `domain`.
    async fn apps_by_domain(&self, domain: &str) -> Result<Vec<AppRecord>>;

    /// The version `ver` of group `vpp`, or the latest enabled one when `ver`
    /// is empty.
    async fn version(&self, vpp: &str, ver: &str) -> Result<Option<VersionRecord>>;

    /// Persist CDN coordinates after a push, clearing `cdn_renew`.
    async fn update_cdn_fields(
        &self,
        vpp: &str,
        ver: &str,
        cdn_name: &str,
        cdn_path: &str,
    ) -> Result<()>;

    /// Durably clear `force_recache` once a rebuild has consumed it.
    async fn clear_force_recache(&self, vpp: &str, ver: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-memory store for tests and local development.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    apps: Vec<AppRecord>,
    versions: HashMap<String, Vec<VersionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_app(&self, app: AppRecord) {
        self.inner.lock().unwrap().apps.push(app);
    }

    pub fn add_version(&self, ver: VersionRecord) {
        self.inner
            .lock()
            .unwrap()
            .versions
            .entry(ver.vpp.clone())
            .or_default()
            .push(ver);
    }

    /// Replace an existing version record in place (same vpp + version).
    pub fn put_version(&self, ver: VersionRecord) {
        let mut inner = self.inner.lock().unwrap();
        let list = inner.versions.entry(ver.vpp.clone()).or_default();
        match list.iter_mut().find(|v| v.version == ver.version) {
            Some(slot) => *slot = ver,
            None => list.push(ver),
        }
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn apps_by_domain(&self, domain: &str) -> Result<Vec<AppRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .apps
            .iter()
            .filter(|a| a.domain == domain)
            .cloned()
            .collect())
    }

    async fn version(&self, vpp: &str, ver: &str) -> Result<Option<VersionRecord>> {
        let inner = self.inner.lock().unwrap();
        let Some(list) = inner.versions.get(vpp) else {
            return Ok(None);
        };
        if ver.is_empty() {
            // Latest enabled version, descending by version string.
            Ok(list
                .iter()
                .filter(|v| !v.disabled)
                .max_by(|l, r| l.version.cmp(&r.version))
                .cloned())
        } else {
            Ok(list.iter().find(|v| v.version == ver).cloned())
        }
    }

    async fn update_cdn_fields(
        &self,
        vpp: &str,
        ver: &str,
        cdn_name: &str,
        cdn_path: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(v) = inner
            .versions
            .get_mut(vpp)
            .and_then(|l| l.iter_mut().find(|v| v.version == ver))
        {
            v.cdn_name = cdn_name.to_string();
            v.cdn_path = cdn_path.to_string();
            v.cdn_renew = false;
        }
        Ok(())
    }

    async fn clear_force_recache(&self, vpp: &str, ver: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(v) = inner
            .versions
            .get_mut(vpp)
            .and_then(|l| l.iter_mut().find(|v| v.version == ver))
        {
            v.force_recache = false;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
