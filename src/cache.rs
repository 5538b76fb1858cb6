use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::store::{AppRecord, VersionRecord};
use crate::{Error, Result};

// ---------------------------------------------------------------------------
// Cache key
// ---------------------------------------------------------------------------

/// Identity of one servable unit: a version-group plus a concrete version.
/// The wire form (invalidation payloads, logs) is `group@version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub group: String,
    pub version: String,
}

impl CacheKey {
    pub fn new(group: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
        }
    }

    /// Parse the `group@version` wire form.
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once('@') {
            Some((group, version)) if !group.is_empty() && !version.is_empty() => {
                Ok(Self::new(group, version))
            }
            _ => Err(Error::NotFound(format!("bad cache key: {}", s))),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.group, self.version)
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// How an entry answers requests once built.
#[derive(Debug, Clone)]
pub enum ContentHandler {
    /// Serve files straight off the local tree.
    Local,
    /// Content lives behind the CDN; proxy or redirect using the recorded
    /// scheme-relative public prefix.
    CdnRedirect { public_prefix: String },
}

/// One built cache entry. Immutable except for the access stamp, which every
/// hit bumps so the janitor can measure idleness without locking the map for
/// writing.
#[derive(Debug)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub app: AppRecord,
    pub version: VersionRecord,
    pub handler: ContentHandler,
    /// Local tree this entry owns (also set for CDN entries that were filled
    /// locally before pushing).
    pub abs_path: PathBuf,
    pub is_local: bool,
    last_access: AtomicI64,
}

impl CacheEntry {
    pub fn new(
        key: CacheKey,
        app: AppRecord,
        version: VersionRecord,
        handler: ContentHandler,
        abs_path: PathBuf,
        is_local: bool,
    ) -> Self {
        Self {
            key,
            app,
            version,
            handler,
            abs_path,
            is_local,
            last_access: AtomicI64::new(unix_now()),
        }
    }

    pub fn touch(&self) {
        self.last_access.store(unix_now(), Ordering::Relaxed);
    }

    pub fn last_access(&self) -> i64 {
        self.last_access.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn set_last_access(&self, secs: i64) {
        self.last_access.store(secs, Ordering::Relaxed);
    }
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

/// The in-memory cache directory. Reads take the map lock briefly; cold
/// fills serialize on `build_lock` so concurrent misses for any key produce
/// exactly one build.
pub struct CacheDir {
    entries: RwLock<HashMap<CacheKey, Arc<CacheEntry>>>,
    /// Coarse population lock. Held across the whole acquire pipeline;
    /// holders re-check the map before building.
    pub build_lock: tokio::sync::Mutex<()>,
}

impl Default for CacheDir {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheDir {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            build_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Look an entry up, bumping its access stamp on hit.
    pub fn lookup(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let map = self.entries.read().unwrap();
        let entry = map.get(key)?;
        entry.touch();
        Some(Arc::clone(entry))
    }

    /// Peek without touching; the janitor and the mode resolver use this.
    pub fn peek(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.entries.read().unwrap().get(key).cloned()
    }

    pub fn insert(&self, entry: Arc<CacheEntry>) {
        self.entries
            .write()
            .unwrap()
            .insert(entry.key.clone(), entry);
    }

    pub fn remove(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.entries.write().unwrap().remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry idle since before `cutoff` and return them. Removal
    /// and path deletion are separate phases: a returned entry's tree may
    /// still be referenced by a surviving entry, which `live_paths` exposes.
    pub fn evict_idle(&self, cutoff: i64) -> Vec<Arc<CacheEntry>> {
        let mut map = self.entries.write().unwrap();
        let stale: Vec<CacheKey> = map
            .iter()
            .filter(|(_, e)| e.last_access() < cutoff)
            .map(|(k, _)| k.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|k| map.remove(&k))
            .collect()
    }

    /// Local trees still referenced by live entries.
    pub fn live_paths(&self) -> Vec<PathBuf> {
        self.entries
            .read()
            .unwrap()
            .values()
            .map(|e| e.abs_path.clone())
            .collect()
    }
}
