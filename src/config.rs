use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Top-level origin configuration, loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginConfig {
    /// Listen address for the serving surface.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Root under which extracted content lives: `<output_root>/<vpp>/<ver>/`.
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,

    /// Index document served for extension-less request paths.
    #[serde(default = "default_index")]
    pub index: String,

    /// Entries idle longer than this are evicted by the janitor (seconds).
    /// 0 keeps the janitor off.
    #[serde(default = "default_idle_secs")]
    pub cache_idle_secs: i64,

    /// Janitor sweep period (seconds).
    #[serde(default = "default_sweep_secs")]
    pub cache_sweep_secs: u64,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub cdn: CdnConfig,

    #[serde(default)]
    pub sync: SyncConfig,
}

/// Container registry access for image-backed cold fill.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Username; empty means anonymous (or the auth map below).
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Per-host JSON auth map: `{"auths":{"<host>":{"username","password"}}}`.
    #[serde(default)]
    pub dcr_auths: String,
    /// Image reference rewrites, applied by longest prefix match before pull.
    #[serde(default)]
    pub image_maps: HashMap<String, String>,
}

impl RegistryConfig {
    /// Mirror map as sorted pairs for deterministic longest-prefix matching.
    pub fn mirrors(&self) -> Vec<(String, String)> {
        let mut v: Vec<(String, String)> = self
            .image_maps
            .iter()
            .map(|(k, val)| (k.clone(), val.clone()))
            .collect();
        v.sort();
        v
    }
}

/// CDN coordinates: where archives and pushed trees live, and the public
/// domain redirects point at.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CdnConfig {
    /// Object key prefix inside the (pre-checked) bucket.
    #[serde(default)]
    pub root_dir: String,
    /// Public CDN domain, e.g. `//cdn.example.com/assets` or
    /// `https://cdn.example.com`.
    #[serde(default)]
    pub domain: String,
}

/// Cross-replica invalidation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Shared secret carried in every sync payload. Empty disables sync.
    #[serde(default)]
    pub token: String,
    /// Headless service name to resolve siblings from, or a space-separated
    /// list of literal `http://host:port/path` endpoints.
    #[serde(default)]
    pub service: String,
    /// Webhook path the receiver listens on.
    #[serde(default = "default_sync_path")]
    pub path: String,
    /// Port siblings listen on (used with DNS discovery).
    #[serde(default = "default_sync_port")]
    pub port: u16,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_output_root() -> PathBuf {
    PathBuf::from("/var/cache/facade")
}

fn default_index() -> String {
    "index.html".to_string()
}

fn default_idle_secs() -> i64 {
    2_592_000 // 30 days
}

fn default_sweep_secs() -> u64 {
    86_400 // daily
}

fn default_sync_path() -> String {
    "/-/sync".to_string()
}

fn default_sync_port() -> u16 {
    8080
}

// The per-field serde defaults only apply when a `sync:` mapping is
// present; a config omitting the section lands here instead.
impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            service: String::new(),
            path: default_sync_path(),
            port: default_sync_port(),
        }
    }
}

impl Default for OriginConfig {
    fn default() -> Self {
        // serde defaults double as the programmatic defaults
        serde_yaml::from_str("{}").expect("default config")
    }
}

impl OriginConfig {
    /// Load the configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }
}
