//! Cross-replica invalidation. Replicas discover each other through a
//! headless service (or an explicit endpoint list) and broadcast cache
//! deletions guarded by a shared token. The receiving side always answers
//! 200 with a text body so a misbehaving sibling can never wedge a caller;
//! the body says what happened.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::UdpSocket;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::{CacheDir, CacheKey};
use crate::config::SyncConfig;

pub const METHOD_DELETE_CACHE: &str = "delete.cache";

/// Payload carried in every sync POST.
#[derive(Debug, Serialize, Deserialize)]
pub struct SyncPayload {
    pub token: String,
    #[serde(default)]
    pub key: String,
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// Apply one incoming sync request. The return value is the response text;
/// the wire status is always 200.
pub fn apply_sync(
    dir: &CacheDir,
    configured_token: &str,
    method: &str,
    source: &str,
    body: &[u8],
) -> String {
    if configured_token.is_empty() {
        warn!("sync request refused: no token configured");
        return "sync token is empty".to_string();
    }
    let payload: SyncPayload = match serde_json::from_slice(body) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "sync request body unreadable");
            return "read body error".to_string();
        }
    };
    if payload.token != configured_token {
        warn!(source, "sync request refused: token mismatch");
        return "sync token is not equal".to_string();
    }

    info!(source, method, key = %payload.key, "applying sync");
    match method {
        METHOD_DELETE_CACHE => {
            let Ok(key) = CacheKey::parse(&payload.key) else {
                return "ok".to_string();
            };
            let Some(entry) = dir.remove(&key) else {
                // Already gone here; the broadcast is idempotent.
                return "ok".to_string();
            };
            if entry.abs_path.as_os_str().is_empty() {
                return "ok".to_string();
            }
            if let Err(e) = std::fs::remove_dir_all(&entry.abs_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(key = %key, path = %entry.abs_path.display(), error = %e, "sync delete failed");
                }
            }
            "ok".to_string()
        }
        _ => {
            warn!(method, "sync method not recognized");
            "ok".to_string()
        }
    }
}

// ---------------------------------------------------------------------------
// Peer discovery
// ---------------------------------------------------------------------------

/// Resolves the sibling endpoints a broadcast goes to. The local replica is
/// never included.
#[async_trait]
pub trait PeerResolver: Send + Sync {
    async fn peers(&self) -> Vec<String>;
}

/// Fixed endpoint list, whitespace-separated `http://host:port/path` URLs.
pub struct StaticPeers {
    endpoints: Vec<String>,
}

impl StaticPeers {
    pub fn new(list: &str) -> Self {
        Self {
            endpoints: list.split_whitespace().map(str::to_string).collect(),
        }
    }
}

#[async_trait]
impl PeerResolver for StaticPeers {
    async fn peers(&self) -> Vec<String> {
        self.endpoints.clone()
    }
}

/// DNS discovery against a headless service: every A record except the
/// local address becomes `http://<ip>:<port><path>`.
pub struct DnsPeers {
    service: String,
    port: u16,
    path: String,
}

impl DnsPeers {
    pub fn new(service: &str, port: u16, path: &str) -> Self {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        Self {
            service: service.to_string(),
            port,
            path,
        }
    }
}

#[async_trait]
impl PeerResolver for DnsPeers {
    async fn peers(&self) -> Vec<String> {
        let local = local_ip().unwrap_or_default();
        match tokio::net::lookup_host((self.service.as_str(), self.port)).await {
            Ok(addrs) => addrs
                .filter(|a| a.ip().to_string() != local)
                .map(|a| format!("http://{}:{}{}", a.ip(), self.port, self.path))
                .collect(),
            Err(e) => {
                warn!(service = %self.service, error = %e, "peer lookup failed");
                Vec::new()
            }
        }
    }
}

/// The LAN address of this replica, found by the routing table rather than
/// hostname resolution. No packet is sent.
pub fn local_ip() -> Option<String> {
    let sock = UdpSocket::bind("0.0.0.0:0").ok()?;
    sock.connect("8.8.8.8:80").ok()?;
    Some(sock.local_addr().ok()?.ip().to_string())
}

// ---------------------------------------------------------------------------
// Broadcaster
// ---------------------------------------------------------------------------

/// Sends invalidations to every sibling. Failures are logged and swallowed;
/// a dead peer rebuilds from source on its next miss anyway.
pub struct Broadcaster {
    token: String,
    resolver: Box<dyn PeerResolver>,
    http: reqwest::Client,
}

impl Broadcaster {
    pub fn new(token: &str, resolver: Box<dyn PeerResolver>) -> Self {
        Self {
            token: token.to_string(),
            resolver,
            http: reqwest::Client::new(),
        }
    }

    /// Build a broadcaster from config, or `None` when sync is disabled.
    pub fn from_config(cfg: &SyncConfig) -> Option<Arc<Self>> {
        if cfg.token.is_empty() || cfg.service.is_empty() {
            return None;
        }
        let resolver: Box<dyn PeerResolver> =
            if cfg.service.starts_with("http://") || cfg.service.starts_with("https://") {
                Box::new(StaticPeers::new(&cfg.service))
            } else {
                Box::new(DnsPeers::new(&cfg.service, cfg.port, &cfg.path))
            };
        Some(Arc::new(Self::new(&cfg.token, resolver)))
    }

    /// Notify all siblings, awaiting each response. Callers wanting
    /// fire-and-forget spawn this.
    pub async fn notify(&self, method: &str, key: &str) {
        let peers = self.resolver.peers().await;
        if peers.is_empty() {
            return;
        }
        let source = local_ip().unwrap_or_default();
        let payload = SyncPayload {
            token: self.token.clone(),
            key: key.to_string(),
        };
        for peer in peers {
            let url = append_query(&peer, method, &source);
            match self.http.post(&url).json(&payload).send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body = resp.text().await.unwrap_or_default();
                    info!(peer = %url, status, body = %body, "sync notified");
                }
                Err(e) => warn!(peer = %url, error = %e, "sync notify failed"),
            }
        }
    }

    /// Spawn a background notification; used on the serving path where the
    /// response must not wait for siblings.
    pub fn notify_detached(self: &Arc<Self>, method: &'static str, key: String) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.notify(method, &key).await;
        });
    }
}

fn append_query(endpoint: &str, method: &str, source: &str) -> String {
    let sep = if endpoint.contains('?') { '&' } else { '?' };
    format!("{}{}method={}&source={}", endpoint, sep, method, source)
}
