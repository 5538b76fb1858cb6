use serde::Deserialize;
use std::collections::HashMap;

use crate::{OciError, Result};

// ---------------------------------------------------------------------------
// Registry credentials
// ---------------------------------------------------------------------------

/// Credentials presented to a registry. Bearer tokens are negotiated
/// separately; this is the identity used for the token exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryAuth {
    Anonymous,
    Basic { username: String, password: String },
}

impl RegistryAuth {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-host auth map ({"auths": {"<host>": {"username", "password"}}})
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct AuthsFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

/// A parsed per-host credential map in the docker-config style.
#[derive(Debug, Clone, Default)]
pub struct AuthMap {
    entries: HashMap<String, (String, String)>,
}

impl AuthMap {
    /// Parse the JSON auth map. An empty string yields an empty map.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let file: AuthsFile = serde_json::from_str(raw)
            .map_err(|e| OciError::Auth(format!("parse auth map: {}", e)))?;
        let entries = file
            .auths
            .into_iter()
            .map(|(host, a)| (host, (a.username, a.password)))
            .collect();
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up credentials by exact registry host. Image references without
    /// a registry component resolve against the `docker.io` key.
    pub fn resolve(&self, image: &str) -> RegistryAuth {
        let host = registry_host(image);
        match self.entries.get(host) {
            Some((user, pass)) => RegistryAuth::basic(user.clone(), pass.clone()),
            None => RegistryAuth::Anonymous,
        }
    }
}

/// The registry host an image reference pulls from. A leading component is a
/// host only when it contains a dot (or a port colon); bare names belong to
/// Docker Hub.
pub fn registry_host(image: &str) -> &str {
    match image.split_once('/') {
        Some((first, _)) if first.contains('.') || first.contains(':') => first,
        _ => "docker.io",
    }
}

/// Resolve the effective credentials for an image pull: an explicit
/// username/password pair wins, then the per-host auth map, then anonymous.
pub fn resolve_auth(
    image: &str,
    username: &str,
    password: &str,
    auths_json: &str,
) -> Result<RegistryAuth> {
    if !username.is_empty() {
        return Ok(RegistryAuth::basic(username, password));
    }
    Ok(AuthMap::parse(auths_json)?.resolve(image))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
