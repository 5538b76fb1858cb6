//! Pull-only client for the OCI Distribution API.
//!
//! Auth is negotiated per request: the first GET goes out with basic
//! credentials when configured, and a 401 with a Bearer challenge is
//! answered by a token exchange against the advertised realm.

use crate::auth::RegistryAuth;
use crate::error::{OciError, Result};
use crate::manifest::{media, Index, Manifest, Platform};
use reqwest::header::{ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// A parsed image reference: host, repository path, tag or digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub registry: String,
    pub repository: String,
    pub reference: String,
}

const DOCKER_HUB: &str = "registry-1.docker.io";

impl ImageRef {
    /// Parse forms like `nginx`, `nginx:1.27`, `org/app@sha256:..` and
    /// `reg.example.com:5000/org/app:v2`. Bare names resolve to Docker Hub
    /// official images; a missing tag means `latest`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(OciError::Registry("empty image reference".to_string()));
        }

        let (name, reference) = split_reference(raw);

        // The first path component is a host only when it looks like one
        // (a dot or a port). "user/app" stays a Hub repository.
        let (registry, repository) = match name.split_once('/') {
            Some((head, tail)) if head.contains('.') || head.contains(':') => {
                (head.to_string(), tail.to_string())
            }
            Some(_) => (DOCKER_HUB.to_string(), name.to_string()),
            None => (DOCKER_HUB.to_string(), format!("library/{name}")),
        };

        Ok(Self {
            registry,
            repository,
            reference: reference.to_string(),
        })
    }

    /// Parse after rewriting through a mirror map. The longest `from`
    /// prefix found in the map wins; no match leaves `raw` untouched.
    pub fn parse_with_mirrors(raw: &str, mirrors: &[(String, String)]) -> Result<Self> {
        let hit = mirrors
            .iter()
            .filter(|(from, _)| raw.starts_with(from.as_str()))
            .max_by_key(|(from, _)| from.len());
        match hit {
            Some((from, to)) => Self::parse(&format!("{}{}", to, &raw[from.len()..])),
            None => Self::parse(raw),
        }
    }

    fn url(&self, kind: &str, item: &str) -> String {
        format!(
            "{}://{}/v2/{}/{}/{}",
            scheme_for(&self.registry),
            self.registry,
            self.repository,
            kind,
            item,
        )
    }
}

/// Split `name[:tag]` / `name@digest` into the name and the reference.
/// A colon before the last slash belongs to a registry port, not a tag.
fn split_reference(raw: &str) -> (&str, &str) {
    if let Some((name, digest)) = raw.split_once('@') {
        return (name, digest);
    }
    let path_start = raw.rfind('/').map_or(0, |p| p + 1);
    match raw.rfind(':') {
        Some(c) if c > path_start => (&raw[..c], &raw[c + 1..]),
        _ => (raw, "latest"),
    }
}

/// Loopback registries speak plain HTTP, everything else TLS.
fn scheme_for(registry: &str) -> &'static str {
    let host = registry.split(':').next().unwrap_or(registry);
    match host {
        "localhost" | "127.0.0.1" | "::1" => "http",
        _ => "https",
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct RegistryClient {
    http: reqwest::Client,
    auth: RegistryAuth,
}

impl RegistryClient {
    pub fn new(auth: RegistryAuth) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(concat!("facade-oci/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to build HTTP client");
        Self { http, auth }
    }

    pub fn anonymous() -> Self {
        Self::new(RegistryAuth::Anonymous)
    }

    /// Resolve `image` to the manifest for `platform`. A registry that
    /// answers with an index costs one extra by-digest round trip.
    pub async fn resolve_manifest(&self, image: &ImageRef, platform: &Platform) -> Result<Manifest> {
        let url = image.url("manifests", &image.reference);
        let body = self.get(&url, image, Some(&media::accept_all())).await?;

        let raw: serde_json::Value = serde_json::from_slice(&body)?;
        let media_type = raw.get("mediaType").and_then(|v| v.as_str()).unwrap_or("");
        if !media::is_index(media_type) && raw.get("manifests").is_none() {
            return Ok(serde_json::from_value(raw)?);
        }

        let index: Index = serde_json::from_value(raw)?;
        let entry = index.entry_for(platform).ok_or_else(|| {
            OciError::Manifest(format!(
                "no manifest for platform {}/{}",
                platform.os, platform.architecture,
            ))
        })?;
        info!(digest = %entry.digest, os = %platform.os, arch = %platform.architecture, "resolved index entry");

        let url = image.url("manifests", &entry.digest);
        let body = self.get(&url, image, Some(&media::accept_manifest())).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Fetch a layer blob and verify its digest before handing it out.
    pub async fn fetch_blob(&self, image: &ImageRef, digest: &str) -> Result<Vec<u8>> {
        let data = self.get(&image.url("blobs", digest), image, None).await?;

        let want = digest.strip_prefix("sha256:").unwrap_or(digest);
        let got = sha256_hex(&data);
        if got != want {
            return Err(OciError::DigestMismatch {
                expected: want.to_string(),
                actual: got,
            });
        }
        Ok(data)
    }

    /// One GET with the challenge dance: basic creds first, then a bearer
    /// token when the registry answers 401.
    async fn get(&self, url: &str, image: &ImageRef, accept: Option<&str>) -> Result<Vec<u8>> {
        let first = self.request(url, accept, None).send().await?;
        if first.status() != StatusCode::UNAUTHORIZED {
            return read_body(first, url).await;
        }

        let challenge = first
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(|h| Challenge::parse(h, &image.repository))
            .ok_or_else(|| OciError::Registry(format!("401 without a challenge from {url}")))?;

        let token = self.exchange_token(&challenge).await?;
        let retry = self
            .request(url, accept, Some(&format!("Bearer {token}")))
            .send()
            .await?;
        read_body(retry, url).await
    }

    fn request(
        &self,
        url: &str,
        accept: Option<&str>,
        bearer: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let mut req = self.http.get(url);
        if let Some(a) = accept {
            req = req.header(ACCEPT, a);
        }
        match (bearer, &self.auth) {
            (Some(h), _) => req = req.header(AUTHORIZATION, h.to_string()),
            (None, RegistryAuth::Basic { username, password }) => {
                req = req.basic_auth(username, Some(password));
            }
            (None, RegistryAuth::Anonymous) => {}
        }
        req
    }

    /// Trade a Bearer challenge for a token, identifying with the basic
    /// credentials when configured.
    async fn exchange_token(&self, challenge: &Challenge) -> Result<String> {
        let url = challenge.token_url()?;
        debug!(%url, "fetching bearer token");

        let mut req = self.http.get(&url);
        if let RegistryAuth::Basic { username, password } = &self.auth {
            req = req.basic_auth(username, Some(password));
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(OciError::Registry(format!(
                "token endpoint answered {status}"
            )));
        }

        let body: serde_json::Value = resp.json().await?;
        body.get("token")
            .or_else(|| body.get("access_token"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| OciError::Registry("token response carries no token".to_string()))
    }
}

async fn read_body(resp: reqwest::Response, url: &str) -> Result<Vec<u8>> {
    match resp.status() {
        StatusCode::NOT_FOUND => Err(OciError::NotFound(url.to_string())),
        s if s.is_success() => Ok(resp.bytes().await?.to_vec()),
        s => Err(OciError::Registry(format!("GET {url} answered {s}"))),
    }
}

fn sha256_hex(data: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(64);
    for byte in Sha256::digest(data) {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

// ---------------------------------------------------------------------------
// Bearer challenge
// ---------------------------------------------------------------------------

/// The fields of a `WWW-Authenticate: Bearer realm=.., service=.., scope=..`
/// header. A missing scope defaults to pull on the requested repository.
#[derive(Debug, PartialEq, Eq)]
struct Challenge {
    realm: String,
    service: String,
    scope: String,
}

impl Challenge {
    fn parse(header: &str, repository: &str) -> Self {
        let mut realm = String::new();
        let mut service = String::new();
        let mut scope = String::new();
        let params = header.strip_prefix("Bearer ").unwrap_or(header);
        for part in params.split(',') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "realm" => realm = value,
                "service" => service = value,
                "scope" => scope = value,
                _ => {}
            }
        }
        if scope.is_empty() {
            scope = format!("repository:{repository}:pull");
        }
        Self {
            realm,
            service,
            scope,
        }
    }

    fn token_url(&self) -> Result<String> {
        if self.realm.is_empty() {
            return Err(OciError::Registry("challenge names no realm".to_string()));
        }
        Ok(format!(
            "{}?service={}&scope={}",
            self.realm, self.service, self.scope
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_is_hub_official() {
        let r = ImageRef::parse("nginx").unwrap();
        assert_eq!(r.registry, DOCKER_HUB);
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.reference, "latest");
    }

    #[test]
    fn user_repo_with_tag() {
        let r = ImageRef::parse("acme/site:2024.1").unwrap();
        assert_eq!(r.registry, DOCKER_HUB);
        assert_eq!(r.repository, "acme/site");
        assert_eq!(r.reference, "2024.1");
    }

    #[test]
    fn hosted_repo_with_port_and_tag() {
        let r = ImageRef::parse("reg.corp.local:5000/web/docs:v3").unwrap();
        assert_eq!(r.registry, "reg.corp.local:5000");
        assert_eq!(r.repository, "web/docs");
        assert_eq!(r.reference, "v3");
    }

    #[test]
    fn digest_reference() {
        let r = ImageRef::parse("ghcr.io/acme/site@sha256:deadbeef").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.reference, "sha256:deadbeef");
    }

    #[test]
    fn empty_reference_is_an_error() {
        assert!(ImageRef::parse("  ").is_err());
    }

    #[test]
    fn mirror_longest_prefix_wins() {
        let mirrors = vec![
            ("docker.io/".to_string(), "mirror.corp/hub/".to_string()),
            (
                "docker.io/library/".to_string(),
                "mirror.corp/official/".to_string(),
            ),
        ];
        let r = ImageRef::parse_with_mirrors("docker.io/library/nginx:1.27", &mirrors).unwrap();
        assert_eq!(r.registry, "mirror.corp");
        assert_eq!(r.repository, "official/nginx");
        assert_eq!(r.reference, "1.27");
    }

    #[test]
    fn unmirrored_reference_passes_through() {
        let mirrors = vec![("ghcr.io/".to_string(), "mirror.corp/ghcr/".to_string())];
        let r = ImageRef::parse_with_mirrors("busybox", &mirrors).unwrap();
        assert_eq!(r.repository, "library/busybox");
    }

    #[test]
    fn loopback_registries_use_http() {
        assert_eq!(scheme_for("localhost:5000"), "http");
        assert_eq!(scheme_for("127.0.0.1"), "http");
        assert_eq!(scheme_for("ghcr.io"), "https");
        assert_eq!(scheme_for("reg.corp.local:443"), "https");
    }

    #[test]
    fn challenge_parses_quoted_params() {
        let header = r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:web/docs:pull""#;
        let c = Challenge::parse(header, "web/docs");
        assert_eq!(c.realm, "https://auth.example.com/token");
        assert_eq!(c.service, "registry.example.com");
        assert_eq!(c.scope, "repository:web/docs:pull");
    }

    #[test]
    fn challenge_defaults_scope_to_pull() {
        let c = Challenge::parse(r#"Bearer realm="https://a/t",service="s""#, "acme/site");
        assert_eq!(c.scope, "repository:acme/site:pull");
        assert!(c.token_url().unwrap().contains("repository:acme/site:pull"));
    }

    #[test]
    fn challenge_without_realm_fails_token_url() {
        let c = Challenge::parse("Bearer error=\"x\"", "r");
        assert!(c.token_url().is_err());
    }

    #[test]
    fn blob_digest_hex() {
        // sha256 of the empty string.
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
