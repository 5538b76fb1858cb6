//! Wire models for the OCI Distribution manifest endpoints.
//!
//! Only the fields the pull path reads are modeled. The container config
//! blob is never fetched; extraction needs the layer list alone.

use serde::Deserialize;

/// Media type strings accepted from the manifest endpoint.
pub mod media {
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const DOCKER_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

    /// The Accept header value for the initial by-tag request, index
    /// flavors first so multi-arch registries answer with one.
    pub fn accept_all() -> String {
        [OCI_INDEX, DOCKER_LIST, OCI_MANIFEST, DOCKER_MANIFEST].join(", ")
    }

    /// The Accept header value for the follow-up by-digest request.
    pub fn accept_manifest() -> String {
        [OCI_MANIFEST, DOCKER_MANIFEST].join(", ")
    }

    pub fn is_index(media_type: &str) -> bool {
        media_type == OCI_INDEX || media_type == DOCKER_LIST
    }
}

/// A single-platform image manifest.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    pub layers: Vec<Descriptor>,
}

/// A multi-arch index; each entry points at a per-platform manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct Index {
    pub manifests: Vec<Descriptor>,
}

impl Index {
    /// The entry for `want`, or `None` when the index has no matching
    /// platform. Entries without platform metadata never match.
    pub fn entry_for(&self, want: &Platform) -> Option<&Descriptor> {
        self.manifests
            .iter()
            .find(|d| d.platform.as_ref().is_some_and(|p| p.matches(want)))
    }
}

/// A content-addressed reference to a blob or manifest.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default)]
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default)]
    pub variant: Option<String>,
}

impl Platform {
    /// The platform of the serving host, in registry vocabulary.
    pub fn host() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "powerpc64" => "ppc64le",
            other => other,
        };
        Self {
            architecture: architecture.to_string(),
            os: "linux".to_string(),
            variant: None,
        }
    }

    /// True when `self` satisfies the request `want`. A request without a
    /// variant accepts any variant.
    pub fn matches(&self, want: &Platform) -> bool {
        self.architecture == want.architecture
            && self.os == want.os
            && (want.variant.is_none() || self.variant == want.variant)
    }
}
