pub mod auth;
pub mod error;
pub mod extract;
pub mod manifest;
pub mod registry;

pub use auth::{resolve_auth, AuthMap, RegistryAuth};
pub use error::{OciError, Result};
pub use registry::ImageRef;

use std::path::{Path, PathBuf};
use tracing::info;

/// Image exporter -- pulls a container image and materializes one internal
/// path from its merged layers onto local disk.
pub struct ImageExporter {
    registry: registry::RegistryClient,
    platform: manifest::Platform,
}

impl ImageExporter {
    pub fn new(auth: RegistryAuth) -> Self {
        Self {
            registry: registry::RegistryClient::new(auth),
            platform: manifest::Platform::host(),
        }
    }

    /// Pull `image_ref`'s layers bottom-to-top and apply the entries under
    /// `src_path` into `dest`, handling whiteouts along the way. On error the
    /// caller owns cleanup of whatever was partially written.
    pub async fn export(&self, image_ref: &ImageRef, src_path: &str, dest: &Path) -> Result<()> {
        info!(
            registry = %image_ref.registry,
            repository = %image_ref.repository,
            reference = %image_ref.reference,
            src = src_path,
            "exporting image path",
        );

        let manifest = self
            .registry
            .resolve_manifest(image_ref, &self.platform)
            .await?;

        let total = manifest.layers.len();
        for (i, desc) in manifest.layers.iter().enumerate() {
            let data = self.registry.fetch_blob(image_ref, &desc.digest).await?;
            let media_type = desc.media_type.clone();
            let src = src_path.to_string();
            let dest: PathBuf = dest.to_path_buf();

            // Decompression and tar application are CPU-bound.
            tokio::task::spawn_blocking(move || -> Result<()> {
                let reader = extract::decompressor(&media_type, &data)?;
                extract::apply_layer(reader, &dest, &src)
            })
            .await
            .map_err(|e| OciError::Layer(format!("apply task panicked: {}", e)))??;

            info!(layer = i + 1, total, digest = %desc.digest, "applied layer");
        }

        Ok(())
    }
}
