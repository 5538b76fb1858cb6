//! The acquisition pipeline: turn a version record into a servable cache
//! entry. Content is materialized at most once per (group, version) under
//! the output root and sourced, in order, from a previously uploaded CDN
//! archive, a direct http(s) archive download, or a container image pull.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use facade_oci::{resolve_auth, ImageExporter, ImageRef};

use crate::archive;
use crate::cache::{CacheEntry, CacheKey, ContentHandler};
use crate::cdn::{self, CdnStore};
use crate::config::OriginConfig;
use crate::store::{AppRecord, MetadataStore, VersionRecord};
use crate::{Error, Result};

pub struct Acquirer {
    config: OriginConfig,
    store: Arc<dyn MetadataStore>,
    cdn: Option<Arc<dyn CdnStore>>,
    http: reqwest::Client,
}

impl Acquirer {
    pub fn new(
        config: OriginConfig,
        store: Arc<dyn MetadataStore>,
        cdn: Option<Arc<dyn CdnStore>>,
    ) -> Self {
        Self {
            config,
            store,
            cdn,
            http: reqwest::Client::new(),
        }
    }

    /// Local tree for one (group, version).
    pub fn tree_path(&self, key: &CacheKey) -> PathBuf {
        self.config.output_root.join(&key.group).join(&key.version)
    }

    /// Build a cache entry for `key`. Callers hold the directory's build
    /// lock; this function never publishes, it only materializes.
    pub async fn build(
        &self,
        key: &CacheKey,
        app: &AppRecord,
        version: &VersionRecord,
        wipe: bool,
    ) -> Result<Arc<CacheEntry>> {
        let abs_path = self.tree_path(key);
        let mut version = version.clone();

        if wipe && abs_path.exists() {
            std::fs::remove_dir_all(&abs_path)?;
        }
        // The flag is consumed by the wipe, before any rebuild can fail.
        if version.force_recache {
            self.store
                .clear_force_recache(&version.vpp, &version.version)
                .await?;
            version.force_recache = false;
        }

        // A version already living behind the CDN needs no disk at all.
        if version.cdn_push && !version.cdn_name.is_empty() && !version.cdn_renew {
            debug!(key = %key, cdn = %version.cdn_name, "serving from recorded cdn location");
            let public_prefix = version.cdn_name.clone();
            return Ok(Arc::new(CacheEntry::new(
                key.clone(),
                app.clone(),
                version,
                ContentHandler::CdnRedirect { public_prefix },
                abs_path,
                false,
            )));
        }

        if is_non_empty_dir(&abs_path) {
            debug!(key = %key, path = %abs_path.display(), "reusing materialized tree");
        } else {
            self.materialize(key, &version, &abs_path).await.map_err(|e| {
                // Never leave a half-written tree behind.
                let _ = std::fs::remove_dir_all(&abs_path);
                e
            })?;
        }

        let handler = if version.cdn_push {
            let cname = self.push_to_cdn(key, &version, &abs_path).await?;
            let prefix = cdn::tree_prefix(&self.config.cdn.root_dir, &key.group, &key.version);
            self.store
                .update_cdn_fields(&version.vpp, &version.version, &cname, &prefix)
                .await?;
            version.cdn_name = cname.clone();
            version.cdn_renew = false;
            ContentHandler::CdnRedirect {
                public_prefix: cname,
            }
        } else {
            ContentHandler::Local
        };

        let is_local = matches!(handler, ContentHandler::Local);
        info!(key = %key, local = is_local, path = %abs_path.display(), "built cache entry");
        Ok(Arc::new(CacheEntry::new(
            key.clone(),
            app.clone(),
            version,
            handler,
            abs_path,
            is_local,
        )))
    }

    /// Fill `abs_path` from the first source that works.
    async fn materialize(
        &self,
        key: &CacheKey,
        version: &VersionRecord,
        abs_path: &Path,
    ) -> Result<()> {
        std::fs::create_dir_all(abs_path)?;

        // Archive reuse: a tree we previously packed and parked on the CDN.
        if version.cdn_cache_reuse && !version.cdn_renew {
            if let Some(cdn) = &self.cdn {
                let akey = cdn::archive_key(&self.config.cdn.root_dir, &key.group, &key.version);
                match cdn.get(&akey).await {
                    Ok(Some(data)) => {
                        info!(key = %key, archive = %akey, "restoring from cdn archive");
                        let dest = abs_path.to_path_buf();
                        tokio::task::spawn_blocking(move || {
                            archive::unpack(&data[..], &dest, "")
                        })
                        .await
                        .map_err(|e| Error::Acquire(format!("unpack task panicked: {}", e)))??;
                        return Ok(());
                    }
                    Ok(None) => {}
                    Err(e) => warn!(key = %key, archive = %akey, error = %e, "cdn archive fetch failed"),
                }
            }
        }

        if version.image.is_empty() {
            return Err(Error::Acquire(format!("version {} has no image", key)));
        }

        if version.image.starts_with("http://") || version.image.starts_with("https://") {
            self.download_archive(key, version, abs_path).await?;
        } else {
            self.export_image(key, version, abs_path).await?;
        }

        // Park a compressed copy so siblings can cold-fill without pulling.
        if version.cdn_cache_reuse {
            if let Some(cdn) = &self.cdn {
                let akey = cdn::archive_key(&self.config.cdn.root_dir, &key.group, &key.version);
                match pack_tree(abs_path).await {
                    Ok(data) => {
                        if let Err(e) = cdn.put(&akey, data, "application/gzip").await {
                            warn!(key = %key, archive = %akey, error = %e, "archive upload failed");
                        } else {
                            info!(key = %key, archive = %akey, "archive parked on cdn");
                        }
                    }
                    Err(e) => warn!(key = %key, error = %e, "archive pack failed"),
                }
            }
        }

        Ok(())
    }

    /// Fetch an http(s) `.tgz` and unpack it, keeping only entries under the
    /// version's internal path.
    async fn download_archive(
        &self,
        key: &CacheKey,
        version: &VersionRecord,
        abs_path: &Path,
    ) -> Result<()> {
        info!(key = %key, url = %version.image, "downloading content archive");
        let resp = self
            .http
            .get(&version.image)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Acquire(format!("download {}: {}", version.image, e)))?;
        let data = resp.bytes().await?;

        let dest = abs_path.to_path_buf();
        let prefix = version.image_path.clone();
        tokio::task::spawn_blocking(move || archive::unpack(&data[..], &dest, &prefix))
            .await
            .map_err(|e| Error::Acquire(format!("unpack task panicked: {}", e)))??;
        Ok(())
    }

    /// Pull a container image and materialize the version's internal path.
    async fn export_image(
        &self,
        key: &CacheKey,
        version: &VersionRecord,
        abs_path: &Path,
    ) -> Result<()> {
        let reg = &self.config.registry;
        let auth = resolve_auth(
            &version.image,
            &reg.username,
            &reg.password,
            &reg.dcr_auths,
        )
        .map_err(|e| Error::Acquire(format!("registry auth: {}", e)))?;
        let image_ref = ImageRef::parse_with_mirrors(&version.image, &reg.mirrors())?;

        info!(key = %key, image = %version.image, src = %version.image_path, "exporting image content");
        ImageExporter::new(auth)
            .export(&image_ref, &version.image_path, abs_path)
            .await?;
        Ok(())
    }

    /// Upload the tree and return the public prefix to record as `cdn_name`.
    async fn push_to_cdn(
        &self,
        key: &CacheKey,
        version: &VersionRecord,
        abs_path: &Path,
    ) -> Result<String> {
        let cdn = self
            .cdn
            .as_ref()
            .ok_or_else(|| Error::Config("cdn_push set but no cdn store configured".to_string()))?;
        cdn::upload_tree(
            cdn.as_ref(),
            abs_path,
            &self.config.cdn.root_dir,
            &key.group,
            &key.version,
            &self.config.cdn.domain,
            version.cdn_renew,
        )
        .await
    }
}

async fn pack_tree(path: &Path) -> Result<Vec<u8>> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        archive::pack_dir(&path, &mut buf)?;
        Ok(buf)
    })
    .await
    .map_err(|e| Error::Acquire(format!("pack task panicked: {}", e)))?
}

fn is_non_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut it| it.next().is_some())
        .unwrap_or(false)
}
