use crate::error::{OciError, Result};
use flate2::read::GzDecoder;
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Layer application
// ---------------------------------------------------------------------------

/// Apply one uncompressed layer tar stream onto `dest`, keeping only entries
/// under `src_prefix` (the prefix itself is stripped from destination paths).
/// Whiteout markers delete content placed by earlier layers. Any entry whose
/// destination would land outside `dest` fails the whole extraction.
pub fn apply_layer<R: Read>(reader: R, dest: &Path, src_prefix: &str) -> Result<()> {
    fs::create_dir_all(dest)?;
    let prefix = src_prefix.trim_start_matches('/');

    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(false);

    // Hard links whose target hasn't been extracted yet get a second pass.
    let mut deferred_hardlinks: Vec<(PathBuf, PathBuf)> = Vec::new();

    for entry_result in archive.entries()? {
        let mut entry = entry_result?;
        let raw_path = entry.path()?.into_owned();

        let Some(rel) = filter_prefix(&raw_path, prefix) else {
            continue;
        };

        let file_name = match rel.file_name().map(|n| n.to_string_lossy().to_string()) {
            Some(n) => n,
            None => {
                // Root-level entry ("./" or the prefix directory itself).
                if entry.header().entry_type().is_dir() {
                    fs::create_dir_all(dest)?;
                }
                continue;
            }
        };

        let parent = rel.parent().unwrap_or_else(|| Path::new(""));

        // Opaque whiteout: clear everything earlier layers put in the
        // directory, keeping the directory itself.
        if file_name == ".wh..wh..opq" {
            let target = safe_join(dest, parent)?;
            if target.exists() {
                clear_directory(&target)?;
            }
            continue;
        }

        // Regular whiteout: delete the named sibling.
        if let Some(hidden) = file_name.strip_prefix(".wh.") {
            let target = safe_join(dest, &parent.join(hidden))?;
            if target.exists() {
                if target.is_dir() {
                    fs::remove_dir_all(&target)?;
                } else {
                    fs::remove_file(&target)?;
                }
                debug!(path = %target.display(), "applied whiteout");
            }
            continue;
        }

        let target = safe_join(dest, &rel)?;
        let mode = entry.header().mode().unwrap_or(0o644);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
                set_mode(&target, mode);
            }
            EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                if let Some(p) = target.parent() {
                    fs::create_dir_all(p)?;
                }
                let mut out = fs::File::create(&target)?;
                std::io::copy(&mut entry, &mut out)?;
                drop(out);
                set_mode(&target, mode);
            }
            EntryType::Symlink => {
                if let Some(p) = target.parent() {
                    fs::create_dir_all(p)?;
                }
                let link_name = entry
                    .header()
                    .link_name()?
                    .ok_or_else(|| OciError::Layer(format!("symlink {} missing target", rel.display())))?;
                let _ = fs::remove_file(&target);
                // The link target is recreated verbatim, never rewritten.
                make_symlink(&link_name, &target)?;
            }
            EntryType::Link => {
                let Some(link_name) = entry.header().link_name()? else {
                    continue;
                };
                // Hard links are only honored when the target also lives
                // under the source prefix.
                let Some(link_rel) = filter_prefix(&link_name, prefix) else {
                    continue;
                };
                let link_target = safe_join(dest, &link_rel)?;
                if link_target.exists() {
                    if let Some(p) = target.parent() {
                        fs::create_dir_all(p)?;
                    }
                    let _ = fs::remove_file(&target);
                    fs::hard_link(&link_target, &target)?;
                } else {
                    deferred_hardlinks.push((target, link_target));
                }
            }
            // Device and FIFO entries are skipped for safety.
            EntryType::Char | EntryType::Block | EntryType::Fifo => continue,
            _ => continue,
        }
    }

    for (link_path, link_target) in &deferred_hardlinks {
        if link_target.exists() {
            if let Some(p) = link_path.parent() {
                fs::create_dir_all(p)?;
            }
            let _ = fs::remove_file(link_path);
            fs::hard_link(link_target, link_path)?;
            debug!(
                link = %link_path.display(),
                target = %link_target.display(),
                "created deferred hard link",
            );
        } else {
            warn!(
                link = %link_path.display(),
                target = %link_target.display(),
                "hard link target still missing after full pass; skipping",
            );
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Path handling
// ---------------------------------------------------------------------------

/// Normalize a tar entry path and keep it only if it equals `prefix` or lies
/// under `prefix + "/"`; the returned path has the prefix stripped. An empty
/// prefix keeps everything.
fn filter_prefix(raw: &Path, prefix: &str) -> Option<PathBuf> {
    let clean: PathBuf = raw
        .components()
        .filter(|c| matches!(c, Component::Normal(_) | Component::ParentDir))
        .collect();
    if clean.as_os_str().is_empty() {
        return None;
    }
    if prefix.is_empty() {
        return Some(clean);
    }
    let clean_str = clean.to_string_lossy();
    if clean_str == prefix {
        Some(PathBuf::new())
    } else {
        clean_str
            .strip_prefix(&format!("{}/", prefix))
            .map(PathBuf::from)
    }
}

/// Join `rel` onto `root`, resolving `..` lexically and refusing any result
/// that would escape `root`.
pub fn safe_join(root: &Path, rel: &Path) -> Result<PathBuf> {
    let mut out = root.to_path_buf();
    let mut depth: usize = 0;
    for comp in rel.components() {
        match comp {
            Component::Normal(c) => {
                out.push(c);
                depth += 1;
            }
            Component::ParentDir => {
                if depth == 0 {
                    return Err(OciError::PathEscape(rel.display().to_string()));
                }
                out.pop();
                depth -= 1;
            }
            Component::CurDir => {}
            // Absolute components would restart the path outside the root.
            Component::RootDir | Component::Prefix(_) => {
                return Err(OciError::PathEscape(rel.display().to_string()));
            }
        }
    }
    Ok(out)
}

/// Remove all entries inside `dir` but keep the directory itself.
fn clear_directory(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777));
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_symlink(target: &Path, link: &Path) -> Result<()> {
    Err(OciError::Layer(format!(
        "symlink {} -> {} unsupported on this platform",
        link.display(),
        target.display()
    )))
}

// ---------------------------------------------------------------------------
// Compression
// ---------------------------------------------------------------------------

/// Return a `Read`er that decompresses `data` according to the OCI media type.
pub fn decompressor<'a>(media_type: &str, data: &'a [u8]) -> Result<Box<dyn Read + 'a>> {
    if media_type.contains("gzip") {
        Ok(Box::new(GzDecoder::new(data)))
    } else if media_type.contains("zstd") {
        let decoder =
            zstd::Decoder::new(data).map_err(|e| OciError::Layer(format!("zstd init: {}", e)))?;
        Ok(Box::new(decoder))
    } else if media_type.contains("tar") && !media_type.contains('+') {
        // Uncompressed tar.
        Ok(Box::new(data))
    } else {
        warn!(media_type, "unknown compression; assuming gzip");
        Ok(Box::new(GzDecoder::new(data)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
