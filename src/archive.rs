//! Gzipped tar archives for CDN-assisted cold fill. Packing streams a
//! materialized tree into `.tgz` form for re-upload; unpacking restores a
//! tree from a previously uploaded archive, optionally stripping a leading
//! prefix, with traversal containment on every entry.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, EntryType};

use crate::{Error, Result};

/// Pack `src_dir` recursively into a gzipped tar written to `writer`.
/// Entries carry paths relative to `src_dir`; file contents stream through
/// without buffering whole files.
pub fn pack_dir<W: Write>(src_dir: &Path, writer: W) -> Result<()> {
    let gz = GzEncoder::new(writer, Compression::default());
    let mut builder = Builder::new(gz);
    append_dir(&mut builder, src_dir, PathBuf::new())?;
    builder.into_inner()?.finish()?;
    Ok(())
}

fn append_dir<W: Write>(builder: &mut Builder<W>, root: &Path, rel: PathBuf) -> Result<()> {
    for entry in fs::read_dir(root.join(&rel))? {
        let entry = entry?;
        let child = rel.join(entry.file_name());
        let ft = entry.file_type()?;
        if ft.is_dir() {
            builder.append_dir(&child, root.join(&child))?;
            append_dir(builder, root, child)?;
        } else if ft.is_file() {
            let mut f = File::open(root.join(&child))?;
            builder.append_file(&child, &mut f)?;
        } else if ft.is_symlink() {
            builder.append_path_with_name(root.join(&child), &child)?;
        }
    }
    Ok(())
}

/// Unpack a gzipped tar from `reader` into `out_dir`.
///
/// When `prefix` is non-empty, only entries under it are restored and the
/// prefix is stripped from their paths. Every target is containment-checked
/// against `out_dir`; one escaping entry fails the whole unpack.
pub fn unpack<R: Read>(reader: R, out_dir: &Path, prefix: &str) -> Result<()> {
    let gz = GzDecoder::new(reader);
    let mut archive = Archive::new(gz);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw = entry.path()?.into_owned();
        let Some(rel) = strip_prefix(&raw, prefix) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = safe_join(out_dir, &rel)?;

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
            }
            EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut out = File::create(&target)?;
                io::copy(&mut entry, &mut out)?;
                #[cfg(unix)]
                if let Ok(mode) = entry.header().mode() {
                    use std::os::unix::fs::PermissionsExt;
                    fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))?;
                }
            }
            EntryType::Symlink => {
                if let Some(link) = entry.link_name()? {
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    if target.symlink_metadata().is_ok() {
                        fs::remove_file(&target)?;
                    }
                    #[cfg(unix)]
                    std::os::unix::fs::symlink(&link, &target)?;
                }
            }
            // Devices and fifos have no place in a content tree.
            _ => {}
        }
    }
    Ok(())
}

/// Keep `raw` only when it lives under `prefix`, returning the remainder.
/// An empty prefix keeps everything.
fn strip_prefix(raw: &Path, prefix: &str) -> Option<PathBuf> {
    if prefix.is_empty() {
        return Some(raw.to_path_buf());
    }
    let want: Vec<&str> = prefix.split('/').filter(|s| !s.is_empty()).collect();
    let mut comps = raw.components();
    for w in &want {
        match comps.next() {
            Some(Component::Normal(c)) if c.to_str() == Some(w) => {}
            _ => return None,
        }
    }
    Some(comps.as_path().to_path_buf())
}

/// Lexically join `rel` onto `root`, refusing absolute paths and any `..`
/// that would climb out of `root`.
pub fn safe_join(root: &Path, rel: &Path) -> Result<PathBuf> {
    let mut depth: i32 = 0;
    let mut out = root.to_path_buf();
    for comp in rel.components() {
        match comp {
            Component::Normal(c) => {
                depth += 1;
                out.push(c);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(Error::Acquire(format!(
                        "archive entry escapes output root: {}",
                        rel.display()
                    )));
                }
                out.pop();
            }
            _ => {
                return Err(Error::Acquire(format!(
                    "archive entry is not relative: {}",
                    rel.display()
                )));
            }
        }
    }
    Ok(out)
}
