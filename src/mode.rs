//! The mode resolver: given a cached entry and the freshest version record,
//! decide whether the entry still answers or the content must be rebuilt.
//! Rules apply in order; the first match wins.

use crate::cache::CacheEntry;
use crate::store::VersionRecord;

/// Outcome of re-validating a cache hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The entry answers as-is.
    Reuse,
    /// Rebuild through the acquisition pipeline; `wipe` deletes the local
    /// tree first so nothing stale can be reused.
    Rebuild { wipe: bool },
}

/// Decide what to do with a cached `entry` given the current `version`
/// record.
///
/// Ordered rules:
/// 1. `force_recache` wipes and rebuilds.
/// 2. A CDN version flagged `cdn_renew` wipes and rebuilds; the renewed
///    upload must come from freshly acquired content, not the old tree.
/// 3. Mode disagreement wipes and rebuilds: the record wants CDN but the
///    entry serves locally, or the record wants local but the entry
///    redirects.
/// 4. A local entry whose tree vanished from disk rebuilds (nothing left
///    to wipe).
/// 5. Otherwise reuse.
pub fn decide(entry: &CacheEntry, version: &VersionRecord) -> Decision {
    if version.force_recache {
        return Decision::Rebuild { wipe: true };
    }
    if version.cdn_push && version.cdn_renew {
        return Decision::Rebuild { wipe: true };
    }
    if version.cdn_push == entry.is_local {
        return Decision::Rebuild { wipe: true };
    }
    if entry.is_local && !entry.abs_path.exists() {
        return Decision::Rebuild { wipe: false };
    }
    Decision::Reuse
}
