//! Idle-entry janitor. Periodically drops entries nobody has touched within
//! the idle window and deletes their local trees, in two phases so a tree
//! shared by a still-live entry (pinned and latest resolving to the same
//! version) survives.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cache::{unix_now, CacheDir};

/// One sweep: evict idle entries, then delete trees no live entry references.
/// Returns (entries evicted, trees deleted).
pub fn sweep(dir: &CacheDir, idle_secs: i64) -> (usize, usize) {
    let cutoff = unix_now() - idle_secs;
    let evicted = dir.evict_idle(cutoff);
    if evicted.is_empty() {
        return (0, 0);
    }

    // Phase two: entries are gone from the directory, so any path still
    // reported live belongs to a survivor and must stay on disk.
    let live: HashSet<PathBuf> = dir.live_paths().into_iter().collect();
    let mut deleted = 0;
    for entry in &evicted {
        if live.contains(&entry.abs_path) {
            continue;
        }
        if !entry.abs_path.exists() {
            continue;
        }
        match std::fs::remove_dir_all(&entry.abs_path) {
            Ok(()) => {
                deleted += 1;
                info!(key = %entry.key, path = %entry.abs_path.display(), "janitor deleted tree");
            }
            Err(e) => {
                warn!(key = %entry.key, path = %entry.abs_path.display(), error = %e, "janitor delete failed");
            }
        }
    }
    (evicted.len(), deleted)
}

/// Run the sweep loop forever. `idle_secs <= 0` disables the janitor.
pub async fn run(dir: Arc<CacheDir>, idle_secs: i64, sweep_secs: u64) {
    if idle_secs <= 0 || sweep_secs == 0 {
        info!("janitor disabled");
        return;
    }
    let mut ticker = tokio::time::interval(Duration::from_secs(sweep_secs));
    // First tick fires immediately; skip it so a restart does not sweep a
    // freshly rebuilt cache.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let (evicted, deleted) = sweep(&dir, idle_secs);
        if evicted > 0 {
            info!(evicted, deleted, "janitor sweep complete");
        }
    }
}
