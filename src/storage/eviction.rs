// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Storage eviction — keeps filesystem usage under the configured ceiling.
//!
//! While over threshold: find the oldest-modified segment file inside a day
//! bucket, delete every file in that day directory plus their index rows,
//! and loop. Whole-day buckets amortize directory scans given the
//! `capture/<channel>/<yyyy>/<mm>/<dd>/` layout.
//!
//! A failed unlink still drops the index row so the two never diverge
//! permanently; the failure is logged and the loop moves on.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::storage::index::SharedIndex;

/// Filesystem usage of the volume containing `path`: (total − available)
/// over total, as a percentage.
pub fn disk_usage_percent(path: &Path) -> Result<f64> {
    let stats = fs2::statvfs(path)?;
    let total = stats.total_space();
    if total == 0 {
        return Ok(0.0);
    }
    let used = total.saturating_sub(stats.available_space());
    Ok(used as f64 / total as f64 * 100.0)
}

/// Background monitor: reconciles the index and runs an eviction pass on a
/// fixed interval, plus whenever a recorder nudges it after a segment
/// finalize or the scheduler closes the window. Failures are logged and
/// retried next cycle, never fatal.
pub fn spawn_monitor(
    capture_root: PathBuf,
    index: SharedIndex,
    max_percent: f64,
    poll: Duration,
    mut nudge_rx: mpsc::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                nudge = nudge_rx.recv() => {
                    if nudge.is_none() {
                        break;
                    }
                }
            }
            let root = capture_root.clone();
            let idx = index.clone();
            let result = tokio::task::spawn_blocking(move || {
                if let Err(e) = idx.reconcile() {
                    error!(error = %e, "Index reconciliation failed");
                }
                evict(&root, &idx, max_percent)
            })
            .await;
            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(error = %e, "Eviction pass failed"),
                Err(e) => error!(error = %e, "Eviction task panicked"),
            }
        }
    })
}

/// One eviction run: delete oldest day-buckets until under `max_percent`.
/// Returns the number of files removed. Never deletes anything while
/// already under threshold.
pub fn evict(capture_root: &Path, index: &SharedIndex, max_percent: f64) -> Result<usize> {
    evict_with(capture_root, index, max_percent, |p| disk_usage_percent(p))
}

/// Eviction loop with an injectable usage reader.
pub(crate) fn evict_with<F>(
    capture_root: &Path,
    index: &SharedIndex,
    max_percent: f64,
    usage: F,
) -> Result<usize>
where
    F: Fn(&Path) -> Result<f64>,
{
    let mut removed_total = 0usize;
    let mut last_bucket: Option<PathBuf> = None;

    loop {
        let pct = usage(capture_root)?;
        if pct <= max_percent {
            if removed_total > 0 {
                info!(usage = pct, removed = removed_total, "Eviction finished, under threshold");
            }
            return Ok(removed_total);
        }

        let Some(oldest) = oldest_file(capture_root) else {
            warn!(usage = pct, "Over threshold but capture tree is empty, nothing to evict");
            return Ok(removed_total);
        };
        let Some(bucket) = oldest.parent().map(Path::to_path_buf) else {
            return Ok(removed_total);
        };

        // The same bucket twice in a row means the pass made no progress
        // (unlinks failing); bail rather than spin.
        if last_bucket.as_deref() == Some(bucket.as_path()) {
            warn!(bucket = ?bucket, usage = pct, "Eviction pass made no progress");
            return Ok(removed_total);
        }
        last_bucket = Some(bucket.clone());

        info!(bucket = ?bucket, usage = pct, max = max_percent, "Evicting oldest day bucket");
        removed_total += delete_bucket(&bucket, index)?;
        prune_empty_dirs(&bucket, capture_root);
    }
}

/// Delete every file in a day directory plus their index rows.
fn delete_bucket(bucket: &Path, index: &SharedIndex) -> Result<usize> {
    let mut removed = 0usize;
    if let Ok(entries) = std::fs::read_dir(bucket) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    removed += 1;
                    debug!(file = ?path, "Evicted");
                }
                Err(e) => {
                    // Index row is dropped anyway to avoid divergence.
                    warn!(file = ?path, error = %e, "Failed to delete file during eviction");
                }
            }
        }
    }
    index.delete_under_dir(bucket)?;
    Ok(removed)
}

/// Depth of a day bucket below the capture root:
/// `<channel>/<yyyy>/<mm>/<dd>`.
const BUCKET_DEPTH: usize = 4;

/// Oldest-modified segment file under `root`, by mtime. Only files at the
/// day-bucket depth are candidates: per-channel files living at the channel
/// root (the snapshot still) must never make the channel root a "bucket",
/// which would wipe the channel's index rows while its segments stay on
/// disk.
fn oldest_file(root: &Path) -> Option<PathBuf> {
    let mut oldest: Option<(PathBuf, SystemTime)> = None;
    walk(root, 0, &mut |path, mtime| match &oldest {
        Some((_, best)) if *best <= mtime => {}
        _ => oldest = Some((path, mtime)),
    });
    oldest.map(|(p, _)| p)
}

fn walk(dir: &Path, depth: usize, visit: &mut impl FnMut(PathBuf, SystemTime)) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk(&path, depth + 1, visit);
        } else if depth == BUCKET_DEPTH {
            if let Ok(meta) = entry.metadata() {
                let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                visit(path, mtime);
            }
        }
    }
}

/// Remove now-empty date directories up to (but never including) the
/// capture root.
fn prune_empty_dirs(from: &Path, capture_root: &Path) {
    let mut cur = Some(from.to_path_buf());
    while let Some(dir) = cur {
        if dir == capture_root || !dir.starts_with(capture_root) {
            break;
        }
        if std::fs::remove_dir(&dir).is_err() {
            break; // not empty, or already gone
        }
        cur = dir.parent().map(Path::to_path_buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::index::SegmentIndex;
    use std::cell::Cell;

    fn touch(path: &Path, mtime_offset_secs: u64) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
        let t = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(mtime_offset_secs);
        let f = std::fs::File::open(path).unwrap();
        f.set_modified(t).unwrap();
    }

    #[test]
    fn under_threshold_deletes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let index = SegmentIndex::open_in_memory().unwrap();
        let file = dir.path().join("c1/2026/08/20/100.mp4");
        touch(&file, 100);

        let removed = evict_with(dir.path(), &index, 90.0, |_| Ok(50.0)).unwrap();
        assert_eq!(removed, 0);
        assert!(file.exists());
    }

    #[test]
    fn evicts_oldest_day_bucket_first() {
        let dir = tempfile::tempdir().unwrap();
        let index = SegmentIndex::open_in_memory().unwrap();
        let old_a = dir.path().join("c1/2026/08/20/100.mp4");
        let old_b = dir.path().join("c1/2026/08/20/200.mp4");
        let newer = dir.path().join("c1/2026/08/21/300.mp4");
        touch(&old_a, 100);
        touch(&old_b, 200);
        touch(&newer, 300);
        index.record_segment("c1", &old_a, 100_000, 200_000).unwrap();
        index.record_segment("c1", &old_b, 200_000, 300_000).unwrap();
        index.record_segment("c1", &newer, 300_000, 400_000).unwrap();

        // Over threshold for exactly one pass.
        let calls = Cell::new(0);
        let removed = evict_with(dir.path(), &index, 90.0, |_| {
            calls.set(calls.get() + 1);
            Ok(if calls.get() == 1 { 95.0 } else { 80.0 })
        })
        .unwrap();

        assert_eq!(removed, 2);
        assert!(!old_a.exists());
        assert!(!old_b.exists());
        assert!(newer.exists());
        // Day bucket rows are gone, the newer day survives.
        assert!(index.query_overlapping("c1", 0, 500_000).unwrap().len() == 1);
        // Emptied date dirs are pruned.
        assert!(!dir.path().join("c1/2026/08/20").exists());
    }

    #[test]
    fn loops_until_under_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let index = SegmentIndex::open_in_memory().unwrap();
        touch(&dir.path().join("c1/2026/08/20/100.mp4"), 100);
        touch(&dir.path().join("c1/2026/08/21/200.mp4"), 200);
        touch(&dir.path().join("c1/2026/08/22/300.mp4"), 300);

        // Usage strictly decreases per pass; needs two buckets gone.
        let calls = Cell::new(0);
        let removed = evict_with(dir.path(), &index, 90.0, |_| {
            calls.set(calls.get() + 1);
            Ok(match calls.get() {
                1 => 98.0,
                2 => 94.0,
                _ => 85.0,
            })
        })
        .unwrap();

        assert_eq!(removed, 2);
        assert!(dir.path().join("c1/2026/08/22/300.mp4").exists());
    }

    #[test]
    fn snapshot_at_channel_root_is_not_a_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let index = SegmentIndex::open_in_memory().unwrap();
        // The snapshot still is the oldest file in the tree, but it lives
        // at the channel root, outside any day bucket.
        let snapshot = dir.path().join("c1/snapshot.jpg");
        let old_seg = dir.path().join("c1/2026/08/20/100.mp4");
        let new_seg = dir.path().join("c1/2026/08/21/200.mp4");
        touch(&snapshot, 50);
        touch(&old_seg, 100);
        touch(&new_seg, 200);
        index.record_segment("c1", &old_seg, 100_000, 200_000).unwrap();
        index.record_segment("c1", &new_seg, 200_000, 300_000).unwrap();

        let calls = Cell::new(0);
        evict_with(dir.path(), &index, 90.0, |_| {
            calls.set(calls.get() + 1);
            Ok(if calls.get() == 1 { 95.0 } else { 80.0 })
        })
        .unwrap();

        // The oldest day bucket goes; the index stays consistent with the
        // files on disk and the snapshot is untouched.
        assert!(!old_seg.exists());
        assert!(new_seg.exists());
        assert!(snapshot.exists());
        let rows = index.query_overlapping("c1", 0, 500_000).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].filename, new_seg.to_string_lossy());
    }

    #[test]
    fn empty_tree_over_threshold_stops() {
        let dir = tempfile::tempdir().unwrap();
        let index = SegmentIndex::open_in_memory().unwrap();
        let removed = evict_with(dir.path(), &index, 90.0, |_| Ok(99.0)).unwrap();
        assert_eq!(removed, 0);
    }
}
