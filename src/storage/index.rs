// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Segment index — durable record of finalized segments.
//!
//! One row per rotated, finalized file: `segments(filename, channel,
//! start_time, end_time, start_str, end_str)`, times in epoch milliseconds.
//! The currently-open file is never indexed; it stays a recorder-session
//! field until rotation finalizes it.
//!
//! Mutated by the channel recorders (insert on finalize) and the eviction
//! monitor (delete), read by the retrieval engine. Every mutation is a
//! single-row insert/delete, atomic at the sqlite layer.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{info, warn};

use crate::error::Result;

/// One finalized segment row.
#[derive(Debug, Clone)]
pub struct SegmentRecord {
    pub filename: String,
    pub channel: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub start_str: String,
    pub end_str: String,
}

pub type SharedIndex = Arc<SegmentIndex>;

pub struct SegmentIndex {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS segments (
    filename   TEXT PRIMARY KEY,
    channel    TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    end_time   INTEGER NOT NULL,
    start_str  TEXT NOT NULL,
    end_str    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_segments_channel_time
    ON segments (channel, start_time);
";

fn display_str(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_else(Utc::now)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

impl SegmentIndex {
    /// Open (creating if needed) the index database at `path`.
    pub fn open(path: &Path) -> Result<SharedIndex> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Arc::new(Self { conn: Mutex::new(conn) }))
    }

    /// In-memory index, used by tests and offline tooling.
    pub fn open_in_memory() -> Result<SharedIndex> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Arc::new(Self { conn: Mutex::new(conn) }))
    }

    /// Insert a finalized segment. Safe against duplicate-insert races
    /// (INSERT OR IGNORE on the filename key). Returns whether a row was
    /// actually inserted.
    pub fn record_segment(
        &self,
        channel: &str,
        path: &Path,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<bool> {
        if start_ms >= end_ms {
            warn!(channel, ?path, start_ms, end_ms, "Rejecting segment with inverted range");
            return Ok(false);
        }
        let n = self.conn.lock().execute(
            "INSERT OR IGNORE INTO segments
                 (filename, channel, start_time, end_time, start_str, end_str)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                path.to_string_lossy(),
                channel,
                start_ms,
                end_ms,
                display_str(start_ms),
                display_str(end_ms),
            ],
        )?;
        Ok(n > 0)
    }

    /// Segments satisfying `start_time < end AND end_time > start`,
    /// ascending by start_time.
    pub fn query_overlapping(
        &self,
        channel: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<SegmentRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT filename, channel, start_time, end_time, start_str, end_str
             FROM segments
             WHERE channel = ?1 AND start_time < ?2 AND end_time > ?3
             ORDER BY start_time ASC",
        )?;
        let rows = stmt.query_map(params![channel, end_ms, start_ms], |row| {
            Ok(SegmentRecord {
                filename: row.get(0)?,
                channel: row.get(1)?,
                start_ms: row.get(2)?,
                end_ms: row.get(3)?,
                start_str: row.get(4)?,
                end_str: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Delete the row backing `path`. Returns whether a row existed.
    pub fn delete_by_path(&self, path: &Path) -> Result<bool> {
        let n = self.conn.lock().execute(
            "DELETE FROM segments WHERE filename = ?1",
            params![path.to_string_lossy()],
        )?;
        Ok(n > 0)
    }

    /// Delete every row whose file lives under `dir` (eviction day-bucket).
    pub fn delete_under_dir(&self, dir: &Path) -> Result<usize> {
        let mut prefix = dir.to_string_lossy().into_owned();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        let n = self.conn.lock().execute(
            "DELETE FROM segments WHERE filename LIKE ?1 || '%'",
            params![prefix],
        )?;
        Ok(n)
    }

    /// Remove every entry whose backing file no longer exists.
    ///
    /// Self-heals index divergence after out-of-band deletions; never
    /// surfaced to callers beyond the returned count.
    pub fn reconcile(&self) -> Result<usize> {
        let filenames: Vec<String> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare("SELECT filename FROM segments")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut removed = 0;
        for filename in filenames {
            if !Path::new(&filename).exists() {
                removed += self
                    .conn
                    .lock()
                    .execute("DELETE FROM segments WHERE filename = ?1", params![filename])?;
            }
        }
        if removed > 0 {
            info!(removed, "Reconciled index against filesystem");
        }
        Ok(removed)
    }

    /// Distinct recording dates (yyyy-mm-dd, UTC) for a channel, ascending.
    pub fn list_dates(&self, channel: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT substr(start_str, 1, 10) FROM segments
             WHERE channel = ?1 ORDER BY 1 ASC",
        )?;
        let rows = stmt.query_map(params![channel], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Number of finalized segments for a channel.
    pub fn count_for_channel(&self, channel: &str) -> Result<u64> {
        let conn = self.conn.lock();
        // sqlite counts are i64 on the wire.
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM segments WHERE channel = ?1",
            params![channel],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }
}
