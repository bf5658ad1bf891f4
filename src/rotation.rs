// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Parser for the capture worker's diagnostic output.
//!
//! The segment muxer announces every rotation on stderr:
//!
//! ```text
//! [segment @ 0x5633..] Opening '/data/capture/cam1/2026/08/23/1755945600.mp4' for writing
//! ```
//!
//! The file stem is the segment's start instant in epoch seconds (the worker
//! is launched with strftime `%s` naming). This module is the only place
//! that knows the shape of those lines; everything else consumes the parsed
//! [`WorkerEvent`].

use std::path::PathBuf;

use regex::Regex;
use std::sync::OnceLock;

/// One classified diagnostic line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The worker closed the previous output and opened a new rotated file.
    Rotation { path: PathBuf, start_ms: i64 },
    /// A transport/connection failure was reported mid-stream.
    TransportError,
    /// Anything else; still counts as liveness for the watchdog.
    Noise,
}

fn rotation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Opening '([^']+)' for writing").unwrap())
}

const TRANSPORT_MARKERS: &[&str] = &[
    "Connection refused",
    "Connection reset",
    "Connection timed out",
    "No route to host",
    "Network is unreachable",
    "Operation timed out",
];

/// Classify one stderr line from a capture worker.
pub fn classify(line: &str) -> WorkerEvent {
    if let Some(caps) = rotation_re().captures(line) {
        let path = PathBuf::from(&caps[1]);
        if let Some(start_ms) = epoch_from_stem(&path) {
            return WorkerEvent::Rotation { path, start_ms };
        }
        // A rotation line whose name we cannot read is treated as noise;
        // the watchdog still sees activity.
        return WorkerEvent::Noise;
    }
    if TRANSPORT_MARKERS.iter().any(|m| line.contains(m)) {
        return WorkerEvent::TransportError;
    }
    WorkerEvent::Noise
}

/// Parse the epoch-seconds file stem into epoch milliseconds.
fn epoch_from_stem(path: &std::path::Path) -> Option<i64> {
    let stem = path.file_stem()?.to_str()?;
    let secs: i64 = stem.parse().ok()?;
    if secs <= 0 {
        return None;
    }
    Some(secs * 1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_line_parses_path_and_timestamp() {
        let line = "[segment @ 0x5633aa] Opening '/data/capture/cam1/2026/08/23/1755945600.mp4' for writing";
        match classify(line) {
            WorkerEvent::Rotation { path, start_ms } => {
                assert_eq!(path, PathBuf::from("/data/capture/cam1/2026/08/23/1755945600.mp4"));
                assert_eq!(start_ms, 1_755_945_600_000);
            }
            other => panic!("expected rotation, got {other:?}"),
        }
    }

    #[test]
    fn rotation_line_with_garbage_stem_is_noise() {
        let line = "[segment @ 0x1] Opening '/data/capture/cam1/output.mp4' for writing";
        assert_eq!(classify(line), WorkerEvent::Noise);
    }

    #[test]
    fn transport_errors_are_classified() {
        for line in [
            "[tcp @ 0x7f] Connection refused",
            "rtsp://cam/stream: Connection timed out",
            "[rtsp @ 0x2] Network is unreachable",
        ] {
            assert_eq!(classify(line), WorkerEvent::TransportError, "{line}");
        }
    }

    #[test]
    fn progress_lines_are_noise() {
        let line = "frame= 1432 fps= 25 q=-1.0 size=    4096KiB time=00:00:57.28";
        assert_eq!(classify(line), WorkerEvent::Noise);
    }

    #[test]
    fn snapshot_open_is_not_a_rotation() {
        // The still-frame output is rewritten in place, never announced with
        // the segment muxer's Opening line.
        let line = "[image2 @ 0x9] writing '/data/capture/cam1/snapshot.jpg'";
        assert_eq!(classify(line), WorkerEvent::Noise);
    }
}
