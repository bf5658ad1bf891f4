// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Argument builders for every external ffmpeg worker the system spawns.
//!
//! All media work — capture, open-file extraction, boundary trims,
//! concatenation, vendor transmux — runs in a separate process with
//! stream copy only (no re-encode, trims land on keyframe boundaries).
//! Builders are pure so the exact argv each worker gets is unit-tested
//! without spawning anything.

use std::path::Path;

pub const FFMPEG_BIN: &str = "ffmpeg";

/// Seconds with millisecond precision, the form ffmpeg's `-ss`/`-t` take.
pub fn format_secs(ms: i64) -> String {
    format!("{}.{:03}", ms / 1000, (ms % 1000).abs())
}

fn p(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Capture worker: rotated, epoch-named segments plus a periodically
/// refreshed still-frame snapshot, both from a single input connection.
pub fn capture_args(
    source_url: &str,
    segment_pattern: &Path,
    snapshot_path: &Path,
    segment_secs: u64,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["-nostdin".into(), "-loglevel".into(), "info".into()];
    if source_url.starts_with("rtsp://") {
        args.extend(["-rtsp_transport".into(), "tcp".into()]);
    }
    args.extend([
        "-i".into(),
        source_url.into(),
        // Rotated segment output, stream copy.
        "-map".into(),
        "0".into(),
        "-c".into(),
        "copy".into(),
        "-f".into(),
        "segment".into(),
        "-segment_time".into(),
        segment_secs.to_string(),
        "-reset_timestamps".into(),
        "1".into(),
        "-strftime".into(),
        "1".into(),
        p(segment_pattern),
        // Still-frame snapshot, refreshed in place every 10 s.
        "-map".into(),
        "0:v:0".into(),
        "-vf".into(),
        "fps=1/10".into(),
        "-update".into(),
        "1".into(),
        "-y".into(),
        p(snapshot_path),
    ]);
    args
}

/// Duration-bounded stream copy of the head of a still-open file.
pub fn extract_args(source: &Path, duration_ms: i64, output: &Path) -> Vec<String> {
    vec![
        "-nostdin".into(),
        "-y".into(),
        "-i".into(),
        p(source),
        "-t".into(),
        format_secs(duration_ms),
        "-c".into(),
        "copy".into(),
        "-avoid_negative_ts".into(),
        "make_zero".into(),
        p(output),
    ]
}

/// Boundary trim: optional head seek, optional duration bound, stream copy.
pub fn trim_args(
    source: &Path,
    head_offset_ms: Option<i64>,
    duration_ms: Option<i64>,
    output: &Path,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["-nostdin".into(), "-y".into()];
    if let Some(off) = head_offset_ms {
        args.extend(["-ss".into(), format_secs(off)]);
    }
    args.extend(["-i".into(), p(source)]);
    if let Some(dur) = duration_ms {
        args.extend(["-t".into(), format_secs(dur)]);
    }
    args.extend([
        "-c".into(),
        "copy".into(),
        "-avoid_negative_ts".into(),
        "make_zero".into(),
        p(output),
    ]);
    args
}

/// Concatenate a prepared list file into a complete container.
pub fn concat_file_args(list_file: &Path, output: &Path) -> Vec<String> {
    vec![
        "-nostdin".into(),
        "-y".into(),
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-i".into(),
        p(list_file),
        "-c".into(),
        "copy".into(),
        "-movflags".into(),
        "+faststart".into(),
        p(output),
    ]
}

/// Concatenate into a fragmented container on stdout so playback can start
/// before assembly completes.
pub fn concat_stream_args(list_file: &Path) -> Vec<String> {
    vec![
        "-nostdin".into(),
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-i".into(),
        p(list_file),
        "-c".into(),
        "copy".into(),
        "-movflags".into(),
        "frag_keyframe+empty_moov".into(),
        "-f".into(),
        "mp4".into(),
        "pipe:1".into(),
    ]
}

/// Vendor playback transmux: copy video, normalize audio to AAC, fragmented
/// output for streaming. stdin → stdout.
pub fn transmux_stream_args() -> Vec<String> {
    vec![
        "-nostdin".into(),
        "-i".into(),
        "pipe:0".into(),
        "-c:v".into(),
        "copy".into(),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        "128k".into(),
        "-movflags".into(),
        "frag_keyframe+empty_moov".into(),
        "-f".into(),
        "mp4".into(),
        "pipe:1".into(),
    ]
}

/// The contents of a concat demuxer list file.
pub fn concat_list(paths: &[std::path::PathBuf]) -> String {
    let mut out = String::new();
    for path in paths {
        // Single quotes in paths are escaped per the concat demuxer rules.
        let escaped = path.to_string_lossy().replace('\'', r"'\''");
        out.push_str(&format!("file '{escaped}'\n"));
    }
    out
}
