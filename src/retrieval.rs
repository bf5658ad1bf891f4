// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Retrieval & assembly engine — serves arbitrary time-range playback and
//! export over the segment store, including content still being written.
//!
//! For a request `[start, end)` on a locally-recorded channel:
//! select overlapping finalized segments, extract a duration-bounded slice
//! of the still-open file when it overlaps, trim the boundary segments by
//! stream copy, concatenate, and either return the finished artifact or
//! pipe a fragmented container to the client as it is produced. All work is
//! delegated to registered worker processes; every intermediate file is
//! removed when the response completes or fails.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ChannelConfig, ChannelKind, Config};
use crate::error::{NvrError, Result};
use crate::ffmpeg;
use crate::procs::{run_worker, spawn_registered, KillOnDrop, ProcessRegistry};
use crate::schedule::SchedulerHandle;
use crate::storage::index::SharedIndex;
use crate::vendor::{ByteStream, VendorClient};

/// Requested start is clamped to at most `now − SAFETY_BUFFER_MS` so the
/// engine never races the active writer's most recent bytes.
pub const SAFETY_BUFFER_MS: i64 = 3_000;

/// A time-range retrieval request.
#[derive(Debug, Clone)]
pub struct ClipRequest {
    pub channel: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub store_evidence: bool,
    pub order_id: Option<String>,
}

/// A finished batch artifact.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ClipArtifact {
    pub output_file: PathBuf,
    pub from_epoch: i64,
    pub to_epoch: i64,
}

/// One source file in the assembly plan with its boundary trims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlanEntry {
    pub path: PathBuf,
    pub head_offset_ms: Option<i64>,
    pub duration_ms: Option<i64>,
}

/// A candidate source: a finalized segment or the virtual trailing segment
/// extracted from the open file.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub path: PathBuf,
    pub start_ms: i64,
    pub end_ms: i64,
}

/// Boundary-trim planning. The first segment's head is trimmed when it
/// starts before the request, the last segment's duration is bounded when
/// it ends after it; a single segment fully containing the request gets
/// both offsets computed directly from the request bounds.
pub(crate) fn plan_trims(candidates: &[Candidate], start_ms: i64, end_ms: i64) -> Vec<PlanEntry> {
    let n = candidates.len();
    candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let head_offset_ms = if i == 0 && c.start_ms < start_ms {
                Some(start_ms - c.start_ms)
            } else {
                None
            };
            let duration_ms = if i == n - 1 && c.end_ms > end_ms {
                if head_offset_ms.is_some() {
                    // Only one segment remains; -ss rebased its origin.
                    Some(end_ms - start_ms)
                } else {
                    Some(end_ms - c.start_ms)
                }
            } else {
                None
            };
            PlanEntry { path: c.path.clone(), head_offset_ms, duration_ms }
        })
        .collect()
}

/// Tracks intermediate scratch files; everything added is removed on drop,
/// on success and on failure alike.
struct ScratchSet {
    files: Vec<PathBuf>,
}

impl ScratchSet {
    fn new() -> Self {
        Self { files: Vec::new() }
    }

    fn track(&mut self, path: PathBuf) -> PathBuf {
        self.files.push(path.clone());
        path
    }
}

impl Drop for ScratchSet {
    fn drop(&mut self) {
        for file in &self.files {
            if std::fs::remove_file(file).is_ok() {
                debug!(file = %file.display(), "Removed intermediate file");
            }
        }
    }
}

/// The engine; shared by all requests, each of which runs its own
/// independent pipeline (identical concurrent requests are not deduplicated).
pub struct RetrievalEngine {
    registry: Arc<ProcessRegistry>,
    index: SharedIndex,
    scheduler: SchedulerHandle,
    vendor: VendorClient,
    channels: Vec<ChannelConfig>,
    scratch_dir: PathBuf,
    evidence_dir: PathBuf,
    min_clip_bytes: u64,
}

impl RetrievalEngine {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        index: SharedIndex,
        scheduler: SchedulerHandle,
        config: &Config,
    ) -> Result<Self> {
        Ok(Self {
            vendor: VendorClient::new(registry.clone())?,
            registry,
            index,
            scheduler,
            channels: config.channels.clone(),
            scratch_dir: config.scratch_dir(),
            evidence_dir: config.evidence_dir(),
            min_clip_bytes: config.storage.min_clip_bytes,
        })
    }

    fn channel_config(&self, id: &str) -> Result<&ChannelConfig> {
        self.channels
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| NvrError::ChannelNotFound { id: id.to_string() })
    }

    fn scratch_path(&self, tag: &str) -> PathBuf {
        self.scratch_dir.join(format!("{tag}_{}.mp4", Uuid::new_v4()))
    }

    /// Batch mode: assemble a complete artifact and return its metadata.
    pub async fn retrieve_clip(&self, req: ClipRequest) -> Result<ClipArtifact> {
        let config = self.channel_config(&req.channel)?;
        if config.kind == ChannelKind::VendorProxy {
            // Local segment logic is bypassed entirely for vendor channels.
            let output = self.scratch_path("vendor");
            self.vendor
                .fetch_clip(config, req.start_ms, req.end_ms, &output)
                .await?;
            if req.store_evidence {
                self.copy_evidence(&output, req.order_id.as_deref())?;
            }
            return Ok(ClipArtifact {
                output_file: output,
                from_epoch: req.start_ms,
                to_epoch: req.end_ms,
            });
        }

        let mut scratch = ScratchSet::new();
        let (sources, from_epoch, to_epoch) =
            self.gather_sources(&req.channel, req.start_ms, req.end_ms, &mut scratch).await?;

        let list_file = self
            .scratch_dir
            .join(format!("concat_{}.txt", Uuid::new_v4()));
        std::fs::write(&list_file, ffmpeg::concat_list(&sources))?;
        scratch.files.push(list_file.clone());

        let output = self.scratch_dir.join(format!(
            "clip_{}_{}_{}_{}.mp4",
            req.channel,
            from_epoch,
            to_epoch,
            Uuid::new_v4().simple()
        ));
        run_worker(
            &self.registry,
            "concat",
            ffmpeg::FFMPEG_BIN,
            &ffmpeg::concat_file_args(&list_file, &output),
        )
        .await?;

        if req.store_evidence {
            self.copy_evidence(&output, req.order_id.as_deref())?;
        }

        info!(
            channel = req.channel,
            output = %output.display(),
            from_epoch,
            to_epoch,
            "Clip assembled"
        );
        Ok(ClipArtifact { output_file: output, from_epoch, to_epoch })
    }

    /// Stream mode: fragmented container bytes as assembly proceeds.
    ///
    /// At most one active stream per session: the session's prior stream
    /// worker is force-killed before this one produces output. Dropping the
    /// returned stream (client disconnect) kills the worker's process tree.
    pub async fn open_live_stream(
        &self,
        channel: &str,
        start_ms: i64,
        end_ms: i64,
        session_id: &str,
    ) -> Result<ByteStream> {
        self.registry.kill_session_streams(session_id);

        let config = self.channel_config(channel)?;
        if config.kind == ChannelKind::VendorProxy {
            return self
                .vendor
                .open_stream(config, start_ms, end_ms, session_id)
                .await;
        }

        let mut scratch = ScratchSet::new();
        let (sources, from_epoch, to_epoch) =
            self.gather_sources(channel, start_ms, end_ms, &mut scratch).await?;

        let list_file = self
            .scratch_dir
            .join(format!("concat_{}.txt", Uuid::new_v4()));
        std::fs::write(&list_file, ffmpeg::concat_list(&sources))?;
        scratch.files.push(list_file.clone());

        let mut worker = spawn_registered(
            &self.registry,
            "stream",
            Some(session_id.to_string()),
            ffmpeg::FFMPEG_BIN,
            &ffmpeg::concat_stream_args(&list_file),
            false,
            true,
            false,
        )?;
        let mut stdout = worker.child.stdout.take().ok_or_else(|| {
            NvrError::Assembly("stream worker produced no stdout pipe".into())
        })?;

        info!(channel, session = session_id, from_epoch, to_epoch, "Live stream started");

        let guard = KillOnDrop::new(self.registry.clone(), worker.pid, worker.child);

        Ok(Box::pin(async_stream::stream! {
            let _guard = guard;
            let _scratch = scratch;
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => yield Ok(Bytes::copy_from_slice(&buf[..n])),
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }))
    }

    /// Steps 1–8 shared by both output modes: clamp, open-file extraction,
    /// overlap query, boundary trims, size-floor validation.
    async fn gather_sources(
        &self,
        channel: &str,
        start_ms: i64,
        end_ms: i64,
        scratch: &mut ScratchSet,
    ) -> Result<(Vec<PathBuf>, i64, i64)> {
        let now_ms = Utc::now().timestamp_millis();
        let start_ms = start_ms.min(now_ms - SAFETY_BUFFER_MS);
        if end_ms <= start_ms {
            return Err(NvrError::NotFound);
        }

        let mut candidates: Vec<Candidate> = self
            .index
            .query_overlapping(channel, start_ms, end_ms)?
            .into_iter()
            .map(|r| Candidate {
                path: PathBuf::from(r.filename),
                start_ms: r.start_ms,
                end_ms: r.end_ms,
            })
            .collect();

        // The still-open file becomes a virtual trailing segment when the
        // request reaches past its start.
        if let Some(open) = self.scheduler.open_segment(channel).await {
            if end_ms > open.start_ms {
                if let Some(last) = candidates.last() {
                    if last.end_ms < open.start_ms {
                        // Recorder outage between finalized and open content;
                        // passed through, the clip is simply discontinuous.
                        debug!(channel, gap_ms = open.start_ms - last.end_ms, "Gap before open segment");
                    }
                }
                let duration_ms = end_ms - open.start_ms;
                let out = scratch.track(self.scratch_path("partial"));
                run_worker(
                    &self.registry,
                    "extract",
                    ffmpeg::FFMPEG_BIN,
                    &ffmpeg::extract_args(&open.path, duration_ms, &out),
                )
                .await?;
                candidates.push(Candidate {
                    path: out,
                    start_ms: open.start_ms,
                    end_ms: open.start_ms + duration_ms,
                });
            }
        }

        if candidates.is_empty() {
            return Err(NvrError::NotFound);
        }

        let from_epoch = start_ms.max(candidates[0].start_ms);
        let to_epoch = end_ms.min(candidates[candidates.len() - 1].end_ms);

        let plan = plan_trims(&candidates, start_ms, end_ms);
        let mut sources = Vec::with_capacity(plan.len());
        for entry in plan {
            let path = if entry.head_offset_ms.is_some() || entry.duration_ms.is_some() {
                let out = scratch.track(self.scratch_path("trim"));
                run_worker(
                    &self.registry,
                    "trim",
                    ffmpeg::FFMPEG_BIN,
                    &ffmpeg::trim_args(
                        &entry.path,
                        entry.head_offset_ms,
                        entry.duration_ms,
                        &out,
                    ),
                )
                .await?;
                out
            } else {
                entry.path
            };

            if usable(&path, self.min_clip_bytes) {
                sources.push(path);
            } else {
                warn!(file = %path.display(), "Dropping missing or undersized candidate");
            }
        }

        if sources.is_empty() {
            return Err(NvrError::NotFound);
        }
        Ok((sources, from_epoch, to_epoch))
    }

    /// Copy the finished artifact into the retention area.
    fn copy_evidence(&self, output: &Path, order_id: Option<&str>) -> Result<()> {
        std::fs::create_dir_all(&self.evidence_dir)?;
        let name = match order_id {
            Some(id) => format!("{id}.mp4"),
            None => format!("{}.mp4", Uuid::new_v4()),
        };
        let dest = self.evidence_dir.join(name);
        std::fs::copy(output, &dest)?;
        info!(evidence = %dest.display(), "Evidence copy stored");
        Ok(())
    }
}

fn usable(path: &Path, min_bytes: u64) -> bool {
    std::fs::metadata(path).map(|m| m.len() >= min_bytes).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(path: &str, start: i64, end: i64) -> Candidate {
        Candidate { path: PathBuf::from(path), start_ms: start, end_ms: end }
    }

    #[test]
    fn two_segments_trim_both_boundaries() {
        // A=[0,1000), B=[1000,2000), request [500,1500).
        let plan = plan_trims(&[cand("a", 0, 1000), cand("b", 1000, 2000)], 500, 1500);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].head_offset_ms, Some(500));
        assert_eq!(plan[0].duration_ms, None);
        assert_eq!(plan[1].head_offset_ms, None);
        assert_eq!(plan[1].duration_ms, Some(500));
        // Total: (1000-500) + 500 = 1000 ms.
    }

    #[test]
    fn single_segment_uses_request_bounds() {
        let plan = plan_trims(&[cand("a", 0, 10_000)], 2_000, 5_000);
        assert_eq!(plan[0].head_offset_ms, Some(2_000));
        // -ss rebased the origin, so the bound is the request length.
        assert_eq!(plan[0].duration_ms, Some(3_000));
    }

    #[test]
    fn exact_cover_needs_no_trims() {
        let plan = plan_trims(&[cand("a", 0, 1000), cand("b", 1000, 2000)], 0, 2000);
        assert!(plan.iter().all(|e| e.head_offset_ms.is_none() && e.duration_ms.is_none()));
    }

    #[test]
    fn interior_segments_are_never_trimmed() {
        let plan = plan_trims(
            &[cand("a", 0, 1000), cand("b", 1000, 2000), cand("c", 2000, 3000)],
            500,
            2500,
        );
        assert_eq!(plan[1].head_offset_ms, None);
        assert_eq!(plan[1].duration_ms, None);
    }

    #[test]
    fn open_file_extraction_then_trim_is_exact() {
        // Open segment at t0, request [t0+10s, t0+20s), now = t0+25s.
        let t0 = 1_000_000i64;
        let (start, end) = (t0 + 10_000, t0 + 20_000);
        // Extraction spans [t0, end): 20 s of the open file.
        let extract_ms = end - t0;
        assert_eq!(extract_ms, 20_000);
        let virtual_seg = cand("partial", t0, t0 + extract_ms);
        let plan = plan_trims(&[virtual_seg], start, end);
        // The extraction already bounded the tail at the request end, so
        // only the head trim remains: 20 s − 10 s = exactly 10 s.
        assert_eq!(plan[0].head_offset_ms, Some(10_000));
        assert_eq!(plan[0].duration_ms, None);
    }
}
