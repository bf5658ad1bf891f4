// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Vendor-proxy playback — channels whose time-range playback is served by
//! the camera/recorder's own API instead of local segment storage.
//!
//! The vendor endpoint takes the range as compact UTC timestamps
//! (`?starttime=20260823T140000Z&endtime=...`). Responses are streamed
//! through as-is; when the channel asks for audio normalization the bytes
//! are piped through an ffmpeg transmux worker (video copy, AAC audio) so
//! fragmented-stream playback works in browsers.

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};

use crate::config::ChannelConfig;
use crate::error::{NvrError, Result};
use crate::ffmpeg;
use crate::procs::{spawn_registered, ProcessRegistry};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(15);

pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Vendor's compact UTC timestamp encoding.
pub fn compact_utc(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_else(Utc::now)
        .format("%Y%m%dT%H%M%SZ")
        .to_string()
}

pub struct VendorClient {
    http: reqwest::Client,
    registry: Arc<ProcessRegistry>,
}

impl VendorClient {
    pub fn new(registry: Arc<ProcessRegistry>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()
            .map_err(|e| NvrError::Vendor(format!("client init: {e}")))?;
        Ok(Self { http, registry })
    }

    async fn request(
        &self,
        config: &ChannelConfig,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<reqwest::Response> {
        let endpoint = config.playback_url.as_deref().ok_or_else(|| {
            NvrError::Vendor(format!("channel '{}' has no playback endpoint", config.id))
        })?;
        let resp = self
            .http
            .get(endpoint)
            .query(&[
                ("starttime", compact_utc(start_ms)),
                ("endtime", compact_utc(end_ms)),
            ])
            .send()
            .await
            .map_err(|e| NvrError::Vendor(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(NvrError::NotFound);
        }
        if !resp.status().is_success() {
            return Err(NvrError::Vendor(format!(
                "vendor returned {} for channel '{}'",
                resp.status(),
                config.id
            )));
        }
        Ok(resp)
    }

    /// Batch mode: download the vendor's range result to `output`.
    pub async fn fetch_clip(
        &self,
        config: &ChannelConfig,
        start_ms: i64,
        end_ms: i64,
        output: &Path,
    ) -> Result<()> {
        let resp = self.request(config, start_ms, end_ms).await?;
        let mut file = tokio::fs::File::create(output).await?;
        let mut body = resp.bytes_stream();
        let mut total = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| NvrError::Vendor(e.to_string()))?;
            total += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        info!(channel = config.id, bytes = total, output = %output.display(), "Vendor clip fetched");
        Ok(())
    }

    /// Stream mode: pass the vendor's bytes through, optionally transmuxed
    /// for audio compatibility.
    pub async fn open_stream(
        &self,
        config: &ChannelConfig,
        start_ms: i64,
        end_ms: i64,
        session_id: &str,
    ) -> Result<ByteStream> {
        let resp = self.request(config, start_ms, end_ms).await?;

        if !config.normalize_audio {
            let body = resp
                .bytes_stream()
                .map(|r| r.map_err(|e| std::io::Error::other(e.to_string())));
            return Ok(Box::pin(body));
        }

        // Pump vendor bytes through an ffmpeg transmux worker registered as
        // this session's stream so it is observable and killable.
        let mut worker = spawn_registered(
            &self.registry,
            "transmux",
            Some(session_id.to_string()),
            ffmpeg::FFMPEG_BIN,
            &ffmpeg::transmux_stream_args(),
            true,
            true,
            false,
        )?;
        let mut stdin = worker.child.stdin.take().ok_or_else(|| {
            NvrError::Vendor("transmux worker has no stdin pipe".into())
        })?;
        let mut stdout = worker.child.stdout.take().ok_or_else(|| {
            NvrError::Vendor("transmux worker has no stdout pipe".into())
        })?;

        let channel = config.id.clone();
        tokio::spawn(async move {
            let mut body = resp.bytes_stream();
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => {
                        if stdin.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(channel, error = %e, "Vendor upstream ended with error");
                        break;
                    }
                }
            }
            // EOF on stdin lets the worker finish the fragment cleanly.
            drop(stdin);
        });

        let guard = crate::procs::KillOnDrop::new(self.registry.clone(), worker.pid, worker.child);
        Ok(Box::pin(async_stream::stream! {
            let _guard = guard;
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn compact_encoding() {
        // 2026-08-23 14:00:00 UTC
        let ms = Utc
            .with_ymd_and_hms(2026, 8, 23, 14, 0, 0)
            .unwrap()
            .timestamp_millis();
        assert_eq!(compact_utc(ms), "20260823T140000Z");
    }
}
