use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{NvrError, Result};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Daily recording window.
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// HTTP API configuration (optional).
    #[serde(default)]
    pub api: ApiConfig,
    /// List of channels to record.
    pub channels: Vec<ChannelConfig>,
}

/// HTTP API configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    /// Whether to enable the HTTP API.
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    /// Port to listen on.
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { enabled: default_api_enabled(), port: default_api_port() }
    }
}

fn default_api_enabled() -> bool { true }
fn default_api_port() -> u16 { 8080 }

/// Storage parameters for the capture tree and scratch/evidence areas.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Base directory; capture/, scratch/, evidence/ and the index DB live
    /// underneath it.
    pub base_path: PathBuf,
    /// Filesystem usage percentage above which eviction kicks in.
    #[serde(default = "default_max_storage_percent")]
    pub max_storage_percent: f64,
    /// Duration of a single rotated segment in seconds.
    #[serde(default = "default_segment_duration")]
    pub segment_duration_secs: u64,
    /// Eviction poll interval in seconds.
    #[serde(default = "default_eviction_poll")]
    pub eviction_poll_secs: u64,
    /// Minimum byte size for a file to count as a usable clip source.
    #[serde(default = "default_min_clip_bytes")]
    pub min_clip_bytes: u64,
}

/// Daily recording window, wall-clock. `start == stop` means always open.
#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    #[serde(default = "default_start_hour")]
    pub start_hour: u32,
    #[serde(default)]
    pub start_minute: u32,
    #[serde(default = "default_stop_hour")]
    pub stop_hour: u32,
    #[serde(default)]
    pub stop_minute: u32,
    /// Delay between the window opening and the first channel spawn.
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            start_hour: default_start_hour(),
            start_minute: 0,
            stop_hour: default_stop_hour(),
            stop_minute: 0,
            settle_secs: default_settle_secs(),
        }
    }
}

/// How a channel's time-range playback is served.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelKind {
    /// Recorded locally into rotated segments.
    Generic,
    /// The camera/recorder answers time-range playback itself.
    VendorProxy,
}

impl Default for ChannelKind {
    fn default() -> Self {
        ChannelKind::Generic
    }
}

/// Per-channel configuration.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChannelConfig {
    /// Unique identifier used for directory/file naming.
    pub id: String,
    /// Human-readable label shown in status output.
    pub name: String,
    /// RTSP (or HTTP) URL of the source stream.
    pub url: String,
    #[serde(default)]
    pub kind: ChannelKind,
    /// Vendor time-range playback endpoint, required for vendor-proxy.
    #[serde(default)]
    pub playback_url: Option<String>,
    /// Re-encode audio to AAC when streaming vendor playback.
    #[serde(default)]
    pub normalize_audio: bool,
}

fn default_max_storage_percent() -> f64 { 90.0 }
fn default_segment_duration() -> u64 { 300 }
fn default_eviction_poll() -> u64 { 60 }
fn default_min_clip_bytes() -> u64 { 1024 }
fn default_start_hour() -> u32 { 0 }
fn default_stop_hour() -> u32 { 0 }
fn default_settle_secs() -> u64 { 2 }

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NvrError::Config(format!("Cannot read config file: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| NvrError::Config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            return Err(NvrError::Config("No channels defined".into()));
        }
        if !(1.0..=100.0).contains(&self.storage.max_storage_percent) {
            return Err(NvrError::Config("max_storage_percent must be in 1..=100".into()));
        }
        if self.storage.segment_duration_secs == 0 {
            return Err(NvrError::Config("segment_duration_secs must be > 0".into()));
        }
        if self.schedule.start_hour > 23 || self.schedule.stop_hour > 23
            || self.schedule.start_minute > 59 || self.schedule.stop_minute > 59
        {
            return Err(NvrError::Config("schedule hours/minutes out of range".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for ch in &self.channels {
            if !seen.insert(ch.id.as_str()) {
                return Err(NvrError::Config(format!("Duplicate channel id '{}'", ch.id)));
            }
            if ch.kind == ChannelKind::VendorProxy && ch.playback_url.is_none() {
                return Err(NvrError::Config(format!(
                    "Channel '{}' is vendor-proxy but has no playback_url", ch.id
                )));
            }
        }
        Ok(())
    }

    /// Root of the date-partitioned capture tree.
    pub fn capture_dir(&self) -> PathBuf {
        self.storage.base_path.join("capture")
    }

    /// Scratch area for transient trim/extract/concat artifacts.
    pub fn scratch_dir(&self) -> PathBuf {
        self.storage.base_path.join("scratch")
    }

    /// Retention area for evidence copies.
    pub fn evidence_dir(&self) -> PathBuf {
        self.storage.base_path.join("evidence")
    }

    /// Path of the sqlite segment index.
    pub fn index_path(&self) -> PathBuf {
        self.storage.base_path.join("segments.db")
    }

    pub fn channel(&self, id: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.id == id)
    }
}
