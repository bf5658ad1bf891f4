//! Configuration loading and validation tests.

use std::io::Write;

use argus::config::{ChannelKind, Config};

fn write_config(toml: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(toml.as_bytes()).expect("write config");
    file
}

const MINIMAL: &str = r#"
[storage]
base_path = "/var/lib/argus"

[[channels]]
id = "cam1"
name = "Entrance"
url = "rtsp://10.0.0.10/stream1"
"#;

#[test]
fn test_minimal_config_gets_defaults() {
    let file = write_config(MINIMAL);
    let cfg = Config::from_file(file.path()).expect("load");

    assert_eq!(cfg.storage.max_storage_percent, 90.0);
    assert_eq!(cfg.storage.segment_duration_secs, 300);
    assert_eq!(cfg.schedule.start_hour, 0);
    assert_eq!(cfg.schedule.stop_hour, 0);
    assert!(cfg.api.enabled);
    assert_eq!(cfg.api.port, 8080);

    assert_eq!(cfg.channels.len(), 1);
    let ch = cfg.channel("cam1").expect("channel");
    assert_eq!(ch.kind, ChannelKind::Generic);
    assert!(!ch.normalize_audio);

    assert_eq!(cfg.capture_dir(), std::path::Path::new("/var/lib/argus/capture"));
    assert_eq!(cfg.index_path(), std::path::Path::new("/var/lib/argus/segments.db"));
}

#[test]
fn test_vendor_channel_parses() {
    let file = write_config(
        r#"
[storage]
base_path = "/data"

[schedule]
start_hour = 7
start_minute = 30
stop_hour = 23

[[channels]]
id = "lobby"
name = "Lobby DVR"
url = "rtsp://10.0.0.20/live"
kind = "vendor-proxy"
playback_url = "http://10.0.0.20/api/playback"
normalize_audio = true
"#,
    );
    let cfg = Config::from_file(file.path()).expect("load");
    assert_eq!(cfg.schedule.start_hour, 7);
    assert_eq!(cfg.schedule.start_minute, 30);
    let ch = cfg.channel("lobby").expect("channel");
    assert_eq!(ch.kind, ChannelKind::VendorProxy);
    assert!(ch.normalize_audio);
}

#[test]
fn test_duplicate_channel_ids_rejected() {
    let file = write_config(
        r#"
[storage]
base_path = "/data"

[[channels]]
id = "cam1"
name = "A"
url = "rtsp://a"

[[channels]]
id = "cam1"
name = "B"
url = "rtsp://b"
"#,
    );
    let err = Config::from_file(file.path()).expect_err("duplicate ids");
    assert!(err.to_string().contains("cam1"));
}

#[test]
fn test_vendor_without_playback_url_rejected() {
    let file = write_config(
        r#"
[storage]
base_path = "/data"

[[channels]]
id = "lobby"
name = "Lobby"
url = "rtsp://a"
kind = "vendor-proxy"
"#,
    );
    assert!(Config::from_file(file.path()).is_err());
}

#[test]
fn test_no_channels_rejected() {
    let file = write_config("[storage]\nbase_path = \"/data\"\nchannels = []\n");
    assert!(Config::from_file(file.path()).is_err());
}

#[test]
fn test_out_of_range_schedule_rejected() {
    let file = write_config(
        r#"
[storage]
base_path = "/data"

[schedule]
start_hour = 24

[[channels]]
id = "cam1"
name = "A"
url = "rtsp://a"
"#,
    );
    assert!(Config::from_file(file.path()).is_err());
}
