// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Schedule controller — drives every channel recorder through the daily
//! recording window and serves out-of-band start/stop/restart requests.
//!
//! One actor owns the channel → recorder map. A single boundary timer per
//! state (next start or next stop) keeps the at-most-one-pending-stop
//! invariant by construction. `start == stop` means the window never
//! closes. Wall-clock times are UTC.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Timelike, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::config::{ChannelConfig, ScheduleConfig};
use crate::recorder::{
    spawn_recorder, ChannelStatus, OpenSegment, RecorderDeps, RecorderHandle, StartOutcome,
};

/// Milliseconds until the next occurrence of `hour:minute`, rolling to
/// tomorrow when already past today.
pub fn next_boundary_delay(now: DateTime<Utc>, hour: u32, minute: u32) -> Duration {
    let today = now
        .date_naive()
        .and_hms_opt(hour, minute, 0)
        .expect("validated hh:mm");
    let mut boundary = Utc.from_utc_datetime(&today);
    if boundary <= now {
        boundary += chrono::Duration::days(1);
    }
    (boundary - now).to_std().unwrap_or(Duration::ZERO)
}

/// Whether `now` falls inside the daily window, handling windows that wrap
/// midnight. `start == stop` is always-in-window.
pub fn in_window_at(now: DateTime<Utc>, sched: &ScheduleConfig) -> bool {
    let start = sched.start_hour * 60 + sched.start_minute;
    let stop = sched.stop_hour * 60 + sched.stop_minute;
    if start == stop {
        return true;
    }
    let cur = now.hour() * 60 + now.minute();
    if start < stop {
        (start..stop).contains(&cur)
    } else {
        cur >= start || cur < stop
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StartChannelOutcome {
    Started,
    AlreadyRecording,
    OutsideWindow,
}

enum SchedulerCommand {
    StartChannel { config: ChannelConfig, reply: oneshot::Sender<StartChannelOutcome> },
    StopChannel { id: String, reply: oneshot::Sender<bool> },
    RestartAll { reply: oneshot::Sender<()> },
    Status { id: String, reply: oneshot::Sender<Option<ChannelStatus>> },
    StatusAll { reply: oneshot::Sender<Vec<ChannelStatus>> },
    OpenSegment { id: String, reply: oneshot::Sender<Option<OpenSegment>> },
    Shutdown { reply: oneshot::Sender<()> },
}

#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    pub async fn start_channel(&self, config: ChannelConfig) -> StartChannelOutcome {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(SchedulerCommand::StartChannel { config, reply }).await;
        rx.await.unwrap_or(StartChannelOutcome::OutsideWindow)
    }

    pub async fn stop_channel(&self, id: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(SchedulerCommand::StopChannel { id: id.to_string(), reply })
            .await;
        rx.await.unwrap_or(false)
    }

    pub async fn restart_all(&self) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(SchedulerCommand::RestartAll { reply }).await;
        let _ = rx.await;
    }

    pub async fn status(&self, id: &str) -> Option<ChannelStatus> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(SchedulerCommand::Status { id: id.to_string(), reply })
            .await;
        rx.await.ok().flatten()
    }

    pub async fn status_all(&self) -> Vec<ChannelStatus> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(SchedulerCommand::StatusAll { reply }).await;
        rx.await.unwrap_or_default()
    }

    pub async fn open_segment(&self, id: &str) -> Option<OpenSegment> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(SchedulerCommand::OpenSegment { id: id.to_string(), reply })
            .await;
        rx.await.ok().flatten()
    }

    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(SchedulerCommand::Shutdown { reply }).await;
        let _ = rx.await;
    }
}

/// Spawn the scheduler actor with one recorder actor per configured channel.
pub fn spawn_scheduler(
    channels: Vec<ChannelConfig>,
    schedule: ScheduleConfig,
    scratch_dir: PathBuf,
    deps: RecorderDeps,
) -> SchedulerHandle {
    let (tx, rx) = mpsc::channel(32);
    let mut recorders = HashMap::new();
    for ch in channels {
        let handle = spawn_recorder(ch.clone(), deps.clone());
        recorders.insert(ch.id.clone(), (ch, handle));
    }
    let actor = SchedulerActor {
        recorders,
        schedule,
        scratch_dir,
        deps,
        cmd_rx: rx,
        in_window: false,
    };
    tokio::spawn(actor.run());
    SchedulerHandle { tx }
}

struct SchedulerActor {
    recorders: HashMap<String, (ChannelConfig, RecorderHandle)>,
    schedule: ScheduleConfig,
    scratch_dir: PathBuf,
    deps: RecorderDeps,
    cmd_rx: mpsc::Receiver<SchedulerCommand>,
    in_window: bool,
}

impl SchedulerActor {
    async fn run(mut self) {
        if in_window_at(Utc::now(), &self.schedule) {
            self.enter_window().await;
        } else {
            info!(
                start = format!("{:02}:{:02}", self.schedule.start_hour, self.schedule.start_minute),
                "Outside recording window at startup"
            );
        }

        loop {
            let boundary = self.next_boundary();
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None => break,
                        Some(cmd) => {
                            if self.handle_command(cmd).await {
                                break;
                            }
                        }
                    }
                }
                // An always-open window has no boundary; the arm is disabled
                // so the timer can never toggle it closed.
                _ = tokio::time::sleep(boundary), if !self.always_open() => {
                    if self.in_window {
                        self.close_window().await;
                    } else {
                        self.enter_window().await;
                    }
                }
            }
        }
        info!("Scheduler exited");
    }

    fn always_open(&self) -> bool {
        self.schedule.start_hour == self.schedule.stop_hour
            && self.schedule.start_minute == self.schedule.stop_minute
    }

    fn next_boundary(&self) -> Duration {
        if self.always_open() {
            // Never polled; the boundary arm is disabled for this case.
            return Duration::from_secs(24 * 3600);
        }
        if self.in_window {
            next_boundary_delay(Utc::now(), self.schedule.stop_hour, self.schedule.stop_minute)
        } else {
            next_boundary_delay(Utc::now(), self.schedule.start_hour, self.schedule.start_minute)
        }
    }

    async fn enter_window(&mut self) {
        self.in_window = true;
        self.purge_scratch();
        tokio::time::sleep(Duration::from_secs(self.schedule.settle_secs)).await;
        info!(channels = self.recorders.len(), "Recording window open, starting all channels");
        for (_, handle) in self.recorders.values() {
            handle.start().await;
        }
    }

    async fn close_window(&mut self) {
        self.in_window = false;
        info!("Recording window closed, stopping all channels");
        for (_, handle) in self.recorders.values() {
            handle.stop().await;
        }
        let _ = self.deps.eviction_nudge.try_send(());
    }

    /// Leftover transient artifacts from interrupted retrievals.
    fn purge_scratch(&self) {
        let Ok(entries) = std::fs::read_dir(&self.scratch_dir) else { return };
        let mut purged = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() && std::fs::remove_file(&path).is_ok() {
                purged += 1;
            }
        }
        if purged > 0 {
            info!(purged, "Purged leftover scratch files");
        }
    }

    /// Returns true when the actor should exit.
    async fn handle_command(&mut self, cmd: SchedulerCommand) -> bool {
        match cmd {
            SchedulerCommand::StartChannel { config, reply } => {
                let outcome = self.start_channel(config).await;
                let _ = reply.send(outcome);
            }
            SchedulerCommand::StopChannel { id, reply } => {
                let found = match self.recorders.get(&id) {
                    Some((_, handle)) => {
                        handle.stop().await;
                        true
                    }
                    None => false,
                };
                let _ = reply.send(found);
            }
            SchedulerCommand::RestartAll { reply } => {
                info!("Restarting all channels (global capture parameter change)");
                for (_, handle) in self.recorders.values() {
                    handle.restart().await;
                }
                let _ = reply.send(());
            }
            SchedulerCommand::Status { id, reply } => {
                let status = match self.recorders.get(&id) {
                    Some((_, handle)) => handle.status().await,
                    None => None,
                };
                let _ = reply.send(status);
            }
            SchedulerCommand::StatusAll { reply } => {
                let mut all = Vec::with_capacity(self.recorders.len());
                for (_, handle) in self.recorders.values() {
                    if let Some(s) = handle.status().await {
                        all.push(s);
                    }
                }
                all.sort_by(|a, b| a.channel.cmp(&b.channel));
                let _ = reply.send(all);
            }
            SchedulerCommand::OpenSegment { id, reply } => {
                let open = match self.recorders.get(&id) {
                    Some((_, handle)) => handle.open_segment().await,
                    None => None,
                };
                let _ = reply.send(open);
            }
            SchedulerCommand::Shutdown { reply } => {
                for (_, handle) in self.recorders.values() {
                    handle.shutdown().await;
                }
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    /// Add or replace a channel outside the window transition. Replacing
    /// fully stops the old session before the new one may write.
    async fn start_channel(&mut self, config: ChannelConfig) -> StartChannelOutcome {
        if !self.in_window {
            warn!(channel = config.id, "Start requested outside recording window");
            return StartChannelOutcome::OutsideWindow;
        }
        let id = config.id.clone();
        let replaced = match self.recorders.remove(&id) {
            Some((old_cfg, old_handle)) => {
                if old_cfg.url == config.url && old_cfg.kind == config.kind {
                    // Unchanged config: plain idempotent start.
                    let outcome = old_handle.start().await;
                    self.recorders.insert(id, (old_cfg, old_handle));
                    return match outcome {
                        StartOutcome::Started => StartChannelOutcome::Started,
                        StartOutcome::AlreadyRecording => StartChannelOutcome::AlreadyRecording,
                    };
                }
                old_handle.shutdown().await;
                true
            }
            None => false,
        };
        if replaced {
            info!(channel = id, "Channel config replaced, old session stopped");
        }
        let handle = spawn_recorder(config.clone(), self.deps.clone());
        handle.start().await;
        self.recorders.insert(id, (config, handle));
        StartChannelOutcome::Started
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sched(sh: u32, sm: u32, eh: u32, em: u32) -> ScheduleConfig {
        ScheduleConfig {
            start_hour: sh,
            start_minute: sm,
            stop_hour: eh,
            stop_minute: em,
            settle_secs: 0,
        }
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 23, h, m, s).unwrap()
    }

    #[test]
    fn boundary_later_today() {
        let now = at(10, 0, 0);
        let d = next_boundary_delay(now, 18, 30);
        assert_eq!(d, Duration::from_secs(8 * 3600 + 30 * 60));
    }

    #[test]
    fn boundary_rolls_to_tomorrow() {
        let now = at(19, 0, 0);
        let d = next_boundary_delay(now, 18, 30);
        assert_eq!(d, Duration::from_secs(23 * 3600 + 30 * 60));
    }

    #[test]
    fn boundary_exactly_now_rolls_over() {
        let now = at(18, 30, 0);
        let d = next_boundary_delay(now, 18, 30);
        assert_eq!(d, Duration::from_secs(24 * 3600));
    }

    #[test]
    fn window_normal_hours() {
        let s = sched(8, 0, 20, 0);
        assert!(!in_window_at(at(7, 59, 59), &s));
        assert!(in_window_at(at(8, 0, 0), &s));
        assert!(in_window_at(at(19, 59, 0), &s));
        assert!(!in_window_at(at(20, 0, 0), &s));
    }

    #[test]
    fn window_wrapping_midnight() {
        let s = sched(22, 0, 6, 0);
        assert!(in_window_at(at(23, 0, 0), &s));
        assert!(in_window_at(at(3, 0, 0), &s));
        assert!(!in_window_at(at(12, 0, 0), &s));
    }

    #[test]
    fn equal_start_stop_is_always_open() {
        let s = sched(0, 0, 0, 0);
        assert!(in_window_at(at(0, 0, 0), &s));
        assert!(in_window_at(at(13, 37, 0), &s));
    }

    #[tokio::test(start_paused = true)]
    async fn always_open_window_survives_day_rollover() {
        use crate::config::{ChannelConfig, ChannelKind};
        use crate::procs::ProcessRegistry;
        use crate::storage::index::SegmentIndex;

        let dir = tempfile::tempdir().unwrap();
        let deps = RecorderDeps {
            registry: ProcessRegistry::new(),
            index: SegmentIndex::open_in_memory().unwrap(),
            capture_root: dir.path().join("capture"),
            segment_secs: 300,
            eviction_nudge: tokio::sync::mpsc::channel(1).0,
        };
        let handle =
            spawn_scheduler(Vec::new(), sched(0, 0, 0, 0), dir.path().join("scratch"), deps);

        // More than a full day passes; no boundary may toggle the window.
        tokio::time::advance(Duration::from_secs(25 * 3600)).await;

        let outcome = handle
            .start_channel(ChannelConfig {
                id: "cam1".into(),
                name: "Cam".into(),
                url: "rtsp://127.0.0.1/none".into(),
                kind: ChannelKind::Generic,
                playback_url: None,
                normalize_audio: false,
            })
            .await;
        assert_eq!(outcome, StartChannelOutcome::Started);

        handle.shutdown().await;
    }
}
