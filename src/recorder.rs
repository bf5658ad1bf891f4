// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Channel recorder — keeps exactly one capture worker alive per channel
//! while its recording window is open, and self-heals from stalls and
//! transient errors.
//!
//! One actor task per channel owns all mutable session state; everything
//! else talks to it through [`RecorderHandle`] messages. The capture worker
//! is an external ffmpeg process writing rotated, epoch-named segments plus
//! a refreshed snapshot still. Rotation is detected from the worker's own
//! diagnostic output (see [`crate::rotation`]); on each rotation the
//! previously open file is finalized into the segment index with
//! `end = now`, so finalize happens-before the next segment's open.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Utc};
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::ChannelConfig;
use crate::error::Result;
use crate::ffmpeg;
use crate::procs::{spawn_registered, ProcessRegistry};
use crate::rotation::{self, WorkerEvent};
use crate::storage::index::SharedIndex;

/// No output activity for this long means the worker is stalled.
pub const WATCHDOG_SECS: u64 = 90;
/// Grace period between the polite shutdown signal and the force kill.
pub const STOP_GRACE_MS: u64 = 3_000;

/// Why a capture worker went down, keyed to its restart backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    /// Inactivity watchdog fired.
    Stalled,
    /// Transport/connection error reported in the worker's output.
    Transport,
    /// Expected-to-run-forever workload exited with success; anomalous.
    CleanExit,
    /// Exit code signalling a persistent upstream/protocol failure.
    Persistent,
    /// Any other unexpected exit.
    Crashed,
    /// The spawn itself failed (executable missing, etc.).
    SpawnFailed,
    /// Operator-requested restart.
    Manual,
}

impl ExitClass {
    /// Backoff before the next spawn; `None` means left stopped.
    pub fn backoff(self) -> Option<Duration> {
        match self {
            ExitClass::Stalled => Some(Duration::from_secs(2)),
            ExitClass::Transport => Some(Duration::from_secs(5)),
            ExitClass::CleanExit => Some(Duration::from_secs(30)),
            ExitClass::Persistent => None,
            ExitClass::Crashed => Some(Duration::from_secs(5)),
            ExitClass::SpawnFailed => Some(Duration::from_secs(30)),
            ExitClass::Manual => Some(Duration::from_secs(1)),
        }
    }

    /// Classify an exit status. ffmpeg exits with 8 when the input is
    /// invalid or unusable; that is treated as persistent and the channel
    /// is left stopped rather than hammering a dead upstream.
    pub fn from_exit(status: std::process::ExitStatus) -> Self {
        match status.code() {
            Some(0) => ExitClass::CleanExit,
            Some(8) => ExitClass::Persistent,
            _ => ExitClass::Crashed,
        }
    }
}

/// The currently-open, not-yet-finalized output file.
#[derive(Debug, Clone)]
pub struct OpenSegment {
    pub path: PathBuf,
    pub start_ms: i64,
}

/// Status snapshot exposed over the API.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub channel: String,
    pub state: String,
    pub is_recording: bool,
    pub pid: Option<u32>,
    pub started_at: Option<chrono::DateTime<Utc>>,
    pub uptime_secs: Option<i64>,
    pub respawn_count: u32,
    pub current_segment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StartOutcome {
    Started,
    AlreadyRecording,
}

enum RecorderCommand {
    Start { reply: oneshot::Sender<StartOutcome> },
    Stop { reply: oneshot::Sender<()> },
    Restart,
    Status { reply: oneshot::Sender<ChannelStatus> },
    OpenSegment { reply: oneshot::Sender<Option<OpenSegment>> },
    /// Stop and exit the actor (channel removal / shutdown).
    Shutdown { reply: oneshot::Sender<()> },
}

/// Handle to one channel's recorder actor.
#[derive(Clone)]
pub struct RecorderHandle {
    pub channel_id: String,
    tx: mpsc::Sender<RecorderCommand>,
}

impl RecorderHandle {
    pub async fn start(&self) -> StartOutcome {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(RecorderCommand::Start { reply }).await;
        rx.await.unwrap_or(StartOutcome::AlreadyRecording)
    }

    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(RecorderCommand::Stop { reply }).await;
        let _ = rx.await;
    }

    pub async fn restart(&self) {
        let _ = self.tx.send(RecorderCommand::Restart).await;
    }

    pub async fn status(&self) -> Option<ChannelStatus> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(RecorderCommand::Status { reply }).await;
        rx.await.ok()
    }

    pub async fn open_segment(&self) -> Option<OpenSegment> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(RecorderCommand::OpenSegment { reply }).await;
        rx.await.ok().flatten()
    }

    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(RecorderCommand::Shutdown { reply }).await;
        let _ = rx.await;
    }
}

/// Dependencies shared by all recorder actors.
#[derive(Clone)]
pub struct RecorderDeps {
    pub registry: Arc<ProcessRegistry>,
    pub index: SharedIndex,
    pub capture_root: PathBuf,
    pub segment_secs: u64,
    /// Nudges the eviction monitor after each finalize.
    pub eviction_nudge: mpsc::Sender<()>,
}

/// Spawn the actor task for one channel.
pub fn spawn_recorder(config: ChannelConfig, deps: RecorderDeps) -> RecorderHandle {
    let (tx, rx) = mpsc::channel(32);
    let handle = RecorderHandle { channel_id: config.id.clone(), tx };
    let actor = RecorderActor {
        config,
        deps,
        cmd_rx: rx,
        state: State::Idle,
        respawn_count: 0,
    };
    tokio::spawn(actor.run());
    handle
}

struct Active {
    pid: u32,
    child: Child,
    lines: mpsc::Receiver<String>,
    lines_closed: bool,
    started_at: chrono::DateTime<Utc>,
    last_activity: Instant,
    open_segment: Option<OpenSegment>,
}

enum State {
    Idle,
    Recording(Active),
    Restarting { due: Instant, class: ExitClass },
}

enum Event {
    Cmd(Option<RecorderCommand>),
    Line(Option<String>),
    Exited(std::io::Result<std::process::ExitStatus>),
    Stalled,
    RestartDue,
}

struct RecorderActor {
    config: ChannelConfig,
    deps: RecorderDeps,
    cmd_rx: mpsc::Receiver<RecorderCommand>,
    state: State,
    respawn_count: u32,
}

impl RecorderActor {
    async fn run(mut self) {
        info!(channel = self.config.id, "Recorder actor started");
        loop {
            let event = match &mut self.state {
                State::Recording(active) => {
                    let watchdog = active.last_activity + Duration::from_secs(WATCHDOG_SECS);
                    tokio::select! {
                        cmd = self.cmd_rx.recv() => Event::Cmd(cmd),
                        line = active.lines.recv(), if !active.lines_closed => Event::Line(line),
                        status = active.child.wait() => Event::Exited(status),
                        _ = tokio::time::sleep_until(watchdog) => Event::Stalled,
                    }
                }
                State::Restarting { due, .. } => {
                    let due = *due;
                    tokio::select! {
                        cmd = self.cmd_rx.recv() => Event::Cmd(cmd),
                        _ = tokio::time::sleep_until(due) => Event::RestartDue,
                    }
                }
                State::Idle => Event::Cmd(self.cmd_rx.recv().await),
            };

            match event {
                Event::Cmd(None) => {
                    // All handles dropped; shut the worker down and exit.
                    self.stop_worker().await;
                    break;
                }
                Event::Cmd(Some(cmd)) => {
                    if self.handle_command(cmd).await {
                        break;
                    }
                }
                Event::Line(Some(line)) => self.on_worker_line(&line).await,
                Event::Line(None) => {
                    // stderr closed; the exit arm will classify shortly.
                    if let State::Recording(active) = &mut self.state {
                        active.lines_closed = true;
                    }
                }
                Event::Exited(status) => self.on_worker_exit(status),
                Event::Stalled => {
                    warn!(
                        channel = self.config.id,
                        idle_secs = WATCHDOG_SECS,
                        "No worker output, treating as stalled"
                    );
                    self.stop_worker().await;
                    self.schedule_restart(ExitClass::Stalled);
                }
                Event::RestartDue => self.spawn_worker(),
            }
        }
        info!(channel = self.config.id, "Recorder actor exited");
    }

    /// Returns true when the actor should exit.
    async fn handle_command(&mut self, cmd: RecorderCommand) -> bool {
        match cmd {
            RecorderCommand::Start { reply } => {
                let outcome = if matches!(self.state, State::Recording(_)) {
                    StartOutcome::AlreadyRecording
                } else {
                    self.spawn_worker();
                    StartOutcome::Started
                };
                let _ = reply.send(outcome);
            }
            RecorderCommand::Stop { reply } => {
                self.stop_worker().await;
                self.state = State::Idle;
                let _ = reply.send(());
            }
            RecorderCommand::Restart => {
                self.respawn_count += 1;
                self.stop_worker().await;
                self.schedule_restart(ExitClass::Manual);
            }
            RecorderCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            RecorderCommand::OpenSegment { reply } => {
                let open = match &self.state {
                    State::Recording(active) => active.open_segment.clone(),
                    _ => None,
                };
                let _ = reply.send(open);
            }
            RecorderCommand::Shutdown { reply } => {
                self.stop_worker().await;
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    fn status(&self) -> ChannelStatus {
        let (state, active) = match &self.state {
            State::Idle => ("idle", None),
            State::Recording(a) => ("recording", Some(a)),
            State::Restarting { .. } => ("restarting", None),
        };
        ChannelStatus {
            channel: self.config.id.clone(),
            state: state.to_string(),
            is_recording: active.is_some(),
            pid: active.map(|a| a.pid),
            started_at: active.map(|a| a.started_at),
            uptime_secs: active.map(|a| (Utc::now() - a.started_at).num_seconds()),
            respawn_count: self.respawn_count,
            current_segment: active
                .and_then(|a| a.open_segment.as_ref())
                .map(|s| s.path.to_string_lossy().into_owned()),
        }
    }

    fn channel_dir(&self) -> PathBuf {
        self.deps.capture_root.join(&self.config.id)
    }

    /// Date-partitioned directories are created on demand: today's so the
    /// worker can open its first output, tomorrow's so a midnight rotation
    /// never races the filesystem.
    fn ensure_date_dirs(&self) -> Result<()> {
        let base = self.channel_dir();
        for day in [Utc::now(), Utc::now() + chrono::Duration::days(1)] {
            let dir = base
                .join(format!("{:04}", day.year()))
                .join(format!("{:02}", day.month()))
                .join(format!("{:02}", day.day()));
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    fn spawn_worker(&mut self) {
        if matches!(self.state, State::Recording(_)) {
            return;
        }
        if let Err(e) = self.ensure_date_dirs() {
            error!(channel = self.config.id, error = %e, "Cannot create capture directories");
            self.schedule_restart(ExitClass::SpawnFailed);
            return;
        }

        let pattern = self.channel_dir().join("%Y/%m/%d/%s.mp4");
        let snapshot = self.channel_dir().join("snapshot.jpg");
        let args = ffmpeg::capture_args(
            &self.config.url,
            &pattern,
            &snapshot,
            self.deps.segment_secs,
        );

        match spawn_registered(
            &self.deps.registry,
            "capture",
            None,
            ffmpeg::FFMPEG_BIN,
            &args,
            false,
            false,
            true,
        ) {
            Ok(worker) => {
                info!(channel = self.config.id, pid = worker.pid, "Capture worker started");
                self.state = State::Recording(Active {
                    pid: worker.pid,
                    child: worker.child,
                    lines: worker.lines.expect("forwarded lines requested"),
                    lines_closed: false,
                    started_at: Utc::now(),
                    last_activity: Instant::now(),
                    open_segment: None,
                });
            }
            Err(e) => {
                error!(channel = self.config.id, error = %e, "Capture worker spawn failed");
                self.schedule_restart(ExitClass::SpawnFailed);
            }
        }
    }

    /// Polite stop, force kill after the grace period, confirmed exit.
    /// The channel must fully stop before any restart so two writers never
    /// target the same output tree.
    async fn stop_worker(&mut self) {
        let State::Recording(mut active) =
            std::mem::replace(&mut self.state, State::Idle)
        else {
            return;
        };

        self.deps.registry.terminate(active.pid);
        let grace = Duration::from_millis(STOP_GRACE_MS);
        match tokio::time::timeout(grace, active.child.wait()).await {
            Ok(_) => {
                info!(channel = self.config.id, pid = active.pid, "Capture worker stopped");
            }
            Err(_) => {
                warn!(
                    channel = self.config.id,
                    pid = active.pid,
                    "Worker ignored shutdown signal, force-killing"
                );
                self.deps.registry.kill(active.pid);
                let _ = active.child.wait().await;
            }
        }
        self.deps.registry.unregister(active.pid);
    }

    fn schedule_restart(&mut self, class: ExitClass) {
        match class.backoff() {
            Some(backoff) => {
                info!(
                    channel = self.config.id,
                    class = ?class,
                    backoff_ms = backoff.as_millis() as u64,
                    "Restart scheduled"
                );
                self.state = State::Restarting { due: Instant::now() + backoff, class };
            }
            None => {
                error!(
                    channel = self.config.id,
                    class = ?class,
                    "Persistent failure, channel left stopped"
                );
                self.state = State::Idle;
            }
        }
    }

    async fn on_worker_line(&mut self, line: &str) {
        if let State::Recording(active) = &mut self.state {
            active.last_activity = Instant::now();
        } else {
            return;
        }

        match rotation::classify(line) {
            WorkerEvent::Rotation { path, start_ms } => self.on_rotation(path, start_ms),
            WorkerEvent::TransportError => {
                warn!(channel = self.config.id, line, "Transport error in worker output");
                self.respawn_count += 1;
                // Confirmed exit before the backoff is armed: transport
                // errors restart with their own class, but never while the
                // old writer could still touch the tree.
                self.stop_worker().await;
                self.schedule_restart(ExitClass::Transport);
            }
            WorkerEvent::Noise => {}
        }
    }

    fn on_rotation(&mut self, path: PathBuf, start_ms: i64) {
        let State::Recording(active) = &mut self.state else { return };
        let finalized = active.open_segment.replace(OpenSegment {
            path: path.clone(),
            start_ms,
        });
        info!(
            channel = self.config.id,
            segment = %path.display(),
            start_ms,
            "Segment rotation detected"
        );
        if let Some(prev) = finalized {
            let end_ms = Utc::now().timestamp_millis();
            match self.deps.index.record_segment(
                &self.config.id,
                &prev.path,
                prev.start_ms,
                end_ms,
            ) {
                Ok(_) => {
                    // Capacity check rides on every finalize.
                    let _ = self.deps.eviction_nudge.try_send(());
                }
                Err(e) => {
                    error!(
                        channel = self.config.id,
                        segment = %prev.path.display(),
                        error = %e,
                        "Failed to finalize segment into index"
                    );
                }
            }
        }
        if let Err(e) = self.ensure_date_dirs() {
            warn!(channel = self.config.id, error = %e, "Date directory refresh failed");
        }
    }

    fn on_worker_exit(&mut self, status: std::io::Result<std::process::ExitStatus>) {
        let State::Recording(active) = std::mem::replace(&mut self.state, State::Idle) else {
            return;
        };
        self.deps.registry.unregister(active.pid);

        let class = match status {
            Ok(s) => {
                let class = ExitClass::from_exit(s);
                match class {
                    ExitClass::CleanExit => warn!(
                        channel = self.config.id,
                        pid = active.pid,
                        "Worker exited cleanly while it should be recording (anomalous)"
                    ),
                    _ => warn!(
                        channel = self.config.id,
                        pid = active.pid,
                        status = %s,
                        class = ?class,
                        "Worker exited unexpectedly"
                    ),
                }
                class
            }
            Err(e) => {
                error!(channel = self.config.id, error = %e, "Worker wait failed");
                ExitClass::Crashed
            }
        };
        self.respawn_count += 1;
        self.schedule_restart(class);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_policy_per_class() {
        assert_eq!(ExitClass::Stalled.backoff(), Some(Duration::from_secs(2)));
        assert_eq!(ExitClass::Transport.backoff(), Some(Duration::from_secs(5)));
        assert_eq!(ExitClass::CleanExit.backoff(), Some(Duration::from_secs(30)));
        assert_eq!(ExitClass::Crashed.backoff(), Some(Duration::from_secs(5)));
        assert_eq!(ExitClass::SpawnFailed.backoff(), Some(Duration::from_secs(30)));
        // Persistent failures are left stopped, never auto-restarted.
        assert_eq!(ExitClass::Persistent.backoff(), None);
    }

    #[test]
    fn clean_exit_waits_the_long_backoff() {
        // A code-0 exit from an expected-to-run-forever workload restarts
        // only after the configured backoff, not immediately.
        let class = ExitClass::from_exit(exit_status(0));
        assert_eq!(class, ExitClass::CleanExit);
        assert!(class.backoff().unwrap() >= Duration::from_secs(30));
    }

    #[test]
    fn exit_codes_classify() {
        assert_eq!(ExitClass::from_exit(exit_status(8)), ExitClass::Persistent);
        assert_eq!(ExitClass::from_exit(exit_status(1)), ExitClass::Crashed);
    }

    fn exit_status(code: i32) -> std::process::ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        std::process::ExitStatus::from_raw(code << 8)
    }

    use crate::config::ChannelKind;
    use crate::procs::ProcessRegistry;
    use crate::storage::index::SegmentIndex;
    use std::process::Stdio;

    fn test_actor(state: State) -> RecorderActor {
        let (_cmd_tx, cmd_rx) = mpsc::channel(1);
        RecorderActor {
            config: ChannelConfig {
                id: "cam1".into(),
                name: "Cam".into(),
                url: "rtsp://127.0.0.1/none".into(),
                kind: ChannelKind::Generic,
                playback_url: None,
                normalize_audio: false,
            },
            deps: RecorderDeps {
                registry: ProcessRegistry::new(),
                index: SegmentIndex::open_in_memory().unwrap(),
                capture_root: std::env::temp_dir(),
                segment_secs: 300,
                eviction_nudge: mpsc::channel(1).0,
            },
            cmd_rx,
            state,
            respawn_count: 0,
        }
    }

    // Long-lived stand-in for a capture worker, in its own process group
    // like the real spawn path.
    fn fake_worker() -> Active {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", "sleep 30"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);
        let child = cmd.spawn().expect("spawn fake worker");
        let pid = child.id().expect("pid");
        let (_lines_tx, lines) = mpsc::channel(1);
        Active {
            pid,
            child,
            lines,
            lines_closed: true,
            started_at: Utc::now(),
            last_activity: Instant::now(),
            open_segment: None,
        }
    }

    #[tokio::test]
    async fn start_while_recording_is_a_noop() {
        let worker = fake_worker();
        let pid = worker.pid;
        let mut actor = test_actor(State::Recording(worker));

        let (reply, rx) = oneshot::channel();
        let exit = actor.handle_command(RecorderCommand::Start { reply }).await;
        assert!(!exit);
        assert_eq!(rx.await.unwrap(), StartOutcome::AlreadyRecording);

        let status = actor.status();
        assert!(status.is_recording);
        // The existing worker keeps writing.
        assert_eq!(status.pid, Some(pid));

        if let State::Recording(mut active) =
            std::mem::replace(&mut actor.state, State::Idle)
        {
            let _ = active.child.start_kill();
            let _ = active.child.wait().await;
        }
    }

    #[tokio::test]
    async fn transport_error_confirms_exit_before_restart() {
        let worker = fake_worker();
        let mut actor = test_actor(State::Recording(worker));

        actor.on_worker_line("[tcp @ 0x7f] Connection refused").await;

        // Returning from the line handler means the old worker was stopped
        // and reaped; only then is the transport backoff armed.
        assert!(matches!(
            actor.state,
            State::Restarting { class: ExitClass::Transport, .. }
        ));
        assert_eq!(actor.respawn_count, 1);
    }
}
