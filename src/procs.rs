// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Process registry — every spawned external worker is observable and
//! killable.
//!
//! Each worker (capture/extract/trim/concat/stream/transmux) is registered
//! at spawn with a context tag, its rendered command line, a start time, an
//! optional stream session id, and a bounded rolling stderr log. Workers are
//! placed in their own process group so a kill takes the whole tree.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{NvrError, Result};

/// Rolling log depth per worker.
const LOG_CAPACITY: usize = 200;

struct Entry {
    context: String,
    command: String,
    started_at: DateTime<Utc>,
    session_id: Option<String>,
    log: VecDeque<String>,
}

/// Serializable snapshot of one registered worker.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub context: String,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub session_id: Option<String>,
}

/// Registry of all live external workers, keyed by pid.
#[derive(Default)]
pub struct ProcessRegistry {
    entries: RwLock<HashMap<u32, Entry>>,
}

impl ProcessRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(
        &self,
        pid: u32,
        context: &str,
        command: String,
        session_id: Option<String>,
    ) {
        self.entries.write().insert(
            pid,
            Entry {
                context: context.to_string(),
                command,
                started_at: Utc::now(),
                session_id,
                log: VecDeque::with_capacity(LOG_CAPACITY),
            },
        );
        debug!(pid, context, "Worker registered");
    }

    pub fn unregister(&self, pid: u32) {
        if self.entries.write().remove(&pid).is_some() {
            debug!(pid, "Worker unregistered");
        }
    }

    pub fn append_log(&self, pid: u32, line: String) {
        if let Some(entry) = self.entries.write().get_mut(&pid) {
            if entry.log.len() == LOG_CAPACITY {
                entry.log.pop_front();
            }
            entry.log.push_back(line);
        }
    }

    pub fn list_all(&self) -> Vec<ProcessInfo> {
        self.entries
            .read()
            .iter()
            .map(|(pid, e)| ProcessInfo {
                pid: *pid,
                context: e.context.clone(),
                command: e.command.clone(),
                started_at: e.started_at,
                session_id: e.session_id.clone(),
            })
            .collect()
    }

    pub fn log_tail(&self, pid: u32) -> Option<Vec<String>> {
        self.entries
            .read()
            .get(&pid)
            .map(|e| e.log.iter().cloned().collect())
    }

    /// Polite shutdown signal to the worker's process group.
    pub fn terminate(&self, pid: u32) {
        signal_group(pid, Signal::SIGTERM);
    }

    /// Force-kill the worker's process group and drop its entry.
    pub fn kill(&self, pid: u32) {
        signal_group(pid, Signal::SIGKILL);
        self.unregister(pid);
    }

    /// Force-kill every stream worker owned by `session_id`.
    ///
    /// Enforces single-active-stream-per-session: a new stream request kills
    /// the session's prior stream before producing output.
    pub fn kill_session_streams(&self, session_id: &str) -> usize {
        let victims: Vec<u32> = self
            .entries
            .read()
            .iter()
            .filter(|(_, e)| e.session_id.as_deref() == Some(session_id))
            .map(|(pid, _)| *pid)
            .collect();
        for pid in &victims {
            warn!(pid, session = session_id, "Killing superseded session stream");
            self.kill(*pid);
        }
        victims.len()
    }
}

fn signal_group(pid: u32, sig: Signal) {
    // pgid == pid: workers are spawned with process_group(0).
    if let Err(e) = killpg(Pid::from_raw(pid as i32), sig) {
        debug!(pid, signal = %sig, error = %e, "Signal delivery failed (already gone?)");
    }
}

/// A spawned, registered worker.
pub struct SpawnedWorker {
    pub pid: u32,
    pub child: Child,
    /// stderr lines, present when the caller asked to observe them.
    pub lines: Option<mpsc::Receiver<String>>,
}

/// Spawn an external worker under registry observation.
///
/// stderr is always piped and pumped into the rolling log; when
/// `forward_lines` is set the same lines are also delivered to the caller
/// (the channel recorder consumes them for rotation detection and the
/// inactivity watchdog). `pipe_stdout` is used by streaming workers,
/// `pipe_stdin` by the transmux worker fed from an upstream body.
pub fn spawn_registered(
    registry: &Arc<ProcessRegistry>,
    context: &str,
    session_id: Option<String>,
    program: &str,
    args: &[String],
    pipe_stdin: bool,
    pipe_stdout: bool,
    forward_lines: bool,
) -> Result<SpawnedWorker> {
    let rendered = format!("{program} {}", args.join(" "));

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if pipe_stdin { Stdio::piped() } else { Stdio::null() })
        .stdout(if pipe_stdout { Stdio::piped() } else { Stdio::null() })
        .stderr(Stdio::piped())
        .process_group(0);

    let mut child = cmd.spawn().map_err(|e| NvrError::Spawn {
        command: rendered.clone(),
        reason: e.to_string(),
    })?;

    let pid = child.id().ok_or_else(|| NvrError::Spawn {
        command: rendered.clone(),
        reason: "child exited before pid was available".into(),
    })?;

    registry.register(pid, context, rendered, session_id);

    let stderr = child.stderr.take();
    let (tx, rx) = mpsc::channel::<String>(256);
    let reg = registry.clone();
    tokio::spawn(async move {
        let Some(stderr) = stderr else { return };
        let mut lines = BufReader::new(stderr).lines();
        let mut forward: Option<mpsc::Sender<String>> =
            if forward_lines { Some(tx) } else { None };
        while let Ok(Some(line)) = lines.next_line().await {
            reg.append_log(pid, line.clone());
            if let Some(fwd) = &forward {
                if fwd.send(line).await.is_err() {
                    forward = None;
                }
            }
        }
    });

    Ok(SpawnedWorker {
        pid,
        child,
        lines: if forward_lines { Some(rx) } else { None },
    })
}

/// Kills a worker's process tree (and drops its registry entry) when the
/// owner goes away — stream bodies hold one so a client disconnect takes
/// the assembling pipeline down with it.
pub struct KillOnDrop {
    registry: Arc<ProcessRegistry>,
    pid: u32,
    _child: Child,
}

impl KillOnDrop {
    pub fn new(registry: Arc<ProcessRegistry>, pid: u32, child: Child) -> Self {
        Self { registry, pid, _child: child }
    }
}

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        self.registry.kill(self.pid);
    }
}

/// Spawn a one-shot worker, wait for it, and unregister it.
///
/// Used for trims, extractions, and file-mode concatenation. A nonzero exit
/// surfaces as [`NvrError::Assembly`] with the tail of the worker's log.
pub async fn run_worker(
    registry: &Arc<ProcessRegistry>,
    context: &str,
    program: &str,
    args: &[String],
) -> Result<()> {
    let mut worker =
        spawn_registered(registry, context, None, program, args, false, false, false)?;
    let status = worker.child.wait().await;
    let tail = registry
        .log_tail(worker.pid)
        .unwrap_or_default()
        .into_iter()
        .rev()
        .take(5)
        .collect::<Vec<_>>();
    registry.unregister(worker.pid);

    match status {
        Ok(s) if s.success() => Ok(()),
        Ok(s) => Err(NvrError::Assembly(format!(
            "{context} exited with {s}: {}",
            tail.join(" | ")
        ))),
        Err(e) => Err(NvrError::Assembly(format!("{context} wait failed: {e}"))),
    }
}
