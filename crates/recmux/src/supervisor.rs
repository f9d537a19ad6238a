//! Supervisor — spawns workers, fans out commands, drives shutdown.
//!
//! The supervisor orchestrates intent, not simultaneity: workers are
//! independent processes and commands fan out concurrently with
//! per-target results. One worker's broken pipe never blocks or fails
//! delivery to its siblings.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use futures::future::join_all;
use tokio::process::{Child, Command as ProcessCommand};

use crate::protocol::Command;
use crate::worker::{
    self, CommandError, ExitOutcome, StopKind, WorkerHandle, WorkerSpec, WorkerState,
};

/// A recorder process could not be launched.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn recorder '{label}': {source}")]
    Launch {
        label: String,
        #[source]
        source: io::Error,
    },

    #[error("recorder '{label}': {reason}")]
    Pipes { label: String, reason: &'static str },
}

impl SpawnError {
    pub(crate) fn pipes(label: &str, reason: &'static str) -> Self {
        Self::Pipes {
            label: label.to_string(),
            reason,
        }
    }
}

/// Extension point for different worker launch strategies.
///
/// The default [`RecorderSpawner`] runs the recorder executable with
/// its interactive-control argument surface; tests substitute stub
/// processes.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, spec: &WorkerSpec) -> Result<Child, SpawnError>;
}

/// Launches the recorder binary named by the spec.
pub struct RecorderSpawner;

impl WorkerSpawner for RecorderSpawner {
    fn spawn(&self, spec: &WorkerSpec) -> Result<Child, SpawnError> {
        let mut command = ProcessCommand::new(spec.program());
        if spec.interactive() {
            command.arg("--interactive");
        }
        command.arg("--source-id").arg(spec.label());
        if spec.quiet() {
            command.arg("--quiet");
        }
        command
            .args(spec.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SpawnError::Launch {
                label: spec.label().to_string(),
                source,
            })
    }
}

/// Per-target outcome of a broadcast.
#[derive(Debug)]
pub struct BroadcastResult {
    pub label: String,
    pub result: Result<(), CommandError>,
}

/// One worker's line in the aggregated exit report.
#[derive(Debug, Clone)]
pub struct WorkerExit {
    pub label: String,
    pub stop_kind: Option<StopKind>,
    pub outcome: WorkerOutcome,
}

/// Either an observed exit or a worker still running when the wait
/// deadline passed. Still-running is not an error: the caller decides
/// whether to escalate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    Exited(ExitOutcome),
    StillRunning(WorkerState),
}

/// Aggregated view of every worker at the end of waiting.
#[derive(Debug)]
pub struct ExitReport {
    pub workers: Vec<WorkerExit>,
}

impl ExitReport {
    pub fn all_exited(&self) -> bool {
        self.workers
            .iter()
            .all(|w| matches!(w.outcome, WorkerOutcome::Exited(_)))
    }

    pub fn still_running(&self) -> impl Iterator<Item = &WorkerExit> {
        self.workers
            .iter()
            .filter(|w| matches!(w.outcome, WorkerOutcome::StillRunning(_)))
    }
}

/// Owns the complete set of worker handles for one orchestration
/// session.
#[derive(Debug)]
pub struct Supervisor {
    handles: Vec<WorkerHandle>,
}

impl Supervisor {
    /// Launch one worker per spec, in spec order, with the default
    /// recorder spawner.
    pub async fn spawn(specs: Vec<WorkerSpec>) -> Result<Self, SpawnError> {
        Self::spawn_with(specs, &RecorderSpawner).await
    }

    /// Launch one worker per spec, in spec order. If any launch fails,
    /// the already-running workers are sent `Quit` and awaited before
    /// the error is surfaced, so a partial spawn never leaves
    /// uncontrolled processes behind.
    pub async fn spawn_with(
        specs: Vec<WorkerSpec>,
        spawner: &dyn WorkerSpawner,
    ) -> Result<Self, SpawnError> {
        let mut handles = Vec::with_capacity(specs.len());
        for spec in specs {
            let label = spec.label().to_string();
            let attached = spawner
                .spawn(&spec)
                .and_then(|child| worker::attach(spec, child));
            match attached {
                Ok(handle) => {
                    tracing::info!(%label, pid = ?handle.pid(), "worker spawned");
                    handles.push(handle);
                }
                Err(e) => {
                    tracing::error!(%label, error = %e, "spawn failed, rolling back siblings");
                    let partial = Supervisor { handles };
                    let _ = partial.shutdown(None).await;
                    return Err(e);
                }
            }
        }
        Ok(Self { handles })
    }

    pub fn handles(&self) -> &[WorkerHandle] {
        &self.handles
    }

    pub fn handle(&self, label: &str) -> Option<&WorkerHandle> {
        self.handles.iter().find(|h| h.label() == label)
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Send `command` to each target concurrently, collecting one
    /// result per target. Failures never abort delivery to the rest.
    pub async fn broadcast(
        &self,
        command: Command,
        targets: &[&WorkerHandle],
    ) -> Vec<BroadcastResult> {
        let sends = targets.iter().map(|handle| async move {
            let result = handle.send(command).await;
            if let Err(ref e) = result {
                tracing::warn!(label = %handle.label(), %command, error = %e, "delivery failed");
            }
            BroadcastResult {
                label: handle.label().to_string(),
                result,
            }
        });
        join_all(sends).await
    }

    /// Broadcast to every worker in the session.
    pub async fn broadcast_all(&self, command: Command) -> Vec<BroadcastResult> {
        let targets: Vec<&WorkerHandle> = self.handles.iter().collect();
        self.broadcast(command, &targets).await
    }

    /// Suspend until every worker has exited, or until `timeout`
    /// elapses.
    ///
    /// All workers are awaited concurrently. Waiting is read-only: on
    /// timeout no command is sent, and workers without an observed exit
    /// are reported as still running.
    pub async fn await_all_exited(&self, timeout: Option<Duration>) -> ExitReport {
        let wait_all = join_all(self.handles.iter().map(WorkerHandle::wait_exited));

        match timeout {
            None => {
                let _ = wait_all.await;
            }
            Some(limit) => {
                if tokio::time::timeout(limit, wait_all).await.is_err() {
                    tracing::warn!(?limit, "wait deadline passed with workers still running");
                }
            }
        }

        ExitReport {
            workers: self
                .handles
                .iter()
                .map(|handle| {
                    let status = handle.status();
                    WorkerExit {
                        label: handle.label().to_string(),
                        stop_kind: status.stop_kind,
                        outcome: match status.exit {
                            Some(exit) => WorkerOutcome::Exited(exit),
                            None => WorkerOutcome::StillRunning(status.state),
                        },
                    }
                })
                .collect(),
        }
    }

    /// Quit every worker, then wait for all of them to exit.
    pub async fn shutdown(&self, timeout: Option<Duration>) -> ExitReport {
        self.broadcast_all(Command::Quit).await;
        self.await_all_exited(timeout).await
    }
}
