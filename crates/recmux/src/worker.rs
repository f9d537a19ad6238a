//! Worker processes and their lifecycle.
//!
//! Each spawned recorder gets one tokio task that exclusively owns the
//! child process, the framed stdin writer, and the scheduled-stop
//! deadline. The supervisor talks to it through a [`WorkerHandle`]:
//! commands travel over an mpsc queue (ordered per worker), status
//! snapshots come back over a watch channel. Stdout and stderr are
//! drained by separate reader tasks and forwarded to `tracing`; they
//! are diagnostics only and never feed control decisions.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use futures::SinkExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::FramedWrite;

use crate::protocol::{Command, CommandCodec};
use crate::schedule::StopSchedule;
use crate::supervisor::SpawnError;

/// Commands queued per worker before delivery applies backpressure.
const COMMAND_QUEUE_DEPTH: usize = 16;

/// Immutable launch descriptor for one recorder process.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    program: PathBuf,
    args: Vec<String>,
    label: String,
    interactive: bool,
    quiet: bool,
}

impl WorkerSpec {
    pub fn new(program: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            label: label.into(),
            interactive: true,
            quiet: false,
        }
    }

    /// Extra arguments appended after the control-surface flags.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Identifying label (the recorder's source id).
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn interactive(&self) -> bool {
        self.interactive
    }

    pub fn quiet(&self) -> bool {
        self.quiet
    }
}

/// Lifecycle state of one worker, as tracked by the supervisor.
///
/// A scheduled stop is not a separate state: the worker keeps
/// `Recording` with an armed deadline until the deadline fires or an
/// explicit `Stop` preempts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Process started, no command issued yet.
    Spawned,
    Recording,
    /// Recording halted; the process stays alive for further commands.
    Stopped,
    /// `Quit` sent, waiting for the process to exit.
    Terminating,
    /// Terminal: process exit observed and recorded.
    Exited,
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawned => "spawned",
            Self::Recording => "recording",
            Self::Stopped => "stopped",
            Self::Terminating => "terminating",
            Self::Exited => "exited",
        }
    }

    /// Whether this state logically accepts `command`.
    pub fn accepts(&self, command: Command) -> bool {
        match command {
            Command::Start => matches!(self, Self::Spawned | Self::Stopped),
            Command::Stop | Command::StopAfter(_) => matches!(self, Self::Recording),
            Command::Quit => !self.is_terminal(),
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a recording was last brought to a stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// An explicit `Stop` command.
    Explicit,
    /// The scheduled-stop deadline fired.
    Scheduled,
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exit observed after this supervisor sent `Quit`.
    Requested(ExitStatus),
    /// Exit without a preceding `Quit` (crash or external kill).
    Unexpected(ExitStatus),
    /// The command channel broke while the worker was still believed
    /// alive, or its exit status could not be collected. The process
    /// was killed and reaped; no status is recorded.
    ChannelLost,
}

impl ExitOutcome {
    /// Abnormal means not preceded by an observed `Quit`.
    pub fn is_abnormal(&self) -> bool {
        !matches!(self, Self::Requested(_))
    }

    pub fn status(&self) -> Option<ExitStatus> {
        match self {
            Self::Requested(status) | Self::Unexpected(status) => Some(*status),
            Self::ChannelLost => None,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested(status) => write!(f, "exited after quit ({status})"),
            Self::Unexpected(status) => write!(f, "exited unexpectedly ({status})"),
            Self::ChannelLost => f.write_str("command channel lost"),
        }
    }
}

/// Point-in-time view of one worker, published over a watch channel.
#[derive(Debug, Clone, Copy)]
pub struct WorkerStatus {
    pub state: WorkerState,
    /// How the most recent stop happened, if any.
    pub stop_kind: Option<StopKind>,
    /// Recorded exactly once, when the exit is observed.
    pub exit: Option<ExitOutcome>,
}

impl WorkerStatus {
    fn spawned() -> Self {
        Self {
            state: WorkerState::Spawned,
            stop_kind: None,
            exit: None,
        }
    }

    /// An explicit `Stop` that lost the race with its own scheduled
    /// deadline: the stop already happened, so the command is a no-op
    /// rather than an error.
    fn stop_already_scheduled(&self, command: Command) -> bool {
        command == Command::Stop
            && self.state == WorkerState::Stopped
            && self.stop_kind == Some(StopKind::Scheduled)
    }
}

/// Failure to deliver one command to one worker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// The command is not legal in the worker's current state. No state
    /// change occurs.
    #[error("{command} not accepted in state '{state}'")]
    Usage {
        command: Command,
        state: WorkerState,
    },

    /// The worker's stdin is no longer accepting data. The handle has
    /// been marked exited (abnormal); the command is not retried.
    #[error("command channel closed")]
    ChannelClosed,
}

struct CommandEnvelope {
    command: Command,
    reply: oneshot::Sender<Result<(), CommandError>>,
}

/// Supervisor-side handle to one spawned worker.
///
/// The handle never touches the stdin pipe itself; the worker task
/// owns it exclusively, so no two call sites can interleave writes.
#[derive(Debug)]
pub struct WorkerHandle {
    spec: WorkerSpec,
    pid: Option<u32>,
    cmd_tx: mpsc::Sender<CommandEnvelope>,
    status_rx: watch::Receiver<WorkerStatus>,
}

impl WorkerHandle {
    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    pub fn label(&self) -> &str {
        self.spec.label()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status_rx.borrow()
    }

    pub fn state(&self) -> WorkerState {
        self.status().state
    }

    /// Deliver one command, suspending until the worker task has
    /// applied or rejected it.
    ///
    /// The state guard runs against the last observed state first, so a
    /// command that was never legal reports `Usage` even if the worker
    /// task is already gone; `ChannelClosed` is reserved for
    /// state-legal commands whose delivery fails.
    pub async fn send(&self, command: Command) -> Result<(), CommandError> {
        let status = self.status();
        if status.stop_already_scheduled(command) {
            return Ok(());
        }
        let state = status.state;
        if !state.accepts(command) {
            return Err(CommandError::Usage { command, state });
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(CommandEnvelope {
                command,
                reply: reply_tx,
            })
            .await
            .map_err(|_| CommandError::ChannelClosed)?;
        reply_rx.await.map_err(|_| CommandError::ChannelClosed)?
    }

    pub async fn start(&self) -> Result<(), CommandError> {
        self.send(Command::Start).await
    }

    pub async fn stop(&self) -> Result<(), CommandError> {
        self.send(Command::Stop).await
    }

    pub async fn stop_after(&self, secs: u64) -> Result<(), CommandError> {
        self.send(Command::StopAfter(secs)).await
    }

    pub async fn quit(&self) -> Result<(), CommandError> {
        self.send(Command::Quit).await
    }

    /// Suspend until this worker's exit has been observed.
    pub async fn wait_exited(&self) -> ExitOutcome {
        let mut rx = self.status_rx.clone();
        match rx.wait_for(|status| status.exit.is_some()).await {
            Ok(status) => status.exit.unwrap_or(ExitOutcome::ChannelLost),
            // The worker task publishes an exit before dropping its
            // sender; a vanished task counts as a lost channel.
            Err(_) => ExitOutcome::ChannelLost,
        }
    }
}

/// Take over a freshly spawned child: capture its pipes, start the
/// worker task and the output readers, and hand back the handle.
pub(crate) fn attach(spec: WorkerSpec, mut child: Child) -> Result<WorkerHandle, SpawnError> {
    let pid = child.id();
    let label = spec.label().to_string();

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| SpawnError::pipes(&label, "stdin not captured"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SpawnError::pipes(&label, "stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| SpawnError::pipes(&label, "stderr not captured"))?;

    forward_lines(stdout, label.clone(), "out");
    forward_lines(stderr, label.clone(), "err");

    let writer = FramedWrite::new(stdin, CommandCodec::new());
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let (status_tx, status_rx) = watch::channel(WorkerStatus::spawned());

    tokio::spawn(worker_loop(label, child, writer, cmd_rx, status_tx));

    Ok(WorkerHandle {
        spec,
        pid,
        cmd_tx,
        status_rx,
    })
}

/// Drain one output stream, logging each line under the worker's label.
fn forward_lines<R>(reader: R, label: String, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::info!(target: "recmux::worker_output", %label, stream, "{line}");
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(%label, stream, error = %e, "output stream read error");
                    break;
                }
            }
        }
    });
}

struct WorkerTask {
    label: String,
    writer: FramedWrite<ChildStdin, CommandCodec>,
    status: WorkerStatus,
    status_tx: watch::Sender<WorkerStatus>,
    schedule: StopSchedule,
    quit_sent: bool,
}

impl WorkerTask {
    async fn apply(&mut self, command: Command) -> Result<(), CommandError> {
        if self.status.stop_already_scheduled(command) {
            return Ok(());
        }
        let state = self.status.state;
        if !state.accepts(command) {
            return Err(CommandError::Usage { command, state });
        }

        match command {
            Command::Start => {
                self.write(Command::Start).await?;
                self.set_state(WorkerState::Recording);
            }
            Command::Stop => {
                // Preempts any armed deadline.
                self.schedule.disarm();
                self.write(Command::Stop).await?;
                self.stopped(StopKind::Explicit);
            }
            Command::StopAfter(0) => {
                // Immediate stop, attributed to the schedule.
                self.schedule.disarm();
                self.write(Command::Stop).await?;
                self.stopped(StopKind::Scheduled);
            }
            Command::StopAfter(secs) => {
                // Arms (or replaces) the deadline; nothing goes on the
                // wire until it fires.
                self.schedule.arm(secs);
                tracing::debug!(label = %self.label, secs, "stop scheduled");
            }
            Command::Quit => {
                self.schedule.disarm();
                self.write(Command::Quit).await?;
                self.quit_sent = true;
                self.set_state(WorkerState::Terminating);
            }
        }
        Ok(())
    }

    async fn deadline_fired(&mut self) {
        self.schedule.disarm();
        if self.status.state != WorkerState::Recording {
            // Stale expiry on an advanced handle.
            return;
        }
        tracing::debug!(label = %self.label, "scheduled stop firing");
        if self.write(Command::Stop).await.is_ok() {
            self.stopped(StopKind::Scheduled);
        }
    }

    async fn write(&mut self, command: Command) -> Result<(), CommandError> {
        if let Err(e) = self.writer.send(command).await {
            tracing::warn!(
                label = %self.label,
                error = %e,
                "stdin write failed, marking worker exited"
            );
            self.schedule.disarm();
            self.status.exit = Some(ExitOutcome::ChannelLost);
            self.set_state(WorkerState::Exited);
            return Err(CommandError::ChannelClosed);
        }
        Ok(())
    }

    fn stopped(&mut self, kind: StopKind) {
        self.status.stop_kind = Some(kind);
        self.set_state(WorkerState::Stopped);
    }

    fn record_exit(&mut self, status: io::Result<ExitStatus>) {
        let outcome = match status {
            Ok(status) if self.quit_sent => ExitOutcome::Requested(status),
            Ok(status) => ExitOutcome::Unexpected(status),
            Err(e) => {
                tracing::warn!(label = %self.label, error = %e, "failed to collect exit status");
                ExitOutcome::ChannelLost
            }
        };
        self.schedule.disarm();
        self.status.exit = Some(outcome);
        self.set_state(WorkerState::Exited);
        tracing::info!(label = %self.label, %outcome, "worker exited");
    }

    fn set_state(&mut self, state: WorkerState) {
        self.status.state = state;
        let _ = self.status_tx.send(self.status);
    }
}

/// Event loop owning one child process end to end.
///
/// `biased` keeps command handling ahead of timer expiry and exit
/// observation, preserving issue order from the supervisor's view.
async fn worker_loop(
    label: String,
    mut child: Child,
    writer: FramedWrite<ChildStdin, CommandCodec>,
    mut cmd_rx: mpsc::Receiver<CommandEnvelope>,
    status_tx: watch::Sender<WorkerStatus>,
) {
    let mut task = WorkerTask {
        label,
        writer,
        status: WorkerStatus::spawned(),
        status_tx,
        schedule: StopSchedule::new(),
        quit_sent: false,
    };
    let mut commands_open = true;

    loop {
        tokio::select! {
            biased;

            envelope = cmd_rx.recv(), if commands_open => {
                match envelope {
                    Some(CommandEnvelope { command, reply }) => {
                        let result = task.apply(command).await;
                        let _ = reply.send(result);
                        if task.status.state.is_terminal() {
                            break;
                        }
                    }
                    // All handles dropped; stay alive to reap the child.
                    None => commands_open = false,
                }
            }

            () = task.schedule.expired(), if task.schedule.is_armed() => {
                task.deadline_fired().await;
                if task.status.state.is_terminal() {
                    break;
                }
            }

            status = child.wait() => {
                task.record_exit(status);
                break;
            }
        }
    }

    if matches!(task.status.exit, Some(ExitOutcome::ChannelLost)) {
        // A process we can no longer command must not be left orphaned.
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}
