//! recmux: supervisor for multi-stream recorder processes.
//!
//! Spawns one recorder process per stream, drives each lifecycle over a
//! line-based stdin protocol, and coordinates non-blocking shutdown.

pub mod protocol;
pub mod schedule;
pub mod supervisor;
pub mod worker;

pub use protocol::{Command, CommandCodec, ProtocolError};
pub use schedule::StopSchedule;
pub use supervisor::{
    BroadcastResult, ExitReport, RecorderSpawner, SpawnError, Supervisor, WorkerExit,
    WorkerOutcome, WorkerSpawner,
};
pub use worker::{
    CommandError, ExitOutcome, StopKind, WorkerHandle, WorkerSpec, WorkerState, WorkerStatus,
};
