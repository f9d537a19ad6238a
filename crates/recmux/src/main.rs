//! recmux — unified controller for multiple recorder processes.
//!
//! Spawns one recorder per source id, forwards operator commands typed
//! on stdin to every recorder, and reports each worker's exit when the
//! session ends.
//!
//! ```bash
//! recmux --source-ids EMG_1234 EEG_5678 \
//!        --stream-names EMG EEG \
//!        --output experiment --subject P001
//! ```
//!
//! Interactive commands: `START`, `STOP`, `STOP_AFTER <seconds>`,
//! `QUIT`.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use recmux::{Command, Supervisor, WorkerSpec};

#[derive(Debug, Parser)]
#[command(name = "recmux")]
#[command(about = "Record multiple streams simultaneously with unified control")]
struct Args {
    /// Stream source ids to record, one recorder process each.
    #[arg(long, required = true, num_args = 1..)]
    source_ids: Vec<String>,

    /// Custom stream names; must match the source id count if given.
    #[arg(long, num_args = 0..)]
    stream_names: Option<Vec<String>>,

    /// Experiment base path handed to each recorder.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,

    /// Subject identifier for recording metadata.
    #[arg(long)]
    subject: Option<String>,

    /// Session identifier for recording metadata.
    #[arg(long)]
    session_id: Option<String>,

    /// Notes for recording metadata.
    #[arg(long)]
    notes: Option<String>,

    /// Path to the recorder executable.
    #[arg(long)]
    recorder_path: Option<PathBuf>,

    /// Minimal output mode for child recorders.
    #[arg(long, short = 'q')]
    quiet: bool,

    /// Auto-stop recording this many seconds after START.
    #[arg(long)]
    duration: Option<u64>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn default_recorder_path() -> PathBuf {
    let name = if cfg!(windows) {
        "lsl-recorder.exe"
    } else {
        "lsl-recorder"
    };
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
        .unwrap_or_else(|| PathBuf::from(name))
}

fn build_specs(args: &Args) -> anyhow::Result<Vec<WorkerSpec>> {
    if let Some(ref names) = args.stream_names
        && names.len() != args.source_ids.len()
    {
        anyhow::bail!(
            "number of stream names ({}) must match number of source ids ({})",
            names.len(),
            args.source_ids.len()
        );
    }

    let recorder_path = args
        .recorder_path
        .clone()
        .unwrap_or_else(default_recorder_path);

    let mut shared_args: Vec<String> = Vec::new();
    if let Some(ref output) = args.output {
        shared_args.push("--output".to_string());
        shared_args.push(output.display().to_string());
    }
    if let Some(ref subject) = args.subject {
        shared_args.push("--subject".to_string());
        shared_args.push(subject.clone());
    }
    if let Some(ref session_id) = args.session_id {
        shared_args.push("--session-id".to_string());
        shared_args.push(session_id.clone());
    }
    if let Some(ref notes) = args.notes {
        shared_args.push("--notes".to_string());
        shared_args.push(notes.clone());
    }

    Ok(args
        .source_ids
        .iter()
        .enumerate()
        .map(|(idx, source_id)| {
            let stream_name = args
                .stream_names
                .as_ref()
                .map(|names| names[idx].clone())
                .unwrap_or_else(|| source_id.clone());
            let mut worker_args = shared_args.clone();
            worker_args.push("--stream-name".to_string());
            worker_args.push(stream_name);
            WorkerSpec::new(&recorder_path, source_id)
                .with_quiet(args.quiet)
                .with_args(worker_args)
        })
        .collect())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let specs = build_specs(&args)?;
    tracing::info!(workers = specs.len(), "spawning recorder processes");

    let supervisor = Supervisor::spawn(specs)
        .await
        .context("spawning recorders")?;
    tracing::info!("all recorders spawned");
    tracing::info!("commands: START, STOP, STOP_AFTER <seconds>, QUIT");
    if let Some(duration) = args.duration {
        tracing::info!(duration, "auto-stop armed for {duration}s after START");
    }

    let mut duration_pending = args.duration;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let Some(line) = lines.next_line().await.context("reading stdin")? else {
            // Operator closed our stdin: treat as QUIT.
            tracing::info!("stdin closed, quitting all recorders");
            supervisor.broadcast_all(Command::Quit).await;
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring bad command line");
                continue;
            }
        };

        tracing::info!(%command, "broadcasting");
        supervisor.broadcast_all(command).await;

        match command {
            Command::Quit => break,
            Command::Start => {
                if let Some(duration) = duration_pending.take() {
                    tracing::info!(duration, "arming scheduled stop on all workers");
                    supervisor
                        .broadcast_all(Command::StopAfter(duration))
                        .await;
                }
            }
            _ => {}
        }
    }

    tracing::info!("waiting for all recorders to finish");
    let report = supervisor.await_all_exited(None).await;
    for worker in &report.workers {
        match worker.outcome {
            recmux::WorkerOutcome::Exited(outcome) => {
                tracing::info!(label = %worker.label, %outcome, "recorder finished");
            }
            recmux::WorkerOutcome::StillRunning(state) => {
                tracing::warn!(label = %worker.label, %state, "recorder still running");
            }
        }
    }
    tracing::info!("all recordings completed");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::parse_from(std::iter::once("recmux").chain(argv.iter().copied()))
    }

    #[test]
    fn specs_default_stream_name_to_source_id() {
        let args = parse(&["--source-ids", "EMG_1", "EEG_2"]);
        let specs = build_specs(&args).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].label(), "EMG_1");
        assert!(specs[0]
            .args()
            .windows(2)
            .any(|w| w == ["--stream-name", "EMG_1"]));
    }

    #[test]
    fn stream_name_count_mismatch_is_rejected() {
        let args = parse(&["--source-ids", "a", "b", "--stream-names", "only-one"]);
        assert!(build_specs(&args).is_err());
    }

    #[test]
    fn metadata_args_are_passed_through() {
        let args = parse(&[
            "--source-ids",
            "a",
            "--output",
            "experiment",
            "--subject",
            "P001",
        ]);
        let specs = build_specs(&args).unwrap();
        let worker_args = specs[0].args();
        assert!(worker_args.windows(2).any(|w| w == ["--output", "experiment"]));
        assert!(worker_args.windows(2).any(|w| w == ["--subject", "P001"]));
    }
}
