//! One-shot worker commands
//!
//! The worker is started with both pipes, answers with a single sync pipe
//! message (`SUCCESS` or `ERROR_MSG`) and, on success, writes its output to
//! the data pipe.

use crate::backend::{LaunchError, SpawnedWorker, StdioWiring, WorkerHandle};
use crate::launcher::Launcher;
use crate::lifecycle::{close_diagnostic, ReapOutcome, FATAL_EXIT_CODE};
use capsync_core::argv::{
    if_capabilities_argv, interface_stats_argv, list_interfaces_argv, set_channel_argv,
    command_argv,
};
use capsync_core::wire::{read_message, Frame, Indicator, ReadOutcome, SyncMessage};
use capsync_core::{ArgumentVector, ChannelSpec, PipeReader, CONTROL_ID_NONE};
use std::io::{self, Read};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Longest statistics line read from the worker
pub const STATS_LINE_MAX: usize = 1024;

/// Output of a successful command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub data: String,
    pub exit_code: i32,
}

/// Why a command failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{primary}")]
pub struct CommandFailure {
    pub primary: String,
    pub secondary: Option<String>,
    /// How the worker ended, when it was started and reaped
    pub exit: Option<ReapOutcome>,
}

impl CommandFailure {
    fn new(primary: impl Into<String>, exit: Option<ReapOutcome>) -> Self {
        Self {
            primary: primary.into(),
            secondary: None,
            exit,
        }
    }

    /// Failure carrying the reap diagnostic
    fn from_reap(reap: ReapOutcome) -> Self {
        Self::new(reap.to_string(), Some(reap))
    }

    pub fn exit_code(&self) -> i32 {
        self.exit.as_ref().map_or(FATAL_EXIT_CODE, ReapOutcome::code)
    }
}

impl From<LaunchError> for CommandFailure {
    fn from(e: LaunchError) -> Self {
        Self::new(e.to_string(), None)
    }
}

/// A worker that answered `SUCCESS`
struct Accepted {
    worker: WorkerHandle,
    sync: PipeReader,
    data: PipeReader,
}

/// Start the worker and wait for its verdict
fn handshake(launcher: &Launcher, argv: &ArgumentVector) -> Result<Accepted, CommandFailure> {
    let SpawnedWorker {
        handle,
        mut sync,
        data,
    } = launcher.spawn(argv, StdioWiring::SyncAndData)?;

    let Some(data) = data else {
        drop(sync);
        let mut handle = handle;
        launcher.force_kill(Some(&mut handle));
        let reap = launcher.reap(handle);
        return Err(CommandFailure::new(
            "Couldn't create data pipe for capture child",
            Some(reap),
        ));
    };

    let read = read_message(&mut sync, launcher.max_message_len());

    if let Ok(ReadOutcome::Message(frame)) = &read {
        if frame.kind() == Some(Indicator::Success) {
            debug!(pid = handle.pid(), "capture child reported success");
            return Ok(Accepted {
                worker: handle,
                sync,
                data,
            });
        }
    }

    // Every other answer ends the command: close both pipes and collect
    // the worker before deciding what to report
    drop(sync);
    drop(data);
    let reap = launcher.reap(handle);

    Err(match read {
        Ok(ReadOutcome::Message(frame)) => rejected(frame, reap),
        Ok(ReadOutcome::Eof) if reap.is_fatal() => CommandFailure::from_reap(reap),
        Ok(ReadOutcome::Eof) => CommandFailure::new(
            "Child capture process closed sync pipe prematurely",
            Some(reap),
        ),
        Err(e) => {
            let diagnostic = close_diagnostic(Some(&e.to_string()), &reap)
                .unwrap_or_else(|| e.to_string());
            CommandFailure::new(diagnostic, Some(reap))
        }
    })
}

/// Failure for any first message other than `SUCCESS`
fn rejected(frame: Frame, reap: ReapOutcome) -> CommandFailure {
    if reap.is_fatal() {
        return CommandFailure::from_reap(reap);
    }
    if frame.kind() != Some(Indicator::ErrorMsg) {
        return CommandFailure::new(
            format!(
                "capture child gave an unexpected message type: 0x{:02x}",
                frame.indicator
            ),
            Some(reap),
        );
    }
    match SyncMessage::from_frame(&frame) {
        Ok(SyncMessage::ErrorMsg { primary, secondary }) => CommandFailure {
            primary,
            secondary: Some(secondary),
            exit: Some(reap),
        },
        Ok(other) => CommandFailure::new(
            format!("capture child gave an unexpected message: {other:?}"),
            Some(reap),
        ),
        Err(e) => CommandFailure::new(e.to_string(), Some(reap)),
    }
}

/// Run `argv` to completion and collect its output
pub fn run_command(launcher: &Launcher, argv: &ArgumentVector) -> Result<CommandOutput, CommandFailure> {
    info!("run_command starts");
    debug!("running: {}", argv);
    let started = Instant::now();

    let result = run_command_inner(launcher, argv);

    let elapsed = started.elapsed().as_secs_f64();
    match &result {
        Ok(output) => info!(
            "run_command ends, taking {:.3}s, exit code {}",
            elapsed, output.exit_code
        ),
        Err(failure) => info!(
            "run_command ends, taking {:.3}s, failed: {}",
            elapsed, failure
        ),
    }
    result
}

fn run_command_inner(
    launcher: &Launcher,
    argv: &ArgumentVector,
) -> Result<CommandOutput, CommandFailure> {
    let Accepted {
        worker,
        sync,
        mut data,
    } = handshake(launcher, argv)?;

    let mut output = Vec::new();
    if let Err(e) = data.read_to_end(&mut output) {
        warn!(error = %e, "error reading command output, keeping {} bytes", output.len());
    }

    drop(data);
    drop(sync);
    match launcher.reap(worker) {
        reap @ ReapOutcome::Fatal { .. } => Err(CommandFailure::from_reap(reap)),
        ReapOutcome::Exited(exit_code) => Ok(CommandOutput {
            data: String::from_utf8_lossy(&output).into_owned(),
            exit_code,
        }),
    }
}

/// `-D`: capture interfaces, one per line
pub fn list_interfaces(launcher: &Launcher) -> Result<CommandOutput, CommandFailure> {
    let program = launcher.locate_worker()?;
    run_command(launcher, &list_interfaces_argv(program, CONTROL_ID_NONE))
}

/// `-L`: link-layer types of one interface
pub fn if_capabilities(
    launcher: &Launcher,
    interface: &str,
    monitor_mode: bool,
    auth: Option<&str>,
) -> Result<CommandOutput, CommandFailure> {
    let program = launcher.locate_worker()?;
    run_command(
        launcher,
        &if_capabilities_argv(program, interface, monitor_mode, auth, CONTROL_ID_NONE),
    )
}

/// `-k`: tune an 802.11 interface
pub fn set_80211_channel(
    launcher: &Launcher,
    interface: &str,
    channel: &ChannelSpec,
) -> Result<CommandOutput, CommandFailure> {
    let program = launcher.locate_worker()?;
    run_command(
        launcher,
        &set_channel_argv(program, interface, channel, CONTROL_ID_NONE),
    )
}

/// Arbitrary worker arguments in child mode
pub fn run_worker_command<I, S>(launcher: &Launcher, args: I) -> Result<CommandOutput, CommandFailure>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let program = launcher.locate_worker()?;
    run_command(launcher, &command_argv(program, args, CONTROL_ID_NONE))
}

/// Start `-S` statistics streaming
pub fn open_interface_stats(launcher: &Launcher) -> Result<StatsStream, CommandFailure> {
    let program = launcher.locate_worker()?;
    open_stats_command(launcher, &interface_stats_argv(program, CONTROL_ID_NONE))
}

/// Statistics streaming from an explicit command line
pub fn open_stats_command(
    launcher: &Launcher,
    argv: &ArgumentVector,
) -> Result<StatsStream, CommandFailure> {
    let accepted = handshake(launcher, argv)?;
    info!(pid = accepted.worker.pid(), "interface statistics started");
    Ok(StatsStream {
        launcher: launcher.clone(),
        worker: Some(accepted.worker),
        sync: Some(accepted.sync),
        data: Some(accepted.data),
    })
}

/// Running statistics worker; lines arrive on its data pipe
#[derive(Debug)]
pub struct StatsStream {
    launcher: Launcher,
    worker: Option<WorkerHandle>,
    sync: Option<PipeReader>,
    data: Option<PipeReader>,
}

impl StatsStream {
    pub fn pid(&self) -> Option<u32> {
        self.worker.as_ref().map(WorkerHandle::pid)
    }

    /// Next line, blocking; `Ok(None)` once the worker closes its output
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        match &mut self.data {
            Some(data) => data.read_line(STATS_LINE_MAX),
            None => Ok(None),
        }
    }

    /// Next line if one is waiting
    pub fn gets_nonblock(&mut self) -> io::Result<Option<String>> {
        match &mut self.data {
            Some(data) => data.gets_nonblock(STATS_LINE_MAX),
            None => Ok(None),
        }
    }

    /// Kill the worker, close its pipes and reap it
    pub fn close(mut self) -> ReapOutcome {
        self.finish()
    }

    fn finish(&mut self) -> ReapOutcome {
        let Some(mut worker) = self.worker.take() else {
            return ReapOutcome::Exited(0);
        };
        self.launcher.force_kill(Some(&mut worker));
        self.data = None;
        self.sync = None;
        let reap = self.launcher.reap(worker);
        info!(outcome = %reap, "interface statistics stopped");
        reap
    }
}

impl Drop for StatsStream {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.finish();
        }
    }
}

/// One `-S` line: interface, packets received, packets dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceStats {
    pub name: String,
    pub received: u64,
    pub dropped: u64,
}

pub fn parse_stats_line(line: &str) -> Option<InterfaceStats> {
    let mut fields = line.split('\t');
    let name = fields.next().filter(|n| !n.is_empty())?;
    let received = fields.next()?.trim().parse().ok()?;
    let dropped = fields.next()?.trim().parse().ok()?;
    Some(InterfaceStats {
        name: name.to_string(),
        received,
        dropped,
    })
}
