//! Platform process backends
//!
//! A backend knows how to start the capture worker with its stderr (and
//! optionally stdout) connected to pipes we read, how to ask it to stop,
//! and how to collect its exit status. Everything above this module is
//! platform independent.

use crate::lifecycle::ReapOutcome;
use capsync_core::{ArgumentVector, PipeReader};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[cfg(unix)]
pub mod posix;
#[cfg(windows)]
pub mod windows;

/// Launch errors
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("We don't know where to find {program}")]
    NotFound { program: String },

    #[error("Couldn't create sync pipe: {0}")]
    Pipe(#[source] io::Error),

    #[error("Couldn't run {program} in child process: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Couldn't fork capture child: {0}")]
    Fork(#[source] io::Error),

    #[error("Invalid worker argument {0:?}: contains a NUL byte")]
    InvalidArgument(String),

    #[error("Capture session is already running")]
    Busy,
}

/// Which worker streams are connected to pipes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioWiring {
    /// stderr only: capture sessions
    SyncOnly,
    /// stderr and stdout: one-shot commands
    SyncAndData,
}

/// A running (or exited but unreaped) worker
///
/// Reaping consumes the handle, so a reaped worker can never be signalled.
#[derive(Debug)]
pub struct WorkerHandle {
    pub(crate) pid: u32,
    #[cfg(windows)]
    pub(crate) child: std::process::Child,
    /// Worker stdin; the worker stops when it reads `QUIT` or sees EOF
    #[cfg(windows)]
    pub(crate) signal: Option<std::process::ChildStdin>,
}

impl WorkerHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

/// Result of a successful spawn
#[derive(Debug)]
pub struct SpawnedWorker {
    pub handle: WorkerHandle,
    /// Read end of the sync pipe (worker stderr)
    pub sync: PipeReader,
    /// Read end of the data pipe (worker stdout), for [`StdioWiring::SyncAndData`]
    pub data: Option<PipeReader>,
}

/// Platform specific process control
pub trait ProcessBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Token passed to the worker with `-Z`
    fn control_id(&self) -> String;

    /// Start the worker with our pipes as its stderr/stdout.
    ///
    /// The parent's write ends are closed before returning, and every
    /// resource created so far is released on failure.
    fn spawn(&self, argv: &ArgumentVector, wiring: StdioWiring)
        -> Result<SpawnedWorker, LaunchError>;

    /// Ask the worker to finish its capture and exit
    fn request_graceful_stop(&self, worker: &mut WorkerHandle);

    /// Terminate the worker now. Already exited workers are left alone.
    fn force_kill(&self, worker: &mut WorkerHandle);

    /// Wait for the worker to exit and normalize its status
    fn reap(&self, worker: WorkerHandle) -> ReapOutcome;
}

/// Backend settings taken from `[sync]`
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub stop_timeout: std::time::Duration,
    pub reap_retries: u32,
    /// Treat "no such child" as a clean exit (someone else reaped it)
    pub echild_is_exit: bool,
}

/// Backend for the platform we were built for
pub fn native(settings: BackendSettings) -> Box<dyn ProcessBackend> {
    #[cfg(unix)]
    {
        Box::new(posix::PosixBackend::new(settings))
    }

    #[cfg(windows)]
    {
        Box::new(windows::WindowsBackend::new(settings))
    }
}
