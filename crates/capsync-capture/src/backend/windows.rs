//! Win32 backend
//!
//! The worker's stderr and stdout are anonymous pipes owned by
//! `std::process::Child`. Its stdin doubles as the signal channel: writing
//! `QUIT` (or closing it) asks the worker to stop.

use super::{BackendSettings, LaunchError, ProcessBackend, SpawnedWorker, StdioWiring, WorkerHandle};
use crate::lifecycle::{exception_name, ReapOutcome};
use capsync_core::{ArgumentVector, PipeReader};
use std::io::{self, Write};
use std::os::windows::io::{AsRawHandle, OwnedHandle};
use std::os::windows::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

const CREATE_NO_WINDOW: u32 = 0x0800_0000;

pub struct WindowsBackend {
    settings: BackendSettings,
}

impl WindowsBackend {
    pub fn new(settings: BackendSettings) -> Self {
        Self { settings }
    }

    /// Bounded wait for the worker to exit on its own
    fn wait_for_exit(&self, worker: &WorkerHandle) -> bool {
        use ::windows::Win32::Foundation::{HANDLE, WAIT_OBJECT_0};
        use ::windows::Win32::System::Threading::WaitForSingleObject;

        let timeout = u32::try_from(self.settings.stop_timeout.as_millis()).unwrap_or(u32::MAX);
        let handle = HANDLE(worker.child.as_raw_handle());
        // SAFETY: the process handle is owned by `worker.child` and outlives the call
        let waited = unsafe { WaitForSingleObject(handle, timeout) };
        waited == WAIT_OBJECT_0
    }
}

impl ProcessBackend for WindowsBackend {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn control_id(&self) -> String {
        std::process::id().to_string()
    }

    fn spawn(
        &self,
        argv: &ArgumentVector,
        wiring: StdioWiring,
    ) -> Result<SpawnedWorker, LaunchError> {
        let mut command = Command::new(argv.program());
        command
            .args(argv.args())
            .stdin(Stdio::piped())
            .stderr(Stdio::piped())
            .stdout(match wiring {
                StdioWiring::SyncOnly => Stdio::null(),
                StdioWiring::SyncAndData => Stdio::piped(),
            })
            .creation_flags(CREATE_NO_WINDOW);

        debug!(argv = %argv, "creating capture child");

        let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
            program: PathBuf::from(argv.program()),
            source,
        })?;

        let sync = match child.stderr.take() {
            Some(stderr) => PipeReader::from(OwnedHandle::from(stderr)),
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(LaunchError::Pipe(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "worker stderr was not captured",
                )));
            }
        };
        let data = child
            .stdout
            .take()
            .map(|stdout| PipeReader::from(OwnedHandle::from(stdout)));
        let signal = child.stdin.take();

        let pid = child.id();
        info!(pid, program = argv.program(), "capture child started");

        Ok(SpawnedWorker {
            handle: WorkerHandle { pid, child, signal },
            sync,
            data,
        })
    }

    fn request_graceful_stop(&self, worker: &mut WorkerHandle) {
        if let Some(mut signal) = worker.signal.take() {
            if let Err(e) = signal.write_all(b"QUIT").and_then(|()| signal.flush()) {
                debug!(pid = worker.pid, error = %e, "signal pipe already closed");
            }
        }

        if !self.wait_for_exit(worker) {
            warn!(
                pid = worker.pid,
                timeout_ms = self.settings.stop_timeout.as_millis() as u64,
                "capture child ignored stop request, killing it"
            );
            self.force_kill(worker);
        }
    }

    fn force_kill(&self, worker: &mut WorkerHandle) {
        match worker.child.kill() {
            Ok(()) => debug!(pid = worker.pid, "terminated capture child"),
            Err(e) => debug!(pid = worker.pid, error = %e, "capture child already gone"),
        }
    }

    fn reap(&self, mut worker: WorkerHandle) -> ReapOutcome {
        drop(worker.signal.take());
        let outcome = match worker.child.wait() {
            Ok(status) => match status.code() {
                Some(code) => match exception_name(code as u32) {
                    Some(name) => ReapOutcome::fatal(format!("Child capture process died: {name}")),
                    None => ReapOutcome::Exited(code),
                },
                None => ReapOutcome::fatal(format!("Bad status from wait(): {status}")),
            },
            Err(e) => ReapOutcome::fatal(format!("Error from WaitForSingleObject(): {e}")),
        };
        debug!(pid = worker.pid, ?outcome, "capture child reaped");
        outcome
    }
}
