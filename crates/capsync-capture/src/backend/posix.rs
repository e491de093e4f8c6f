//! fork/exec backend
//!
//! The worker gets the sync pipe as stderr and, for one-shot commands, the
//! data pipe as stdout. If exec fails the child reports the error over the
//! sync pipe as an `ERROR_MSG` frame, so the parent learns about it through
//! the same channel as any other worker failure.

use super::{BackendSettings, LaunchError, ProcessBackend, SpawnedWorker, StdioWiring, WorkerHandle};
use crate::lifecycle::{signal_name, ReapOutcome};
use capsync_core::wire::{encode_header, Indicator, HEADER_LEN};
use capsync_core::{ArgumentVector, PipeReader, CONTROL_ID_NONE};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, pipe, ForkResult, Pid};
use std::ffi::{CStr, CString};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use tracing::{debug, info, warn};

pub struct PosixBackend {
    settings: BackendSettings,
}

impl PosixBackend {
    pub fn new(settings: BackendSettings) -> Self {
        Self { settings }
    }

    fn signal(&self, worker: &WorkerHandle, signal: Signal) {
        let Ok(raw) = i32::try_from(worker.pid) else {
            warn!(pid = worker.pid, "pid out of range, not signalling");
            return;
        };
        match kill(Pid::from_raw(raw), signal) {
            Ok(()) => debug!(pid = worker.pid, %signal, "signalled capture child"),
            Err(Errno::ESRCH) => debug!(pid = worker.pid, %signal, "capture child already gone"),
            Err(e) => warn!(pid = worker.pid, %signal, error = %e, "failed to signal capture child"),
        }
    }
}

/// Pipe whose ends are not inherited across exec
fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let (read, write) = pipe()?;
    for fd in [&read, &write] {
        // SAFETY: fd is a valid descriptor we own
        if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok((read, write))
}

fn c_string(arg: &str) -> Result<CString, LaunchError> {
    CString::new(arg).map_err(|_| LaunchError::InvalidArgument(arg.to_string()))
}

impl ProcessBackend for PosixBackend {
    fn name(&self) -> &'static str {
        "posix"
    }

    fn control_id(&self) -> String {
        CONTROL_ID_NONE.to_string()
    }

    fn spawn(
        &self,
        argv: &ArgumentVector,
        wiring: StdioWiring,
    ) -> Result<SpawnedWorker, LaunchError> {
        // Everything the child touches is prepared before fork
        let program = c_string(argv.program())?;
        let args = argv
            .as_slice()
            .iter()
            .map(|a| c_string(a))
            .collect::<Result<Vec<_>, _>>()?;
        let mut arg_ptrs: Vec<*const libc::c_char> = args.iter().map(|a| a.as_ptr()).collect();
        arg_ptrs.push(std::ptr::null());
        let failure = format!("Couldn't run {} in child process: ", argv.program());

        let (sync_read, sync_write) = cloexec_pipe().map_err(LaunchError::Pipe)?;
        let data = match wiring {
            StdioWiring::SyncOnly => None,
            StdioWiring::SyncAndData => Some(cloexec_pipe().map_err(LaunchError::Pipe)?),
        };

        debug!(argv = %argv, "forking capture child");

        // SAFETY: the child only calls async-signal-safe functions before
        // exec or _exit
        match unsafe { fork() } {
            Ok(ForkResult::Child) => unsafe {
                exec_child(
                    sync_write.as_raw_fd(),
                    data.as_ref().map(|(_, w)| w.as_raw_fd()),
                    &program,
                    &arg_ptrs,
                    failure.as_bytes(),
                )
            },
            Ok(ForkResult::Parent { child }) => {
                drop(sync_write);
                let data = data.map(|(read, write)| {
                    drop(write);
                    PipeReader::from(read)
                });
                let pid = child.as_raw() as u32;
                info!(pid, program = argv.program(), "capture child started");
                Ok(SpawnedWorker {
                    handle: WorkerHandle { pid },
                    sync: PipeReader::from(sync_read),
                    data,
                })
            }
            Err(e) => Err(LaunchError::Fork(e.into())),
        }
    }

    fn request_graceful_stop(&self, worker: &mut WorkerHandle) {
        self.signal(worker, Signal::SIGINT);
    }

    fn force_kill(&self, worker: &mut WorkerHandle) {
        self.signal(worker, Signal::SIGTERM);
    }

    fn reap(&self, worker: WorkerHandle) -> ReapOutcome {
        let pid = Pid::from_raw(worker.pid as i32);
        let mut attempts = 0;
        loop {
            attempts += 1;
            let outcome = match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, code)) => ReapOutcome::Exited(code),
                Ok(WaitStatus::Signaled(_, signal, core_dumped)) => ReapOutcome::fatal(format!(
                    "Child capture process died: {}{}",
                    signal_name(signal as i32),
                    if core_dumped { " - core dumped" } else { "" }
                )),
                Ok(WaitStatus::Stopped(_, signal)) => ReapOutcome::fatal(format!(
                    "Child capture process stopped: {}",
                    signal_name(signal as i32)
                )),
                Ok(other) => {
                    ReapOutcome::fatal(format!("Bad status from waitpid(): {other:?}"))
                }
                Err(Errno::EINTR) if attempts < self.settings.reap_retries => {
                    warn!(pid = worker.pid, "waitpid returned EINTR, retrying");
                    continue;
                }
                Err(Errno::ECHILD) if self.settings.echild_is_exit => {
                    debug!(pid = worker.pid, "capture child already reaped elsewhere");
                    ReapOutcome::Exited(0)
                }
                Err(e) => ReapOutcome::fatal(format!("Error from waitpid(): {}", e.desc())),
            };
            debug!(pid = worker.pid, ?outcome, "capture child reaped");
            return outcome;
        }
    }
}

/// Runs in the forked child. Never returns.
///
/// # Safety
///
/// Must only be called between `fork` and `exec` in the child. It performs
/// no allocation and calls only async-signal-safe functions.
unsafe fn exec_child(
    sync_fd: RawFd,
    data_fd: Option<RawFd>,
    program: &CStr,
    argv: &[*const libc::c_char],
    failure: &[u8],
) -> ! {
    if let Some(fd) = data_fd {
        libc::dup2(fd, libc::STDOUT_FILENO);
    }
    libc::dup2(sync_fd, libc::STDERR_FILENO);

    libc::execv(program.as_ptr(), argv.as_ptr());

    let reason = Errno::last().desc();
    write_exec_failure(libc::STDERR_FILENO, failure, reason.as_bytes());
    libc::_exit(1);
}

/// `ERROR_MSG` with primary `prefix + reason` and an empty secondary,
/// assembled from stack buffers
unsafe fn write_exec_failure(fd: RawFd, prefix: &[u8], reason: &[u8]) {
    let primary_len = prefix.len() + reason.len();
    let marker = Indicator::ErrorMsg.as_byte();
    let (Ok(outer), Ok(primary), Ok(secondary)) = (
        encode_header(marker, HEADER_LEN + primary_len + HEADER_LEN),
        encode_header(marker, primary_len),
        encode_header(marker, 0),
    ) else {
        return;
    };
    for part in [&outer[..], &primary[..], prefix, reason, &secondary[..]] {
        if !write_all_raw(fd, part) {
            return;
        }
    }
}

unsafe fn write_all_raw(fd: RawFd, mut buf: &[u8]) -> bool {
    while !buf.is_empty() {
        let n = libc::write(fd, buf.as_ptr().cast(), buf.len());
        if n < 0 {
            if Errno::last() == Errno::EINTR {
                continue;
            }
            return false;
        }
        buf = &buf[n as usize..];
    }
    true
}
