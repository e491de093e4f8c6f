//! Stopping, killing and reaping the capture worker

use crate::backend::WorkerHandle;
use crate::launcher::Launcher;
use std::fmt;
use tracing::{debug, error};

/// Exit code reported when the worker did not exit normally
pub const FATAL_EXIT_CODE: i32 = -1;

/// Normalized worker exit status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReapOutcome {
    /// Normal exit with the worker's own code
    Exited(i32),
    /// Killed, stopped, crashed, or the wait itself failed
    Fatal { diagnostic: String },
}

impl ReapOutcome {
    pub fn fatal(diagnostic: impl Into<String>) -> Self {
        ReapOutcome::Fatal {
            diagnostic: diagnostic.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ReapOutcome::Fatal { .. })
    }

    /// Raw exit code, or [`FATAL_EXIT_CODE`]
    pub fn code(&self) -> i32 {
        match self {
            ReapOutcome::Exited(code) => *code,
            ReapOutcome::Fatal { .. } => FATAL_EXIT_CODE,
        }
    }

    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            ReapOutcome::Exited(_) => None,
            ReapOutcome::Fatal { diagnostic } => Some(diagnostic),
        }
    }

    pub fn kind(&self) -> ExitKind {
        match self {
            ReapOutcome::Exited(0) => ExitKind::Success,
            ReapOutcome::Exited(_) => ExitKind::Failure,
            ReapOutcome::Fatal { .. } => ExitKind::Fatal,
        }
    }
}

impl fmt::Display for ReapOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReapOutcome::Exited(code) => write!(f, "exited with status {code}"),
            ReapOutcome::Fatal { diagnostic } => f.write_str(diagnostic),
        }
    }
}

/// Coarse classification used in logs and CLI output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Success,
    Failure,
    Fatal,
}

/// Combine a pipe error with the reap result so neither is lost
pub fn close_diagnostic(pipe_error: Option<&str>, reap: &ReapOutcome) -> Option<String> {
    match (pipe_error, reap.diagnostic()) {
        (Some(pipe), Some(reap)) => Some(format!("{pipe}\n\n{reap}")),
        (Some(pipe), None) => Some(pipe.to_string()),
        (None, Some(reap)) => Some(reap.to_string()),
        (None, None) => None,
    }
}

/// Human readable name of a POSIX signal
pub fn signal_name(signal: i32) -> String {
    #[cfg(unix)]
    {
        let name = match signal {
            libc::SIGHUP => "Hangup",
            libc::SIGINT => "Interrupted",
            libc::SIGQUIT => "Quit",
            libc::SIGILL => "Illegal instruction",
            libc::SIGTRAP => "Trace trap",
            libc::SIGABRT => "Abort",
            libc::SIGFPE => "Arithmetic exception",
            libc::SIGKILL => "Killed",
            libc::SIGBUS => "Bus error",
            libc::SIGSEGV => "Segmentation violation",
            libc::SIGSYS => "Bad system call",
            libc::SIGPIPE => "Broken pipe",
            libc::SIGALRM => "Alarm clock",
            libc::SIGTERM => "Terminated",
            other => return format!("Signal {other}"),
        };
        name.to_string()
    }

    #[cfg(not(unix))]
    {
        format!("Signal {signal}")
    }
}

/// Name of a Windows exception, if `code` is one (severity bits set)
pub fn exception_name(code: u32) -> Option<String> {
    if code & 0xC000_0000 != 0xC000_0000 {
        return None;
    }
    let name = match code {
        0xC000_0005 => "Access violation",
        0xC000_0006 => "In page error",
        0xC000_0008 => "Invalid handle",
        0xC000_001D => "Illegal instruction",
        0xC000_0025 => "Noncontinuable exception",
        0xC000_0026 => "Invalid disposition",
        0xC000_008C => "Array bounds exceeded",
        0xC000_008D => "Float denormal operand",
        0xC000_008E => "Float divide by zero",
        0xC000_008F => "Float inexact result",
        0xC000_0090 => "Float invalid operation",
        0xC000_0091 => "Float overflow",
        0xC000_0092 => "Float stack check",
        0xC000_0093 => "Float underflow",
        0xC000_0094 => "Integer divide by zero",
        0xC000_0095 => "Integer overflow",
        0xC000_0096 => "Privileged instruction",
        0xC000_00FD => "Stack overflow",
        0xC000_013A => "Control-C exit",
        0xC000_0409 => "Stack buffer overrun",
        other => return Some(format!("Exception 0x{other:08x}")),
    };
    Some(name.to_string())
}

impl Launcher {
    /// Ask the worker to stop. No-op without a worker.
    pub fn request_stop(&self, worker: Option<&mut WorkerHandle>) {
        match worker {
            Some(worker) => {
                debug!(pid = worker.pid(), backend = self.backend().name(), "stopping capture child");
                self.backend().request_graceful_stop(worker);
            }
            None => debug!("stop requested with no capture child"),
        }
    }

    /// Kill the worker immediately. Safe to call repeatedly, or with `None`.
    pub fn force_kill(&self, worker: Option<&mut WorkerHandle>) {
        if let Some(worker) = worker {
            debug!(pid = worker.pid(), "killing capture child");
            self.backend().force_kill(worker);
        }
    }

    /// Wait for the worker to exit
    pub fn reap(&self, worker: WorkerHandle) -> ReapOutcome {
        let pid = worker.pid();
        let outcome = self.backend().reap(worker);
        if let ReapOutcome::Fatal { diagnostic } = &outcome {
            error!(pid, "{}", diagnostic);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_codes() {
        assert_eq!(ReapOutcome::Exited(0).code(), 0);
        assert_eq!(ReapOutcome::Exited(2).code(), 2);
        assert_eq!(ReapOutcome::fatal("boom").code(), FATAL_EXIT_CODE);
        assert_eq!(ReapOutcome::fatal("boom").diagnostic(), Some("boom"));
        assert_eq!(ReapOutcome::Exited(2).diagnostic(), None);
        assert_eq!(ReapOutcome::Exited(0).kind(), ExitKind::Success);
        assert_eq!(ReapOutcome::Exited(1).kind(), ExitKind::Failure);
    }

    #[test]
    fn test_close_diagnostic_keeps_both_errors() {
        let fatal = ReapOutcome::fatal("Child capture process died: Killed");
        assert_eq!(
            close_diagnostic(Some("Error reading from sync pipe: Broken pipe"), &fatal).as_deref(),
            Some("Error reading from sync pipe: Broken pipe\n\nChild capture process died: Killed")
        );
        assert_eq!(
            close_diagnostic(Some("short read"), &ReapOutcome::Exited(0)).as_deref(),
            Some("short read")
        );
        assert_eq!(
            close_diagnostic(None, &fatal).as_deref(),
            Some("Child capture process died: Killed")
        );
        assert_eq!(close_diagnostic(None, &ReapOutcome::Exited(1)), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name(libc::SIGTERM), "Terminated");
        assert_eq!(signal_name(libc::SIGSEGV), "Segmentation violation");
        assert_eq!(signal_name(libc::SIGKILL), "Killed");
        assert_eq!(signal_name(libc::SIGUSR1), format!("Signal {}", libc::SIGUSR1));
    }

    #[test]
    fn test_exception_names() {
        assert_eq!(exception_name(0), None);
        assert_eq!(exception_name(1), None);
        assert_eq!(exception_name(0x8000_0003), None);
        assert_eq!(exception_name(0xC000_0005).as_deref(), Some("Access violation"));
        assert_eq!(
            exception_name(0xC0DE_0001).as_deref(),
            Some("Exception 0xc0de0001")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_force_kill_exited_worker_before_reap() {
        use crate::backend::StdioWiring;
        use crate::testing::{launcher, sh};
        use std::io::Read;

        let launcher = launcher();
        let spawned = launcher.spawn(&sh("exit 3"), StdioWiring::SyncOnly).unwrap();
        let mut worker = spawned.handle;
        let mut sync = spawned.sync;

        // EOF on the sync pipe: the worker is gone but not yet reaped
        let mut rest = Vec::new();
        sync.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());

        launcher.force_kill(Some(&mut worker));
        launcher.force_kill(Some(&mut worker));
        assert_eq!(launcher.reap(worker), ReapOutcome::Exited(3));
    }
}
