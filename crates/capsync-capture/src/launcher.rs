//! Locating and starting the capture worker

use crate::backend::{self, BackendSettings, LaunchError, ProcessBackend, SpawnedWorker, StdioWiring};
use capsync_core::argv::build_capture_argv;
use capsync_core::config::{SyncSettings, WorkerSettings};
use capsync_core::{ArgumentVector, CapsyncConfig, CaptureOptions};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Called with the worker PID after every successful spawn
pub type PidObserver = Arc<dyn Fn(u32) + Send + Sync>;

/// Launcher settings
#[derive(Clone, Default)]
pub struct LauncherConfig {
    pub worker: WorkerSettings,
    pub sync: SyncSettings,
    /// Set when something else may reap our workers; see [`BackendSettings::echild_is_exit`]
    pub pid_observer: Option<PidObserver>,
}

impl LauncherConfig {
    pub fn from_config(config: &CapsyncConfig) -> Self {
        Self {
            worker: config.worker.clone(),
            sync: config.sync.clone(),
            pid_observer: None,
        }
    }

    pub fn with_pid_observer(mut self, observer: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.pid_observer = Some(Arc::new(observer));
        self
    }
}

impl fmt::Debug for LauncherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LauncherConfig")
            .field("worker", &self.worker)
            .field("sync", &self.sync)
            .field("pid_observer", &self.pid_observer.is_some())
            .finish()
    }
}

/// Starts workers and owns the platform backend used to control them
#[derive(Clone)]
pub struct Launcher {
    config: Arc<LauncherConfig>,
    backend: Arc<dyn ProcessBackend>,
}

impl Launcher {
    pub fn new(config: LauncherConfig) -> Self {
        let settings = BackendSettings {
            stop_timeout: config.sync.stop_timeout(),
            reap_retries: config.sync.reap_retries.max(1),
            echild_is_exit: config.pid_observer.is_some(),
        };
        let backend: Arc<dyn ProcessBackend> = Arc::from(backend::native(settings));
        Self::with_backend(config, backend)
    }

    pub fn with_backend(config: LauncherConfig, backend: Arc<dyn ProcessBackend>) -> Self {
        Self {
            config: Arc::new(config),
            backend,
        }
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    pub fn backend(&self) -> &dyn ProcessBackend {
        self.backend.as_ref()
    }

    pub fn max_message_len(&self) -> usize {
        self.config.sync.max_message_len
    }

    /// Token for the worker's `-Z` flag
    pub fn control_id(&self) -> String {
        self.backend.control_id()
    }

    /// Find the worker executable: configured path, then next to our own
    /// executable, then `PATH`
    pub fn locate_worker(&self) -> Result<PathBuf, LaunchError> {
        let worker = &self.config.worker;
        let not_found = || LaunchError::NotFound {
            program: worker.program_name.clone(),
        };

        if let Some(path) = &worker.path {
            if path.is_file() {
                return Ok(path.clone());
            }
            warn!("Configured worker path does not exist: {}", path.display());
            return Err(not_found());
        }

        let file_name = format!("{}{}", worker.program_name, std::env::consts::EXE_SUFFIX);

        if let Some(dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            let candidate = dir.join(&file_name);
            if candidate.is_file() {
                debug!("Found worker next to executable: {}", candidate.display());
                return Ok(candidate);
            }
        }

        if let Some(paths) = std::env::var_os("PATH") {
            for dir in std::env::split_paths(&paths) {
                let candidate = dir.join(&file_name);
                if candidate.is_file() {
                    debug!("Found worker in PATH: {}", candidate.display());
                    return Ok(candidate);
                }
            }
        }

        Err(not_found())
    }

    /// Worker command line for a capture session
    pub fn capture_argv(&self, options: &CaptureOptions) -> Result<ArgumentVector, LaunchError> {
        let program = self.locate_worker()?;
        Ok(build_capture_argv(program, options, &self.control_id()))
    }

    /// Start a worker and notify the PID observer
    pub fn spawn(
        &self,
        argv: &ArgumentVector,
        wiring: StdioWiring,
    ) -> Result<SpawnedWorker, LaunchError> {
        debug!(backend = self.backend.name(), ?wiring, "spawning: {}", argv);
        let spawned = self.backend.spawn(argv, wiring)?;
        info!(pid = spawned.handle.pid(), "capture child running");

        if let Some(observer) = &self.config.pid_observer {
            observer(spawned.handle.pid());
        }
        Ok(spawned)
    }
}

impl fmt::Debug for Launcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Launcher")
            .field("config", &self.config)
            .field("backend", &self.backend.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launcher_with_worker(path: Option<PathBuf>, program_name: &str) -> Launcher {
        Launcher::new(LauncherConfig {
            worker: WorkerSettings {
                path,
                program_name: program_name.to_string(),
            },
            ..LauncherConfig::default()
        })
    }

    #[test]
    fn test_locate_configured_worker() {
        let dir = tempfile::tempdir().unwrap();
        let worker = dir.path().join("dumpcap");
        std::fs::write(&worker, b"").unwrap();

        let launcher = launcher_with_worker(Some(worker.clone()), "dumpcap");
        assert_eq!(launcher.locate_worker().unwrap(), worker);
    }

    #[test]
    fn test_missing_configured_worker_is_not_found() {
        let launcher = launcher_with_worker(Some(PathBuf::from("/nonexistent/dumpcap")), "dumpcap");
        let err = launcher.locate_worker().unwrap_err();
        assert!(matches!(err, LaunchError::NotFound { .. }));
        assert_eq!(err.to_string(), "We don't know where to find dumpcap");
    }

    #[test]
    fn test_unknown_program_name_is_not_found() {
        let launcher = launcher_with_worker(None, "capsync-test-no-such-worker");
        assert!(matches!(
            launcher.capture_argv(&CaptureOptions::for_interface("eth0")),
            Err(LaunchError::NotFound { .. })
        ));
    }

    #[test]
    fn test_capture_argv_uses_located_worker() {
        let dir = tempfile::tempdir().unwrap();
        let worker = dir.path().join("dumpcap");
        std::fs::write(&worker, b"").unwrap();

        let launcher = launcher_with_worker(Some(worker.clone()), "dumpcap");
        let argv = launcher
            .capture_argv(&CaptureOptions::for_interface("eth0"))
            .unwrap();
        assert_eq!(argv.program(), worker.to_string_lossy());
        let tail: Vec<&str> = argv.args().iter().rev().take(2).map(String::as_str).collect();
        assert_eq!(tail, [launcher.control_id().as_str(), "-Z"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_pid_observer_sees_spawned_worker() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let seen = Arc::new(AtomicU32::new(0));
        let observed = Arc::clone(&seen);
        let launcher = Launcher::new(
            LauncherConfig::default()
                .with_pid_observer(move |pid| observed.store(pid, Ordering::SeqCst)),
        );

        let mut argv = ArgumentVector::new("/bin/sh");
        argv.push("-c").push("exit 0");
        let spawned = launcher.spawn(&argv, StdioWiring::SyncOnly).unwrap();
        let pid = spawned.handle.pid();
        assert_eq!(seen.load(Ordering::SeqCst), pid);
        assert!(!launcher.reap(spawned.handle).is_fatal());
    }

    #[cfg(unix)]
    #[test]
    fn test_reap_after_worker_was_waited_for_elsewhere() {
        use crate::lifecycle::ReapOutcome;
        use nix::sys::wait::waitpid;
        use nix::unistd::Pid;

        let reap_stolen = |launcher: Launcher| {
            let mut argv = ArgumentVector::new("/bin/sh");
            argv.push("-c").push("exit 0");
            let spawned = launcher.spawn(&argv, StdioWiring::SyncOnly).unwrap();
            waitpid(Pid::from_raw(spawned.handle.pid() as i32), None).unwrap();
            launcher.reap(spawned.handle)
        };

        assert_eq!(
            reap_stolen(Launcher::new(LauncherConfig::default())),
            ReapOutcome::fatal("Error from waitpid(): No child processes")
        );
        assert_eq!(
            reap_stolen(Launcher::new(
                LauncherConfig::default().with_pid_observer(|_| {})
            )),
            ReapOutcome::Exited(0)
        );
    }
}
