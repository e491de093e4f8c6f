//! Capture sessions
//!
//! A [`Session`] starts the worker, reads one sync pipe message per
//! readiness event and forwards it to its [`CaptureEvents`] sink. When the
//! worker closes the pipe the session reaps it and reports the outcome
//! through [`CaptureEvents::input_closed`].
//!
//! Everything runs on the caller's thread. [`Session::run_until`] hooks the
//! sync pipe into the tokio reactor; [`Session::run_blocking`] is the same
//! loop without an event loop.

use crate::backend::{LaunchError, StdioWiring, WorkerHandle};
use crate::launcher::Launcher;
use crate::lifecycle::{close_diagnostic, ReapOutcome};
use capsync_core::wire::{read_message, ReadOutcome, SyncMessage};
use capsync_core::{ArgumentVector, CaptureOptions, PipeReader};
use std::ops::ControlFlow;
use tracing::{debug, info, warn};

/// Where a session is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Stopped,
    /// Worker started, nothing heard from it yet
    Preparing,
    Running,
}

/// Receives what the worker reports
pub trait CaptureEvents {
    /// The worker opened a new capture file. Returning `false` stops the
    /// capture without reading any further messages.
    fn new_file(&mut self, path: &str) -> bool;

    fn new_packets(&mut self, count: u32);

    fn error_message(&mut self, primary: &str, secondary: &str);

    /// Capture filter `index` (one per interface) failed to compile
    fn bad_filter(&mut self, index: usize, message: &str);

    /// Cumulative dropped packet count
    fn drops(&mut self, dropped: u32);

    /// The capture is over. `diagnostic` is set when it ended abnormally.
    fn input_closed(&mut self, diagnostic: Option<&str>);
}

/// One capture worker and the state derived from its messages
pub struct Session<E: CaptureEvents> {
    launcher: Launcher,
    events: E,
    worker: Option<WorkerHandle>,
    sync_pipe: Option<PipeReader>,
    state: CaptureState,
    owner: (u32, u32),
    count: u64,
    session_started: bool,
    options: Option<CaptureOptions>,
    current_file: Option<String>,
    exit: Option<ReapOutcome>,
}

impl<E: CaptureEvents> Session<E> {
    pub fn new(launcher: Launcher, events: E) -> Self {
        Self {
            launcher,
            events,
            worker: None,
            sync_pipe: None,
            state: CaptureState::Stopped,
            owner: current_owner(),
            count: 0,
            session_started: false,
            options: None,
            current_file: None,
            exit: None,
        }
    }

    /// Start a capture with `options`
    pub fn start(&mut self, options: CaptureOptions) -> Result<(), LaunchError> {
        self.ensure_stopped()?;
        let argv = self.launcher.capture_argv(&options)?;
        info!(
            interfaces = options.interfaces.len(),
            "Capture Start ..."
        );
        self.launch(&argv)?;
        self.options = Some(options);
        Ok(())
    }

    /// Start a session around an explicit worker command line
    pub fn start_command(&mut self, argv: &ArgumentVector) -> Result<(), LaunchError> {
        self.ensure_stopped()?;
        self.launch(argv)?;
        self.options = None;
        Ok(())
    }

    fn ensure_stopped(&mut self) -> Result<(), LaunchError> {
        if self.state != CaptureState::Stopped {
            return Err(LaunchError::Busy);
        }
        // Left behind by a rejected capture file; it was already asked to stop
        if let Some(worker) = self.worker.take() {
            self.exit = Some(self.launcher.reap(worker));
        }
        Ok(())
    }

    fn launch(&mut self, argv: &ArgumentVector) -> Result<(), LaunchError> {
        self.state = CaptureState::Preparing;
        match self.launcher.spawn(argv, StdioWiring::SyncOnly) {
            Ok(spawned) => {
                self.worker = Some(spawned.handle);
                self.sync_pipe = Some(spawned.sync);
                self.count = 0;
                self.session_started = false;
                self.current_file = None;
                self.exit = None;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "capture child failed to start");
                self.state = CaptureState::Stopped;
                Err(e)
            }
        }
    }

    /// Handle one readiness event on the sync pipe.
    ///
    /// Reads exactly one message. On [`ControlFlow::Break`] the session is
    /// stopped and the caller must stop watching and close `pipe`.
    ///
    /// When the sink rejects a new file the worker is asked to stop first
    /// and `pipe` is closed by the caller afterwards, so the worker may
    /// still write its last messages into a pipe nobody reads.
    pub fn on_sync_readable(&mut self, pipe: &mut PipeReader) -> ControlFlow<()> {
        if self.state == CaptureState::Preparing {
            debug!("capture child is reporting, session running");
            self.state = CaptureState::Running;
        }

        let frame = match read_message(pipe, self.launcher.max_message_len()) {
            Ok(ReadOutcome::Message(frame)) => frame,
            Ok(ReadOutcome::Eof) => return self.worker_finished(None),
            Err(e) => return self.worker_finished(Some(e.to_string())),
        };

        if frame.kind().is_none() {
            unreachable!(
                "capture child sent unknown message type 0x{:02x}",
                frame.indicator
            );
        }

        // The framing is intact, so a payload that doesn't decode is still
        // reported and the capture carries on
        let message = match SyncMessage::from_frame(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("sync pipe: {}", e);
                SyncMessage::ErrorMsg {
                    primary: frame.error_text_lossy(),
                    secondary: String::new(),
                }
            }
        };

        match message {
            SyncMessage::File { path } => {
                debug!("sync pipe: new file {}", path);
                self.session_started = true;
                self.current_file = Some(path.clone());
                if !self.events.new_file(&path) {
                    // The sink could not keep up (e.g. very fast ring buffer
                    // switches); stop the worker and read nothing more
                    debug!("new file rejected, closing capture");
                    self.launcher.request_stop(self.worker.as_mut());
                    self.state = CaptureState::Stopped;
                    self.events.input_closed(None);
                    return ControlFlow::Break(());
                }
            }
            SyncMessage::PacketCount { count } => {
                debug!("sync pipe: new packets {}", count);
                self.count += u64::from(count);
                self.events.new_packets(count);
            }
            SyncMessage::ErrorMsg { primary, secondary } => {
                debug!("sync pipe: error message {:?}", primary);
                self.events.error_message(&primary, &secondary);
            }
            SyncMessage::BadFilter { index, message } => {
                debug!("sync pipe: bad filter {}: {}", index, message);
                self.events.bad_filter(index, &message);
            }
            SyncMessage::Drops { dropped } => {
                debug!("sync pipe: drops {}", dropped);
                self.events.drops(dropped);
            }
            SyncMessage::Success => {
                unreachable!("capture child sent SUCCESS during a capture")
            }
        }

        ControlFlow::Continue(())
    }

    /// The pipe is finished: reap the worker and report
    fn worker_finished(&mut self, pipe_error: Option<String>) -> ControlFlow<()> {
        if let Some(error) = &pipe_error {
            debug!("sync pipe: {}", error);
        }

        let outcome = self.worker.take().map(|worker| self.launcher.reap(worker));
        let diagnostic = match &outcome {
            Some(outcome) => close_diagnostic(pipe_error.as_deref(), outcome),
            None => pipe_error,
        };

        info!(
            packets = self.count,
            exit_code = outcome.as_ref().map(ReapOutcome::code),
            "Capture stopped"
        );

        self.state = CaptureState::Stopped;
        self.exit = outcome;
        self.events.input_closed(diagnostic.as_deref());
        ControlFlow::Break(())
    }

    /// Process one message from the session's own pipe, blocking until it
    /// arrives
    pub fn pump(&mut self) -> ControlFlow<()> {
        let Some(mut pipe) = self.sync_pipe.take() else {
            return ControlFlow::Break(());
        };
        let flow = self.on_sync_readable(&mut pipe);
        if flow.is_continue() {
            self.sync_pipe = Some(pipe);
        }
        flow
    }

    /// Read messages until the worker finishes, without an event loop
    pub fn run_blocking(&mut self) -> Option<&ReapOutcome> {
        while self.pump().is_continue() {}
        self.exit.as_ref()
    }

    /// Run until the worker finishes
    #[cfg(unix)]
    pub async fn run(&mut self) -> std::io::Result<Option<ReapOutcome>> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run until the worker finishes, asking it to stop once `shutdown`
    /// completes. The worker's final messages are still delivered.
    #[cfg(unix)]
    pub async fn run_until<F>(&mut self, shutdown: F) -> std::io::Result<Option<ReapOutcome>>
    where
        F: std::future::Future<Output = ()>,
    {
        use tokio::io::unix::AsyncFd;
        use tokio::io::Interest;

        let Some(pipe) = self.sync_pipe.take() else {
            return Ok(self.exit.clone());
        };
        let mut watched = AsyncFd::with_interest(pipe, Interest::READABLE)?;

        tokio::pin!(shutdown);
        let mut stop_requested = false;

        loop {
            tokio::select! {
                ready = watched.readable_mut() => {
                    let mut guard = ready?;
                    if self.on_sync_readable(guard.get_inner_mut()).is_break() {
                        break;
                    }
                    // A message may already be buffered behind this one
                    if !guard.get_inner().data_available() {
                        guard.clear_ready();
                    }
                }
                () = &mut shutdown, if !stop_requested => {
                    stop_requested = true;
                    info!("Shutdown requested, stopping capture");
                    self.stop();
                }
            }
        }

        // Deregisters from the reactor, then closes the pipe
        drop(watched);
        Ok(self.exit.clone())
    }

    /// Ask the worker to stop; it reports its last messages and closes
    /// the pipe
    pub fn stop(&mut self) {
        if self.state != CaptureState::Stopped {
            self.launcher.request_stop(self.worker.as_mut());
        }
    }

    /// Kill the worker now
    pub fn kill(&mut self) {
        self.launcher.force_kill(self.worker.as_mut());
    }

    /// Kill and reap any worker still held. Runs on drop.
    pub fn shutdown(&mut self) -> Option<&ReapOutcome> {
        self.sync_pipe = None;
        if let Some(mut worker) = self.worker.take() {
            self.launcher.force_kill(Some(&mut worker));
            self.exit = Some(self.launcher.reap(worker));
        }
        self.state = CaptureState::Stopped;
        self.exit.as_ref()
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Packets reported since the session started
    pub fn packet_count(&self) -> u64 {
        self.count
    }

    /// Whether the worker has reported a capture file yet
    pub fn session_started(&self) -> bool {
        self.session_started
    }

    pub fn current_file(&self) -> Option<&str> {
        self.current_file.as_deref()
    }

    pub fn capture_options(&self) -> Option<&CaptureOptions> {
        self.options.as_ref()
    }

    /// How the last worker ended
    pub fn exit_outcome(&self) -> Option<&ReapOutcome> {
        self.exit.as_ref()
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.worker.as_ref().map(WorkerHandle::pid)
    }

    /// Real uid and gid of the process that created the session
    pub fn owner(&self) -> (u32, u32) {
        self.owner
    }

    pub fn events(&self) -> &E {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut E {
        &mut self.events
    }

    pub fn launcher(&self) -> &Launcher {
        &self.launcher
    }
}

impl<E: CaptureEvents> Drop for Session<E> {
    fn drop(&mut self) {
        if self.worker.is_some() {
            debug!("session dropped with a live capture child");
            self.shutdown();
        }
    }
}

#[cfg(unix)]
fn current_owner() -> (u32, u32) {
    (
        nix::unistd::getuid().as_raw(),
        nix::unistd::getgid().as_raw(),
    )
}

#[cfg(not(unix))]
fn current_owner() -> (u32, u32) {
    (0, 0)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::lifecycle::FATAL_EXIT_CODE;
    use crate::testing::{launcher, printf_bytes, printf_frames, sh, Event, Recorder};
    use capsync_core::wire::{encode_header, Indicator};
    use std::time::Duration;

    fn session() -> Session<Recorder> {
        Session::new(launcher(), Recorder::default())
    }

    #[tokio::test]
    async fn test_end_to_end_capture() {
        let script = printf_frames(&[
            SyncMessage::File {
                path: "/tmp/x.pcap".into(),
            },
            SyncMessage::PacketCount { count: 1 },
            SyncMessage::PacketCount { count: 2 },
            SyncMessage::PacketCount { count: 3 },
        ]);
        let mut session = session();
        session.start_command(&sh(&script)).unwrap();
        assert_eq!(session.state(), CaptureState::Preparing);
        assert!(session.worker_pid().is_some());

        let exit = session.run().await.unwrap();

        assert_eq!(exit, Some(ReapOutcome::Exited(0)));
        assert_eq!(session.packet_count(), 6);
        assert_eq!(session.state(), CaptureState::Stopped);
        assert_eq!(session.current_file(), Some("/tmp/x.pcap"));
        assert!(session.session_started());
        assert!(session.worker_pid().is_none());
        assert_eq!(
            session.events().events,
            vec![
                Event::NewFile("/tmp/x.pcap".into()),
                Event::Packets(1),
                Event::Packets(2),
                Event::Packets(3),
                Event::Closed(None),
            ]
        );
    }

    #[test]
    fn test_blocking_loop_delivers_all_messages() {
        let script = printf_frames(&[
            SyncMessage::ErrorMsg {
                primary: "Interface went down".into(),
                secondary: "Check the cable".into(),
            },
            SyncMessage::BadFilter {
                index: 1,
                message: "syntax error".into(),
            },
            SyncMessage::Drops { dropped: 12 },
        ]);
        let mut session = session();
        session.start_command(&sh(&script)).unwrap();
        let exit = session.run_blocking().cloned();

        assert_eq!(exit, Some(ReapOutcome::Exited(0)));
        assert_eq!(
            session.events().events,
            vec![
                Event::Error("Interface went down".into(), "Check the cable".into()),
                Event::BadFilter(1, "syntax error".into()),
                Event::Drops(12),
                Event::Closed(None),
            ]
        );
    }

    #[tokio::test]
    async fn test_rejected_file_stops_capture() {
        let script = format!(
            "{}; exec sleep 5",
            printf_frames(&[
                SyncMessage::File {
                    path: "/tmp/ring_00001.pcapng".into(),
                },
                SyncMessage::PacketCount { count: 7 },
            ])
        );
        let mut session = Session::new(
            launcher(),
            Recorder {
                reject_files: true,
                ..Recorder::default()
            },
        );
        session.start_command(&sh(&script)).unwrap();

        assert_eq!(session.run().await.unwrap(), None);
        assert_eq!(session.state(), CaptureState::Stopped);
        assert_eq!(session.packet_count(), 0);
        assert_eq!(
            session.events().events,
            vec![
                Event::NewFile("/tmp/ring_00001.pcapng".into()),
                Event::Closed(None),
            ]
        );

        // The worker was asked to stop and is still ours to reap
        assert!(session.worker_pid().is_some());
        let exit = session.shutdown().cloned();
        assert_eq!(exit.map(|e| e.code()), Some(FATAL_EXIT_CODE));
        assert!(session.worker_pid().is_none());
    }

    #[tokio::test]
    async fn test_worker_exit_code_is_reported() {
        let mut session = session();
        session.start_command(&sh("exit 2")).unwrap();

        let exit = session.run().await.unwrap();
        assert_eq!(exit, Some(ReapOutcome::Exited(2)));
        assert_eq!(session.events().events, vec![Event::Closed(None)]);
    }

    #[tokio::test]
    async fn test_killed_worker_is_fatal() {
        let mut session = session();
        session.start_command(&sh("kill -TERM $$")).unwrap();

        let exit = session.run().await.unwrap().unwrap();
        assert_eq!(exit.code(), FATAL_EXIT_CODE);
        assert_eq!(exit.diagnostic(), Some("Child capture process died: Terminated"));
        assert_eq!(
            session.events().events,
            vec![Event::Closed(Some(
                "Child capture process died: Terminated".into()
            ))]
        );
    }

    #[tokio::test]
    async fn test_force_kill_is_idempotent() {
        let mut session = session();
        session.start_command(&sh("exec sleep 30")).unwrap();
        session.kill();
        session.kill();
        session.launcher().force_kill(None);

        let exit = session.run().await.unwrap().unwrap();
        assert!(exit.is_fatal());
        // Nothing left to signal
        session.kill();
        assert!(session.worker_pid().is_none());
    }

    #[tokio::test]
    async fn test_exec_failure_reported_over_sync_pipe() {
        let mut session = session();
        session
            .start_command(&ArgumentVector::new("/nonexistent/capsync-worker"))
            .unwrap();

        let exit = session.run().await.unwrap();
        assert_eq!(exit, Some(ReapOutcome::Exited(1)));

        let events = &session.events().events;
        assert_eq!(events.len(), 2);
        match &events[0] {
            Event::Error(primary, secondary) => {
                assert!(primary.starts_with(
                    "Couldn't run /nonexistent/capsync-worker in child process: "
                ));
                assert!(primary.contains("No such file or directory"));
                assert!(secondary.is_empty());
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(events[1], Event::Closed(None));
    }

    #[tokio::test]
    async fn test_shutdown_future_stops_worker() {
        let mut session = session();
        session.start_command(&sh("exec sleep 30")).unwrap();

        let exit = session
            .run_until(tokio::time::sleep(Duration::from_millis(100)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.diagnostic(), Some("Child capture process died: Interrupted"));
        assert_eq!(session.state(), CaptureState::Stopped);
    }

    #[tokio::test]
    async fn test_undecodable_error_message_keeps_capture_running() {
        let mut bytes = encode_header(Indicator::ErrorMsg.as_byte(), 6).unwrap().to_vec();
        bytes.extend_from_slice(&[b'E', 0, 0, 40, b'o', b'o']);
        let script = format!(
            "{}; {}; exec sleep 30",
            printf_bytes(&bytes),
            printf_frames(&[SyncMessage::PacketCount { count: 4 }])
        );
        let mut session = session();
        session.start_command(&sh(&script)).unwrap();

        let started = std::time::Instant::now();
        let exit = session
            .run_until(tokio::time::sleep(Duration::from_millis(100)))
            .await
            .unwrap()
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(exit.diagnostic(), Some("Child capture process died: Interrupted"));
        assert_eq!(session.packet_count(), 4);
        assert_eq!(
            session.events().events,
            vec![
                Event::Error("oo".into(), String::new()),
                Event::Packets(4),
                Event::Closed(Some("Child capture process died: Interrupted".into())),
            ]
        );
    }

    #[tokio::test]
    async fn test_premature_eof_inside_header() {
        let mut session = session();
        session.start_command(&sh(&printf_bytes(b"P\x00"))).unwrap();

        session.run().await.unwrap();
        assert_eq!(
            session.events().events,
            vec![Event::Closed(Some(
                "Premature EOF reading from sync pipe: got only 2 bytes".into()
            ))]
        );
    }

    #[tokio::test]
    async fn test_start_rejected_while_running() {
        let mut session = session();
        session.start_command(&sh("exec sleep 30")).unwrap();
        assert!(matches!(
            session.start_command(&sh("exit 0")),
            Err(LaunchError::Busy)
        ));

        session.stop();
        session.run().await.unwrap();

        // Restartable once stopped
        session.start_command(&sh("exit 0")).unwrap();
        assert_eq!(session.run().await.unwrap(), Some(ReapOutcome::Exited(0)));
    }

    #[test]
    fn test_launch_failure_leaves_session_stopped() {
        let mut session = Session::new(
            crate::testing::launcher_for("capsync-test-no-such-worker"),
            Recorder::default(),
        );
        let err = session
            .start(CaptureOptions::for_interface("eth0"))
            .unwrap_err();
        assert!(matches!(err, LaunchError::NotFound { .. }));
        assert_eq!(session.state(), CaptureState::Stopped);
        assert!(session.capture_options().is_none());
    }

    #[test]
    fn test_owner_is_current_user() {
        let session = session();
        assert_eq!(session.owner().0, nix::unistd::getuid().as_raw());
    }
}
