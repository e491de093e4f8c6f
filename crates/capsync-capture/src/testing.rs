//! Shared test helpers: `/bin/sh` stub workers and a recording event sink

use crate::launcher::{Launcher, LauncherConfig};
use crate::session::CaptureEvents;
use capsync_core::config::WorkerSettings;
use capsync_core::wire::SyncMessage;
use capsync_core::ArgumentVector;

pub(crate) fn launcher() -> Launcher {
    Launcher::new(LauncherConfig::default())
}

/// Launcher that searches for `program_name` instead of using a fixed path
pub(crate) fn launcher_for(program_name: &str) -> Launcher {
    Launcher::new(LauncherConfig {
        worker: WorkerSettings {
            path: None,
            program_name: program_name.to_string(),
        },
        ..LauncherConfig::default()
    })
}

/// `/bin/sh -c <script>`
pub(crate) fn sh(script: &str) -> ArgumentVector {
    let mut argv = ArgumentVector::new("/bin/sh");
    argv.push("-c").push(script);
    argv
}

/// Shell command writing `bytes` to stderr, every byte as an octal escape
pub(crate) fn printf_bytes(bytes: &[u8]) -> String {
    let mut script = String::from("printf '");
    for byte in bytes {
        script.push_str(&format!("\\{byte:03o}"));
    }
    script.push_str("' >&2");
    script
}

pub(crate) fn printf_frames(messages: &[SyncMessage]) -> String {
    let bytes: Vec<u8> = messages
        .iter()
        .flat_map(|m| m.encode().unwrap())
        .collect();
    printf_bytes(&bytes)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    NewFile(String),
    Packets(u32),
    Error(String, String),
    BadFilter(usize, String),
    Drops(u32),
    Closed(Option<String>),
}

#[derive(Debug, Default)]
pub(crate) struct Recorder {
    pub events: Vec<Event>,
    pub reject_files: bool,
}

impl CaptureEvents for Recorder {
    fn new_file(&mut self, path: &str) -> bool {
        self.events.push(Event::NewFile(path.to_string()));
        !self.reject_files
    }

    fn new_packets(&mut self, count: u32) {
        self.events.push(Event::Packets(count));
    }

    fn error_message(&mut self, primary: &str, secondary: &str) {
        self.events
            .push(Event::Error(primary.to_string(), secondary.to_string()));
    }

    fn bad_filter(&mut self, index: usize, message: &str) {
        self.events.push(Event::BadFilter(index, message.to_string()));
    }

    fn drops(&mut self, dropped: u32) {
        self.events.push(Event::Drops(dropped));
    }

    fn input_closed(&mut self, diagnostic: Option<&str>) {
        self.events.push(Event::Closed(diagnostic.map(str::to_string)));
    }
}
