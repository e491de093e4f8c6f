//! capsync capture control
//!
//! Starts the capture worker, follows its sync pipe and controls its
//! lifetime:
//! - [`launcher`]: finding and starting the worker
//! - [`session`]: capture sessions driven by sync pipe messages
//! - [`lifecycle`]: stopping, killing and reaping
//! - [`command`]: one-shot queries (interfaces, capabilities, statistics)

pub mod backend;
pub mod command;
pub mod launcher;
pub mod lifecycle;
pub mod session;

#[cfg(all(test, unix))]
mod testing;

pub use backend::{LaunchError, ProcessBackend, StdioWiring, WorkerHandle};
pub use command::{CommandFailure, CommandOutput, StatsStream};
pub use launcher::{Launcher, LauncherConfig};
pub use lifecycle::{ReapOutcome, FATAL_EXIT_CODE};
pub use session::{CaptureEvents, CaptureState, Session};
