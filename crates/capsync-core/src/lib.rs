//! capsync core
//!
//! Building blocks shared by the capture controller and its front ends:
//! the sync pipe wire format, blocking pipe reads, capture option records,
//! worker command lines and configuration.

pub mod argv;
pub mod config;
pub mod options;
pub mod pipe;
pub mod wire;

pub use argv::{ArgumentVector, ChannelSpec, ChannelWidth, CONTROL_ID_NONE};
pub use config::{CapsyncConfig, ConfigError, ConfigLoader};
pub use options::{CaptureOptions, InterfaceOptions, RemoteAuth, Sampling};
pub use pipe::PipeReader;
pub use wire::{Frame, Indicator, ReadOutcome, SyncMessage, WireError, SP_MAX_MSG_LEN};
