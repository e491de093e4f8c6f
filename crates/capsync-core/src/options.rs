//! Capture option records handed to the launcher

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Largest snapshot length the worker accepts; the worker's own default
pub const MAX_SNAPLEN: u32 = 262_144;

/// Kernel capture buffer size in MiB the worker uses unless told otherwise
pub const DEFAULT_BUFFER_SIZE: u32 = 2;

/// Options for one capture run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureOptions {
    pub interfaces: Vec<InterfaceOptions>,

    /// Write pcapng rather than pcap
    pub use_pcapng: bool,

    pub capture_comment: Option<String>,

    /// Ring buffer / multiple file output
    pub multi_files_on: bool,

    /// Switch (or stop) after this many kB
    pub autostop_filesize: Option<u32>,

    /// Switch files after this many seconds
    pub file_duration: Option<u32>,

    pub ring_num_files: Option<u32>,
    pub autostop_files: Option<u32>,
    pub autostop_packets: Option<u32>,

    /// Stop after this many seconds
    pub autostop_duration: Option<u32>,

    pub group_read_access: bool,
    pub save_file: Option<PathBuf>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            interfaces: Vec::new(),
            use_pcapng: true,
            capture_comment: None,
            multi_files_on: false,
            autostop_filesize: None,
            file_duration: None,
            ring_num_files: None,
            autostop_files: None,
            autostop_packets: None,
            autostop_duration: None,
            group_read_access: false,
            save_file: None,
        }
    }
}

impl CaptureOptions {
    /// Options capturing on a single interface with defaults everywhere else
    pub fn for_interface(name: impl Into<String>) -> Self {
        Self {
            interfaces: vec![InterfaceOptions::new(name)],
            ..Self::default()
        }
    }
}

/// Per-interface options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceOptions {
    pub name: String,

    /// FIFO to read from instead of the interface (extcap)
    pub extcap_fifo: Option<String>,

    /// Capture filter
    pub cfilter: Option<String>,

    pub snaplen: u32,

    /// Link-layer header type name, e.g. `EN10MB`
    pub linktype: Option<String>,

    pub promisc_mode: bool,

    /// Buffer size in MiB; 0 means the default
    pub buffer_size: u32,

    pub monitor_mode: bool,

    /// Remote capture: transfer data over UDP
    pub datatx_udp: bool,

    /// Remote capture: ignore our own RPCAP traffic
    pub nocap_rpcap: bool,

    pub auth: Option<RemoteAuth>,
    pub sampling: Option<Sampling>,
}

impl Default for InterfaceOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            extcap_fifo: None,
            cfilter: None,
            snaplen: MAX_SNAPLEN,
            linktype: None,
            promisc_mode: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
            monitor_mode: false,
            datatx_udp: false,
            nocap_rpcap: true,
            auth: None,
            sampling: None,
        }
    }
}

impl InterfaceOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Password authentication for a remote interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAuth {
    pub username: String,
    pub password: String,
}

impl RemoteAuth {
    /// Parse `user:password`; the password may itself contain colons
    pub fn parse(text: &str) -> Option<Self> {
        let (username, password) = text.split_once(':')?;
        Some(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

/// Packet sampling on a remote interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sampling {
    /// One packet out of every N
    ByCount(u32),
    /// One packet every N milliseconds
    ByTimer(u32),
}
