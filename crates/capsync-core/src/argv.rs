//! Worker command lines
//!
//! Every vector starts with the worker program path and ends with
//! `-Z <control token>`, which puts the worker into child mode and tells it
//! to report over the sync pipe.

use crate::options::{CaptureOptions, InterfaceOptions, Sampling, DEFAULT_BUFFER_SIZE, MAX_SNAPLEN};
use std::fmt;
use std::path::Path;

/// Control token meaning "no signal pipe"; the worker watches its stdin
pub const CONTROL_ID_NONE: &str = "none";

/// Program path followed by its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentVector {
    args: Vec<String>,
}

impl ArgumentVector {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            args: vec![program.as_ref().to_string_lossy().into_owned()],
        }
    }

    pub fn push(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    /// Push a flag and its value
    pub fn push_pair(&mut self, flag: &str, value: impl Into<String>) -> &mut Self {
        self.push(flag).push(value)
    }

    pub fn program(&self) -> &str {
        &self.args[0]
    }

    /// Everything after the program path
    pub fn args(&self) -> &[String] {
        &self.args[1..]
    }

    pub fn as_slice(&self) -> &[String] {
        &self.args
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    fn finish(mut self, control_id: &str) -> Self {
        self.push_pair("-Z", control_id);
        self
    }
}

impl fmt::Display for ArgumentVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, "\"{arg}\"")?;
            } else {
                f.write_str(arg)?;
            }
        }
        Ok(())
    }
}

/// Command line for a capture session
pub fn build_capture_argv(
    program: impl AsRef<Path>,
    options: &CaptureOptions,
    control_id: &str,
) -> ArgumentVector {
    let mut argv = ArgumentVector::new(program);

    if options.interfaces.len() > 1 {
        argv.push("-t");
    }

    argv.push(if options.use_pcapng { "-n" } else { "-P" });

    if let Some(comment) = &options.capture_comment {
        argv.push_pair("--capture-comment", comment.as_str());
    }

    if options.multi_files_on {
        if let Some(kb) = options.autostop_filesize {
            argv.push_pair("-b", format!("filesize:{kb}"));
        }
        if let Some(secs) = options.file_duration {
            argv.push_pair("-b", format!("duration:{secs}"));
        }
        if let Some(files) = options.ring_num_files {
            argv.push_pair("-b", format!("files:{files}"));
        }
        if let Some(files) = options.autostop_files {
            argv.push_pair("-a", format!("files:{files}"));
        }
    } else if let Some(kb) = options.autostop_filesize {
        argv.push_pair("-a", format!("filesize:{kb}"));
    }

    if let Some(packets) = options.autostop_packets {
        argv.push_pair("-c", packets.to_string());
    }

    if let Some(secs) = options.autostop_duration {
        argv.push_pair("-a", format!("duration:{secs}"));
    }

    if options.group_read_access {
        argv.push("-g");
    }

    for iface in &options.interfaces {
        push_interface(&mut argv, iface);
    }

    argv.push_pair("-Z", control_id);

    if let Some(file) = &options.save_file {
        argv.push_pair("-w", file.to_string_lossy());
    }

    argv
}

fn push_interface(argv: &mut ArgumentVector, iface: &InterfaceOptions) {
    argv.push_pair("-i", iface.extcap_fifo.as_deref().unwrap_or(&iface.name));

    if let Some(filter) = iface.cfilter.as_deref().filter(|f| !f.is_empty()) {
        argv.push_pair("-f", filter);
    }

    if iface.snaplen != MAX_SNAPLEN {
        argv.push_pair("-s", iface.snaplen.to_string());
    }

    if let Some(linktype) = &iface.linktype {
        argv.push_pair("-y", linktype.as_str());
    }

    if !iface.promisc_mode {
        argv.push("-p");
    }

    if iface.buffer_size != DEFAULT_BUFFER_SIZE {
        let size = match iface.buffer_size {
            0 => DEFAULT_BUFFER_SIZE,
            n => n,
        };
        argv.push_pair("-B", size.to_string());
    }

    if iface.monitor_mode {
        argv.push("-I");
    }

    if iface.datatx_udp {
        argv.push("-u");
    }

    if !iface.nocap_rpcap {
        argv.push("-r");
    }

    if let Some(auth) = &iface.auth {
        argv.push_pair("-A", format!("{}:{}", auth.username, auth.password));
    }

    if let Some(sampling) = iface.sampling {
        let spec = match sampling {
            Sampling::ByCount(n) => format!("count:{n}"),
            Sampling::ByTimer(ms) => format!("timer:{ms}"),
        };
        argv.push_pair("-m", spec);
    }
}

/// `-D`: list capture interfaces
pub fn list_interfaces_argv(program: impl AsRef<Path>, control_id: &str) -> ArgumentVector {
    let mut argv = ArgumentVector::new(program);
    argv.push("-D");
    argv.finish(control_id)
}

/// `-i <iface> -L`: list link-layer types, optionally in monitor mode
pub fn if_capabilities_argv(
    program: impl AsRef<Path>,
    interface: &str,
    monitor_mode: bool,
    auth: Option<&str>,
    control_id: &str,
) -> ArgumentVector {
    let mut argv = ArgumentVector::new(program);
    argv.push_pair("-i", interface).push("-L");
    if monitor_mode {
        argv.push("-I");
    }
    if let Some(auth) = auth {
        argv.push_pair("-A", auth);
    }
    argv.finish(control_id)
}

/// `-S`: stream per-interface packet statistics
pub fn interface_stats_argv(program: impl AsRef<Path>, control_id: &str) -> ArgumentVector {
    let mut argv = ArgumentVector::new(program);
    argv.push("-S");
    argv.finish(control_id)
}

/// 802.11 channel for `-k`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub freq: String,
    /// Channel type plus both center frequencies, e.g. `VHT80`
    pub width: Option<ChannelWidth>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelWidth {
    pub channel_type: String,
    pub center_freq1: String,
    pub center_freq2: String,
}

impl fmt::Display for ChannelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.width {
            Some(w) => write!(
                f,
                "{},{},{},{}",
                self.freq, w.channel_type, w.center_freq1, w.center_freq2
            ),
            None => f.write_str(&self.freq),
        }
    }
}

/// `-i <iface> -k <channel>`: set the 802.11 channel
pub fn set_channel_argv(
    program: impl AsRef<Path>,
    interface: &str,
    channel: &ChannelSpec,
    control_id: &str,
) -> ArgumentVector {
    let mut argv = ArgumentVector::new(program);
    argv.push_pair("-i", interface)
        .push_pair("-k", channel.to_string());
    argv.finish(control_id)
}

/// Arbitrary worker arguments in child mode
pub fn command_argv<I, S>(program: impl AsRef<Path>, args: I, control_id: &str) -> ArgumentVector
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut argv = ArgumentVector::new(program);
    for arg in args {
        argv.push(arg);
    }
    argv.finish(control_id)
}
