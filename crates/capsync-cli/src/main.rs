//! capsync - drive a packet capture worker over its sync pipe

mod output;

use anyhow::{bail, Context};
use capsync_capture::command::{self, parse_stats_line, CommandFailure, CommandOutput};
use capsync_capture::{Launcher, LauncherConfig, ReapOutcome, Session};
use capsync_core::{CapsyncConfig, CaptureOptions, ChannelSpec, ChannelWidth, ConfigLoader, InterfaceOptions, RemoteAuth};
use clap::{Parser, Subcommand};
use output::{ConsoleEvents, OutputFormat, Printer};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "capsync")]
#[command(version)]
#[command(about = "Run and control a packet capture worker", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "CAPSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Capture worker executable (overrides the configured one)
    #[arg(long, global = true)]
    worker: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture packets until the worker stops or Ctrl-C is pressed
    Capture {
        /// Interface to capture on (repeatable)
        #[arg(short, long)]
        interface: Vec<String>,

        /// Capture filter applied to every interface
        #[arg(short, long)]
        filter: Option<String>,

        /// Output file
        #[arg(short, long)]
        write: Option<PathBuf>,

        /// Stop after this many packets
        #[arg(short = 'c', long)]
        count: Option<u32>,

        /// Stop after this many seconds
        #[arg(short = 'a', long)]
        duration: Option<u32>,

        /// Snapshot length
        #[arg(short, long)]
        snaplen: Option<u32>,

        /// Write pcap instead of pcapng
        #[arg(long)]
        pcap: bool,

        /// Don't put interfaces into promiscuous mode
        #[arg(long)]
        no_promisc: bool,

        /// Capture in 802.11 monitor mode
        #[arg(long)]
        monitor: bool,

        /// Ring buffer: number of files
        #[arg(long)]
        ring_files: Option<u32>,

        /// Ring buffer: switch files after this many seconds
        #[arg(long)]
        file_duration: Option<u32>,

        /// Switch (ring buffer) or stop after this many kB
        #[arg(long)]
        filesize: Option<u32>,

        /// Comment stored in the capture file
        #[arg(long)]
        comment: Option<String>,
    },

    /// List capture interfaces
    Interfaces,

    /// Show link-layer types of an interface
    Caps {
        #[arg(short, long)]
        interface: String,

        /// Query capabilities in monitor mode
        #[arg(long)]
        monitor: bool,

        /// Remote authentication as user:password
        #[arg(long)]
        auth: Option<String>,
    },

    /// Stream per-interface packet statistics
    Stats {
        /// Polling interval in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,

        /// Number of polls (0 = until Ctrl-C)
        #[arg(long, default_value = "0")]
        samples: u64,
    },

    /// Set the 802.11 channel of an interface
    SetChannel {
        #[arg(short, long)]
        interface: String,

        /// Frequency in MHz
        #[arg(long)]
        freq: String,

        /// Channel type, e.g. HT40+ or VHT80
        #[arg(long = "type", requires_all = ["center_freq1", "center_freq2"])]
        channel_type: Option<String>,

        #[arg(long)]
        center_freq1: Option<String>,

        #[arg(long)]
        center_freq2: Option<String>,
    },

    /// Run the worker with arbitrary arguments in child mode
    Exec {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.clone());
    if let Some(worker) = cli.worker.clone() {
        config.worker.path = Some(worker);
    }

    // CLI verbose flag takes precedence, then config
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match config.general.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let launcher = Launcher::new(LauncherConfig::from_config(&config));
    let printer = Printer::new(cli.format);

    match cli.command {
        Commands::Capture {
            interface,
            filter,
            write,
            count,
            duration,
            snaplen,
            pcap,
            no_promisc,
            monitor,
            ring_files,
            file_duration,
            filesize,
            comment,
        } => {
            let mut options = config.capture.clone();
            if !interface.is_empty() {
                options.interfaces = interface.into_iter().map(InterfaceOptions::new).collect();
            }
            for iface in &mut options.interfaces {
                if filter.is_some() {
                    iface.cfilter = filter.clone();
                }
                if let Some(snaplen) = snaplen {
                    iface.snaplen = snaplen;
                }
                iface.promisc_mode &= !no_promisc;
                iface.monitor_mode |= monitor;
            }
            options.use_pcapng &= !pcap;
            options.save_file = write.or(options.save_file);
            options.autostop_packets = count.or(options.autostop_packets);
            options.autostop_duration = duration.or(options.autostop_duration);
            options.ring_num_files = ring_files.or(options.ring_num_files);
            options.file_duration = file_duration.or(options.file_duration);
            options.autostop_filesize = filesize.or(options.autostop_filesize);
            options.capture_comment = comment.or(options.capture_comment);
            options.multi_files_on |= options.ring_num_files.is_some() || options.file_duration.is_some();

            capture_command(launcher, options, printer).await?;
        }

        Commands::Interfaces => {
            let result = command::list_interfaces(&launcher);
            report_command(&printer, "interfaces", result)?;
        }

        Commands::Caps {
            interface,
            monitor,
            auth,
        } => {
            if let Some(auth) = &auth {
                if RemoteAuth::parse(auth).is_none() {
                    bail!("--auth must be user:password");
                }
            }
            let result = command::if_capabilities(&launcher, &interface, monitor, auth.as_deref());
            report_command(&printer, "capabilities", result)?;
        }

        Commands::Stats {
            interval_ms,
            samples,
        } => {
            stats_command(&launcher, &printer, Duration::from_millis(interval_ms), samples).await?;
        }

        Commands::SetChannel {
            interface,
            freq,
            channel_type,
            center_freq1,
            center_freq2,
        } => {
            let width = match (channel_type, center_freq1, center_freq2) {
                (Some(channel_type), Some(center_freq1), Some(center_freq2)) => Some(ChannelWidth {
                    channel_type,
                    center_freq1,
                    center_freq2,
                }),
                _ => None,
            };
            let channel = ChannelSpec { freq, width };
            let result = command::set_80211_channel(&launcher, &interface, &channel);
            report_command(&printer, "set_channel", result)?;
        }

        Commands::Exec { args } => {
            let result = command::run_worker_command(&launcher, args);
            report_command(&printer, "exec", result)?;
        }
    }

    Ok(())
}

/// Load configuration, falling back to defaults
fn load_config(cli_path: Option<PathBuf>) -> CapsyncConfig {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => {
            info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            warn!("Failed to load configuration: {}, using defaults", e);
            CapsyncConfig::default()
        }
    }
}

async fn capture_command(
    launcher: Launcher,
    options: CaptureOptions,
    printer: Printer,
) -> anyhow::Result<()> {
    if options.interfaces.is_empty() {
        bail!("No capture interface given (use --interface or [capture] in the config)");
    }

    let mut session = Session::new(launcher, ConsoleEvents::new(printer));
    session.start(options).context("Failed to start capture")?;
    info!(pid = ?session.worker_pid(), "Capture running, press Ctrl-C to stop");

    #[cfg(unix)]
    let exit = session
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    #[cfg(not(unix))]
    let exit = tokio::task::block_in_place(|| session.run_blocking().cloned());

    let packets = session.packet_count();
    session.events().summary(packets, session.current_file());

    match exit {
        Some(ReapOutcome::Fatal { diagnostic }) => bail!("{}", diagnostic),
        Some(ReapOutcome::Exited(0)) | None => Ok(()),
        Some(ReapOutcome::Exited(code)) => {
            warn!("Capture worker exited with status {}", code);
            std::process::exit(code);
        }
    }
}

async fn stats_command(
    launcher: &Launcher,
    printer: &Printer,
    interval: Duration,
    samples: u64,
) -> anyhow::Result<()> {
    let mut stats = command::open_interface_stats(launcher).map_err(failure_error)?;
    let mut taken = 0u64;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        loop {
            match stats.gets_nonblock() {
                Ok(Some(line)) => match parse_stats_line(&line) {
                    Some(entry) => printer.stats(&entry),
                    None => warn!("Unparsable statistics line: {:?}", line),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("Statistics stream ended: {}", e);
                    let outcome = stats.close();
                    if let Some(diagnostic) = outcome.diagnostic() {
                        bail!("{}", diagnostic);
                    }
                    return Ok(());
                }
            }
        }

        taken += 1;
        if samples != 0 && taken >= samples {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = &mut ctrl_c => break,
        }
    }

    let outcome = stats.close();
    info!("Statistics worker {}", outcome);
    Ok(())
}

fn report_command(
    printer: &Printer,
    what: &str,
    result: Result<CommandOutput, CommandFailure>,
) -> anyhow::Result<()> {
    match result {
        Ok(output) => {
            printer.command_output(what, &output);
            if output.exit_code != 0 {
                std::process::exit(output.exit_code);
            }
            Ok(())
        }
        Err(failure) => Err(failure_error(failure)),
    }
}

fn failure_error(failure: CommandFailure) -> anyhow::Error {
    match failure.secondary.as_deref().filter(|s| !s.is_empty()) {
        Some(secondary) => anyhow::anyhow!("{}\n{}", failure.primary, secondary),
        None => anyhow::anyhow!("{}", failure.primary),
    }
}
