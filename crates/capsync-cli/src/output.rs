//! Console output in text or JSON lines

use capsync_capture::command::{CommandOutput, InterfaceStats};
use capsync_capture::CaptureEvents;
use capsync_core::SyncMessage;
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Records that don't come straight off the sync pipe
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Report<'a> {
    Closed {
        diagnostic: Option<&'a str>,
    },
    Summary {
        packets: u64,
        file: Option<&'a str>,
    },
    Stats {
        interface: &'a str,
        received: u64,
        dropped: u64,
    },
    Command {
        command: &'a str,
        exit_code: i32,
        lines: Vec<&'a str>,
    },
}

#[derive(Serialize)]
struct Stamped<'a, T: Serialize> {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    record: &'a T,
}

#[derive(Debug, Clone, Copy)]
pub struct Printer {
    format: OutputFormat,
}

impl Printer {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    fn json<T: Serialize>(&self, record: &T) {
        let stamped = Stamped {
            timestamp: Utc::now(),
            record,
        };
        match serde_json::to_string(&stamped) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::error!("Failed to serialize output: {}", e),
        }
    }

    pub fn message(&self, message: &SyncMessage) {
        if self.format == OutputFormat::Json {
            self.json(message);
            return;
        }
        match message {
            SyncMessage::File { path } => println!("File: {}", path),
            SyncMessage::PacketCount { count } => println!("Packets: +{}", count),
            SyncMessage::ErrorMsg { primary, secondary } => {
                eprintln!("Error: {}", primary);
                if !secondary.is_empty() {
                    eprintln!("       {}", secondary);
                }
            }
            SyncMessage::BadFilter { index, message } => {
                eprintln!("Invalid capture filter for interface #{}: {}", index, message)
            }
            SyncMessage::Drops { dropped } => println!("Dropped: {}", dropped),
            SyncMessage::Success => println!("OK"),
        }
    }

    pub fn closed(&self, diagnostic: Option<&str>) {
        match self.format {
            OutputFormat::Json => self.json(&Report::Closed { diagnostic }),
            OutputFormat::Text => match diagnostic {
                Some(diagnostic) => eprintln!("Capture ended: {}", diagnostic),
                None => println!("Capture ended"),
            },
        }
    }

    pub fn summary(&self, packets: u64, file: Option<&str>) {
        match self.format {
            OutputFormat::Json => self.json(&Report::Summary { packets, file }),
            OutputFormat::Text => {
                println!("{} packets captured", packets);
                if let Some(file) = file {
                    println!("Saved to {}", file);
                }
            }
        }
    }

    pub fn stats(&self, stats: &InterfaceStats) {
        match self.format {
            OutputFormat::Json => self.json(&Report::Stats {
                interface: &stats.name,
                received: stats.received,
                dropped: stats.dropped,
            }),
            OutputFormat::Text => println!(
                "{:<24} {:>12} received {:>10} dropped",
                stats.name, stats.received, stats.dropped
            ),
        }
    }

    pub fn command_output(&self, command: &str, output: &CommandOutput) {
        match self.format {
            OutputFormat::Json => self.json(&Report::Command {
                command,
                exit_code: output.exit_code,
                lines: output.data.lines().collect(),
            }),
            OutputFormat::Text => print!("{}", output.data),
        }
    }
}

/// Prints capture events as they arrive
pub struct ConsoleEvents {
    printer: Printer,
}

impl ConsoleEvents {
    pub fn new(printer: Printer) -> Self {
        Self { printer }
    }

    pub fn summary(&self, packets: u64, file: Option<&str>) {
        self.printer.summary(packets, file);
    }
}

impl CaptureEvents for ConsoleEvents {
    fn new_file(&mut self, path: &str) -> bool {
        self.printer.message(&SyncMessage::File {
            path: path.to_string(),
        });
        true
    }

    fn new_packets(&mut self, count: u32) {
        self.printer.message(&SyncMessage::PacketCount { count });
    }

    fn error_message(&mut self, primary: &str, secondary: &str) {
        self.printer.message(&SyncMessage::ErrorMsg {
            primary: primary.to_string(),
            secondary: secondary.to_string(),
        });
    }

    fn bad_filter(&mut self, index: usize, message: &str) {
        self.printer.message(&SyncMessage::BadFilter {
            index,
            message: message.to_string(),
        });
    }

    fn drops(&mut self, dropped: u32) {
        self.printer.message(&SyncMessage::Drops { dropped });
    }

    fn input_closed(&mut self, diagnostic: Option<&str>) {
        self.printer.closed(diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamped_message_flattens_type_tag() {
        let message = SyncMessage::BadFilter {
            index: 1,
            message: "syntax error".to_string(),
        };
        let stamped = Stamped {
            timestamp: Utc::now(),
            record: &message,
        };
        let value = serde_json::to_value(&stamped).unwrap();
        assert_eq!(value["type"], "bad_filter");
        assert_eq!(value["index"], 1);
        assert_eq!(value["message"], "syntax error");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_command_report_splits_lines() {
        let report = Report::Command {
            command: "interfaces",
            exit_code: 0,
            lines: "1. eth0\n2. lo\n".lines().collect(),
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["type"], "command");
        assert_eq!(value["lines"].as_array().map(Vec::len), Some(2));
    }
}
