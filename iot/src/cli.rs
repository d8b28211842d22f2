//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// IoT daemon - device registry with group temperature queries
#[derive(Parser)]
#[command(
    name = "iot",
    about = "Device registry that aggregates temperature readings per group",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the device registry until interrupted
    Start,

    /// Register devices in a group, record readings and query the group once
    Simulate {
        /// Group to register the devices in
        #[arg(short, long, default_value = "floor-1")]
        group: String,

        /// Number of devices, named device-1..device-N
        #[arg(short = 'n', long, default_value = "3")]
        devices: usize,

        /// Devices that never record a reading
        #[arg(short, long, value_name = "DEVICE")]
        empty: Vec<String>,

        /// Devices stopped before the query runs
        #[arg(short, long, value_name = "DEVICE")]
        stop: Vec<String>,

        /// Query timeout in milliseconds (defaults to the config value)
        #[arg(short, long)]
        timeout_ms: Option<u64>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

/// Output format for query results
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => {
                debug!("OutputFormat::from_str: matched Text");
                Ok(Self::Text)
            }
            "json" => {
                debug!("OutputFormat::from_str: matched Json");
                Ok(Self::Json)
            }
            _ => {
                debug!(%s, "OutputFormat::from_str: unknown format");
                Err(format!("Unknown format: {}. Use: text or json", s))
            }
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Location of the daemon log file
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    let path = get_log_dir().join("iotdaemon.log");
    debug!(?path, "get_log_path: returning path");
    path
}

/// Directory holding the daemon log file
pub fn get_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("iotdaemon")
        .join("logs")
}
