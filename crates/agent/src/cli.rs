//! Command line and the bits of config the binary needs before the agent
//! starts

use agent_lib::config::{LogConfig, DEFAULT_CONFIG_PATH, DEFAULT_DIAGNOSTICS_SOCKET};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(
    name = "signalfx-agent",
    about = "SignalFx host telemetry agent",
    disable_version_flag = true
)]
pub struct Cli {
    /// Path to the agent config file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH, env = "SFX_CONFIG")]
    pub config: PathBuf,

    /// Log at debug level regardless of config
    #[arg(long)]
    pub debug: bool,

    /// Print the agent version and exit
    #[arg(long)]
    pub version: bool,

    /// How often to poll the config file for changes, e.g. `5s` or `500ms`.
    /// Zero disables watching.
    #[arg(long = "filePollRate", default_value = "5s", value_parser = parse_duration)]
    pub file_poll_rate: Duration,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show the status of the running agent
    Status {
        /// One of version, config, writer, observers, monitors, endpoints
        section: Option<String>,
    },
}

/// Parse `<n>`, `<n>ms`, `<n>s`, `<n>m` or `<n>h`. A bare number is seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(input.len());
    let (number, unit) = input.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration '{}'", input))?;

    let seconds = match unit {
        "" | "s" => value,
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("unknown duration unit '{}' in '{}'", other, input)),
    };
    Duration::try_from_secs_f64(seconds)
        .map_err(|e| format!("invalid duration '{}': {}", input, e))
}

/// Top-level keys read straight from the file, before sources and
/// validation run
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapConfig {
    #[serde(default)]
    pub logging: LogConfig,
    pub diagnostics_socket_path: Option<PathBuf>,
    #[serde(default)]
    pub profiling: bool,
    pub profiling_host: Option<String>,
    pub profiling_port: Option<u16>,
}

impl BootstrapConfig {
    /// Defaults when the file is missing or unreadable; the agent itself
    /// reports those errors
    pub fn peek(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_yaml::from_str(&text).ok())
            .unwrap_or_default()
    }

    pub fn diagnostics_socket(&self) -> PathBuf {
        self.diagnostics_socket_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DIAGNOSTICS_SOCKET))
    }

    pub fn profiling_addr(&self) -> String {
        format!(
            "{}:{}",
            self.profiling_host.as_deref().unwrap_or("127.0.0.1"),
            self.profiling_port.unwrap_or(6060)
        )
    }
}
