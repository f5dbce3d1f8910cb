//! Agent configuration
//!
//! This module provides:
//! - Typed configuration structs with their defaults
//! - Parsing of the YAML document with `${VAR}` expansion and `#from` values
//! - Validation with line numbers for the offending entries
//! - A watching loader that emits fresh snapshots on change

mod dynamic;
mod loader;
mod parse;
pub mod sources;
mod yaml;

#[cfg(test)]
mod tests;

pub use loader::{load, ConfigStream};
pub use parse::{parse_config, parse_config_text};

use crate::endpoint::rules::Rule;
use crate::error::ConfigError;
use crate::filters::{FilterSet, MetricFilter, PropertyFilterConfig};
use crate::monitors::MonitorSettings;
use crate::observers::ObserverSettings;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/signalfx/agent.yaml";
pub const DEFAULT_INGEST_URL: &str = "https://ingest.signalfx.com";
pub const DEFAULT_API_URL: &str = "https://api.signalfx.com";
pub const DEFAULT_INTERVAL_SECONDS: u64 = 10;
pub const DEFAULT_DIAGNOSTICS_SOCKET: &str = "/var/run/signalfx-agent/diagnostics.sock";
pub const DEFAULT_INTERNAL_METRICS_SOCKET: &str = "/var/run/signalfx-agent/internal-metrics.sock";
pub const DEFAULT_CONFIGURE_TIMEOUT_SECONDS: u64 = 30;

/// Fully resolved agent configuration. Immutable once built; reloads
/// produce a new value.
#[derive(Debug, Clone)]
pub struct Config {
    pub access_token: String,
    pub ingest_url: String,
    pub api_url: String,
    pub hostname: String,
    pub disable_host_dimensions: bool,
    pub interval_seconds: u64,
    pub global_dimensions: HashMap<String, String>,
    pub enable_builtin_filtering: bool,
    pub observers: Vec<ObserverConfig>,
    pub monitors: Vec<MonitorConfig>,
    pub writer: WriterConfig,
    pub logging: LogConfig,
    pub collectd: CollectdConfig,
    pub metrics_to_exclude: Vec<MetricFilter>,
    pub metrics_to_include: Vec<MetricFilter>,
    pub diagnostics_socket_path: PathBuf,
    pub internal_metrics_socket_path: PathBuf,
    pub profiling: bool,
    pub profiling_host: String,
    pub profiling_port: u16,
    pub bundle_dir: PathBuf,
    /// Resolved document with secrets masked, for display
    pub display_yaml: String,
    /// SHA-256 of the resolved document
    pub content_hash: String,
}

impl Config {
    /// Host-id dimensions forced onto host-specific telemetry
    pub fn host_id_dimensions(&self) -> HashMap<String, String> {
        let mut dims = HashMap::new();
        if !self.disable_host_dimensions && !self.hostname.is_empty() {
            dims.insert(crate::models::HOST_DIMENSION.to_string(), self.hostname.clone());
        }
        dims
    }
}

/// `logging` subtree
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// `collectd` subtree. Consumed by the bundled collectd runtime, which runs
/// as an external process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CollectdConfig {
    #[serde(default)]
    pub disable_collectd: bool,
    #[serde(default = "default_collectd_timeout")]
    pub timeout: u32,
    #[serde(default = "default_read_threads")]
    pub read_threads: u32,
    #[serde(default = "default_write_threads")]
    pub write_threads: u32,
    #[serde(default = "default_write_queue_high")]
    pub write_queue_limit_high: u32,
    #[serde(default = "default_write_queue_low")]
    pub write_queue_limit_low: u32,
    #[serde(default = "default_collectd_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub interval_seconds: u64,
    #[serde(default = "default_collectd_config_dir")]
    pub config_dir: PathBuf,
}

fn default_collectd_timeout() -> u32 {
    40
}

fn default_read_threads() -> u32 {
    5
}

fn default_write_threads() -> u32 {
    2
}

fn default_write_queue_high() -> u32 {
    500_000
}

fn default_write_queue_low() -> u32 {
    400_000
}

fn default_collectd_log_level() -> String {
    "notice".to_string()
}

fn default_collectd_config_dir() -> PathBuf {
    PathBuf::from("/var/run/signalfx-agent/collectd")
}

impl Default for CollectdConfig {
    fn default() -> Self {
        Self {
            disable_collectd: false,
            timeout: default_collectd_timeout(),
            read_threads: default_read_threads(),
            write_threads: default_write_threads(),
            write_queue_limit_high: default_write_queue_high(),
            write_queue_limit_low: default_write_queue_low(),
            log_level: default_collectd_log_level(),
            interval_seconds: 0,
            config_dir: default_collectd_config_dir(),
        }
    }
}

/// Writer settings after merging top-level values into the `writer` subtree
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub ingest_url: String,
    pub api_url: String,
    pub access_token: String,
    pub datapoint_endpoint_url: Option<String>,
    pub event_endpoint_url: Option<String>,
    pub trace_endpoint_url: Option<String>,
    pub global_dimensions: HashMap<String, String>,
    pub host_id_dimensions: HashMap<String, String>,
    pub datapoint_max_batch_size: usize,
    pub datapoint_max_requests: usize,
    pub trace_span_max_batch_size: usize,
    pub trace_span_max_requests: usize,
    pub event_send_interval: Duration,
    pub properties_max_requests: usize,
    pub properties_history_size: usize,
    pub properties_to_exclude: Vec<PropertyFilterConfig>,
    pub filter: FilterSet,
    pub log_datapoints: bool,
    pub log_events: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        let raw = RawWriterConfig::default();
        Self {
            ingest_url: DEFAULT_INGEST_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            access_token: String::new(),
            datapoint_endpoint_url: None,
            event_endpoint_url: None,
            trace_endpoint_url: None,
            global_dimensions: HashMap::new(),
            host_id_dimensions: HashMap::new(),
            datapoint_max_batch_size: raw.datapoint_max_batch_size,
            datapoint_max_requests: raw.max_requests,
            trace_span_max_batch_size: raw.trace_span_max_batch_size,
            trace_span_max_requests: raw.trace_span_max_requests,
            event_send_interval: Duration::from_secs(raw.event_send_interval_seconds),
            properties_max_requests: raw.properties_max_requests,
            properties_history_size: raw.properties_history_size,
            properties_to_exclude: Vec::new(),
            filter: FilterSet::default(),
            log_datapoints: false,
            log_events: false,
        }
    }
}

impl WriterConfig {
    /// Capacity of the datapoint channel
    pub fn datapoint_buffer_size(&self) -> usize {
        self.datapoint_max_batch_size * self.datapoint_max_requests
    }

    /// Capacity of the span channel
    pub fn span_buffer_size(&self) -> usize {
        self.trace_span_max_batch_size * self.trace_span_max_requests
    }

    /// True when two configs size the writer's channels differently
    pub fn buffers_differ(&self, other: &WriterConfig) -> bool {
        self.datapoint_buffer_size() != other.datapoint_buffer_size()
            || self.span_buffer_size() != other.span_buffer_size()
            || self.properties_history_size != other.properties_history_size
            || self.properties_max_requests != other.properties_max_requests
            || self.datapoint_max_requests != other.datapoint_max_requests
            || self.trace_span_max_requests != other.trace_span_max_requests
    }
}

/// The `writer` subtree as written in YAML
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct RawWriterConfig {
    pub ingest_url: Option<String>,
    pub api_url: Option<String>,
    pub access_token: Option<String>,
    pub datapoint_endpoint_url: Option<String>,
    pub event_endpoint_url: Option<String>,
    pub trace_endpoint_url: Option<String>,
    /// Replaces the top-level map when set
    pub global_dimensions: Option<HashMap<String, String>>,
    #[serde(default = "default_batch_size")]
    pub datapoint_max_batch_size: usize,
    /// Newer spelling of `maxRequests`; wins when both are set
    pub datapoint_max_requests: Option<usize>,
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
    #[serde(default = "default_batch_size")]
    pub trace_span_max_batch_size: usize,
    #[serde(default = "default_max_requests")]
    pub trace_span_max_requests: usize,
    #[serde(default = "default_event_interval")]
    pub event_send_interval_seconds: u64,
    #[serde(default = "default_properties_max_requests")]
    pub properties_max_requests: usize,
    #[serde(default = "default_properties_history_size")]
    pub properties_history_size: usize,
    #[serde(default)]
    pub properties_to_exclude: Vec<PropertyFilterConfig>,
    #[serde(default)]
    pub log_datapoints: bool,
    #[serde(default)]
    pub log_events: bool,
}

fn default_batch_size() -> usize {
    1000
}

fn default_max_requests() -> usize {
    10
}

fn default_event_interval() -> u64 {
    1
}

fn default_properties_max_requests() -> usize {
    20
}

fn default_properties_history_size() -> usize {
    10_000
}

impl Default for RawWriterConfig {
    fn default() -> Self {
        Self {
            ingest_url: None,
            api_url: None,
            access_token: None,
            datapoint_endpoint_url: None,
            event_endpoint_url: None,
            trace_endpoint_url: None,
            global_dimensions: None,
            datapoint_max_batch_size: default_batch_size(),
            datapoint_max_requests: None,
            max_requests: default_max_requests(),
            trace_span_max_batch_size: default_batch_size(),
            trace_span_max_requests: default_max_requests(),
            event_send_interval_seconds: default_event_interval(),
            properties_max_requests: default_properties_max_requests(),
            properties_history_size: default_properties_history_size(),
            properties_to_exclude: Vec::new(),
            log_datapoints: false,
            log_events: false,
        }
    }
}

/// One entry of `monitors`
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Position in the `monitors` sequence
    pub index: usize,
    pub monitor_type: String,
    pub discovery_rule: Option<Rule>,
    pub interval: Duration,
    pub extra_dimensions: HashMap<String, String>,
    pub metrics_to_exclude: Vec<MetricFilter>,
    pub extra_metrics: Vec<String>,
    pub disable_host_dimensions: bool,
    pub disable_endpoint_dimensions: bool,
    pub solo: bool,
    pub configure_timeout: Duration,
    pub settings: MonitorSettings,
    /// The entry as written, for hashing and subprocess runners
    pub raw: serde_json::Value,
    /// SHA-256 of `raw`
    pub hash: String,
    pub line: Option<usize>,
    /// Set when the entry failed type-specific validation
    pub validation_error: Option<ConfigError>,
}

impl MonitorConfig {
    pub fn is_static(&self) -> bool {
        self.discovery_rule.is_none()
    }

    pub fn is_valid(&self) -> bool {
        self.validation_error.is_none()
    }

    /// Short hash prefix used in logs and monitor ids
    pub fn short_hash(&self) -> &str {
        &self.hash[..self.hash.len().min(12)]
    }
}

/// One entry of `observers`
#[derive(Debug, Clone)]
pub struct ObserverConfig {
    pub index: usize,
    pub observer_type: String,
    /// User-supplied name; defaults to the type
    pub name: String,
    pub settings: ObserverSettings,
    pub hash: String,
    pub line: Option<usize>,
    pub validation_error: Option<ConfigError>,
}
