//! Building a `Config` from YAML text

use super::dynamic;
use super::sources::{SourceConfig, SourceSet};
use super::yaml::{expand_env, hash_json, sequence_item_lines, yaml_to_json};
use super::{
    CollectdConfig, Config, LogConfig, MonitorConfig, ObserverConfig, RawWriterConfig, WriterConfig,
    DEFAULT_API_URL, DEFAULT_CONFIGURE_TIMEOUT_SECONDS, DEFAULT_DIAGNOSTICS_SOCKET,
    DEFAULT_INGEST_URL, DEFAULT_INTERNAL_METRICS_SOCKET, DEFAULT_INTERVAL_SECONDS,
};
use crate::endpoint::rules::Rule;
use crate::error::ConfigError;
use crate::filters::{DimPropsFilter, FilterSet, MetricFilter};
use crate::monitors::{self, MonitorSettings};
use crate::observers::{self, ObserverSettings};
use crate::process::ProcessContext;
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const MASK: &str = "****";

/// Top-level document as written
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    #[serde(default)]
    signal_fx_access_token: Option<String>,
    #[serde(default)]
    ingest_url: Option<String>,
    #[serde(default)]
    api_url: Option<String>,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    disable_host_dimensions: bool,
    #[serde(default = "default_interval")]
    interval_seconds: u64,
    #[serde(default)]
    global_dimensions: HashMap<String, String>,
    #[serde(default = "default_true", rename = "enableBuiltInFiltering")]
    enable_builtin_filtering: bool,
    #[serde(default)]
    observers: Vec<Value>,
    #[serde(default)]
    monitors: Vec<Value>,
    #[serde(default)]
    writer: RawWriterConfig,
    #[serde(default)]
    logging: LogConfig,
    #[serde(default)]
    collectd: CollectdConfig,
    #[serde(default)]
    metrics_to_exclude: Vec<MetricFilter>,
    #[serde(default)]
    metrics_to_include: Vec<MetricFilter>,
    #[serde(default = "default_diagnostics_socket")]
    diagnostics_socket_path: PathBuf,
    #[serde(default = "default_internal_metrics_socket")]
    internal_metrics_socket_path: PathBuf,
    #[serde(default)]
    profiling: bool,
    #[serde(default = "default_profiling_host")]
    profiling_host: String,
    #[serde(default = "default_profiling_port")]
    profiling_port: u16,
    #[serde(default)]
    bundle_dir: Option<PathBuf>,
    #[serde(default)]
    #[allow(dead_code)]
    scratch: Option<Value>,
    #[serde(flatten)]
    unknown: BTreeMap<String, Value>,
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECONDS
}

fn default_true() -> bool {
    true
}

fn default_diagnostics_socket() -> PathBuf {
    PathBuf::from(DEFAULT_DIAGNOSTICS_SOCKET)
}

fn default_internal_metrics_socket() -> PathBuf {
    PathBuf::from(DEFAULT_INTERNAL_METRICS_SOCKET)
}

fn default_profiling_host() -> String {
    "127.0.0.1".to_string()
}

fn default_profiling_port() -> u16 {
    6060
}

/// Keys shared by every monitor entry. Everything else is type-specific.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MonitorEntry {
    #[serde(rename = "type")]
    monitor_type: String,
    #[serde(default)]
    discovery_rule: Option<String>,
    #[serde(default)]
    interval_seconds: Option<u64>,
    #[serde(default)]
    extra_dimensions: HashMap<String, String>,
    #[serde(default)]
    metrics_to_exclude: Vec<MetricFilter>,
    #[serde(default)]
    extra_metrics: Vec<String>,
    #[serde(default)]
    disable_host_dimensions: bool,
    #[serde(default)]
    disable_endpoint_dimensions: bool,
    #[serde(default)]
    solo: bool,
    #[serde(default)]
    configure_timeout_seconds: Option<u64>,
    #[serde(flatten)]
    other: serde_yaml::Mapping,
}

#[derive(Debug, Deserialize)]
struct ObserverEntry {
    #[serde(rename = "type")]
    observer_type: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(flatten)]
    other: serde_yaml::Mapping,
}

/// Read and parse the config file at `path`
pub async fn parse_config(path: &Path, ctx: &ProcessContext) -> Result<Config, ConfigError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse_config_text(&text, dir, ctx).await
}

/// Parse config text. `config_dir` anchors relative `#from` file paths.
pub async fn parse_config_text(
    text: &str,
    config_dir: &Path,
    ctx: &ProcessContext,
) -> Result<Config, ConfigError> {
    let expanded = expand_env(text, &ctx.env);

    let doc: Value = serde_yaml::from_str(&expanded).map_err(yaml_error)?;
    let doc = match doc {
        Value::Null => Value::Mapping(Default::default()),
        Value::Mapping(_) => doc,
        _ => return Err(ConfigError::parse("config root must be a mapping")),
    };

    let source_conf: SourceConfig = match doc.get("configSources") {
        Some(v) => serde_yaml::from_value(v.clone()).map_err(|e| {
            ConfigError::validation(format!("invalid configSources: {}", e))
        })?,
        None => SourceConfig::default(),
    };
    let sources = SourceSet::new(&source_conf, config_dir, &ctx.env)?;

    let resolved = dynamic::resolve(doc, &sources).await?;
    let content_hash = hash_json(&yaml_to_json(&resolved));

    let raw: RawConfig = serde_yaml::from_value(resolved.clone()).map_err(|e| {
        // Values lose their location once parsed; re-decode the text to find the line
        let line = serde_yaml::from_str::<RawConfig>(&expanded)
            .err()
            .and_then(|e| e.location())
            .map(|l| l.line());
        ConfigError::Parse {
            message: e.to_string(),
            line,
        }
    })?;

    // Sources were decoded above
    for key in raw.unknown.keys().filter(|k| *k != "configSources") {
        warn!(key = %key, "Unknown top-level config key");
    }

    build_config(raw, &resolved, &expanded, ctx, content_hash)
}

fn yaml_error(e: serde_yaml::Error) -> ConfigError {
    ConfigError::Parse {
        line: e.location().map(|l| l.line()),
        message: e.to_string(),
    }
}

fn build_config(
    raw: RawConfig,
    resolved: &Value,
    text: &str,
    ctx: &ProcessContext,
    content_hash: String,
) -> Result<Config, ConfigError> {
    if raw.interval_seconds == 0 {
        return Err(ConfigError::validation("intervalSeconds must be greater than 0"));
    }

    let access_token = ctx
        .access_token_override
        .clone()
        .or_else(|| raw.writer.access_token.clone())
        .or_else(|| raw.signal_fx_access_token.clone())
        .unwrap_or_default();
    if access_token.is_empty() {
        return Err(ConfigError::validation("signalFxAccessToken is required"));
    }

    let ingest_url = raw
        .ingest_url
        .clone()
        .unwrap_or_else(|| DEFAULT_INGEST_URL.to_string());
    let api_url = raw
        .api_url
        .clone()
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());

    let hostname = match &raw.hostname {
        Some(h) if !h.is_empty() => h.clone(),
        _ => resolve_hostname(),
    };

    let monitor_lines = sequence_item_lines(text, "monitors");
    let observer_lines = sequence_item_lines(text, "observers");
    let default_interval = Duration::from_secs(raw.interval_seconds);

    let monitors: Vec<MonitorConfig> = raw
        .monitors
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            build_monitor(index, entry, monitor_lines.get(index).copied(), default_interval)
        })
        .collect();

    let observers: Vec<ObserverConfig> = raw
        .observers
        .iter()
        .enumerate()
        .map(|(index, entry)| build_observer(index, entry, observer_lines.get(index).copied()))
        .collect();

    let mut config = Config {
        access_token: access_token.clone(),
        ingest_url: ingest_url.clone(),
        api_url: api_url.clone(),
        hostname,
        disable_host_dimensions: raw.disable_host_dimensions,
        interval_seconds: raw.interval_seconds,
        global_dimensions: raw.global_dimensions.clone(),
        enable_builtin_filtering: raw.enable_builtin_filtering,
        observers,
        monitors,
        writer: WriterConfig::default(),
        logging: raw.logging.clone(),
        collectd: raw.collectd.clone(),
        metrics_to_exclude: raw.metrics_to_exclude.clone(),
        metrics_to_include: raw.metrics_to_include.clone(),
        diagnostics_socket_path: raw.diagnostics_socket_path.clone(),
        internal_metrics_socket_path: raw.internal_metrics_socket_path.clone(),
        profiling: raw.profiling,
        profiling_host: raw.profiling_host.clone(),
        profiling_port: raw.profiling_port,
        bundle_dir: raw
            .bundle_dir
            .clone()
            .unwrap_or_else(|| ctx.bundle_dir.clone()),
        display_yaml: display_yaml(resolved),
        content_hash,
    };

    config.writer = build_writer(&raw, &config)?;
    Ok(config)
}

fn resolve_hostname() -> String {
    match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            warn!(error = %e, "Could not determine hostname");
            String::new()
        }
    }
}

fn build_writer(raw: &RawConfig, config: &Config) -> Result<WriterConfig, ConfigError> {
    let w = &raw.writer;

    let ingest_url = w.ingest_url.clone().unwrap_or_else(|| config.ingest_url.clone());
    let api_url = w.api_url.clone().unwrap_or_else(|| config.api_url.clone());
    for (name, value) in [("ingestUrl", &ingest_url), ("apiUrl", &api_url)] {
        url::Url::parse(value)
            .map_err(|e| ConfigError::validation(format!("{} {:?} is invalid: {}", name, value, e)))?;
    }
    for (name, value) in [
        ("writer.datapointEndpointUrl", &w.datapoint_endpoint_url),
        ("writer.eventEndpointUrl", &w.event_endpoint_url),
        ("writer.traceEndpointUrl", &w.trace_endpoint_url),
    ] {
        if let Some(value) = value {
            url::Url::parse(value).map_err(|e| {
                ConfigError::validation(format!("{} {:?} is invalid: {}", name, value, e))
            })?;
        }
    }

    let datapoint_max_requests = w.datapoint_max_requests.unwrap_or(w.max_requests);
    for (name, value) in [
        ("writer.datapointMaxBatchSize", w.datapoint_max_batch_size),
        ("writer.datapointMaxRequests", datapoint_max_requests),
        ("writer.traceSpanMaxBatchSize", w.trace_span_max_batch_size),
        ("writer.traceSpanMaxRequests", w.trace_span_max_requests),
        ("writer.propertiesMaxRequests", w.properties_max_requests),
        ("writer.propertiesHistorySize", w.properties_history_size),
    ] {
        if value == 0 {
            return Err(ConfigError::validation(format!(
                "{} must be greater than 0",
                name
            )));
        }
    }
    if w.event_send_interval_seconds == 0 {
        return Err(ConfigError::validation(
            "writer.eventSendIntervalSeconds must be greater than 0",
        ));
    }

    // Validate eagerly so a bad pattern fails the load rather than the writer
    DimPropsFilter::new(&w.properties_to_exclude)?;

    let global_dimensions = w
        .global_dimensions
        .clone()
        .unwrap_or_else(|| config.global_dimensions.clone());

    Ok(WriterConfig {
        ingest_url,
        api_url,
        access_token: config.access_token.clone(),
        datapoint_endpoint_url: w.datapoint_endpoint_url.clone(),
        event_endpoint_url: w.event_endpoint_url.clone(),
        trace_endpoint_url: w.trace_endpoint_url.clone(),
        global_dimensions,
        host_id_dimensions: config.host_id_dimensions(),
        datapoint_max_batch_size: w.datapoint_max_batch_size,
        datapoint_max_requests,
        trace_span_max_batch_size: w.trace_span_max_batch_size,
        trace_span_max_requests: w.trace_span_max_requests,
        event_send_interval: Duration::from_secs(w.event_send_interval_seconds),
        properties_max_requests: w.properties_max_requests,
        properties_history_size: w.properties_history_size,
        properties_to_exclude: w.properties_to_exclude.clone(),
        filter: FilterSet::new(&config.metrics_to_exclude, &config.metrics_to_include)?,
        log_datapoints: w.log_datapoints,
        log_events: w.log_events,
    })
}

fn build_monitor(
    index: usize,
    value: &Value,
    line: Option<usize>,
    default_interval: Duration,
) -> MonitorConfig {
    let json = yaml_to_json(value);
    let hash = hash_json(&json);
    let fallback_type = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let mut conf = MonitorConfig {
        index,
        monitor_type: fallback_type.clone(),
        discovery_rule: None,
        interval: default_interval,
        extra_dimensions: HashMap::new(),
        metrics_to_exclude: Vec::new(),
        extra_metrics: Vec::new(),
        disable_host_dimensions: false,
        disable_endpoint_dimensions: false,
        solo: false,
        configure_timeout: Duration::from_secs(DEFAULT_CONFIGURE_TIMEOUT_SECONDS),
        settings: MonitorSettings::Unknown(fallback_type),
        raw: json,
        hash,
        line,
        validation_error: None,
    };

    if let Err(e) = fill_monitor(&mut conf, value) {
        let e = e.at_line(line);
        warn!(
            monitor_type = %conf.monitor_type,
            index = index,
            error = %e,
            "Monitor config is invalid"
        );
        conf.validation_error = Some(e);
    }
    conf
}

fn fill_monitor(conf: &mut MonitorConfig, value: &Value) -> Result<(), ConfigError> {
    let entry: MonitorEntry = serde_yaml::from_value(value.clone())
        .map_err(|e| ConfigError::validation(format!("monitors[{}]: {}", conf.index, e)))?;

    if entry.monitor_type.is_empty() {
        return Err(ConfigError::validation("monitor type must be set"));
    }
    conf.monitor_type = entry.monitor_type.clone();

    if let Some(interval) = entry.interval_seconds {
        if interval == 0 {
            return Err(ConfigError::validation("intervalSeconds must be greater than 0"));
        }
        conf.interval = Duration::from_secs(interval);
    }
    if let Some(timeout) = entry.configure_timeout_seconds {
        if timeout == 0 {
            return Err(ConfigError::validation(
                "configureTimeoutSeconds must be greater than 0",
            ));
        }
        conf.configure_timeout = Duration::from_secs(timeout);
    }

    conf.discovery_rule = entry.discovery_rule.as_deref().map(Rule::parse).transpose()?;
    // Validate filters up front; the manager rebuilds them per instance
    FilterSet::new(&entry.metrics_to_exclude, &[])?;
    conf.extra_dimensions = entry.extra_dimensions;
    conf.metrics_to_exclude = entry.metrics_to_exclude;
    conf.extra_metrics = entry.extra_metrics;
    conf.disable_host_dimensions = entry.disable_host_dimensions;
    conf.disable_endpoint_dimensions = entry.disable_endpoint_dimensions;
    conf.solo = entry.solo;

    let Some(meta) = monitors::lookup_metadata(&conf.monitor_type) else {
        return Err(ConfigError::validation(format!(
            "unknown monitor type {:?}",
            conf.monitor_type
        )));
    };
    if conf.discovery_rule.is_some() && !meta.accepts_endpoints {
        return Err(ConfigError::validation(format!(
            "monitor type {} does not accept discovery rules",
            conf.monitor_type
        )));
    }

    conf.settings = monitors::decode_settings(&conf.monitor_type, Value::Mapping(entry.other))?;
    debug!(monitor_type = %conf.monitor_type, hash = %conf.short_hash(), "Decoded monitor config");
    Ok(())
}

fn build_observer(index: usize, value: &Value, line: Option<usize>) -> ObserverConfig {
    let hash = hash_json(&yaml_to_json(value));
    let fallback_type = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let mut conf = ObserverConfig {
        index,
        observer_type: fallback_type.clone(),
        name: fallback_type.clone(),
        settings: ObserverSettings::Unknown(fallback_type),
        hash,
        line,
        validation_error: None,
    };

    let result = serde_yaml::from_value::<ObserverEntry>(value.clone())
        .map_err(|e| ConfigError::validation(format!("observers[{}]: {}", index, e)))
        .and_then(|entry| {
            conf.name = entry.name.unwrap_or_else(|| entry.observer_type.clone());
            conf.observer_type = entry.observer_type;
            observers::decode_settings(&conf.observer_type, Value::Mapping(entry.other))
        });

    match result {
        Ok(settings) => conf.settings = settings,
        Err(e) => {
            let e = e.at_line(line);
            warn!(observer_type = %conf.observer_type, error = %e, "Observer config is invalid");
            conf.validation_error = Some(e);
        }
    }
    conf
}

/// Pretty-print the resolved document with access tokens masked
fn display_yaml(resolved: &Value) -> String {
    let mut doc = resolved.clone();
    if let Some(map) = doc.as_mapping_mut() {
        if map.contains_key("signalFxAccessToken") {
            map.insert("signalFxAccessToken".into(), MASK.into());
        }
        map.remove("configSources");
        if let Some(writer) = map.get_mut("writer").and_then(Value::as_mapping_mut) {
            if writer.contains_key("accessToken") {
                writer.insert("accessToken".into(), MASK.into());
            }
        }
    }
    serde_yaml::to_string(&doc).unwrap_or_default()
}
