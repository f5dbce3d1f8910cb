//! Static table of built-in monitor types
//!
//! Each entry pairs the type's metadata with a decoder for its config
//! subtree and a factory for fresh instances. The table is built once on
//! first use and only read afterwards.

use super::cpu::{CpuConfig, CpuMonitor};
use super::http_check::{HttpCheckConfig, HttpCheckMonitor};
use super::internal_metrics::{InternalMetricsConfig, InternalMetricsMonitor};
use super::memory::{MemoryConfig, MemoryMonitor};
use super::subprocess::{SubprocessConfig, SubprocessMonitor};
use super::Monitor;
use crate::error::ConfigError;
use crate::models::MetricType;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Type-specific monitor configuration, one variant per built-in type
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorSettings {
    Cpu(CpuConfig),
    Memory(MemoryConfig),
    HttpCheck(HttpCheckConfig),
    InternalMetrics(InternalMetricsConfig),
    Subprocess(SubprocessConfig),
    /// A type with no registered factory; such configs are reported as bad
    Unknown(String),
}

/// One metric a monitor type can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricInfo {
    pub name: &'static str,
    pub metric_type: MetricType,
    /// Sent without being listed in `extraMetrics`
    pub default: bool,
}

/// Static description of a monitor type
#[derive(Debug, Clone)]
pub struct MonitorMetadata {
    pub monitor_type: &'static str,
    pub doc: &'static str,
    pub metrics: &'static [MetricInfo],
    /// The metric list above covers everything the monitor emits
    pub metrics_exhaustive: bool,
    /// Built-in filtering is skipped for this type
    pub send_all: bool,
    /// The monitor-id dimension is omitted while one instance is active
    pub single_instance: bool,
    /// Instances may be bound to discovered endpoints
    pub accepts_endpoints: bool,
}

impl MonitorMetadata {
    pub fn metric(&self, name: &str) -> Option<&MetricInfo> {
        self.metrics.iter().find(|m| m.name == name)
    }

    pub fn default_metrics(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.metrics.iter().filter(|m| m.default).map(|m| m.name)
    }
}

type DecodeFn = fn(serde_yaml::Value) -> Result<MonitorSettings, ConfigError>;
type FactoryFn = fn() -> Box<dyn Monitor>;

struct Registration {
    metadata: MonitorMetadata,
    decode: DecodeFn,
    factory: FactoryFn,
}

fn decode<T, F>(value: serde_yaml::Value, wrap: F) -> Result<MonitorSettings, ConfigError>
where
    T: DeserializeOwned,
    F: FnOnce(T) -> MonitorSettings,
{
    serde_yaml::from_value::<T>(value)
        .map(wrap)
        .map_err(|e| ConfigError::validation(e.to_string()))
}

fn registry() -> &'static BTreeMap<&'static str, Registration> {
    static REGISTRY: OnceLock<BTreeMap<&'static str, Registration>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let entries = [
            Registration {
                metadata: super::cpu::metadata(),
                decode: |v| decode::<CpuConfig, _>(v, MonitorSettings::Cpu),
                factory: || Box::new(CpuMonitor::default()),
            },
            Registration {
                metadata: super::memory::metadata(),
                decode: |v| decode::<MemoryConfig, _>(v, MonitorSettings::Memory),
                factory: || Box::new(MemoryMonitor::default()),
            },
            Registration {
                metadata: super::http_check::metadata(),
                decode: |v| decode::<HttpCheckConfig, _>(v, MonitorSettings::HttpCheck),
                factory: || Box::new(HttpCheckMonitor::default()),
            },
            Registration {
                metadata: super::internal_metrics::metadata(),
                decode: |v| decode::<InternalMetricsConfig, _>(v, MonitorSettings::InternalMetrics),
                factory: || Box::new(InternalMetricsMonitor::default()),
            },
            Registration {
                metadata: super::subprocess::metadata(),
                decode: |v| {
                    let settings = decode::<SubprocessConfig, _>(v, MonitorSettings::Subprocess)?;
                    if let MonitorSettings::Subprocess(conf) = &settings {
                        conf.validate()?;
                    }
                    Ok(settings)
                },
                factory: || Box::new(SubprocessMonitor::default()),
            },
        ];

        entries
            .into_iter()
            .map(|r| (r.metadata.monitor_type, r))
            .collect()
    })
}

/// Metadata for a registered monitor type
pub fn lookup_metadata(monitor_type: &str) -> Option<&'static MonitorMetadata> {
    registry().get(monitor_type).map(|r| &r.metadata)
}

/// Decode the type-specific part of a monitor entry. Unknown keys are
/// rejected.
pub fn decode_settings(
    monitor_type: &str,
    value: serde_yaml::Value,
) -> Result<MonitorSettings, ConfigError> {
    match registry().get(monitor_type) {
        Some(r) => (r.decode)(value),
        None => Ok(MonitorSettings::Unknown(monitor_type.to_string())),
    }
}

/// Fresh, unconfigured instance of a monitor type
pub fn create_monitor(monitor_type: &str) -> Option<Box<dyn Monitor>> {
    registry().get(monitor_type).map(|r| (r.factory)())
}

/// All registered monitor types, sorted
pub fn registered_types() -> Vec<&'static str> {
    registry().keys().copied().collect()
}
