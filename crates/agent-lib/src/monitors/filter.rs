//! Per-instance datapoint filtering
//!
//! Two layers run in order: the built-in filter derived from the monitor's
//! metadata (only default metrics plus `extraMetrics` pass), then the
//! instance's `metricsToExclude`.

use super::registry::MonitorMetadata;
use crate::error::ConfigError;
use crate::filters::{FilterSet, MetricFilter, StringFilter};
use crate::models::Datapoint;
use std::collections::HashSet;

#[derive(Debug, Clone)]
struct BuiltinFilter {
    metadata: &'static MonitorMetadata,
    /// Known metrics enabled by default or through `extraMetrics`
    enabled: HashSet<&'static str>,
    extra: StringFilter,
}

impl BuiltinFilter {
    fn new(metadata: &'static MonitorMetadata, extra_metrics: &[String]) -> Result<Self, ConfigError> {
        for name in extra_metrics {
            validate_extra_metric(metadata, name)?;
        }
        let extra = StringFilter::new(extra_metrics)?;
        let enabled = metadata
            .metrics
            .iter()
            .filter(|m| m.default || extra.matches(m.name))
            .map(|m| m.name)
            .collect();

        Ok(Self {
            metadata,
            enabled,
            extra,
        })
    }

    fn should_send(&self, dp: &Datapoint) -> bool {
        if self.enabled.contains(dp.metric.as_str()) {
            return true;
        }
        if self.metadata.metrics_exhaustive {
            return false;
        }
        // Metrics the metadata does not know about can still be enabled by pattern
        self.metadata.metric(&dp.metric).is_none() && self.extra.matches(&dp.metric)
    }
}

fn validate_extra_metric(metadata: &MonitorMetadata, name: &str) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        return Err(ConfigError::validation("extraMetrics entries cannot be empty"));
    }
    if !metadata.metrics_exhaustive {
        return Ok(());
    }

    if name.contains('*') {
        let pattern = StringFilter::new(&[name])?;
        if metadata.metrics.iter().any(|m| pattern.matches(m.name)) {
            return Ok(());
        }
        return Err(ConfigError::validation(format!(
            "metric pattern '{}' did not match any available metrics",
            name
        )));
    }

    if metadata.metric(name).is_none() {
        return Err(ConfigError::validation(format!(
            "metric '{}' does not exist for monitor type {}",
            name, metadata.monitor_type
        )));
    }
    Ok(())
}

/// Combined filter applied by a monitor's output
#[derive(Debug, Clone, Default)]
pub struct MonitorFilter {
    builtin: Option<BuiltinFilter>,
    exclude: FilterSet,
}

impl MonitorFilter {
    pub fn new(
        metadata: &'static MonitorMetadata,
        enable_builtin: bool,
        extra_metrics: &[String],
        metrics_to_exclude: &[MetricFilter],
    ) -> Result<Self, ConfigError> {
        let builtin = if enable_builtin && !metadata.send_all && !metadata.metrics.is_empty() {
            Some(BuiltinFilter::new(metadata, extra_metrics)?)
        } else {
            None
        };

        Ok(Self {
            builtin,
            exclude: FilterSet::new(metrics_to_exclude, &[])?,
        })
    }

    /// True when the datapoint should be dropped
    pub fn matches(&self, dp: &Datapoint) -> bool {
        if let Some(builtin) = &self.builtin {
            if !builtin.should_send(dp) {
                return true;
            }
        }
        self.exclude.matches(dp)
    }
}
