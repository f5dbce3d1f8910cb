//! Datapoint filters built from `metricsToExclude` / `metricsToInclude`

use super::{StringFilter, StringMapFilter};
use crate::error::ConfigError;
use crate::models::Datapoint;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single value or a list of values in YAML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StringOrList::One(s) => vec![s],
            StringOrList::Many(v) => v,
        }
    }
}

/// One entry of `metricsToExclude` or `metricsToInclude`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MetricFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metric_names: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub dimensions: HashMap<String, StringOrList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_type: Option<String>,
    #[serde(default)]
    pub negated: bool,
}

/// Compiled form of a [`MetricFilter`]
#[derive(Debug, Clone)]
pub struct DatapointFilter {
    names: Option<StringFilter>,
    dimensions: Option<StringMapFilter>,
    monitor_type: Option<String>,
    negated: bool,
}

impl DatapointFilter {
    pub fn new(conf: &MetricFilter) -> Result<Self, ConfigError> {
        let mut names: Vec<String> = conf.metric_names.clone();
        if let Some(name) = &conf.metric_name {
            names.push(name.clone());
        }

        let dims: HashMap<String, Vec<String>> = conf
            .dimensions
            .iter()
            .map(|(k, v)| (k.clone(), v.clone().into_vec()))
            .collect();

        if names.is_empty() && dims.is_empty() && conf.monitor_type.is_none() {
            return Err(ConfigError::validation(
                "metric filter must set metricName, metricNames, dimensions or monitorType",
            ));
        }

        Ok(Self {
            names: if names.is_empty() {
                None
            } else {
                Some(StringFilter::new(&names)?)
            },
            dimensions: if dims.is_empty() {
                None
            } else {
                Some(StringMapFilter::new(&dims)?)
            },
            monitor_type: conf.monitor_type.clone(),
            negated: conf.negated,
        })
    }

    pub fn matches(&self, dp: &Datapoint) -> bool {
        let name_ok = self
            .names
            .as_ref()
            .map(|f| f.matches(&dp.metric))
            .unwrap_or(true);
        let dims_ok = self
            .dimensions
            .as_ref()
            .map(|f| f.matches(&dp.dimensions))
            .unwrap_or(true);
        let type_ok = match &self.monitor_type {
            Some(wanted) => dp.meta.monitor_type.as_deref() == Some(wanted.as_str()),
            None => true,
        };

        (name_ok && dims_ok && type_ok) != self.negated
    }
}

/// Exclusion filters with include overrides. A datapoint is dropped when it
/// matches any exclude filter and no include filter.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    exclude: Vec<DatapointFilter>,
    include: Vec<DatapointFilter>,
}

impl FilterSet {
    pub fn new(exclude: &[MetricFilter], include: &[MetricFilter]) -> Result<Self, ConfigError> {
        Ok(Self {
            exclude: exclude
                .iter()
                .map(DatapointFilter::new)
                .collect::<Result<_, _>>()?,
            include: include
                .iter()
                .map(DatapointFilter::new)
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.exclude.is_empty()
    }

    /// True when the datapoint should be dropped
    pub fn matches(&self, dp: &Datapoint) -> bool {
        self.exclude.iter().any(|f| f.matches(dp)) && !self.include.iter().any(|f| f.matches(dp))
    }
}
