//! Core telemetry models shared by monitors, the writer and diagnostics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Span tag that marks a span as not host specific. Stripped before send.
pub const NOT_HOST_SPECIFIC_TAG: &str = "sfxagent.not_host_specific";

/// Dimension carrying the hostname on host-specific telemetry
pub const HOST_DIMENSION: &str = "host";

/// Kind of metric a datapoint represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Gauge,
    Counter,
    CumulativeCounter,
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricType::Gauge => write!(f, "gauge"),
            MetricType::Counter => write!(f, "counter"),
            MetricType::CumulativeCounter => write!(f, "cumulative_counter"),
        }
    }
}

/// Datapoint value, either integral or floating point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
}

impl Value {
    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Int(v) => *v as f64,
            Value::Float(v) => *v,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

/// Routing metadata attached to a datapoint inside the agent. Never transmitted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatapointMeta {
    pub not_host_specific: bool,
    pub monitor_type: Option<String>,
    pub monitor_id: Option<String>,
    pub config_hash: Option<String>,
    pub endpoint_id: Option<String>,
}

/// A single metric sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Datapoint {
    pub metric: String,
    #[serde(default)]
    pub dimensions: HashMap<String, String>,
    pub value: Value,
    pub metric_type: MetricType,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub meta: DatapointMeta,
}

impl Datapoint {
    pub fn new(
        metric: impl Into<String>,
        dimensions: HashMap<String, String>,
        value: impl Into<Value>,
        metric_type: MetricType,
    ) -> Self {
        Self {
            metric: metric.into(),
            dimensions,
            value: value.into(),
            metric_type,
            timestamp: Utc::now(),
            meta: DatapointMeta::default(),
        }
    }

    pub fn gauge(metric: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(metric, HashMap::new(), value, MetricType::Gauge)
    }

    pub fn counter(metric: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(metric, HashMap::new(), value, MetricType::Counter)
    }

    pub fn cumulative(metric: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(metric, HashMap::new(), value, MetricType::CumulativeCounter)
    }

    /// Builder-style helper to add a dimension
    pub fn with_dimension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(key.into(), value.into());
        self
    }

    pub fn not_host_specific(mut self) -> Self {
        self.meta.not_host_specific = true;
        self
    }
}

/// Category of an event as understood by the ingest API
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventCategory {
    #[default]
    UserDefined,
    Alert,
    Audit,
    Job,
    Collectd,
    ServiceDiscovery,
    Exception,
    Agent,
}

/// Routing metadata for events
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventMeta {
    pub not_host_specific: bool,
}

/// A semi-structured operational message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_type: String,
    #[serde(default)]
    pub category: EventCategory,
    #[serde(default)]
    pub dimensions: HashMap<String, String>,
    /// Scalar property values (string, number or bool)
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub meta: EventMeta,
}

impl Event {
    pub fn new(event_type: impl Into<String>, category: EventCategory) -> Self {
        Self {
            event_type: event_type.into(),
            category,
            dimensions: HashMap::new(),
            properties: HashMap::new(),
            timestamp: Utc::now(),
            meta: EventMeta::default(),
        }
    }
}

/// Service endpoint reported on a span
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanEndpoint {
    pub service_name: Option<String>,
    pub ipv4: Option<String>,
    pub port: Option<u32>,
}

/// Timestamped annotation on a span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanAnnotation {
    pub timestamp: i64,
    pub value: String,
}

/// A trace span. Everything but `tags` passes through the agent untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSpan {
    pub trace_id: String,
    pub id: String,
    pub parent_id: Option<String>,
    pub name: Option<String>,
    pub kind: Option<String>,
    /// Start time in microseconds since the epoch
    pub timestamp: Option<i64>,
    /// Duration in microseconds
    pub duration: Option<i64>,
    pub local_endpoint: Option<SpanEndpoint>,
    pub remote_endpoint: Option<SpanEndpoint>,
    #[serde(default)]
    pub annotations: Vec<SpanAnnotation>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl TraceSpan {
    pub fn is_not_host_specific(&self) -> bool {
        self.tags
            .get(NOT_HOST_SPECIFIC_TAG)
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}

/// Dimension name/value pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub value: String,
}

/// Properties and tags to set on a dimension value in the backend
///
/// Properties are string-valued, so equality is plain string equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DimProperties {
    pub dimension: Dimension,
    pub properties: BTreeMap<String, String>,
    pub tags: BTreeSet<String>,
}

impl DimProperties {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            dimension: Dimension {
                name: name.into(),
                value: value.into(),
            },
            properties: BTreeMap::new(),
            tags: BTreeSet::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}
