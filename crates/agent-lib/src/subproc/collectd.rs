//! collectd write_http JSON conversion

use crate::models::{Datapoint, Event, EventCategory, MetricType, Value};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

/// One entry of a `ValueList` payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ValueListEntry {
    Values(CollectdValues),
    Notification(CollectdNotification),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CollectdValues {
    pub values: Vec<Option<f64>>,
    pub dstypes: Vec<String>,
    pub dsnames: Vec<String>,
    #[serde(default)]
    pub time: f64,
    #[serde(default)]
    pub interval: f64,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub plugin: String,
    #[serde(default)]
    pub plugin_instance: String,
    #[serde(rename = "type", default)]
    pub type_name: String,
    #[serde(default)]
    pub type_instance: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CollectdNotification {
    pub severity: serde_json::Value,
    pub message: String,
    #[serde(default)]
    pub time: f64,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub plugin: String,
    #[serde(default)]
    pub plugin_instance: String,
    #[serde(rename = "type", default)]
    pub type_name: String,
    #[serde(default)]
    pub type_instance: String,
}

fn timestamp(secs: f64) -> DateTime<Utc> {
    if secs <= 0.0 {
        return Utc::now();
    }
    Utc.timestamp_millis_opt((secs * 1000.0) as i64)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Split `name[k=v,k2=v2]` into the bare name and its embedded dimensions
fn split_embedded_dims(instance: &str) -> (String, HashMap<String, String>) {
    let mut dims = HashMap::new();
    let (Some(open), Some(close)) = (instance.find('['), instance.rfind(']')) else {
        return (instance.to_string(), dims);
    };
    if close < open {
        return (instance.to_string(), dims);
    }

    for pair in instance[open + 1..close].split(',') {
        if let Some((k, v)) = pair.split_once('=') {
            if !k.trim().is_empty() {
                dims.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
    }
    let bare = format!("{}{}", &instance[..open], &instance[close + 1..]);
    (bare, dims)
}

fn base_dimensions(host: &str, plugin: &str, plugin_instance: &str) -> HashMap<String, String> {
    let (instance, mut dims) = split_embedded_dims(plugin_instance);
    if !plugin.is_empty() {
        dims.insert("plugin".to_string(), plugin.to_string());
    }
    if !instance.is_empty() {
        dims.insert("plugin_instance".to_string(), instance);
    }
    if !host.is_empty() {
        dims.insert("host".to_string(), host.to_string());
    }
    dims
}

fn metric_name(type_name: &str, type_instance: &str, dsname: &str) -> String {
    let mut name = type_name.to_string();
    if !type_instance.is_empty() {
        name.push('.');
        name.push_str(type_instance);
    }
    if !dsname.is_empty() && dsname != "value" {
        name.push('.');
        name.push_str(dsname);
    }
    name
}

fn metric_type(dstype: &str) -> Option<MetricType> {
    match dstype {
        "gauge" => Some(MetricType::Gauge),
        "derive" | "counter" => Some(MetricType::CumulativeCounter),
        "absolute" => Some(MetricType::Counter),
        _ => None,
    }
}

fn values_to_datapoints(v: &CollectdValues) -> Vec<Datapoint> {
    let (type_instance, type_dims) = split_embedded_dims(&v.type_instance);
    let mut dims = base_dimensions(&v.host, &v.plugin, &v.plugin_instance);
    dims.extend(type_dims);
    let ts = timestamp(v.time);

    let mut out = Vec::with_capacity(v.values.len());
    for (i, value) in v.values.iter().enumerate() {
        let Some(value) = value else { continue };
        let dstype = v.dstypes.get(i).map(String::as_str).unwrap_or("gauge");
        let Some(mtype) = metric_type(dstype) else {
            debug!(dstype = %dstype, "Skipping value with unknown collectd type");
            continue;
        };
        let dsname = v.dsnames.get(i).map(String::as_str).unwrap_or("value");

        let value = if mtype != MetricType::Gauge && value.fract() == 0.0 {
            Value::Int(*value as i64)
        } else {
            Value::Float(*value)
        };
        let mut dp = Datapoint::new(
            metric_name(&v.type_name, &type_instance, dsname),
            dims.clone(),
            value,
            mtype,
        );
        dp.timestamp = ts;
        out.push(dp);
    }
    out
}

fn notification_to_event(n: &CollectdNotification) -> Event {
    let mut event = Event::new(
        metric_name(&n.type_name, &n.type_instance, ""),
        EventCategory::Collectd,
    );
    event.dimensions = base_dimensions(&n.host, &n.plugin, &n.plugin_instance);
    event
        .properties
        .insert("message".to_string(), serde_json::Value::from(n.message.clone()));
    event
        .properties
        .insert("severity".to_string(), n.severity.clone());
    event.timestamp = timestamp(n.time);
    event
}

/// Convert a `ValueList` payload into datapoints and events
pub fn convert_value_lists(entries: &[ValueListEntry]) -> (Vec<Datapoint>, Vec<Event>) {
    let mut dps = Vec::new();
    let mut events = Vec::new();
    for entry in entries {
        match entry {
            ValueListEntry::Values(v) => dps.extend(values_to_datapoints(v)),
            ValueListEntry::Notification(n) => events.push(notification_to_event(n)),
        }
    }
    (dps, events)
}
