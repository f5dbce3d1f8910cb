//! The agent's own counters as datapoints

use super::status::AgentStatus;
use crate::models::{Datapoint, HOST_DIMENSION};
use chrono::Utc;

const PREFIX: &str = "sfxagent.";

/// One datapoint per writer counter and manager gauge, all stamped with the
/// same timestamp and the host dimension
pub fn internal_metrics(status: &AgentStatus) -> Vec<Datapoint> {
    let w = &status.writer;
    let cumulative = [
        ("datapoints_sent", w.dps_sent),
        ("datapoints_received", w.dps_received),
        ("datapoints_filtered", w.dps_filtered),
        ("datapoints_dropped", w.dps_dropped),
        ("datapoint_requests_failed", w.dp_requests_failed),
        ("events_sent", w.events_sent),
        ("events_dropped", w.events_dropped),
        ("event_requests_failed", w.event_requests_failed),
        ("trace_spans_sent", w.trace_spans_sent),
        ("trace_spans_dropped", w.trace_spans_dropped),
        ("trace_span_requests_failed", w.trace_span_requests_failed),
        ("dim_props_sent", w.dim_props_sent),
        ("dim_props_duplicate", w.dim_props_duplicate),
        ("dim_props_dropped", w.dim_props_dropped),
        ("dim_prop_requests_failed", w.dim_prop_requests_failed),
    ];
    let gauges = [
        ("datapoints_in_flight", w.dps_in_flight),
        ("datapoint_requests_active", w.dp_requests_active),
        ("trace_spans_in_flight", w.trace_spans_in_flight),
        ("trace_span_requests_active", w.trace_span_requests_active),
        ("dim_props_in_flight", w.dim_props_in_flight),
        ("dim_prop_requests_active", w.dim_prop_requests_active),
        ("datapoint_channel_len", w.datapoint_chan_len as i64),
        ("event_channel_len", w.event_chan_len as i64),
        ("trace_span_channel_len", w.trace_span_chan_len as i64),
        ("dim_props_channel_len", w.dim_props_chan_len as i64),
        ("active_monitors", status.monitors.active.len() as i64),
        ("configured_monitors", status.monitors.configured as i64),
        ("active_observers", status.observers.len() as i64),
        ("discovered_endpoints", status.endpoints.len() as i64),
    ];

    let now = Utc::now();
    let stamp = |mut dp: Datapoint| {
        dp.timestamp = now;
        dp.with_dimension(HOST_DIMENSION, status.hostname.clone())
    };

    cumulative
        .into_iter()
        .map(|(name, v)| stamp(Datapoint::cumulative(format!("{}{}", PREFIX, name), v as i64)))
        .chain(
            gauges
                .into_iter()
                .map(|(name, v)| stamp(Datapoint::gauge(format!("{}{}", PREFIX, name), v))),
        )
        .collect()
}

/// JSON array served on the internal-metrics socket
pub fn render_internal_metrics(status: &AgentStatus) -> String {
    serde_json::to_string(&internal_metrics(status)).unwrap_or_else(|_| "[]".to_string())
}
