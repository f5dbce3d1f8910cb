//! Writer counters
//!
//! All counters are plain atomics so the diagnostics endpoints can read them
//! without touching the workers.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Live counters shared by the writer workers and output handles
#[derive(Debug, Default)]
pub struct WriterCounters {
    pub dps_received: AtomicU64,
    pub dps_sent: AtomicU64,
    pub dps_in_flight: AtomicI64,
    pub dp_requests_active: AtomicI64,
    pub dps_filtered: AtomicU64,
    pub dps_dropped: AtomicU64,
    pub dp_requests_failed: AtomicU64,

    pub events_sent: AtomicU64,
    pub events_dropped: AtomicU64,
    pub event_requests_failed: AtomicU64,

    pub trace_spans_sent: AtomicU64,
    pub trace_spans_in_flight: AtomicI64,
    pub trace_spans_dropped: AtomicU64,
    pub trace_span_requests_active: AtomicI64,
    pub trace_span_requests_failed: AtomicU64,

    pub dim_props_sent: AtomicU64,
    pub dim_props_duplicate: AtomicU64,
    pub dim_props_dropped: AtomicU64,
    pub dim_props_in_flight: AtomicI64,
    pub dim_prop_requests_active: AtomicI64,
    pub dim_prop_requests_failed: AtomicU64,
}

/// Point-in-time copy of the writer counters plus channel lengths
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub dps_received: u64,
    pub dps_sent: u64,
    pub dps_in_flight: i64,
    pub dp_requests_active: i64,
    pub dps_filtered: u64,
    pub dps_dropped: u64,
    pub dp_requests_failed: u64,
    pub events_sent: u64,
    pub events_dropped: u64,
    pub event_requests_failed: u64,
    pub trace_spans_sent: u64,
    pub trace_spans_in_flight: i64,
    pub trace_spans_dropped: u64,
    pub trace_span_requests_active: i64,
    pub trace_span_requests_failed: u64,
    pub dim_props_sent: u64,
    pub dim_props_duplicate: u64,
    pub dim_props_dropped: u64,
    pub dim_props_in_flight: i64,
    pub dim_prop_requests_active: i64,
    pub dim_prop_requests_failed: u64,
    pub datapoint_chan_len: usize,
    pub event_chan_len: usize,
    pub trace_span_chan_len: usize,
    pub dim_props_chan_len: usize,
}

impl WriterCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        let u = |a: &AtomicU64| a.load(Ordering::Relaxed);
        let i = |a: &AtomicI64| a.load(Ordering::Relaxed);
        CounterSnapshot {
            dps_received: u(&self.dps_received),
            dps_sent: u(&self.dps_sent),
            dps_in_flight: i(&self.dps_in_flight),
            dp_requests_active: i(&self.dp_requests_active),
            dps_filtered: u(&self.dps_filtered),
            dps_dropped: u(&self.dps_dropped),
            dp_requests_failed: u(&self.dp_requests_failed),
            events_sent: u(&self.events_sent),
            events_dropped: u(&self.events_dropped),
            event_requests_failed: u(&self.event_requests_failed),
            trace_spans_sent: u(&self.trace_spans_sent),
            trace_spans_in_flight: i(&self.trace_spans_in_flight),
            trace_spans_dropped: u(&self.trace_spans_dropped),
            trace_span_requests_active: i(&self.trace_span_requests_active),
            trace_span_requests_failed: u(&self.trace_span_requests_failed),
            dim_props_sent: u(&self.dim_props_sent),
            dim_props_duplicate: u(&self.dim_props_duplicate),
            dim_props_dropped: u(&self.dim_props_dropped),
            dim_props_in_flight: i(&self.dim_props_in_flight),
            dim_prop_requests_active: i(&self.dim_prop_requests_active),
            dim_prop_requests_failed: u(&self.dim_prop_requests_failed),
            ..Default::default()
        }
    }
}

pub(crate) fn add(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

pub(crate) fn gauge_add(gauge: &AtomicI64, n: usize) {
    gauge.fetch_add(n as i64, Ordering::Relaxed);
}

pub(crate) fn gauge_sub(gauge: &AtomicI64, n: usize) {
    gauge.fetch_sub(n as i64, Ordering::Relaxed);
}

impl CounterSnapshot {
    /// Name/value pairs in display order
    pub fn rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("dpsReceived", self.dps_received.to_string()),
            ("dpsSent", self.dps_sent.to_string()),
            ("dpsInFlight", self.dps_in_flight.to_string()),
            ("dpRequestsActive", self.dp_requests_active.to_string()),
            ("dpsFiltered", self.dps_filtered.to_string()),
            ("dpsDropped", self.dps_dropped.to_string()),
            ("dpRequestsFailed", self.dp_requests_failed.to_string()),
            ("eventsSent", self.events_sent.to_string()),
            ("eventsDropped", self.events_dropped.to_string()),
            ("eventRequestsFailed", self.event_requests_failed.to_string()),
            ("traceSpansSent", self.trace_spans_sent.to_string()),
            ("traceSpansInFlight", self.trace_spans_in_flight.to_string()),
            ("traceSpansDropped", self.trace_spans_dropped.to_string()),
            (
                "traceSpanRequestsActive",
                self.trace_span_requests_active.to_string(),
            ),
            (
                "traceSpanRequestsFailed",
                self.trace_span_requests_failed.to_string(),
            ),
            ("dimPropsSent", self.dim_props_sent.to_string()),
            ("dimPropsDuplicate", self.dim_props_duplicate.to_string()),
            ("dimPropsDropped", self.dim_props_dropped.to_string()),
            ("dimPropsInFlight", self.dim_props_in_flight.to_string()),
            ("dimPropRequestsActive", self.dim_prop_requests_active.to_string()),
            ("dimPropRequestsFailed", self.dim_prop_requests_failed.to_string()),
            ("datapointChanLen", self.datapoint_chan_len.to_string()),
            ("eventChanLen", self.event_chan_len.to_string()),
            ("traceSpanChanLen", self.trace_span_chan_len.to_string()),
            ("dimPropsChanLen", self.dim_props_chan_len.to_string()),
        ]
    }
}
