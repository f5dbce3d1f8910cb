//! Output handle given to each monitor instance

use super::filter::MonitorFilter;
use crate::endpoint::Endpoint;
use crate::models::{Datapoint, DimProperties, Event, TraceSpan, NOT_HOST_SPECIFIC_TAG};
use crate::writer::OutputSinks;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Dimension identifying the emitting monitor instance
pub const MONITOR_ID_DIMENSION: &str = "monitorID";

/// Dimension naming the emitting monitor type
pub const PLUGIN_DIMENSION: &str = "plugin";

struct OutputInner {
    sinks: OutputSinks,
    monitor_type: String,
    monitor_id: String,
    config_hash: String,
    endpoint_id: Option<String>,
    endpoint_dims: HashMap<String, String>,
    extra_dims: RwLock<HashMap<String, String>>,
    not_host_specific: bool,
    /// Cleared by the manager while this is the only instance of a
    /// single-instance type
    include_monitor_id: Arc<AtomicBool>,
    filter: MonitorFilter,
}

/// Stamps and filters everything a monitor emits before handing it to the
/// writer. Cheap to clone.
#[derive(Clone)]
pub struct MonitorOutput {
    inner: Arc<OutputInner>,
}

pub(crate) struct OutputParams {
    pub sinks: OutputSinks,
    pub monitor_type: String,
    pub monitor_id: String,
    pub config_hash: String,
    pub endpoint: Option<Endpoint>,
    pub disable_endpoint_dimensions: bool,
    pub extra_dimensions: HashMap<String, String>,
    pub not_host_specific: bool,
    pub include_monitor_id: Arc<AtomicBool>,
    pub filter: MonitorFilter,
}

impl MonitorOutput {
    pub(crate) fn new(p: OutputParams) -> Self {
        let endpoint_dims = match &p.endpoint {
            Some(ep) if !p.disable_endpoint_dimensions => ep.output_dimensions(),
            _ => HashMap::new(),
        };

        Self {
            inner: Arc::new(OutputInner {
                sinks: p.sinks,
                monitor_type: p.monitor_type,
                monitor_id: p.monitor_id,
                config_hash: p.config_hash,
                endpoint_id: p.endpoint.map(|ep| ep.id),
                endpoint_dims,
                extra_dims: RwLock::new(p.extra_dimensions),
                not_host_specific: p.not_host_specific,
                include_monitor_id: p.include_monitor_id,
                filter: p.filter,
            }),
        }
    }

    pub fn monitor_id(&self) -> &str {
        &self.inner.monitor_id
    }

    pub fn monitor_type(&self) -> &str {
        &self.inner.monitor_type
    }

    fn stamp_dimensions(&self, dims: &mut HashMap<String, String>) {
        let inner = &self.inner;
        dims.entry(PLUGIN_DIMENSION.to_string())
            .or_insert_with(|| inner.monitor_type.clone());
        for (k, v) in &inner.endpoint_dims {
            dims.insert(k.clone(), v.clone());
        }
        for (k, v) in inner.extra_dims.read().iter() {
            dims.insert(k.clone(), v.clone());
        }
        if inner.include_monitor_id.load(Ordering::Relaxed) {
            dims.insert(MONITOR_ID_DIMENSION.to_string(), inner.monitor_id.clone());
        }
    }

    /// Stamp, filter and enqueue one datapoint. Returns false if it was
    /// filtered out or dropped.
    pub fn send_datapoint(&self, mut dp: Datapoint) -> bool {
        let inner = &self.inner;
        self.stamp_dimensions(&mut dp.dimensions);

        dp.meta.monitor_type = Some(inner.monitor_type.clone());
        dp.meta.monitor_id = Some(inner.monitor_id.clone());
        dp.meta.config_hash = Some(inner.config_hash.clone());
        dp.meta.endpoint_id = inner.endpoint_id.clone();
        if inner.not_host_specific {
            dp.meta.not_host_specific = true;
        }

        if inner.filter.matches(&dp) {
            trace!(metric = %dp.metric, monitor_id = %inner.monitor_id, "Datapoint filtered by monitor");
            return false;
        }
        inner.sinks.send_datapoint(dp)
    }

    pub fn send_datapoints(&self, dps: impl IntoIterator<Item = Datapoint>) {
        for dp in dps {
            self.send_datapoint(dp);
        }
    }

    pub fn send_event(&self, mut event: Event) -> bool {
        self.stamp_dimensions(&mut event.dimensions);
        if self.inner.not_host_specific {
            event.meta.not_host_specific = true;
        }
        self.inner.sinks.send_event(event)
    }

    pub fn send_span(&self, mut span: TraceSpan) -> bool {
        if self.inner.not_host_specific {
            span.tags
                .insert(NOT_HOST_SPECIFIC_TAG.to_string(), "true".to_string());
        }
        self.inner.sinks.send_span(span)
    }

    pub fn send_dim_props(&self, update: DimProperties) -> bool {
        self.inner.sinks.send_dim_props(update)
    }

    /// Add a dimension to everything emitted from now on
    pub fn add_extra_dimension(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.extra_dims.write().insert(key.into(), value.into());
    }

    pub fn remove_extra_dimension(&self, key: &str) {
        self.inner.extra_dims.write().remove(key);
    }
}
