//! Telemetry writer
//!
//! This module provides:
//! - The output channels monitors send into
//! - Four workers (datapoints, events, spans, dimension properties) that
//!   batch, decorate and send to the ingest and dimension APIs
//! - Atomic counters readable by diagnostics at any time

mod client;
pub mod counters;
mod datapoints;
mod dimensions;
mod events;
mod lru;
pub mod sinks;
mod spans;

#[cfg(test)]
mod tests;

pub use client::{IngestClient, REQUEST_TIMEOUT, TOKEN_HEADER};
pub use counters::{CounterSnapshot, WriterCounters};
pub use sinks::OutputSinks;

use crate::config::WriterConfig;
use crate::error::{AgentError, ConfigError};
use crate::filters::DimPropsFilter;
use client::join_url;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Dimension values longer than this are cut before sending
pub const MAX_DIMENSION_VALUE_LEN: usize = 256;

/// Configuration and clients shared by the workers. Swapped as a whole on
/// reconfigure; workers pick up the new value on their next batch.
pub(crate) struct Shared {
    config: RwLock<Arc<WriterConfig>>,
    prop_filter: RwLock<Arc<DimPropsFilter>>,
    client: IngestClient,
    counters: Arc<WriterCounters>,
}

impl Shared {
    pub(crate) fn config(&self) -> Arc<WriterConfig> {
        self.config.read().clone()
    }

    pub(crate) fn prop_filter(&self) -> Arc<DimPropsFilter> {
        self.prop_filter.read().clone()
    }
}

pub(crate) fn datapoint_url(conf: &WriterConfig) -> String {
    conf.datapoint_endpoint_url
        .clone()
        .unwrap_or_else(|| join_url(&conf.ingest_url, "/v2/datapoint"))
}

pub(crate) fn event_url(conf: &WriterConfig) -> String {
    conf.event_endpoint_url
        .clone()
        .unwrap_or_else(|| join_url(&conf.ingest_url, "/v2/event"))
}

pub(crate) fn trace_url(conf: &WriterConfig) -> String {
    conf.trace_endpoint_url
        .clone()
        .unwrap_or_else(|| join_url(&conf.ingest_url, "/v1/trace"))
}

/// Cut a dimension value to the allowed length on a char boundary
pub(crate) fn truncate_value(value: &mut String) {
    if value.len() <= MAX_DIMENSION_VALUE_LEN {
        return;
    }
    let mut end = MAX_DIMENSION_VALUE_LEN;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value.truncate(end);
}

pub(crate) fn truncate_dimensions(dims: &mut HashMap<String, String>) {
    for value in dims.values_mut() {
        truncate_value(value);
    }
}

/// Receive up to `max` items: waits for the first, then drains whatever is
/// already queued. Returns `None` once cancelled or closed.
pub(crate) async fn next_batch<T>(
    rx: &mut mpsc::Receiver<T>,
    max: usize,
    cancel: &CancellationToken,
) -> Option<Vec<T>> {
    let first = tokio::select! {
        _ = cancel.cancelled() => return None,
        item = rx.recv() => item?,
    };
    let mut batch = Vec::with_capacity(max.min(1024));
    batch.push(first);
    while batch.len() < max {
        match rx.try_recv() {
            Ok(item) => batch.push(item),
            Err(_) => break,
        }
    }
    Some(batch)
}

fn validate(config: &WriterConfig) -> Result<DimPropsFilter, ConfigError> {
    if config.access_token.is_empty() {
        return Err(ConfigError::validation("writer access token is empty"));
    }
    for url in [
        config.ingest_url.clone(),
        config.api_url.clone(),
        datapoint_url(config),
        event_url(config),
        trace_url(config),
    ] {
        url::Url::parse(&url)
            .map_err(|e| ConfigError::validation(format!("invalid writer URL {}: {}", url, e)))?;
    }
    if config.datapoint_max_batch_size == 0
        || config.datapoint_max_requests == 0
        || config.trace_span_max_batch_size == 0
        || config.trace_span_max_requests == 0
        || config.properties_max_requests == 0
    {
        return Err(ConfigError::validation(
            "writer batch sizes and request limits must be greater than zero",
        ));
    }
    DimPropsFilter::new(&config.properties_to_exclude)
}

/// Owns the writer workers and the producer side of their channels
pub struct Writer {
    shared: Arc<Shared>,
    sinks: OutputSinks,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Writer {
    /// Validate the config, create the channels and start the workers.
    /// Channel capacities and request ceilings are fixed from here on.
    pub fn start(config: WriterConfig, cancel: CancellationToken) -> Result<Self, AgentError> {
        let prop_filter = validate(&config)?;
        let client = IngestClient::new()
            .map_err(|e| AgentError::Internal(format!("could not build HTTP client: {}", e)))?;
        let counters = Arc::new(WriterCounters::default());
        let (sinks, receivers) = sinks::channel(
            config.datapoint_buffer_size(),
            config.span_buffer_size(),
            counters.clone(),
        );

        let dp_limit = Arc::new(Semaphore::new(config.datapoint_max_requests));
        let span_limit = Arc::new(Semaphore::new(config.trace_span_max_requests));
        let prop_limit = Arc::new(Semaphore::new(config.properties_max_requests));
        let history_size = config.properties_history_size;

        let shared = Arc::new(Shared {
            config: RwLock::new(Arc::new(config)),
            prop_filter: RwLock::new(Arc::new(prop_filter)),
            client,
            counters,
        });

        let tasks = vec![
            tokio::spawn(datapoints::run(
                shared.clone(),
                receivers.datapoints,
                dp_limit,
                cancel.clone(),
            )),
            tokio::spawn(events::run(shared.clone(), receivers.events, cancel.clone())),
            tokio::spawn(spans::run(
                shared.clone(),
                receivers.spans,
                span_limit,
                cancel.clone(),
            )),
            tokio::spawn(dimensions::run(
                shared.clone(),
                receivers.dim_props,
                dimensions::Dedup::new(history_size),
                prop_limit,
                cancel.clone(),
            )),
        ];
        info!("Writer started");

        Ok(Self {
            shared,
            sinks,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    /// Apply a new config to the running workers
    pub fn configure(&self, config: WriterConfig) -> Result<(), AgentError> {
        let prop_filter = validate(&config)?;
        if self.shared.config().buffers_differ(&config) {
            warn!("Writer buffer sizes or request limits changed; restart the agent to apply them");
        }
        *self.shared.config.write() = Arc::new(config);
        *self.shared.prop_filter.write() = Arc::new(prop_filter);
        info!("Writer reconfigured");
        Ok(())
    }

    /// Producer handle for monitor outputs
    pub fn sinks(&self) -> OutputSinks {
        self.sinks.clone()
    }

    pub fn counters(&self) -> &Arc<WriterCounters> {
        &self.shared.counters
    }

    /// Counters plus current channel lengths
    pub fn snapshot(&self) -> CounterSnapshot {
        let mut snap = self.shared.counters.snapshot();
        let (dps, events, spans, props) = self.sinks.lengths();
        snap.datapoint_chan_len = dps;
        snap.event_chan_len = events;
        snap.trace_span_chan_len = spans;
        snap.dim_props_chan_len = props;
        snap
    }

    /// Stop accepting work and wait for the workers to exit. Requests
    /// already in flight finish on their own.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Writer worker ended abnormally");
            }
        }
        info!("Writer stopped");
    }
}
