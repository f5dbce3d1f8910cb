//! Channels between monitor outputs and the writer workers

use super::counters::{add, WriterCounters};
use crate::models::{Datapoint, DimProperties, Event, TraceSpan};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{error, warn};

/// Capacity of the event channel and of the event worker's buffer
pub const EVENT_BUFFER_SIZE: usize = 1000;

/// Capacity of the dimension-properties channel
pub const DIM_PROPS_BUFFER_SIZE: usize = 1000;

/// Producer side of the writer channels. Cheap to clone; every monitor
/// output holds one. Sends never block: a full channel drops the item and
/// counts it.
#[derive(Clone)]
pub struct OutputSinks {
    datapoints: mpsc::Sender<Datapoint>,
    events: mpsc::Sender<Event>,
    spans: mpsc::Sender<TraceSpan>,
    dim_props: mpsc::Sender<DimProperties>,
    counters: Arc<WriterCounters>,
}

/// Consumer side, owned by the writer workers
pub struct SinkReceivers {
    pub datapoints: mpsc::Receiver<Datapoint>,
    pub events: mpsc::Receiver<Event>,
    pub spans: mpsc::Receiver<TraceSpan>,
    pub dim_props: mpsc::Receiver<DimProperties>,
}

/// Create the writer channels
pub fn channel(
    datapoint_capacity: usize,
    span_capacity: usize,
    counters: Arc<WriterCounters>,
) -> (OutputSinks, SinkReceivers) {
    let (dp_tx, dp_rx) = mpsc::channel(datapoint_capacity.max(1));
    let (ev_tx, ev_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
    let (span_tx, span_rx) = mpsc::channel(span_capacity.max(1));
    let (dim_tx, dim_rx) = mpsc::channel(DIM_PROPS_BUFFER_SIZE);

    (
        OutputSinks {
            datapoints: dp_tx,
            events: ev_tx,
            spans: span_tx,
            dim_props: dim_tx,
            counters,
        },
        SinkReceivers {
            datapoints: dp_rx,
            events: ev_rx,
            spans: span_rx,
            dim_props: dim_rx,
        },
    )
}

fn chan_len<T>(tx: &mpsc::Sender<T>) -> usize {
    tx.max_capacity() - tx.capacity()
}

impl OutputSinks {
    /// Returns false when the datapoint was dropped
    pub fn send_datapoint(&self, dp: Datapoint) -> bool {
        match self.datapoints.try_send(dp) {
            Ok(()) => true,
            Err(TrySendError::Full(dp)) => {
                add(&self.counters.dps_dropped, 1);
                warn!(metric = %dp.metric, "Datapoint channel full, dropping datapoint");
                false
            }
            Err(TrySendError::Closed(_)) => {
                add(&self.counters.dps_dropped, 1);
                false
            }
        }
    }

    pub fn send_event(&self, event: Event) -> bool {
        match self.events.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(ev)) | Err(TrySendError::Closed(ev)) => {
                add(&self.counters.events_dropped, 1);
                error!(event_type = %ev.event_type, "Event channel full, dropping event");
                false
            }
        }
    }

    pub fn send_span(&self, span: TraceSpan) -> bool {
        match self.spans.try_send(span) {
            Ok(()) => true,
            Err(_) => {
                add(&self.counters.trace_spans_dropped, 1);
                false
            }
        }
    }

    pub fn send_dim_props(&self, update: DimProperties) -> bool {
        match self.dim_props.try_send(update) {
            Ok(()) => true,
            Err(TrySendError::Full(update)) | Err(TrySendError::Closed(update)) => {
                add(&self.counters.dim_props_dropped, 1);
                warn!(
                    dimension = %update.dimension.name,
                    value = %update.dimension.value,
                    "Dimension properties channel full, dropping update"
                );
                false
            }
        }
    }

    pub fn counters(&self) -> &Arc<WriterCounters> {
        &self.counters
    }

    /// Current channel lengths: datapoints, events, spans, dim props
    pub fn lengths(&self) -> (usize, usize, usize, usize) {
        (
            chan_len(&self.datapoints),
            chan_len(&self.events),
            chan_len(&self.spans),
            chan_len(&self.dim_props),
        )
    }
}
