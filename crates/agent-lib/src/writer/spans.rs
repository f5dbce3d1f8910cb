//! Trace span worker

use super::client::CONTENT_PROTOBUF;
use super::counters::{add, gauge_add, gauge_sub};
use super::{next_batch, trace_url, Shared};
use crate::config::WriterConfig;
use crate::models::{TraceSpan, NOT_HOST_SPECIFIC_TAG};
use crate::proto::encode_spans;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Add host-id tags to host-specific spans and strip the marker tag
pub(crate) fn prepare(mut spans: Vec<TraceSpan>, conf: &WriterConfig) -> Vec<TraceSpan> {
    for span in &mut spans {
        if !span.is_not_host_specific() {
            for (k, v) in &conf.host_id_dimensions {
                span.tags.insert(k.clone(), v.clone());
            }
        }
        span.tags.remove(NOT_HOST_SPECIFIC_TAG);
    }
    spans
}

pub(super) async fn run(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<TraceSpan>,
    limit: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = limit.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let max = shared.config().trace_span_max_batch_size;
        let Some(batch) = next_batch(&mut rx, max, &cancel).await else {
            break;
        };
        let conf = shared.config();
        let spans = prepare(batch, &conf);
        let count = spans.len();

        let counters = &shared.counters;
        gauge_add(&counters.trace_spans_in_flight, count);
        gauge_add(&counters.trace_span_requests_active, 1);

        let shared = shared.clone();
        tokio::spawn(async move {
            let url = trace_url(&conf);
            let body = encode_spans(spans);
            let result = shared
                .client
                .post(&url, &conf.access_token, CONTENT_PROTOBUF, body)
                .await;

            let counters = &shared.counters;
            match result {
                Ok(()) => add(&counters.trace_spans_sent, count),
                Err(e) => {
                    add(&counters.trace_span_requests_failed, 1);
                    add(&counters.trace_spans_dropped, count);
                    error!(url = %url, count = count, error = %e, "Dropping trace span batch");
                }
            }
            gauge_sub(&counters.trace_spans_in_flight, count);
            gauge_sub(&counters.trace_span_requests_active, 1);
            drop(permit);
        });
    }
    debug!("Trace span worker stopped");
}
