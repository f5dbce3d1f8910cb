//! Datapoint worker

use super::client::CONTENT_JSON;
use super::counters::{add, gauge_add, gauge_sub};
use super::{datapoint_url, next_batch, truncate_dimensions, Shared};
use crate::config::WriterConfig;
use crate::error::TransportError;
use crate::models::{Datapoint, Value};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Serialize)]
struct WireDatapoint<'a> {
    metric: &'a str,
    dimensions: &'a HashMap<String, String>,
    value: Value,
    timestamp: i64,
}

/// `{"gauge":[...],"counter":[...],"cumulative_counter":[...]}`
pub(crate) fn encode(dps: &[Datapoint]) -> serde_json::Result<Vec<u8>> {
    let mut by_type: BTreeMap<String, Vec<WireDatapoint<'_>>> = BTreeMap::new();
    for dp in dps {
        by_type
            .entry(dp.metric_type.to_string())
            .or_default()
            .push(WireDatapoint {
                metric: &dp.metric,
                dimensions: &dp.dimensions,
                value: dp.value,
                timestamp: dp.timestamp.timestamp_millis(),
            });
    }
    serde_json::to_vec(&by_type)
}

/// Filter and decorate a batch. Global dimensions never override existing
/// keys; host-id dimensions always do, unless the datapoint opted out.
pub(crate) fn prepare(batch: Vec<Datapoint>, conf: &WriterConfig) -> (Vec<Datapoint>, usize) {
    let mut filtered = 0;
    let mut out = Vec::with_capacity(batch.len());
    for mut dp in batch {
        if conf.filter.matches(&dp) {
            filtered += 1;
            continue;
        }
        for (k, v) in &conf.global_dimensions {
            dp.dimensions.entry(k.clone()).or_insert_with(|| v.clone());
        }
        if !dp.meta.not_host_specific {
            for (k, v) in &conf.host_id_dimensions {
                dp.dimensions.insert(k.clone(), v.clone());
            }
        }
        truncate_dimensions(&mut dp.dimensions);
        out.push(dp);
    }
    (out, filtered)
}

pub(super) async fn run(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<Datapoint>,
    limit: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    let counters = shared.counters.clone();
    loop {
        // Holding a permit before draining keeps at most `limit` batches in flight
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = limit.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let max = shared.config().datapoint_max_batch_size;
        let Some(batch) = next_batch(&mut rx, max, &cancel).await else {
            break;
        };
        let conf = shared.config();
        add(&counters.dps_received, batch.len());

        let (batch, filtered) = prepare(batch, &conf);
        add(&counters.dps_filtered, filtered);
        if batch.is_empty() {
            continue;
        }
        if conf.log_datapoints {
            for dp in &batch {
                debug!(metric = %dp.metric, value = ?dp.value, dimensions = ?dp.dimensions, "Sending datapoint");
            }
        }

        let count = batch.len();
        gauge_add(&counters.dps_in_flight, count);
        gauge_add(&counters.dp_requests_active, 1);

        let shared = shared.clone();
        tokio::spawn(async move {
            let url = datapoint_url(&conf);
            let result = match encode(&batch) {
                Ok(body) => {
                    shared
                        .client
                        .post(&url, &conf.access_token, CONTENT_JSON, body)
                        .await
                }
                Err(e) => Err(TransportError::Encode {
                    url: url.clone(),
                    reason: e.to_string(),
                }),
            };

            let counters = &shared.counters;
            match result {
                Ok(()) => add(&counters.dps_sent, count),
                Err(e) => {
                    add(&counters.dp_requests_failed, 1);
                    error!(url = %url, count = count, error = %e, "Dropping datapoint batch");
                }
            }
            gauge_sub(&counters.dps_in_flight, count);
            gauge_sub(&counters.dp_requests_active, 1);
            drop(permit);
        });
    }
    debug!("Datapoint worker stopped");
}
