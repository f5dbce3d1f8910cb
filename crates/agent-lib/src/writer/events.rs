//! Event worker: buffers events and flushes them on a ticker

use super::client::CONTENT_JSON;
use super::counters::add;
use super::sinks::EVENT_BUFFER_SIZE;
use super::{event_url, truncate_dimensions, Shared};
use crate::config::WriterConfig;
use crate::models::{Event, HOST_DIMENSION};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Apply global dimensions and the host dimension
pub(crate) fn prepare(mut event: Event, conf: &WriterConfig) -> Event {
    for (k, v) in &conf.global_dimensions {
        event.dimensions.entry(k.clone()).or_insert_with(|| v.clone());
    }
    if !event.meta.not_host_specific {
        if let Some(host) = conf.host_id_dimensions.get(HOST_DIMENSION) {
            event
                .dimensions
                .insert(HOST_DIMENSION.to_string(), host.clone());
        }
    }
    truncate_dimensions(&mut event.dimensions);
    event
}

fn ticker(every: std::time::Duration) -> Interval {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

pub(super) async fn run(shared: Arc<Shared>, mut rx: mpsc::Receiver<Event>, cancel: CancellationToken) {
    let mut every = shared.config().event_send_interval;
    let mut tick = ticker(every);
    let mut buffer: Vec<Event> = Vec::with_capacity(EVENT_BUFFER_SIZE);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                if buffer.len() >= EVENT_BUFFER_SIZE {
                    add(&shared.counters.events_dropped, 1);
                    error!(event_type = %event.event_type, "Event buffer full, dropping event");
                    continue;
                }
                let conf = shared.config();
                if conf.log_events {
                    debug!(event_type = %event.event_type, dimensions = ?event.dimensions, "Sending event");
                }
                buffer.push(prepare(event, &conf));
            }
            _ = tick.tick() => {
                let conf = shared.config();
                if !buffer.is_empty() {
                    let batch = std::mem::replace(&mut buffer, Vec::with_capacity(EVENT_BUFFER_SIZE));
                    tokio::spawn(send(shared.clone(), conf.clone(), batch));
                }
                if conf.event_send_interval != every {
                    every = conf.event_send_interval;
                    tick = ticker(every);
                    tick.reset();
                }
            }
        }
    }
    debug!("Event worker stopped");
}

async fn send(shared: Arc<Shared>, conf: Arc<WriterConfig>, batch: Vec<Event>) {
    let url = event_url(&conf);
    let count = batch.len();
    let body = match serde_json::to_vec(&batch) {
        Ok(body) => body,
        Err(e) => {
            add(&shared.counters.event_requests_failed, 1);
            error!(url = %url, error = %e, "Could not encode events");
            return;
        }
    };

    match shared
        .client
        .post(&url, &conf.access_token, CONTENT_JSON, body)
        .await
    {
        Ok(()) => add(&shared.counters.events_sent, count),
        Err(e) => {
            add(&shared.counters.event_requests_failed, 1);
            error!(url = %url, count = count, error = %e, "Dropping event batch");
        }
    }
}
