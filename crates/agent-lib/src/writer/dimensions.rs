//! Dimension-property worker with dedup

use super::counters::{add, gauge_add, gauge_sub};
use super::lru::LruCache;
use super::{truncate_value, Shared};
use crate::config::WriterConfig;
use crate::error::TransportError;
use crate::models::{DimProperties, Dimension};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// Recently sent and currently in-flight updates, keyed by dimension
pub(crate) struct Dedup {
    history: LruCache<Dimension, DimProperties>,
    in_flight: HashMap<Dimension, DimProperties>,
}

impl Dedup {
    pub(crate) fn new(history_size: usize) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            history: LruCache::new(history_size),
            in_flight: HashMap::new(),
        }))
    }

    /// Register `update` as in flight unless it repeats the last sent or
    /// in-flight update for the same dimension
    pub(crate) fn begin(&mut self, update: &DimProperties) -> bool {
        let key = &update.dimension;
        if self.in_flight.get(key) == Some(update) || self.history.get(key) == Some(update) {
            return false;
        }
        self.in_flight.insert(key.clone(), update.clone());
        true
    }

    pub(crate) fn finish(&mut self, update: DimProperties, sent: bool) {
        if self.in_flight.get(&update.dimension) == Some(&update) {
            self.in_flight.remove(&update.dimension);
        }
        if sent {
            self.history.put(update.dimension.clone(), update);
        }
    }
}

/// `{apiUrl}/v2/dimension/{key}/{value}` with both segments escaped
pub(crate) fn dimension_url(api_url: &str, dim: &Dimension) -> Result<String, TransportError> {
    let invalid = |reason: String| TransportError::Encode {
        url: api_url.to_string(),
        reason,
    };
    let mut url = url::Url::parse(api_url).map_err(|e| invalid(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| invalid("API URL cannot be a base".to_string()))?
        .pop_if_empty()
        .extend(["v2", "dimension", dim.name.as_str(), dim.value.as_str()]);
    Ok(url.to_string())
}

pub(crate) fn body(update: &DimProperties) -> serde_json::Value {
    // BTreeSet iterates in sorted order
    let tags: Vec<&String> = update.tags.iter().collect();
    serde_json::json!({
        "key": update.dimension.name,
        "value": update.dimension.value,
        "customProperties": update.properties,
        "tags": tags,
    })
}

pub(super) async fn run(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<DimProperties>,
    dedup: Arc<Mutex<Dedup>>,
    limit: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    loop {
        let update = tokio::select! {
            _ = cancel.cancelled() => break,
            update = rx.recv() => match update {
                Some(u) => u,
                None => break,
            },
        };

        let Some(mut update) = shared.prop_filter().apply(update) else {
            trace!("Dimension update empty after filtering");
            continue;
        };
        truncate_value(&mut update.dimension.value);

        if !dedup.lock().begin(&update) {
            add(&shared.counters.dim_props_duplicate, 1);
            continue;
        }

        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = limit.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let counters = &shared.counters;
        gauge_add(&counters.dim_props_in_flight, 1);
        gauge_add(&counters.dim_prop_requests_active, 1);

        let shared = shared.clone();
        let dedup = dedup.clone();
        let conf = shared.config();
        tokio::spawn(async move {
            let sent = match put(&shared, &conf, &update).await {
                Ok(()) => {
                    add(&shared.counters.dim_props_sent, 1);
                    true
                }
                Err(e) => {
                    add(&shared.counters.dim_prop_requests_failed, 1);
                    error!(
                        dimension = %update.dimension.name,
                        value = %update.dimension.value,
                        error = %e,
                        "Could not update dimension properties"
                    );
                    false
                }
            };
            dedup.lock().finish(update, sent);
            gauge_sub(&shared.counters.dim_props_in_flight, 1);
            gauge_sub(&shared.counters.dim_prop_requests_active, 1);
            drop(permit);
        });
    }
    debug!("Dimension properties worker stopped");
}

async fn put(
    shared: &Shared,
    conf: &WriterConfig,
    update: &DimProperties,
) -> Result<(), TransportError> {
    let url = dimension_url(&conf.api_url, &update.dimension)?;
    shared
        .client
        .put_json(&url, &conf.access_token, &body(update))
        .await
}
