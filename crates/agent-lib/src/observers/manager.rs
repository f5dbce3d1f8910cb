//! Reconciles running observers against config and merges their output
//!
//! Every observer emits into one unbounded dispatcher channel. The
//! dispatcher applies each event to the [`EndpointRegistry`] and forwards
//! the result downstream, so consumers see one ordered stream.

use super::registry::EndpointRegistry;
use super::{create_observer, Dispatch, EndpointSink, Observer, ObserverInit, ObserverSettings};
use crate::config::ObserverConfig;
use crate::endpoint::EndpointEvent;
use crate::process::ProcessContext;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Builds observers by type name
pub type ObserverFactory = Arc<dyn Fn(&str) -> Option<Box<dyn Observer>> + Send + Sync>;

/// A running observer as reported by diagnostics
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveObserverInfo {
    pub observer_type: String,
    pub name: String,
    pub config_hash: String,
    /// Endpoints currently owned by this observer
    pub endpoints: usize,
}

struct ActiveObserver {
    key: String,
    config: Arc<ObserverConfig>,
    instance: Box<dyn Observer>,
}

fn instance_key(config: &ObserverConfig) -> String {
    let hash = &config.hash[..config.hash.len().min(12)];
    format!("{}/{}/{}", config.observer_type, config.name, hash)
}

/// Builder for [`ObserverManager`]
pub struct ObserverManagerBuilder {
    registry: Arc<EndpointRegistry>,
    downstream: mpsc::UnboundedSender<EndpointEvent>,
    ctx: Arc<ProcessContext>,
    factory: Option<ObserverFactory>,
    shutdown_deadline: Duration,
    cancel: CancellationToken,
}

impl ObserverManagerBuilder {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        downstream: mpsc::UnboundedSender<EndpointEvent>,
        ctx: Arc<ProcessContext>,
    ) -> Self {
        Self {
            registry,
            downstream,
            ctx,
            factory: None,
            shutdown_deadline: DEFAULT_SHUTDOWN_DEADLINE,
            cancel: CancellationToken::new(),
        }
    }

    pub fn factory(mut self, factory: ObserverFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn shutdown_deadline(mut self, deadline: Duration) -> Self {
        self.shutdown_deadline = deadline;
        self
    }

    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Spawns the dispatcher; must be called inside a runtime
    pub fn build(self) -> ObserverManager {
        let cancel = self.cancel.child_token();
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch(
            rx,
            self.registry.clone(),
            self.downstream,
            cancel.clone(),
        ));

        ObserverManager {
            active: Mutex::new(Vec::new()),
            published: RwLock::new(Arc::new(Vec::new())),
            tx,
            registry: self.registry,
            ctx: self.ctx,
            factory: self
                .factory
                .unwrap_or_else(|| Arc::new(|t: &str| create_observer(t))),
            shutdown_deadline: self.shutdown_deadline,
            cancel,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }
}

async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<Dispatch>,
    registry: Arc<EndpointRegistry>,
    downstream: mpsc::UnboundedSender<EndpointEvent>,
    cancel: CancellationToken,
) {
    loop {
        // Queued retirements are applied before a cancel is honoured
        let msg = tokio::select! {
            biased;

            msg = rx.recv() => match msg {
                Some(m) => m,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };
        let events = match msg {
            Dispatch::Event { observer, event } => registry.apply(&observer, event),
            Dispatch::Retire(observer) => {
                let removed = registry.retire(&observer);
                debug!(observer = %observer, removed = removed.len(), "Observer retired");
                removed
            }
        };
        for event in events {
            if downstream.send(event).is_err() {
                debug!("Endpoint consumer is gone, stopping dispatcher");
                return;
            }
        }
    }
    debug!("Endpoint dispatcher stopped");
}

/// Owns all observer instances
pub struct ObserverManager {
    active: Mutex<Vec<ActiveObserver>>,
    published: RwLock<Arc<Vec<(String, Arc<ObserverConfig>)>>>,
    tx: mpsc::UnboundedSender<Dispatch>,
    registry: Arc<EndpointRegistry>,
    ctx: Arc<ProcessContext>,
    factory: ObserverFactory,
    shutdown_deadline: Duration,
    cancel: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ObserverManager {
    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// Running observers with their current endpoint counts
    pub fn snapshot(&self) -> Vec<ActiveObserverInfo> {
        self.published
            .read()
            .iter()
            .map(|(key, conf)| ActiveObserverInfo {
                observer_type: conf.observer_type.clone(),
                name: conf.name.clone(),
                config_hash: conf.hash[..conf.hash.len().min(12)].to_string(),
                endpoints: self.registry.count_for(key),
            })
            .collect()
    }

    /// Apply a new set of observer configs. Unchanged entries keep running,
    /// new ones start first, then replaced ones stop and have their
    /// endpoints removed.
    pub async fn configure(&self, configs: &[ObserverConfig]) {
        let mut active = self.active.lock().await;

        let mut desired = Vec::new();
        let mut seen = HashSet::new();
        for conf in configs {
            if let Some(err) = &conf.validation_error {
                error!(observer_type = %conf.observer_type, index = conf.index, error = %err, "Observer config is invalid, skipping");
                continue;
            }
            if let ObserverSettings::Unknown(t) = &conf.settings {
                error!(observer_type = %t, index = conf.index, "Unknown observer type, skipping");
                continue;
            }
            let key = instance_key(conf);
            if !seen.insert(key.clone()) {
                warn!(observer_type = %conf.observer_type, name = %conf.name, "Duplicate observer config, skipping");
                continue;
            }
            desired.push((key, Arc::new(conf.clone())));
        }

        let (keep, doomed): (Vec<_>, Vec<_>) = std::mem::take(&mut *active)
            .into_iter()
            .partition(|a| desired.iter().any(|(k, _)| *k == a.key));
        *active = keep;

        for (key, conf) in &desired {
            if active.iter().any(|a| a.key == *key) {
                continue;
            }
            if let Some(observer) = self.start_instance(key, conf.clone()).await {
                active.push(observer);
            }
        }

        for observer in doomed {
            self.stop_instance(observer).await;
        }

        let published = active
            .iter()
            .map(|a| (a.key.clone(), a.config.clone()))
            .collect();
        *self.published.write() = Arc::new(published);
    }

    async fn start_instance(&self, key: &str, config: Arc<ObserverConfig>) -> Option<ActiveObserver> {
        let Some(mut instance) = (self.factory)(&config.observer_type) else {
            error!(observer_type = %config.observer_type, "No implementation for observer type");
            return None;
        };

        let init = ObserverInit {
            config: config.clone(),
            ctx: self.ctx.clone(),
            cancel: self.cancel.child_token(),
        };
        if let Err(e) = instance.configure(init).await {
            error!(observer_type = %config.observer_type, name = %config.name, error = %e, "Could not configure observer");
            instance.shutdown().await;
            return None;
        }

        instance.start(EndpointSink::new(key, self.tx.clone()));
        info!(observer_type = %config.observer_type, name = %config.name, "Observer started");
        Some(ActiveObserver {
            key: key.to_string(),
            config,
            instance,
        })
    }

    async fn stop_instance(&self, mut observer: ActiveObserver) {
        if tokio::time::timeout(self.shutdown_deadline, observer.instance.shutdown())
            .await
            .is_err()
        {
            warn!(observer = %observer.key, "Observer did not stop within its deadline");
        }
        // Queued behind everything the observer already sent
        let _ = self.tx.send(Dispatch::Retire(observer.key.clone()));
        info!(observer_type = %observer.config.observer_type, name = %observer.config.name, "Observer stopped");
    }

    /// Stop every observer and the dispatcher
    pub async fn shutdown(&self) {
        let doomed = std::mem::take(&mut *self.active.lock().await);
        for observer in doomed {
            self.stop_instance(observer).await;
        }
        *self.published.write() = Arc::new(Vec::new());

        self.cancel.cancel();
        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                debug!(error = %e, "Endpoint dispatcher ended abnormally");
            }
        }
    }
}
