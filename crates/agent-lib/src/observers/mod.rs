//! Endpoint discovery
//!
//! This module provides:
//! - The `Observer` trait implemented by discovery sources
//! - The built-in `host` observer, which finds listening sockets
//! - `EndpointRegistry`, the single source of truth for known endpoints
//! - `ObserverManager`, which reconciles observers and merges their streams

mod host;
mod manager;
mod registry;

#[cfg(test)]
mod tests;

pub use host::{parse_socket_table, HostObserver, HostObserverConfig, ListeningSocket};
pub use manager::{ActiveObserverInfo, ObserverFactory, ObserverManager, ObserverManagerBuilder};
pub use registry::EndpointRegistry;

use crate::config::ObserverConfig;
use crate::endpoint::{Endpoint, EndpointEvent};
use crate::error::{ConfigError, InstantiationError};
use crate::process::ProcessContext;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Type-specific observer configuration
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverSettings {
    Host(HostObserverConfig),
    /// No implementation is registered for the type
    Unknown(String),
}

/// Decode the type-specific part of an observer entry
pub fn decode_settings(
    observer_type: &str,
    value: serde_yaml::Value,
) -> Result<ObserverSettings, ConfigError> {
    match observer_type {
        "host" => serde_yaml::from_value::<HostObserverConfig>(value)
            .map(ObserverSettings::Host)
            .map_err(|e| ConfigError::validation(e.to_string())),
        other => Ok(ObserverSettings::Unknown(other.to_string())),
    }
}

/// Fresh, unconfigured instance of a built-in observer type
pub fn create_observer(observer_type: &str) -> Option<Box<dyn Observer>> {
    match observer_type {
        "host" => Some(Box::new(HostObserver::default())),
        _ => None,
    }
}

/// What an observer receives when configured
pub struct ObserverInit {
    pub config: Arc<ObserverConfig>,
    pub ctx: Arc<ProcessContext>,
    /// Cancelled when the instance is torn down
    pub cancel: CancellationToken,
}

/// A discovery source
#[async_trait]
pub trait Observer: Send {
    async fn configure(&mut self, init: ObserverInit) -> Result<(), InstantiationError>;

    /// Begin emitting into `sink`. Called once, after `configure`.
    fn start(&mut self, sink: EndpointSink);

    /// Stop emitting and wait for background work to finish
    async fn shutdown(&mut self);
}

/// Message on the dispatcher channel
#[derive(Debug)]
pub(crate) enum Dispatch {
    Event { observer: String, event: EndpointEvent },
    /// Every endpoint still owned by the observer is removed
    Retire(String),
}

/// Handle an observer emits through. Tags each event with the instance key.
#[derive(Debug, Clone)]
pub struct EndpointSink {
    observer: String,
    tx: mpsc::UnboundedSender<Dispatch>,
}

impl EndpointSink {
    pub(crate) fn new(observer: impl Into<String>, tx: mpsc::UnboundedSender<Dispatch>) -> Self {
        Self {
            observer: observer.into(),
            tx,
        }
    }

    pub fn observer(&self) -> &str {
        &self.observer
    }

    /// Returns false once the dispatcher has stopped
    pub fn added(&self, endpoint: Endpoint) -> bool {
        self.send(EndpointEvent::Added(endpoint))
    }

    pub fn removed(&self, id: impl Into<String>) -> bool {
        self.send(EndpointEvent::Removed(id.into()))
    }

    fn send(&self, event: EndpointEvent) -> bool {
        self.tx
            .send(Dispatch::Event {
                observer: self.observer.clone(),
                event,
            })
            .is_ok()
    }
}
