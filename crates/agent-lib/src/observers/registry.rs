//! Registry of currently discovered endpoints

use crate::endpoint::{Endpoint, EndpointEvent};
use dashmap::DashMap;
use tracing::debug;

struct Entry {
    observer: String,
    endpoint: Endpoint,
}

/// Endpoints keyed by id, each remembering the observer that reported it
#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: DashMap<String, Entry>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event from `observer` and return what downstream should
    /// see. An add for a known id becomes a remove followed by an add; a
    /// remove for an unknown id produces nothing.
    pub fn apply(&self, observer: &str, event: EndpointEvent) -> Vec<EndpointEvent> {
        match event {
            EndpointEvent::Added(endpoint) => {
                let id = endpoint.id.clone();
                let previous = self.endpoints.insert(
                    id.clone(),
                    Entry {
                        observer: observer.to_string(),
                        endpoint: endpoint.clone(),
                    },
                );
                match previous {
                    Some(_) => {
                        debug!(endpoint_id = %id, "Endpoint replaced");
                        vec![EndpointEvent::Removed(id), EndpointEvent::Added(endpoint)]
                    }
                    None => vec![EndpointEvent::Added(endpoint)],
                }
            }
            EndpointEvent::Removed(id) => match self.endpoints.remove(&id) {
                Some(_) => vec![EndpointEvent::Removed(id)],
                None => {
                    debug!(endpoint_id = %id, "Ignoring removal of unknown endpoint");
                    vec![]
                }
            },
        }
    }

    /// Drop every endpoint owned by `observer`, returning the removals
    pub fn retire(&self, observer: &str) -> Vec<EndpointEvent> {
        let ids: Vec<String> = self
            .endpoints
            .iter()
            .filter(|e| e.value().observer == observer)
            .map(|e| e.key().clone())
            .collect();

        ids.into_iter()
            .filter(|id| {
                self.endpoints
                    .remove_if(id, |_, e| e.observer == observer)
                    .is_some()
            })
            .map(EndpointEvent::Removed)
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Endpoint> {
        self.endpoints.get(id).map(|e| e.endpoint.clone())
    }

    /// All known endpoints, sorted by id
    pub fn list(&self) -> Vec<Endpoint> {
        let mut out: Vec<Endpoint> = self
            .endpoints
            .iter()
            .map(|e| e.value().endpoint.clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn count_for(&self, observer: &str) -> usize {
        self.endpoints
            .iter()
            .filter(|e| e.value().observer == observer)
            .count()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
