//! Component health for the debug server's probes
//!
//! The orchestrator marks each pipeline component as it starts, fails or
//! recovers. `/healthz` reports the worst component; `/readyz` additionally
//! requires the first config to have been applied.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Still running, but dropping or retrying work
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub since: i64,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            since: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::new(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::new(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names
pub mod components {
    pub const CONFIG: &str = "config";
    pub const WRITER: &str = "writer";
    pub const MONITORS: &str = "monitors";
    pub const OBSERVERS: &str = "observers";
    pub const DIAGNOSTICS: &str = "diagnostics";
}

#[derive(Debug, Default)]
struct Inner {
    components: BTreeMap<String, ComponentHealth>,
    ready: bool,
}

/// Shared, cheaply cloned health table
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str) {
        self.inner
            .write()
            .components
            .insert(name.to_string(), ComponentHealth::healthy());
    }

    /// Record `health` unless the status is unchanged, so `since` keeps
    /// the time of the last transition
    pub fn update(&self, name: &str, health: ComponentHealth) {
        let mut inner = self.inner.write();
        match inner.components.get(name) {
            Some(current) if current.status == health.status && current.message == health.message => {}
            _ => {
                inner.components.insert(name.to_string(), health);
            }
        }
    }

    pub fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy());
    }

    pub fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message));
    }

    pub fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message));
    }

    pub fn set_ready(&self, ready: bool) {
        self.inner.write().ready = ready;
    }

    pub fn health(&self) -> HealthResponse {
        let components = self.inner.read().components.clone();
        let status = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        HealthResponse { status, components }
    }

    pub fn readiness(&self) -> ReadinessResponse {
        let ready = self.inner.read().ready;
        let reason = if !ready {
            Some("no config applied yet".to_string())
        } else if self.health().status == ComponentStatus::Unhealthy {
            Some("a component is unhealthy".to_string())
        } else {
            None
        };
        ReadinessResponse {
            ready: reason.is_none(),
            reason,
        }
    }
}
