//! The agent's own observability
//!
//! Provides:
//! - Prometheus metrics mirroring the writer counters and manager state,
//!   served by the debug server's `/metrics`
//! - A structured logger for agent lifecycle events

use crate::diagnostics::AgentStatus;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, register_int_gauge_vec,
    Encoder, Histogram, IntCounter, IntGauge, IntGaugeVec, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Buckets for config reconcile durations (in seconds)
const RECONCILE_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    config_reloads: IntCounter,
    config_reload_failures: IntCounter,
    reconcile_seconds: Histogram,
    active_monitors: IntGauge,
    bad_monitor_configs: IntGauge,
    active_observers: IntGauge,
    discovered_endpoints: IntGauge,
    writer: IntGaugeVec,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            config_reloads: register_int_counter!(
                "sfxagent_config_reloads_total",
                "Configs applied after the initial load"
            )
            .expect("Failed to register config_reloads"),

            config_reload_failures: register_int_counter!(
                "sfxagent_config_reload_failures_total",
                "Config reloads that could not be applied"
            )
            .expect("Failed to register config_reload_failures"),

            reconcile_seconds: register_histogram!(
                "sfxagent_reconcile_seconds",
                "Time spent applying a config to all components",
                RECONCILE_BUCKETS.to_vec()
            )
            .expect("Failed to register reconcile_seconds"),

            active_monitors: register_int_gauge!(
                "sfxagent_active_monitors",
                "Running monitor instances"
            )
            .expect("Failed to register active_monitors"),

            bad_monitor_configs: register_int_gauge!(
                "sfxagent_bad_monitor_configs",
                "Monitor config entries that could not be used"
            )
            .expect("Failed to register bad_monitor_configs"),

            active_observers: register_int_gauge!(
                "sfxagent_active_observers",
                "Running observers"
            )
            .expect("Failed to register active_observers"),

            discovered_endpoints: register_int_gauge!(
                "sfxagent_discovered_endpoints",
                "Endpoints currently known to the registry"
            )
            .expect("Failed to register discovered_endpoints"),

            writer: register_int_gauge_vec!(
                "sfxagent_writer",
                "Writer counters and channel lengths",
                &["counter"]
            )
            .expect("Failed to register writer"),
        }
    }
}

/// Handle to the process-global metrics. Clones share the same metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    inner: &'static AgentMetricsInner,
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    pub fn new() -> Self {
        Self {
            inner: GLOBAL_METRICS.get_or_init(AgentMetricsInner::new),
        }
    }

    pub fn inc_config_reloads(&self) {
        self.inner.config_reloads.inc();
    }

    pub fn inc_config_reload_failures(&self) {
        self.inner.config_reload_failures.inc();
    }

    pub fn observe_reconcile(&self, took: Duration) {
        self.inner.reconcile_seconds.observe(took.as_secs_f64());
    }

    /// Copy a status snapshot into the gauges
    pub fn update_from(&self, status: &AgentStatus) {
        let inner = self.inner;
        inner.active_monitors.set(status.monitors.active.len() as i64);
        inner
            .bad_monitor_configs
            .set(status.monitors.bad_configs.len() as i64);
        inner.active_observers.set(status.observers.len() as i64);
        inner.discovered_endpoints.set(status.endpoints.len() as i64);
        for (name, value) in status.writer.rows() {
            if let Ok(v) = value.parse::<i64>() {
                inner.writer.with_label_values(&[name]).set(v);
            }
        }
    }

    /// Prometheus text exposition of every registered metric
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
            warn!(error = %e, "Could not encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Lifecycle events with a fixed `event` field
#[derive(Clone)]
pub struct StructuredLogger {
    hostname: String,
}

impl StructuredLogger {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }

    pub fn log_startup(&self, version: &str, config_path: &str) {
        info!(
            event = "agent_started",
            host = %self.hostname,
            agent_version = %version,
            config_path = %config_path,
            "SignalFx agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            host = %self.hostname,
            reason = %reason,
            "SignalFx agent shutting down"
        );
    }

    pub fn log_config_reloaded(&self, content_hash: &str, monitors: usize, observers: usize) {
        let short_hash = &content_hash[..content_hash.len().min(12)];
        info!(
            event = "config_reloaded",
            host = %self.hostname,
            content_hash = %short_hash,
            monitors = monitors,
            observers = observers,
            "Applied new config"
        );
    }

    pub fn log_monitor_instantiated(
        &self,
        monitor_id: &str,
        monitor_type: &str,
        endpoint_id: Option<&str>,
    ) {
        info!(
            event = "monitor_instantiated",
            host = %self.hostname,
            monitor_id = %monitor_id,
            monitor_type = %monitor_type,
            endpoint_id = endpoint_id.unwrap_or(""),
            "Monitor instance started"
        );
    }

    pub fn log_monitor_shutdown(&self, monitor_id: &str, monitor_type: &str) {
        info!(
            event = "monitor_shutdown",
            host = %self.hostname,
            monitor_id = %monitor_id,
            monitor_type = %monitor_type,
            "Monitor instance stopped"
        );
    }
}
