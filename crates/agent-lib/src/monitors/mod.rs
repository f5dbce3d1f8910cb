//! Monitors and their lifecycle
//!
//! This module provides:
//! - The `Monitor` trait implemented by every built-in monitor type
//! - A static registry of types with their config decoders and metadata
//! - `MonitorOutput`, which stamps and filters what instances emit
//! - `MonitorManager`, which reconciles instances against config and endpoints

mod cpu;
mod filter;
mod http_check;
mod internal_metrics;
mod manager;
mod memory;
mod output;
mod registry;
mod subprocess;

#[cfg(test)]
mod tests;

pub use cpu::CpuConfig;
pub use filter::MonitorFilter;
pub use http_check::HttpCheckConfig;
pub use internal_metrics::InternalMetricsConfig;
pub use manager::{
    ActiveMonitorInfo, BadConfigInfo, MonitorManager, MonitorManagerBuilder, MonitorSnapshot,
};
pub use memory::MemoryConfig;
pub use output::MonitorOutput;
pub use registry::{
    create_monitor, decode_settings, lookup_metadata, registered_types, MetricInfo,
    MonitorMetadata, MonitorSettings,
};
pub use subprocess::SubprocessConfig;

use crate::config::MonitorConfig;
use crate::endpoint::Endpoint;
use crate::error::InstantiationError;
use crate::process::ProcessContext;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Agent-level facts a monitor may need
#[derive(Debug, Clone)]
pub struct MonitorEnv {
    pub ctx: Arc<ProcessContext>,
    pub internal_metrics_socket_path: PathBuf,
}

/// Everything a monitor instance receives when it is configured
pub struct MonitorInit {
    pub monitor_id: String,
    pub config: Arc<MonitorConfig>,
    /// Set for rule-bound instances
    pub endpoint: Option<Endpoint>,
    pub output: MonitorOutput,
    pub env: MonitorEnv,
    /// Cancelled when the instance is torn down
    pub cancel: CancellationToken,
}

/// A running monitor instance
#[async_trait]
pub trait Monitor: Send {
    /// Validate the settings and start emitting. Called exactly once.
    async fn configure(&mut self, init: MonitorInit) -> Result<(), InstantiationError>;

    /// Stop emitting. Must return within a bounded time.
    async fn shutdown(&mut self);
}

/// Background task owned by a monitor instance
#[derive(Default)]
pub(crate) struct MonitorTask {
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

impl MonitorTask {
    pub(crate) fn start<F>(&mut self, cancel: CancellationToken, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.cancel = Some(cancel);
        self.handle = Some(tokio::spawn(fut));
    }

    pub(crate) async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                debug!(error = %e, "Monitor task ended abnormally");
            }
        }
    }
}
