//! Re-emits the agent's own metrics read from the internal-metrics socket

use super::registry::MonitorMetadata;
use super::{Monitor, MonitorInit, MonitorOutput, MonitorTask};
use crate::error::{AgentError, InstantiationError};
use crate::models::Datapoint;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub(super) fn metadata() -> MonitorMetadata {
    MonitorMetadata {
        monitor_type: "internal-metrics",
        doc: "The agent's writer and manager counters as datapoints",
        metrics: &[],
        metrics_exhaustive: false,
        send_all: true,
        single_instance: true,
        accepts_endpoints: false,
    }
}

/// `internal-metrics` monitor settings
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InternalMetricsConfig {
    /// Defaults to the agent's `internalMetricsSocketPath`
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
}

#[derive(Default)]
pub struct InternalMetricsMonitor {
    task: MonitorTask,
}

#[async_trait]
impl Monitor for InternalMetricsMonitor {
    async fn configure(&mut self, init: MonitorInit) -> Result<(), InstantiationError> {
        let super::MonitorSettings::InternalMetrics(settings) = &init.config.settings else {
            return Err(InstantiationError::monitor(
                "internal-metrics",
                "unexpected settings variant",
            ));
        };
        let path = settings
            .socket_path
            .clone()
            .unwrap_or_else(|| init.env.internal_metrics_socket_path.clone());

        let cancel = init.cancel.clone();
        self.task
            .start(init.cancel, run(path, init.output, init.config.interval, cancel));
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.task.stop().await;
    }
}

async fn run(path: PathBuf, output: MonitorOutput, every: Duration, cancel: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => match read_internal_metrics(&path).await {
                Ok(dps) => output.send_datapoints(dps),
                Err(e) => warn!(path = %path.display(), error = %e, "Could not read internal metrics"),
            },
        }
    }
}

/// Read one JSON array of datapoints from the socket
pub(crate) async fn read_internal_metrics(path: &Path) -> Result<Vec<Datapoint>, AgentError> {
    let body = crate::diagnostics::read_socket(path).await?;
    serde_json::from_slice(&body)
        .map_err(|e| AgentError::Internal(format!("malformed internal metrics: {}", e)))
}
