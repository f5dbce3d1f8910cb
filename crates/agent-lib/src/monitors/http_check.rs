//! HTTP availability check against a fixed or discovered endpoint

use super::registry::{MetricInfo, MonitorMetadata};
use super::{Monitor, MonitorInit, MonitorOutput, MonitorTask};
use crate::error::InstantiationError;
use crate::models::{Datapoint, MetricType};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const METRICS: &[MetricInfo] = &[
    MetricInfo {
        name: "http.status_code",
        metric_type: MetricType::Gauge,
        default: true,
    },
    MetricInfo {
        name: "http.response_time_ms",
        metric_type: MetricType::Gauge,
        default: true,
    },
    MetricInfo {
        name: "http.up",
        metric_type: MetricType::Gauge,
        default: true,
    },
];

pub(super) fn metadata() -> MonitorMetadata {
    MonitorMetadata {
        monitor_type: "http-check",
        doc: "Periodic HTTP GET reporting status code, latency and availability",
        metrics: METRICS,
        metrics_exhaustive: true,
        send_all: false,
        single_instance: false,
        accepts_endpoints: true,
    }
}

/// `http-check` monitor settings. `host` and `port` come from the endpoint
/// when the instance is rule-bound.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HttpCheckConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub use_https: bool,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_path() -> String {
    "/".to_string()
}

fn default_timeout_seconds() -> u64 {
    5
}

impl Default for HttpCheckConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            path: default_path(),
            use_https: false,
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl HttpCheckConfig {
    /// Target URL, preferring the endpoint's address
    fn target_url(&self, endpoint_host: Option<&str>, endpoint_port: Option<u16>) -> Option<String> {
        let host = endpoint_host
            .filter(|h| !h.is_empty())
            .or(self.host.as_deref())?;
        let port = endpoint_port.filter(|p| *p != 0).or(self.port)?;
        let scheme = if self.use_https { "https" } else { "http" };
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]", host)
        } else {
            host.to_string()
        };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        Some(format!("{}://{}:{}{}", scheme, host, port, path))
    }
}

#[derive(Default)]
pub struct HttpCheckMonitor {
    task: MonitorTask,
}

#[async_trait]
impl Monitor for HttpCheckMonitor {
    async fn configure(&mut self, init: MonitorInit) -> Result<(), InstantiationError> {
        let super::MonitorSettings::HttpCheck(settings) = &init.config.settings else {
            return Err(InstantiationError::monitor("http-check", "unexpected settings variant"));
        };

        let url = settings
            .target_url(
                init.endpoint.as_ref().map(|ep| ep.host.as_str()),
                init.endpoint.as_ref().map(|ep| ep.port),
            )
            .ok_or_else(|| InstantiationError::monitor("http-check", "host and port are required"))?;
        url::Url::parse(&url)
            .map_err(|e| InstantiationError::monitor("http-check", format!("{}: {}", url, e)))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds.max(1)))
            .build()
            .map_err(|e| InstantiationError::monitor("http-check", e.to_string()))?;

        let cancel = init.cancel.clone();
        self.task.start(
            init.cancel,
            run(client, url, init.output, init.config.interval, cancel),
        );
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.task.stop().await;
    }
}

async fn run(
    client: reqwest::Client,
    url: String,
    output: MonitorOutput,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                // A cancelled check must not emit after shutdown
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    dps = check(&client, &url) => output.send_datapoints(dps),
                }
            }
        }
    }
}

async fn check(client: &reqwest::Client, url: &str) -> Vec<Datapoint> {
    let started = Instant::now();
    let result = client.get(url).send().await;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    let with_url = |dp: Datapoint| dp.with_dimension("url", url);
    match result {
        Ok(resp) => {
            let status = resp.status().as_u16();
            vec![
                with_url(Datapoint::gauge("http.status_code", i64::from(status))),
                with_url(Datapoint::gauge("http.response_time_ms", elapsed_ms)),
                with_url(Datapoint::gauge("http.up", if status < 400 { 1i64 } else { 0 })),
            ]
        }
        Err(e) => {
            debug!(url = %url, error = %e, "HTTP check failed");
            vec![with_url(Datapoint::gauge("http.up", 0i64))]
        }
    }
}
