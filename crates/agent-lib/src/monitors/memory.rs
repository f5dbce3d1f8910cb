//! Memory usage from procfs

use super::registry::{MetricInfo, MonitorMetadata};
use super::{Monitor, MonitorInit, MonitorOutput, MonitorTask};
use crate::error::InstantiationError;
use crate::models::{Datapoint, MetricType};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::warn;

const METRICS: &[MetricInfo] = &[
    MetricInfo {
        name: "memory.used",
        metric_type: MetricType::Gauge,
        default: true,
    },
    MetricInfo {
        name: "memory.free",
        metric_type: MetricType::Gauge,
        default: true,
    },
    MetricInfo {
        name: "memory.utilization",
        metric_type: MetricType::Gauge,
        default: true,
    },
    MetricInfo {
        name: "memory.buffered",
        metric_type: MetricType::Gauge,
        default: false,
    },
    MetricInfo {
        name: "memory.cached",
        metric_type: MetricType::Gauge,
        default: false,
    },
];

pub(super) fn metadata() -> MonitorMetadata {
    MonitorMetadata {
        monitor_type: "memory",
        doc: "Host memory usage in bytes and as a percentage of total",
        metrics: METRICS,
        metrics_exhaustive: true,
        send_all: false,
        single_instance: true,
        accepts_endpoints: false,
    }
}

/// `memory` monitor settings; it takes none
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryConfig {}

#[derive(Debug, Clone, Copy, PartialEq)]
struct MemSample {
    total: u64,
    free: u64,
    buffered: u64,
    cached: u64,
    used: u64,
}

/// Parse `/proc/meminfo`. Values are reported in kB and returned in bytes.
fn parse_meminfo(text: &str) -> Option<MemSample> {
    let fields: HashMap<&str, u64> = text
        .lines()
        .filter_map(|line| {
            let (key, rest) = line.split_once(':')?;
            let value = rest.split_whitespace().next()?.parse::<u64>().ok()?;
            Some((key.trim(), value * 1024))
        })
        .collect();

    let total = *fields.get("MemTotal")?;
    let free = *fields.get("MemFree")?;
    let buffered = fields.get("Buffers").copied().unwrap_or(0);
    let cached = fields.get("Cached").copied().unwrap_or(0)
        + fields.get("SReclaimable").copied().unwrap_or(0);
    let used = match fields.get("MemAvailable") {
        Some(avail) => total.saturating_sub(*avail),
        None => total.saturating_sub(free + buffered + cached),
    };

    Some(MemSample {
        total,
        free,
        buffered,
        cached,
        used,
    })
}

#[derive(Default)]
pub struct MemoryMonitor {
    task: MonitorTask,
}

#[async_trait]
impl Monitor for MemoryMonitor {
    async fn configure(&mut self, init: MonitorInit) -> Result<(), InstantiationError> {
        let meminfo = init.env.ctx.proc_path("meminfo");
        tokio::fs::metadata(&meminfo).await.map_err(|e| {
            InstantiationError::monitor("memory", format!("{}: {}", meminfo.display(), e))
        })?;

        let cancel = init.cancel.clone();
        self.task.start(
            init.cancel,
            run(meminfo, init.output, init.config.interval, cancel),
        );
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
            _ = ticker.tick() => {
                let sample = match tokio::fs::read_to_string(&path).await {
                    Ok(text) => parse_meminfo(&text),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Could not read meminfo");
                        continue;
                    }
                };
                let Some(s) = sample else {
                    warn!(path = %path.display(), "meminfo is missing MemTotal or MemFree");
                    continue;
                };

                let utilization = if s.total > 0 {
                    100.0 * s.used as f64 / s.total as f64
                } else {
                    0.0
                };
                output.send_datapoints([
                    Datapoint::gauge("memory.used", s.used as i64),
                    Datapoint::gauge("memory.free", s.free as i64),
                    Datapoint::gauge("memory.utilization", utilization),
                    Datapoint::gauge("memory.buffered", s.buffered as i64),
                    Datapoint::gauge("memory.cached", s.cached as i64),
                ]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo_prefers_available() {
        let text = "MemTotal:       1000 kB
MemFree:         200 kB
MemAvailable:    600 kB
Buffers:          50 kB
Cached:          100 kB
SReclaimable:     10 kB
";
        let s = parse_meminfo(text).unwrap();
        assert_eq!(s.total, 1000 * 1024);
        assert_eq!(s.used, 400 * 1024);
        assert_eq!(s.cached, 110 * 1024);
    }

    #[test]
    fn test_parse_meminfo_without_available() {
        let text = "MemTotal: 1000 kB\nMemFree: 200 kB\nBuffers: 100 kB\nCached: 100 kB\n";
        let s = parse_meminfo(text).unwrap();
        assert_eq!(s.used, 600 * 1024);
        assert!(parse_meminfo("Buffers: 1 kB\n").is_none());
    }
}
