//! CPU utilization from procfs

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
use tracing::{debug, warn};

const METRICS: &[MetricInfo] = &[
    MetricInfo {
        name: "cpu.utilization",
        metric_type: MetricType::Gauge,
        default: true,
    },
    MetricInfo {
        name: "cpu.num_processors",
        metric_type: MetricType::Gauge,
        default: true,
    },
    MetricInfo {
        name: "cpu.utilization_per_core",
        metric_type: MetricType::Gauge,
        default: false,
    },
];

pub(super) fn metadata() -> MonitorMetadata {
    MonitorMetadata {
        monitor_type: "cpu",
        doc: "Host CPU utilization as a percentage of all cores",
        metrics: METRICS,
        metrics_exhaustive: true,
        send_all: false,
        single_instance: true,
        accepts_endpoints: false,
    }
}

/// `cpu` monitor settings
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CpuConfig {
    /// Emit `cpu.utilization_per_core`; it still has to be enabled in `extraMetrics`
    #[serde(default)]
    pub report_per_core: bool,
}

/// Cumulative jiffies for one `cpu` line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

impl CpuTimes {
    /// Busy percentage between two samples
    fn utilization_since(&self, prev: &CpuTimes) -> Option<f64> {
        let total = self.total.checked_sub(prev.total)?;
        let idle = self.idle.checked_sub(prev.idle)?;
        if total == 0 {
            return None;
        }
        Some(100.0 * (total.saturating_sub(idle)) as f64 / total as f64)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct StatSample {
    all: CpuTimes,
    cores: HashMap<String, CpuTimes>,
}

fn parse_cpu_line(fields: &[&str]) -> Option<CpuTimes> {
    let values: Vec<u64> = fields
        .iter()
        .map(|f| f.parse::<u64>())
        .collect::<Result<_, _>>()
        .ok()?;
    if values.len() < 4 {
        return None;
    }
    // idle + iowait count as idle; guest time is already part of user
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    let total = values.iter().take(8).sum();
    Some(CpuTimes { idle, total })
}

fn parse_proc_stat(text: &str) -> Option<StatSample> {
    let mut sample = StatSample::default();
    let mut found_all = false;

    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let Some(label) = parts.next() else { continue };
        if !label.starts_with("cpu") {
            continue;
        }
        let fields: Vec<&str> = parts.collect();
        let Some(times) = parse_cpu_line(&fields) else {
            continue;
        };
        if label == "cpu" {
            sample.all = times;
            found_all = true;
        } else {
            sample.cores.insert(label.trim_start_matches("cpu").to_string(), times);
        }
    }

    found_all.then_some(sample)
}

#[derive(Default)]
pub struct CpuMonitor {
    task: MonitorTask,
}

#[async_trait]
impl Monitor for CpuMonitor {
    async fn configure(&mut self, init: MonitorInit) -> Result<(), InstantiationError> {
        let super::MonitorSettings::Cpu(settings) = &init.config.settings else {
            return Err(InstantiationError::monitor("cpu", "unexpected settings variant"));
        };

        let stat_path = init.env.ctx.proc_path("stat");
        // Fail fast when procfs is unreadable
        tokio::fs::metadata(&stat_path).await.map_err(|e| {
            InstantiationError::monitor("cpu", format!("{}: {}", stat_path.display(), e))
        })?;

        let collector = CpuCollector {
            stat_path,
            report_per_core: settings.report_per_core,
            output: init.output,
            previous: None,
        };
        let cancel = init.cancel.clone();
        self.task
            .start(init.cancel, collector.run(init.config.interval, cancel));
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.task.stop().await;
    }
}

struct CpuCollector {
    stat_path: PathBuf,
    report_per_core: bool,
    output: MonitorOutput,
    previous: Option<StatSample>,
}

impl CpuCollector {
    async fn run(mut self, every: Duration, cancel: CancellationToken) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.collect().await,
            }
        }
        debug!(monitor_id = %self.output.monitor_id(), "CPU monitor stopped");
    }

    async fn collect(&mut self) {
        let text = match tokio::fs::read_to_string(&self.stat_path).await {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %self.stat_path.display(), error = %e, "Could not read CPU stats");
                return;
            }
        };
        let Some(sample) = parse_proc_stat(&text) else {
            warn!(path = %self.stat_path.display(), "No aggregate cpu line found");
            return;
        };

        self.output.send_datapoint(Datapoint::gauge(
            "cpu.num_processors",
            sample.cores.len() as i64,
        ));

        if let Some(prev) = &self.previous {
            if let Some(util) = sample.all.utilization_since(&prev.all) {
                self.output
                    .send_datapoint(Datapoint::gauge("cpu.utilization", util));
            }
            if self.report_per_core {
                for (core, times) in &sample.cores {
                    let Some(prev_core) = prev.cores.get(core) else {
                        continue;
                    };
                    if let Some(util) = times.utilization_since(prev_core) {
                        self.output.send_datapoint(
                            Datapoint::gauge("cpu.utilization_per_core", util)
                                .with_dimension("cpu", core.clone()),
                        );
                    }
                }
            }
        }

        self.previous = Some(sample);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT_1: &str = "cpu  100 0 100 800 0 0 0 0 0 0
cpu0 50 0 50 400 0 0 0 0 0 0
cpu1 50 0 50 400 0 0 0 0 0 0
intr 12345
ctxt 999
";

    const STAT_2: &str = "cpu  150 0 150 900 0 0 0 0 0 0
cpu0 100 0 100 400 0 0 0 0 0 0
cpu1 50 0 50 500 0 0 0 0 0 0
";

    #[test]
    fn test_parse_proc_stat() {
        let sample = parse_proc_stat(STAT_1).unwrap();
        assert_eq!(sample.all, CpuTimes { idle: 800, total: 1000 });
        assert_eq!(sample.cores.len(), 2);
        assert!(parse_proc_stat("intr 1\n").is_none());
    }

    #[test]
    fn test_utilization_between_samples() {
        let a = parse_proc_stat(STAT_1).unwrap();
        let b = parse_proc_stat(STAT_2).unwrap();

        let util = b.all.utilization_since(&a.all).unwrap();
        assert!((util - 50.0).abs() < f64::EPSILON);

        let core0 = b.cores["0"].utilization_since(&a.cores["0"]).unwrap();
        assert!((core0 - 100.0).abs() < f64::EPSILON);
        let core1 = b.cores["1"].utilization_since(&a.cores["1"]).unwrap();
        assert!(core1.abs() < f64::EPSILON);

        // Counter reset yields no value
        assert!(a.all.utilization_since(&b.all).is_none());
    }
}
