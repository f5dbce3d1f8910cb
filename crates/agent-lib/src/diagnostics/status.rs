//! Human-readable status dump

use crate::endpoint::Endpoint;
use crate::monitors::MonitorSnapshot;
use crate::observers::ActiveObserverInfo;
use crate::writer::CounterSnapshot;
use chrono::{DateTime, Utc};
use std::fmt::Write;
use std::sync::Arc;
use tabled::{settings::Style, Table, Tabled};

/// Section names accepted by `status [SECTION]`
pub const SECTIONS: &[&str] = &["version", "config", "writer", "observers", "monitors", "endpoints"];

/// Everything the status and internal-metrics payloads are computed from.
/// Built from published snapshots only.
#[derive(Debug, Clone)]
pub struct AgentStatus {
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub hostname: String,
    pub config_yaml: String,
    pub writer: CounterSnapshot,
    pub observers: Vec<ActiveObserverInfo>,
    pub monitors: Arc<MonitorSnapshot>,
    pub endpoints: Vec<Endpoint>,
}

#[derive(Tabled)]
struct CounterRow {
    #[tabled(rename = "Counter")]
    name: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

#[derive(Tabled)]
struct ObserverRow {
    #[tabled(rename = "Type")]
    observer_type: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Endpoints")]
    endpoints: usize,
}

#[derive(Tabled)]
struct MonitorRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Type")]
    monitor_type: String,
    #[tabled(rename = "Endpoint")]
    endpoint: String,
    #[tabled(rename = "Rule")]
    rule: String,
    #[tabled(rename = "Interval")]
    interval: String,
}

#[derive(Tabled)]
struct BadConfigRow {
    #[tabled(rename = "Index")]
    index: usize,
    #[tabled(rename = "Type")]
    monitor_type: String,
    #[tabled(rename = "Line")]
    line: String,
    #[tabled(rename = "Error")]
    error: String,
}

#[derive(Tabled)]
struct EndpointRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Host")]
    host: String,
    #[tabled(rename = "Port")]
    port: u16,
    #[tabled(rename = "Type")]
    port_type: String,
    #[tabled(rename = "Discovered By")]
    discovered_by: String,
}

fn table<T: Tabled>(rows: Vec<T>) -> String {
    if rows.is_empty() {
        return "  (none)\n".to_string();
    }
    let mut out = Table::new(rows).with(Style::rounded()).to_string();
    out.push('\n');
    out
}

/// Render the whole dump, or one section of it. Unknown sections produce a
/// message listing the valid ones.
pub fn render_status(status: &AgentStatus, section: Option<&str>) -> String {
    let section = section.map(str::trim).filter(|s| !s.is_empty());
    if let Some(name) = section {
        if !SECTIONS.contains(&name) {
            return format!(
                "Unknown status section '{}'. Valid sections: {}\n",
                name,
                SECTIONS.join(", ")
            );
        }
    }

    let mut out = String::from("SignalFx Agent Status\n=====================\n");
    for name in SECTIONS {
        if section.map_or(true, |s| s == *name) {
            out.push('\n');
            render_section(&mut out, status, name);
        }
    }
    out
}

fn render_section(out: &mut String, status: &AgentStatus, name: &str) {
    match name {
        "version" => {
            let uptime = Utc::now().signed_duration_since(status.started_at);
            let _ = writeln!(out, "Version:  {}", status.version);
            let _ = writeln!(out, "Hostname: {}", status.hostname);
            let _ = writeln!(out, "Uptime:   {}s", uptime.num_seconds().max(0));
        }
        "config" => {
            out.push_str("Agent Configuration:\n");
            for line in status.config_yaml.lines() {
                let _ = writeln!(out, "  {}", line);
            }
        }
        "writer" => {
            out.push_str("Writer Status:\n");
            let rows = status
                .writer
                .rows()
                .into_iter()
                .map(|(name, value)| CounterRow { name, value })
                .collect();
            out.push_str(&table(rows));
        }
        "observers" => {
            let _ = writeln!(out, "Observers ({} active):", status.observers.len());
            let rows = status
                .observers
                .iter()
                .map(|o| ObserverRow {
                    observer_type: o.observer_type.clone(),
                    name: o.name.clone(),
                    endpoints: o.endpoints,
                })
                .collect();
            out.push_str(&table(rows));
        }
        "monitors" => {
            let monitors = &status.monitors;
            let _ = writeln!(
                out,
                "Monitors ({} active, {} configured):",
                monitors.active.len(),
                monitors.configured
            );
            let rows = monitors
                .active
                .iter()
                .map(|m| MonitorRow {
                    id: m.id.clone(),
                    monitor_type: m.monitor_type.clone(),
                    endpoint: m.endpoint_id.clone().unwrap_or_default(),
                    rule: m.discovery_rule.clone().unwrap_or_default(),
                    interval: format!("{}s", m.interval_seconds),
                })
                .collect();
            out.push_str(&table(rows));

            if !monitors.bad_configs.is_empty() {
                let _ = writeln!(out, "Bad Monitor Configurations ({}):", monitors.bad_configs.len());
                let rows = monitors
                    .bad_configs
                    .iter()
                    .map(|b| BadConfigRow {
                        index: b.index,
                        monitor_type: b.monitor_type.clone(),
                        line: b.line.map(|l| l.to_string()).unwrap_or_default(),
                        error: b.error.clone(),
                    })
                    .collect();
                out.push_str(&table(rows));
            }
        }
        "endpoints" => {
            let _ = writeln!(out, "Discovered Endpoints ({}):", status.endpoints.len());
            let mut endpoints: Vec<&Endpoint> = status.endpoints.iter().collect();
            endpoints.sort_by(|a, b| a.id.cmp(&b.id));
            let rows = endpoints
                .into_iter()
                .map(|e| EndpointRow {
                    id: e.id.clone(),
                    host: e.host.clone(),
                    port: e.port,
                    port_type: e.port_type.to_string(),
                    discovered_by: e.discovered_by.clone(),
                })
                .collect();
            out.push_str(&table(rows));
        }
        _ => {}
    }
}
