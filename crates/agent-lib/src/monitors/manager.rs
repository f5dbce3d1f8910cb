//! Reconciles running monitor instances against config and endpoints
//!
//! The manager owns every instance. It is driven by three inputs: a new
//! `Config`, an endpoint being added, and an endpoint being removed. All
//! three are serialized behind one lock, so instance creation and teardown
//! never interleave.

use super::filter::MonitorFilter;
use super::output::{MonitorOutput, OutputParams};
use super::registry::{create_monitor, lookup_metadata};
use super::{Monitor, MonitorEnv, MonitorInit};
use crate::config::{Config, MonitorConfig};
use crate::endpoint::Endpoint;
use crate::error::InstantiationError;
use crate::observability::StructuredLogger;
use crate::process::ProcessContext;
use crate::writer::OutputSinks;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Time allowed for an instance's `shutdown` before moving on
const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Builds instances by type name
pub type MonitorFactory = Arc<dyn Fn(&str) -> Option<Box<dyn Monitor>> + Send + Sync>;

/// A running instance as reported by diagnostics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveMonitorInfo {
    pub id: String,
    pub monitor_type: String,
    pub config_index: usize,
    pub config_hash: String,
    pub endpoint_id: Option<String>,
    pub discovery_rule: Option<String>,
    pub interval_seconds: u64,
    pub started_at: DateTime<Utc>,
}

/// A config entry that could not be used
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BadConfigInfo {
    pub index: usize,
    pub monitor_type: String,
    pub error: String,
    pub line: Option<usize>,
}

/// Point-in-time view of the manager
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSnapshot {
    pub active: Vec<ActiveMonitorInfo>,
    pub bad_configs: Vec<BadConfigInfo>,
    /// Usable configs, static and rule-bound
    pub configured: usize,
    pub endpoints: usize,
}

struct ActiveMonitor {
    id: String,
    config: Arc<MonitorConfig>,
    endpoint_id: Option<String>,
    instance: Box<dyn Monitor>,
    cancel: CancellationToken,
    include_id: Arc<AtomicBool>,
    started_at: DateTime<Utc>,
}

impl ActiveMonitor {
    fn serves(&self, config: &MonitorConfig, endpoint_id: Option<&str>) -> bool {
        self.config.index == config.index
            && self.config.hash == config.hash
            && self.endpoint_id.as_deref() == endpoint_id
    }

    fn info(&self) -> ActiveMonitorInfo {
        ActiveMonitorInfo {
            id: self.id.clone(),
            monitor_type: self.config.monitor_type.clone(),
            config_index: self.config.index,
            config_hash: self.config.short_hash().to_string(),
            endpoint_id: self.endpoint_id.clone(),
            discovery_rule: self.config.discovery_rule.as_ref().map(|r| r.text().to_string()),
            interval_seconds: self.config.interval.as_secs(),
            started_at: self.started_at,
        }
    }
}

#[derive(Default)]
struct ManagerState {
    configs: Vec<Arc<MonitorConfig>>,
    bad_configs: Vec<BadConfigInfo>,
    active: Vec<ActiveMonitor>,
    endpoints: HashMap<String, Endpoint>,
    enable_builtin_filtering: bool,
    internal_metrics_socket_path: PathBuf,
}

/// Builder for [`MonitorManager`]
pub struct MonitorManagerBuilder {
    sinks: OutputSinks,
    ctx: Arc<ProcessContext>,
    factory: Option<MonitorFactory>,
    shutdown_deadline: Duration,
    cancel: CancellationToken,
    logger: Option<StructuredLogger>,
}

impl MonitorManagerBuilder {
    pub fn new(sinks: OutputSinks, ctx: Arc<ProcessContext>) -> Self {
        Self {
            sinks,
            ctx,
            factory: None,
            shutdown_deadline: DEFAULT_SHUTDOWN_DEADLINE,
            cancel: CancellationToken::new(),
            logger: None,
        }
    }

    /// Lifecycle logger for instance start and stop events
    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Replace the built-in registry, mainly for tests
    pub fn factory(mut self, factory: MonitorFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn shutdown_deadline(mut self, deadline: Duration) -> Self {
        self.shutdown_deadline = deadline;
        self
    }

    /// Parent token; every instance token is a child of it
    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(self) -> MonitorManager {
        MonitorManager {
            state: Mutex::new(ManagerState::default()),
            snapshot: RwLock::new(Arc::new(MonitorSnapshot::default())),
            sinks: self.sinks,
            ctx: self.ctx,
            factory: self
                .factory
                .unwrap_or_else(|| Arc::new(|t: &str| create_monitor(t))),
            shutdown_deadline: self.shutdown_deadline,
            cancel: self.cancel,
            next_id: AtomicU64::new(1),
            logger: self
                .logger
                .unwrap_or_else(|| StructuredLogger::new("localhost")),
        }
    }
}

/// Owns all monitor instances
pub struct MonitorManager {
    state: Mutex<ManagerState>,
    snapshot: RwLock<Arc<MonitorSnapshot>>,
    sinks: OutputSinks,
    ctx: Arc<ProcessContext>,
    factory: MonitorFactory,
    shutdown_deadline: Duration,
    cancel: CancellationToken,
    next_id: AtomicU64,
    logger: StructuredLogger,
}

impl MonitorManager {
    /// Latest published view, safe to read from any thread
    pub fn snapshot(&self) -> Arc<MonitorSnapshot> {
        self.snapshot.read().clone()
    }

    /// Apply a new config. Instances whose entry is unchanged keep running;
    /// new instances start before replaced ones are shut down.
    pub async fn configure(&self, config: &Config) {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        st.enable_builtin_filtering = config.enable_builtin_filtering;
        st.internal_metrics_socket_path = config.internal_metrics_socket_path.clone();

        let solo = config.monitors.iter().any(|m| m.solo && m.is_valid());
        if solo {
            warn!("A monitor is marked solo, all other monitors are disabled");
        }

        let mut configs = Vec::new();
        let mut bad_configs = Vec::new();
        let mut seen = HashSet::new();
        for m in &config.monitors {
            if let Some(err) = &m.validation_error {
                error!(
                    monitor_type = %m.monitor_type,
                    index = m.index,
                    error = %err,
                    "Monitor config is invalid, skipping"
                );
                bad_configs.push(BadConfigInfo {
                    index: m.index,
                    monitor_type: m.monitor_type.clone(),
                    error: err.to_string(),
                    line: m.line,
                });
                continue;
            }
            if solo && !m.solo {
                debug!(monitor_type = %m.monitor_type, index = m.index, "Skipping non-solo monitor");
                continue;
            }
            if !seen.insert(m.hash.clone()) {
                warn!(
                    monitor_type = %m.monitor_type,
                    index = m.index,
                    "Duplicate monitor config, skipping"
                );
                bad_configs.push(BadConfigInfo {
                    index: m.index,
                    monitor_type: m.monitor_type.clone(),
                    error: "duplicate of an earlier monitor config".to_string(),
                    line: m.line,
                });
                continue;
            }
            configs.push(Arc::new(m.clone()));
        }
        st.configs = configs;
        st.bad_configs = bad_configs;

        let (keep, doomed): (Vec<_>, Vec<_>) = {
            let desired: HashSet<(usize, &str)> = st
                .configs
                .iter()
                .map(|c| (c.index, c.hash.as_str()))
                .collect();
            std::mem::take(&mut st.active)
                .into_iter()
                .partition(|a| desired.contains(&(a.config.index, a.config.hash.as_str())))
        };
        st.active = keep;

        let configs = st.configs.clone();
        for conf in &configs {
            if conf.is_static() {
                if !st.active.iter().any(|a| a.serves(conf, None)) {
                    self.start_instance(st, conf.clone(), None).await;
                }
                continue;
            }
            let endpoints: Vec<Endpoint> = st.endpoints.values().cloned().collect();
            for ep in endpoints {
                if !st.active.iter().any(|a| a.serves(conf, Some(&ep.id))) && rule_matches(conf, &ep) {
                    self.start_instance(st, conf.clone(), Some(ep)).await;
                }
            }
        }

        for instance in doomed {
            self.stop_instance(instance).await;
        }

        self.publish(st);
        info!(
            active = st.active.len(),
            bad = st.bad_configs.len(),
            "Monitors configured"
        );
    }

    /// Bind matching rule-based configs to a new endpoint. Re-adding an
    /// identical endpoint is a no-op; a changed one replaces its instances.
    pub async fn endpoint_added(&self, endpoint: Endpoint) {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        match st.endpoints.get(&endpoint.id) {
            Some(existing) if *existing == endpoint => return,
            Some(_) => {
                debug!(endpoint_id = %endpoint.id, "Endpoint changed, replacing its monitors");
                self.stop_bound(st, &endpoint.id).await;
            }
            None => {}
        }
        st.endpoints.insert(endpoint.id.clone(), endpoint.clone());

        let configs = st.configs.clone();
        for conf in configs.iter().filter(|c| !c.is_static()) {
            if rule_matches(conf, &endpoint)
                && !st.active.iter().any(|a| a.serves(conf, Some(&endpoint.id)))
            {
                self.start_instance(st, conf.clone(), Some(endpoint.clone()))
                    .await;
            }
        }
        self.publish(st);
    }

    /// Tear down every instance bound to the endpoint
    pub async fn endpoint_removed(&self, endpoint_id: &str) {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        if st.endpoints.remove(endpoint_id).is_none() {
            debug!(endpoint_id = %endpoint_id, "Removal of unknown endpoint ignored");
            return;
        }
        self.stop_bound(st, endpoint_id).await;
        self.publish(st);
    }

    /// Stop every instance and forget all endpoints
    pub async fn shutdown(&self) {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        let active = std::mem::take(&mut st.active);
        info!(count = active.len(), "Shutting down monitors");
        for instance in active {
            self.stop_instance(instance).await;
        }
        st.endpoints.clear();
        self.publish(st);
    }

    async fn stop_bound(&self, st: &mut ManagerState, endpoint_id: &str) {
        let (bound, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut st.active)
            .into_iter()
            .partition(|a| a.endpoint_id.as_deref() == Some(endpoint_id));
        st.active = rest;
        for instance in bound {
            self.stop_instance(instance).await;
        }
    }

    fn next_monitor_id(&self, monitor_type: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", monitor_type, n)
    }

    async fn start_instance(
        &self,
        st: &mut ManagerState,
        config: Arc<MonitorConfig>,
        endpoint: Option<Endpoint>,
    ) {
        let endpoint_id = endpoint.as_ref().map(|ep| ep.id.clone());
        let env = MonitorEnv {
            ctx: self.ctx.clone(),
            internal_metrics_socket_path: st.internal_metrics_socket_path.clone(),
        };
        let builtin_filtering = st.enable_builtin_filtering;
        match self
            .create_instance(config.clone(), endpoint, env, builtin_filtering)
            .await
        {
            Ok(active) => {
                self.logger.log_monitor_instantiated(
                    &active.id,
                    &config.monitor_type,
                    endpoint_id.as_deref(),
                );
                st.active.push(active);
            }
            Err(e) => error!(
                monitor_type = %config.monitor_type,
                index = config.index,
                endpoint_id = ?endpoint_id,
                error = %e,
                "Could not create monitor"
            ),
        }
    }

    async fn create_instance(
        &self,
        config: Arc<MonitorConfig>,
        endpoint: Option<Endpoint>,
        env: MonitorEnv,
        builtin_filtering: bool,
    ) -> Result<ActiveMonitor, InstantiationError> {
        let monitor_type = config.monitor_type.as_str();
        let metadata = lookup_metadata(monitor_type)
            .ok_or_else(|| InstantiationError::monitor(monitor_type, "unknown monitor type"))?;
        let filter = MonitorFilter::new(
            metadata,
            builtin_filtering,
            &config.extra_metrics,
            &config.metrics_to_exclude,
        )
        .map_err(|e| InstantiationError::monitor(monitor_type, e.to_string()))?;
        let mut instance = (self.factory)(monitor_type)
            .ok_or_else(|| InstantiationError::monitor(monitor_type, "no factory for type"))?;

        let id = self.next_monitor_id(monitor_type);
        let cancel = self.cancel.child_token();
        let include_id = Arc::new(AtomicBool::new(!metadata.single_instance));
        let endpoint_id = endpoint.as_ref().map(|ep| ep.id.clone());

        let output = MonitorOutput::new(OutputParams {
            sinks: self.sinks.clone(),
            monitor_type: config.monitor_type.clone(),
            monitor_id: id.clone(),
            config_hash: config.hash.clone(),
            endpoint: endpoint.clone(),
            disable_endpoint_dimensions: config.disable_endpoint_dimensions,
            extra_dimensions: config.extra_dimensions.clone(),
            not_host_specific: config.disable_host_dimensions,
            include_monitor_id: include_id.clone(),
            filter,
        });
        let init = MonitorInit {
            monitor_id: id.clone(),
            config: config.clone(),
            endpoint,
            output,
            env,
            cancel: cancel.clone(),
        };

        match tokio::time::timeout(config.configure_timeout, instance.configure(init)).await {
            Ok(Ok(())) => Ok(ActiveMonitor {
                id,
                config,
                endpoint_id,
                instance,
                cancel,
                include_id,
                started_at: Utc::now(),
            }),
            Ok(Err(e)) => {
                cancel.cancel();
                instance.shutdown().await;
                Err(e)
            }
            Err(_) => {
                cancel.cancel();
                Err(InstantiationError::monitor(
                    monitor_type,
                    format!(
                        "configure did not finish within {}s",
                        config.configure_timeout.as_secs()
                    ),
                ))
            }
        }
    }

    async fn stop_instance(&self, mut active: ActiveMonitor) {
        active.cancel.cancel();
        if tokio::time::timeout(self.shutdown_deadline, active.instance.shutdown())
            .await
            .is_err()
        {
            warn!(
                monitor_id = %active.id,
                deadline_secs = self.shutdown_deadline.as_secs(),
                "Monitor did not shut down in time"
            );
        } else {
            self.logger
                .log_monitor_shutdown(&active.id, &active.config.monitor_type);
        }
    }

    /// Refresh monitor-id stamping and publish a new snapshot
    fn publish(&self, st: &ManagerState) {
        let mut per_type: HashMap<&str, usize> = HashMap::new();
        for a in &st.active {
            *per_type.entry(a.config.monitor_type.as_str()).or_default() += 1;
        }
        for a in &st.active {
            let single = lookup_metadata(&a.config.monitor_type)
                .map(|m| m.single_instance)
                .unwrap_or(false);
            let alone = per_type.get(a.config.monitor_type.as_str()).copied() == Some(1);
            a.include_id.store(!(single && alone), Ordering::Relaxed);
        }

        let snapshot = MonitorSnapshot {
            active: st.active.iter().map(ActiveMonitor::info).collect(),
            bad_configs: st.bad_configs.clone(),
            configured: st.configs.len(),
            endpoints: st.endpoints.len(),
        };
        *self.snapshot.write() = Arc::new(snapshot);
    }
}

fn rule_matches(config: &MonitorConfig, endpoint: &Endpoint) -> bool {
    config
        .discovery_rule
        .as_ref()
        .map(|rule| rule.matches(&endpoint.rule_variables()))
        .unwrap_or(false)
}
