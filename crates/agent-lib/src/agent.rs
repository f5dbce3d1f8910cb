//! Agent orchestration
//!
//! Wires the config stream to the writer, monitor manager, observer
//! manager and diagnostics sockets. On the first config the components are
//! started in pipeline order (writer, monitors, observers, diagnostics);
//! later configs are applied to the running components in the same order.

use crate::config::{load, Config, ConfigStream};
use crate::diagnostics::{self, render_internal_metrics, render_status, AgentStatus, Handler};
use crate::endpoint::EndpointEvent;
use crate::error::{AgentError, ConfigError};
use crate::health::{components, HealthRegistry};
use crate::monitors::{MonitorManager, MonitorManagerBuilder};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::observers::{EndpointRegistry, ObserverManager, ObserverManagerBuilder};
use crate::process::ProcessContext;
use crate::writer::Writer;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Time allowed for every component to stop
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// How often health and Prometheus gauges are refreshed from the status
const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Failure before the agent could start sending
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("could not load config: {0}")]
    Config(#[source] ConfigError),

    #[error("could not start writer: {0}")]
    Writer(#[source] AgentError),
}

impl StartupError {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Config(_) => 1,
            StartupError::Writer(_) => 4,
        }
    }
}

/// Why a running agent stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Shutdown was requested
    Stopped,
    /// The config stream ended while the file was being watched
    ConfigStreamClosed,
}

impl ExitReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitReason::Stopped => 0,
            ExitReason::ConfigStreamClosed => 2,
        }
    }
}

/// Everything the agent needs from the command line and environment
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub config_path: PathBuf,
    /// Zero disables file watching
    pub watch_interval: Duration,
    pub version: String,
    pub ctx: ProcessContext,
}

/// Read-only handles the diagnostics callbacks build a status from
#[derive(Clone)]
pub struct StatusSource {
    version: String,
    started_at: DateTime<Utc>,
    config: Arc<RwLock<Arc<Config>>>,
    writer: Arc<Writer>,
    monitors: Arc<MonitorManager>,
    observers: Arc<ObserverManager>,
    registry: Arc<EndpointRegistry>,
}

impl StatusSource {
    /// Assemble a status from published snapshots. Never waits on a
    /// reconcile in progress.
    pub fn status(&self) -> AgentStatus {
        let config = self.config.read().clone();
        AgentStatus {
            version: self.version.clone(),
            started_at: self.started_at,
            hostname: config.hostname.clone(),
            config_yaml: config.display_yaml.clone(),
            writer: self.writer.snapshot(),
            observers: self.observers.snapshot(),
            monitors: self.monitors.snapshot(),
            endpoints: self.registry.list(),
        }
    }
}

struct DiagnosticsServer {
    path: PathBuf,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// A started agent
pub struct Agent {
    source: StatusSource,
    endpoint_task: JoinHandle<()>,
    diagnostics: Vec<DiagnosticsServer>,
    health: HealthRegistry,
    metrics: AgentMetrics,
    logger: StructuredLogger,
    cancel: CancellationToken,
    last_failed_requests: u64,
}

impl Agent {
    /// Start every component from the first config
    pub async fn start(
        config: Config,
        options: &AgentOptions,
        health: HealthRegistry,
        metrics: AgentMetrics,
        cancel: CancellationToken,
    ) -> Result<Self, StartupError> {
        let logger = StructuredLogger::new(config.hostname.clone());
        let ctx = Arc::new(options.ctx.clone());
        for name in [
            components::CONFIG,
            components::WRITER,
            components::MONITORS,
            components::OBSERVERS,
            components::DIAGNOSTICS,
        ] {
            health.register(name);
        }

        let writer = Writer::start(config.writer.clone(), cancel.child_token())
            .map_err(StartupError::Writer)?;
        let writer = Arc::new(writer);

        let monitors = Arc::new(
            MonitorManagerBuilder::new(writer.sinks(), ctx.clone())
                .logger(logger.clone())
                .cancel_token(cancel.child_token())
                .build(),
        );
        monitors.configure(&config).await;

        let registry = Arc::new(EndpointRegistry::new());
        let (endpoint_tx, endpoint_rx) = mpsc::unbounded_channel();
        let endpoint_task = tokio::spawn(forward_endpoints(endpoint_rx, monitors.clone()));
        let observers = Arc::new(
            ObserverManagerBuilder::new(registry.clone(), endpoint_tx, ctx)
                .cancel_token(cancel.child_token())
                .build(),
        );
        observers.configure(&config.observers).await;

        let source = StatusSource {
            version: options.version.clone(),
            started_at: Utc::now(),
            config: Arc::new(RwLock::new(Arc::new(config))),
            writer,
            monitors,
            observers,
            registry,
        };

        let mut agent = Self {
            source,
            endpoint_task,
            diagnostics: Vec::new(),
            health,
            metrics,
            logger,
            cancel,
            last_failed_requests: 0,
        };
        let config = agent.source.config.read().clone();
        agent.bind_diagnostics(&config).await;
        agent.refresh();
        agent.health.set_ready(true);
        Ok(agent)
    }

    pub fn status_source(&self) -> StatusSource {
        self.source.clone()
    }

    /// Apply a new config to the running components
    pub async fn reload(&mut self, config: Config) {
        let started = Instant::now();

        if let Err(e) = self.source.writer.configure(config.writer.clone()) {
            error!(error = %e, "Writer rejected new config, keeping previous writer settings");
            self.metrics.inc_config_reload_failures();
            self.health
                .set_degraded(components::CONFIG, format!("writer rejected config: {}", e));
        } else {
            self.health.set_healthy(components::CONFIG);
        }

        self.source.monitors.configure(&config).await;
        self.source.observers.configure(&config.observers).await;

        let config = Arc::new(config);
        *self.source.config.write() = config.clone();
        self.bind_diagnostics(&config).await;

        self.metrics.inc_config_reloads();
        self.metrics.observe_reconcile(started.elapsed());
        self.logger.log_config_reloaded(
            &config.content_hash,
            config.monitors.len(),
            config.observers.len(),
        );
        self.refresh();
    }

    /// (Re)bind the status and internal-metrics sockets when their paths
    /// change
    async fn bind_diagnostics(&mut self, config: &Config) {
        let wanted = [
            config.diagnostics_socket_path.clone(),
            config.internal_metrics_socket_path.clone(),
        ];
        let current: Vec<&PathBuf> = self.diagnostics.iter().map(|d| &d.path).collect();
        if current.len() == wanted.len() && current.iter().zip(&wanted).all(|(a, b)| *a == b) {
            return;
        }

        for server in self.diagnostics.drain(..) {
            server.cancel.cancel();
            if let Err(e) = server.handle.await {
                debug!(
                    path = %server.path.display(),
                    error = %e,
                    "Diagnostics task ended abnormally"
                );
            }
        }

        let status_source = self.source.clone();
        let status_handler: Handler = Arc::new(move |section: &str| {
            let section = Some(section).filter(|s| !s.is_empty());
            render_status(&status_source.status(), section)
        });
        let metrics_source = self.source.clone();
        let metrics_handler: Handler =
            Arc::new(move |_: &str| render_internal_metrics(&metrics_source.status()));

        let mut failed = Vec::new();
        for (path, handler) in wanted.into_iter().zip([status_handler, metrics_handler]) {
            let cancel = self.cancel.child_token();
            match diagnostics::serve(&path, handler, cancel.clone()) {
                Ok(handle) => self.diagnostics.push(DiagnosticsServer {
                    path,
                    cancel,
                    handle,
                }),
                Err(e) => {
                    error!(
                        path = %path.display(),
                        error = %e,
                        "Could not start diagnostics socket"
                    );
                    failed.push(e.to_string());
                }
            }
        }
        if failed.is_empty() {
            self.health.set_healthy(components::DIAGNOSTICS);
        } else {
            self.health
                .set_degraded(components::DIAGNOSTICS, failed.join("; "));
        }
    }

    /// Copy the current status into health and Prometheus gauges
    fn refresh(&mut self) {
        let status = self.source.status();
        self.metrics.update_from(&status);

        let failed = status.writer.dp_requests_failed;
        if failed > self.last_failed_requests {
            self.health
                .set_degraded(components::WRITER, "datapoint requests are failing");
        } else {
            self.health.set_healthy(components::WRITER);
        }
        self.last_failed_requests = failed;

        if status.monitors.bad_configs.is_empty() {
            self.health.set_healthy(components::MONITORS);
        } else {
            self.health.set_degraded(
                components::MONITORS,
                format!("{} bad monitor configs", status.monitors.bad_configs.len()),
            );
        }
        self.health.set_healthy(components::OBSERVERS);
    }

    /// Stop every component, giving all of them one shared deadline
    pub async fn shutdown(self) {
        let deadline = tokio::time::Instant::now() + SHUTDOWN_DEADLINE;
        let source = self.source;

        stop_within(deadline, "observers", source.observers.shutdown()).await;
        self.endpoint_task.abort();
        stop_within(deadline, "monitors", source.monitors.shutdown()).await;
        for server in self.diagnostics {
            server.cancel.cancel();
            stop_within(deadline, "diagnostics", server.handle).await;
        }
        stop_within(deadline, "writer", source.writer.shutdown()).await;
        self.cancel.cancel();
        info!("Agent stopped");
    }
}

async fn stop_within<F: Future>(deadline: tokio::time::Instant, component: &str, stopping: F) {
    if timeout_at(deadline, stopping).await.is_err() {
        warn!(component, "Component did not stop before the deadline, abandoning");
    }
}

async fn forward_endpoints(
    mut rx: mpsc::UnboundedReceiver<EndpointEvent>,
    monitors: Arc<MonitorManager>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            EndpointEvent::Added(endpoint) => monitors.endpoint_added(endpoint).await,
            EndpointEvent::Removed(id) => monitors.endpoint_removed(&id).await,
        }
    }
    debug!("Endpoint stream closed");
}

/// Load config, start the agent and drive it until `shutdown` fires or the
/// watched config stream ends
pub async fn run(
    options: AgentOptions,
    health: HealthRegistry,
    metrics: AgentMetrics,
    shutdown: CancellationToken,
) -> Result<ExitReason, StartupError> {
    let cancel = shutdown.child_token();
    let mut stream = load(
        options.config_path.clone(),
        options.ctx.clone(),
        options.watch_interval,
        cancel.child_token(),
    )
    .await
    .map_err(StartupError::Config)?;

    let Some(first) = stream.recv().await else {
        return Err(StartupError::Config(ConfigError::parse(
            "config stream closed before the first config",
        )));
    };
    let logger = StructuredLogger::new(first.hostname.clone());
    let mut agent = Agent::start(first, &options, health, metrics, cancel).await?;
    logger.log_startup(&options.version, &options.config_path.display().to_string());

    let reason = drive(&mut agent, &mut stream, &shutdown).await;

    logger.log_shutdown(match reason {
        ExitReason::Stopped => "shutdown requested",
        ExitReason::ConfigStreamClosed => "config stream closed",
    });
    agent.shutdown().await;
    Ok(reason)
}

async fn drive(
    agent: &mut Agent,
    stream: &mut ConfigStream,
    shutdown: &CancellationToken,
) -> ExitReason {
    let mut refresh = interval(REFRESH_INTERVAL);
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stream_done = false;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => return ExitReason::Stopped,
            next = stream.recv(), if !stream_done => match next {
                Some(config) => agent.reload(config).await,
                // The loader token is a child of `shutdown`
                None if shutdown.is_cancelled() => return ExitReason::Stopped,
                None if stream.is_watching() => {
                    error!("Config stream closed unexpectedly");
                    return ExitReason::ConfigStreamClosed;
                }
                None => stream_done = true,
            },
            _ = refresh.tick() => agent.refresh(),
        }
    }
}
