//! Monitor backed by an external runner speaking the framed pipe

use super::registry::MonitorMetadata;
use super::{Monitor, MonitorInit, MonitorOutput, MonitorTask};
use crate::error::{AgentError, ConfigError, InstantiationError};
use crate::subproc::{
    convert_value_lists, read_frame, write_frame, ConfigureResult, Frame, LogRecord, MessageType,
    ValueListEntry,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RESTART_BACKOFF: Duration = Duration::from_secs(5);

pub(super) fn metadata() -> MonitorMetadata {
    MonitorMetadata {
        monitor_type: "subprocess",
        doc: "Runs an external collector and forwards what it reports",
        metrics: &[],
        metrics_exhaustive: false,
        send_all: true,
        single_instance: false,
        accepts_endpoints: true,
    }
}

/// `subprocess` monitor settings
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SubprocessConfig {
    /// Executable; relative paths resolve against the bundle directory
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Passed to the runner verbatim in the `Configure` message
    #[serde(default)]
    pub runner_config: Option<serde_json::Value>,
}

impl SubprocessConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::validation("subprocess command must be set"));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct SubprocessMonitor {
    task: MonitorTask,
}

#[async_trait]
impl Monitor for SubprocessMonitor {
    async fn configure(&mut self, init: MonitorInit) -> Result<(), InstantiationError> {
        let super::MonitorSettings::Subprocess(settings) = &init.config.settings else {
            return Err(InstantiationError::monitor("subprocess", "unexpected settings variant"));
        };

        let mut command = PathBuf::from(&settings.command);
        if command.is_relative() && command.components().count() > 1 {
            command = init.env.ctx.bundle_dir.join(command);
        }

        let mut payload = settings
            .runner_config
            .clone()
            .unwrap_or_else(|| init.config.raw.clone());
        if let serde_json::Value::Object(map) = &mut payload {
            map.insert(
                "monitorID".to_string(),
                serde_json::Value::from(init.monitor_id.clone()),
            );
            if let Some(ep) = &init.endpoint {
                map.entry("host")
                    .or_insert_with(|| serde_json::Value::from(ep.host.clone()));
                map.entry("port")
                    .or_insert_with(|| serde_json::Value::from(ep.port));
            }
        }

        let runner = Runner {
            command,
            args: settings.args.clone(),
            env: settings.env.clone(),
            bundle_dir: init.env.ctx.bundle_dir.clone(),
            configure_payload: payload,
            output: init.output,
        };
        let cancel = init.cancel.clone();
        self.task.start(init.cancel, runner.supervise(cancel));
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.task.stop().await;
    }
}

struct Runner {
    command: PathBuf,
    args: Vec<String>,
    env: HashMap<String, String>,
    bundle_dir: PathBuf,
    configure_payload: serde_json::Value,
    output: MonitorOutput,
}

impl Runner {
    /// Keep the child running until cancelled, restarting after a backoff
    async fn supervise(self, cancel: CancellationToken) {
        let monitor_id = self.output.monitor_id().to_string();
        loop {
            match self.run_once(&cancel).await {
                Ok(()) if cancel.is_cancelled() => break,
                Ok(()) => warn!(monitor_id = %monitor_id, "Runner exited, restarting"),
                Err(e) => error!(monitor_id = %monitor_id, error = %e, "Runner failed, restarting"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(RESTART_BACKOFF) => {}
            }
        }
        debug!(monitor_id = %monitor_id, "Subprocess monitor stopped");
    }

    fn spawn(&self) -> Result<Child, AgentError> {
        Command::new(&self.command)
            .args(&self.args)
            .envs(&self.env)
            .env("BUNDLE_DIR", &self.bundle_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::io(format!("spawning {}", self.command.display()), e))
    }

    async fn run_once(&self, cancel: &CancellationToken) -> Result<(), AgentError> {
        let mut child = self.spawn()?;
        let (Some(mut stdin), Some(mut stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(AgentError::Internal("runner pipes unavailable".to_string()));
        };
        info!(
            monitor_id = %self.output.monitor_id(),
            command = %self.command.display(),
            "Started runner"
        );

        write_frame(
            &mut stdin,
            &Frame::json(MessageType::Configure, &self.configure_payload)?,
        )
        .await?;

        let result = loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                frame = read_frame(&mut stdout) => frame,
            };
            match frame {
                Ok(Some(frame)) => self.handle_frame(frame)?,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        // Closing stdin asks the runner to exit; kill it if it lingers
        drop(stdin);
        if tokio::time::timeout(Duration::from_secs(2), child.wait())
            .await
            .is_err()
        {
            let _ = child.kill().await;
        }
        result
    }

    fn handle_frame(&self, frame: Frame) -> Result<(), AgentError> {
        let monitor_id = self.output.monitor_id();
        match frame.message_type {
            MessageType::ConfigureResult => {
                let result: ConfigureResult = frame.parse_json()?;
                if let Some(err) = result.error {
                    return Err(AgentError::Instantiation(InstantiationError::monitor(
                        "subprocess",
                        err,
                    )));
                }
                debug!(monitor_id = %monitor_id, "Runner configured");
            }
            MessageType::Log => {
                let record: LogRecord = frame.parse_json()?;
                record.emit(monitor_id);
            }
            MessageType::ValueList => match frame.parse_json::<Vec<ValueListEntry>>() {
                Ok(entries) => {
                    let (dps, events) = convert_value_lists(&entries);
                    self.output.send_datapoints(dps);
                    for event in events {
                        self.output.send_event(event);
                    }
                }
                Err(e) => error!(monitor_id = %monitor_id, error = %e, "Dropping value list"),
            },
            MessageType::Configure | MessageType::Unknown(_) => {
                let err = AgentError::Internal(format!(
                    "unexpected message type {:?} from runner",
                    frame.message_type
                ));
                error!(monitor_id = %monitor_id, error = %err, "Skipping frame");
            }
        }
        Ok(())
    }
}
