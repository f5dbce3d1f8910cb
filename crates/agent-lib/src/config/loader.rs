//! Config loading with optional file watching

use super::{parse_config, Config};
use crate::error::ConfigError;
use crate::process::ProcessContext;
use notify::{PollWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Stream of config snapshots. The first item is the initial config.
pub struct ConfigStream {
    rx: mpsc::Receiver<Config>,
    watching: bool,
}

impl ConfigStream {
    /// Next config, or `None` once the loader has stopped
    pub async fn recv(&mut self) -> Option<Config> {
        self.rx.recv().await
    }

    /// Whether the loader re-emits configs on file changes
    pub fn is_watching(&self) -> bool {
        self.watching
    }
}

/// Load the config at `path`, failing if the first read does not parse. When
/// `watch_interval` is non-zero the file is polled and fresh configs are
/// emitted whenever its content changes.
pub async fn load(
    path: impl Into<PathBuf>,
    ctx: ProcessContext,
    watch_interval: Duration,
    cancel: CancellationToken,
) -> Result<ConfigStream, ConfigError> {
    let path = path.into();
    let initial = parse_config(&path, &ctx).await?;
    info!(
        path = %path.display(),
        monitors = initial.monitors.len(),
        observers = initial.observers.len(),
        "Loaded config"
    );

    let (tx, rx) = mpsc::channel(1);
    let last_hash = initial.content_hash.clone();
    // Capacity 1 and an empty channel; this cannot fail
    let _ = tx.try_send(initial);

    let watching = !watch_interval.is_zero();
    if watching {
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        let watcher = start_watcher(&path, watch_interval, change_tx)?;
        tokio::spawn(watch_loop(
            path, ctx, watcher, change_rx, tx, last_hash, cancel,
        ));
    }

    Ok(ConfigStream { rx, watching })
}

fn start_watcher(
    path: &Path,
    interval: Duration,
    change_tx: mpsc::UnboundedSender<()>,
) -> Result<PollWatcher, ConfigError> {
    let watch_error = |e: notify::Error| ConfigError::Read {
        path: path.display().to_string(),
        reason: format!("could not watch file: {}", e),
    };

    let mut watcher = PollWatcher::new(
        move |res: Result<notify::Event, notify::Error>| match res {
            Ok(_) => {
                let _ = change_tx.send(());
            }
            Err(e) => warn!(error = %e, "Config watch error"),
        },
        notify::Config::default()
            .with_poll_interval(interval)
            .with_compare_contents(true),
    )
    .map_err(watch_error)?;

    watcher
        .watch(path, RecursiveMode::NonRecursive)
        .map_err(watch_error)?;
    debug!(path = %path.display(), interval = ?interval, "Watching config file");
    Ok(watcher)
}

async fn watch_loop(
    path: PathBuf,
    ctx: ProcessContext,
    // Held so polling continues until the loop exits
    _watcher: PollWatcher,
    mut changes: mpsc::UnboundedReceiver<()>,
    tx: mpsc::Sender<Config>,
    mut last_hash: String,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            change = changes.recv() => {
                if change.is_none() {
                    break;
                }
                // Coalesce bursts of events into one re-read
                while changes.try_recv().is_ok() {}

                let config = match parse_config(&path, &ctx).await {
                    Ok(config) => config,
                    Err(e) => {
                        error!(
                            path = %path.display(),
                            error = %e,
                            "Config reload failed, keeping previous config"
                        );
                        continue;
                    }
                };

                if config.content_hash == last_hash {
                    debug!("Config content unchanged, skipping reload");
                    continue;
                }
                last_hash = config.content_hash.clone();

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(config) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    debug!("Config watcher stopped");
}
