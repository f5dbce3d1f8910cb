//! SignalFx Agent - host telemetry agent
//!
//! Runs the collection pipeline on a host. With `status` it instead asks a
//! running agent for its state over the diagnostics socket.

use agent_lib::{
    config::LogFormat, AgentMetrics, AgentOptions, ExitReason, HealthRegistry, ProcessContext,
};
use clap::Parser;
use cli::{BootstrapConfig, Cli, Command};
use colored::Colorize;
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod cli;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit code of `status` when no agent answers
const STATUS_UNREACHABLE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Stop,
    Restart,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.version {
        println!("signalfx-agent {}", AGENT_VERSION);
        return ExitCode::SUCCESS;
    }

    let boot = BootstrapConfig::peek(&cli.config);
    match &cli.command {
        Some(Command::Status { section }) => status(&boot, section.as_deref()).await,
        None => {
            init_tracing(&cli, &boot);
            run_agent(&cli, &boot).await
        }
    }
}

fn init_tracing(cli: &Cli, boot: &BootstrapConfig) {
    let level = if cli.debug {
        "debug"
    } else {
        boot.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    match boot.logging.format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}

async fn status(boot: &BootstrapConfig, section: Option<&str>) -> ExitCode {
    let path = boot.diagnostics_socket();
    match agent_lib::diagnostics::request(&path, section.unwrap_or("")).await {
        Ok(payload) => {
            let mut stdout = std::io::stdout();
            if stdout.write_all(&payload).and_then(|_| stdout.flush()).is_err() {
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!(
                "{} could not reach the agent at {}: {}",
                "error:".red().bold(),
                path.display(),
                e
            );
            eprintln!("Is the agent running?");
            ExitCode::from(STATUS_UNREACHABLE)
        }
    }
}

async fn run_agent(cli: &Cli, boot: &BootstrapConfig) -> ExitCode {
    let options = AgentOptions {
        config_path: cli.config.clone(),
        watch_interval: cli.file_poll_rate,
        version: AGENT_VERSION.to_string(),
        ctx: ProcessContext::from_env(),
    };
    let health = HealthRegistry::new();
    let metrics = AgentMetrics::new();

    let api_cancel = CancellationToken::new();
    let api_handle = boot.profiling.then(|| {
        let state = Arc::new(api::AppState::new(health.clone(), metrics.clone()));
        tokio::spawn(api::serve(boot.profiling_addr(), state, api_cancel.clone()))
    });

    let code = loop {
        health.set_ready(false);
        let shutdown = CancellationToken::new();
        let signals = tokio::spawn(wait_for_signal(shutdown.clone()));

        let result =
            agent_lib::run(options.clone(), health.clone(), metrics.clone(), shutdown).await;
        let signal = match result {
            // A stop only happens once the signal task has fired
            Ok(ExitReason::Stopped) => signals.await.unwrap_or(Signal::Stop),
            _ => {
                signals.abort();
                Signal::Stop
            }
        };

        match result {
            Ok(ExitReason::Stopped) if signal == Signal::Restart => {
                info!("Restarting agent");
                continue;
            }
            Ok(reason) => break reason.exit_code(),
            Err(e) => {
                error!(error = %e, "Agent failed to start");
                break e.exit_code();
            }
        }
    };

    api_cancel.cancel();
    if let Some(handle) = api_handle {
        match handle.await {
            Ok(Err(e)) => warn!(error = %e, "Debug server failed"),
            Err(e) => warn!(error = %e, "Debug server task panicked"),
            Ok(Ok(())) => {}
        }
    }
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

/// Resolve on the first stop or restart signal, cancelling `shutdown`
#[cfg(unix)]
async fn wait_for_signal(shutdown: CancellationToken) -> Signal {
    use tokio::signal::unix::{signal, SignalKind};

    let streams = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    );
    let (mut int, mut term, mut hup) = match streams {
        (Ok(int), Ok(term), Ok(hup)) => (int, term, hup),
        _ => {
            warn!("Could not install signal handlers, falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
            return Signal::Stop;
        }
    };

    let signal = tokio::select! {
        _ = int.recv() => Signal::Stop,
        _ = term.recv() => Signal::Stop,
        _ = hup.recv() => Signal::Restart,
    };
    info!(signal = ?signal, "Received signal");
    shutdown.cancel();
    signal
}

#[cfg(not(unix))]
async fn wait_for_signal(shutdown: CancellationToken) -> Signal {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    shutdown.cancel();
    Signal::Stop
}
