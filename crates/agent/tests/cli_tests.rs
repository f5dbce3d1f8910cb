//! Integration tests for the signalfx-agent binary

use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

const BIN: &str = env!("CARGO_BIN_EXE_signalfx-agent");

fn agent() -> Command {
    let mut cmd = Command::new(BIN);
    cmd.env_remove("RUST_LOG").env_remove("SFX_CONFIG").kill_on_drop(true);
    cmd
}

async fn output(args: &[&str]) -> Output {
    agent().args(args).output().await.unwrap()
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn write_config(dir: &Path, extra: &str) -> PathBuf {
    let path = dir.join("agent.yaml");
    let text = format!(
        "signalFxAccessToken: tok\nhostname: cli-host\ningestUrl: http://127.0.0.1:1\n\
         apiUrl: http://127.0.0.1:1\ndiagnosticsSocketPath: {}\ninternalMetricsSocketPath: {}\n{}",
        dir.join("diag.sock").display(),
        dir.join("internal.sock").display(),
        extra
    );
    std::fs::write(&path, text).unwrap();
    path
}

#[tokio::test]
async fn test_version_flag() {
    let out = output(&["--version"]).await;
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.starts_with("signalfx-agent "));
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}

#[tokio::test]
async fn test_missing_config_exits_1() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.yaml");
    let out = output(&["--config", missing.to_str().unwrap(), "--filePollRate", "0"]).await;
    assert_eq!(out.status.code(), Some(1));
}

#[tokio::test]
async fn test_status_without_agent_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "");
    let out = output(&["status", "--config", config.to_str().unwrap()]).await;
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("Is the agent running?"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_running_agent_answers_status_and_debug_server() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let config = write_config(
        dir.path(),
        &format!("profiling: true\nprofilingPort: {port}\nmonitors:\n  - type: internal-metrics\n"),
    );
    let config_arg = config.to_str().unwrap();

    let mut child = agent()
        .args(["--config", config_arg, "--filePollRate", "0"])
        .spawn()
        .unwrap();

    let mut monitors = String::new();
    for _ in 0..100 {
        let out = output(&["status", "--config", config_arg, "monitors"]).await;
        if out.status.success() {
            monitors = String::from_utf8_lossy(&out.stdout).into_owned();
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(monitors.contains("Monitors (1 active"), "status was:\n{monitors}");
    assert!(monitors.contains("internal-metrics"));

    let client = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{port}");
    let mut ready = false;
    for _ in 0..50 {
        if let Ok(resp) = client.get(format!("{base}/readyz")).send().await {
            if resp.status().is_success() {
                ready = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(ready, "debug server never reported ready");

    let health: serde_json::Value = client
        .get(format!("{base}/healthz"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(health["components"].get("writer").is_some());

    let metrics = client
        .get(format!("{base}/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("sfxagent_reconcile_seconds"));

    let pid = child.id().unwrap().to_string();
    let killed = std::process::Command::new("kill")
        .args(["-TERM", &pid])
        .status()
        .unwrap();
    assert!(killed.success());
    let status = tokio::time::timeout(Duration::from_secs(35), child.wait())
        .await
        .expect("agent did not exit after SIGTERM")
        .unwrap();
    assert_eq!(status.code(), Some(0));
    assert!(!dir.path().join("diag.sock").exists());
}
