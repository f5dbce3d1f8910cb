//! Process-wide context captured once at startup
//!
//! Components receive this value at construction rather than reading the
//! environment themselves.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const ENV_ACCESS_TOKEN: &str = "SFX_ACCESS_TOKEN";
pub const ENV_BUNDLE_DIR: &str = "BUNDLE_DIR";
pub const ENV_HOST_PROC: &str = "HOST_PROC";
pub const ENV_HOST_ETC: &str = "HOST_ETC";

const DEFAULT_BUNDLE_DIR: &str = "/usr/lib/signalfx-agent";

/// Snapshot of the environment the agent was started with
#[derive(Debug, Clone)]
pub struct ProcessContext {
    /// Base directory for bundled collectd/python runtimes
    pub bundle_dir: PathBuf,
    /// Root of the host's procfs
    pub host_proc: PathBuf,
    /// Root of the host's /etc
    pub host_etc: PathBuf,
    /// Access token that overrides the one in the config file
    pub access_token_override: Option<String>,
    /// Full environment, used by the `env` config source and `${VAR}` expansion
    pub env: HashMap<String, String>,
}

impl Default for ProcessContext {
    fn default() -> Self {
        Self {
            bundle_dir: PathBuf::from(DEFAULT_BUNDLE_DIR),
            host_proc: PathBuf::from("/proc"),
            host_etc: PathBuf::from("/etc"),
            access_token_override: None,
            env: HashMap::new(),
        }
    }
}

impl ProcessContext {
    /// Capture the current process environment
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Build a context from an explicit set of variables
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let env: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let path_or = |key: &str, default: &str| {
            env.get(key)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(default))
        };

        Self {
            bundle_dir: path_or(ENV_BUNDLE_DIR, DEFAULT_BUNDLE_DIR),
            host_proc: path_or(ENV_HOST_PROC, "/proc"),
            host_etc: path_or(ENV_HOST_ETC, "/etc"),
            access_token_override: env.get(ENV_ACCESS_TOKEN).filter(|v| !v.is_empty()).cloned(),
            env,
        }
    }

    /// Path under the host procfs root
    pub fn proc_path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.host_proc.join(rel)
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }
}
