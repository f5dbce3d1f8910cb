//! Config sources referenced by `#from` values
//!
//! Each source exposes `get(path)` returning the raw bytes stored under
//! that path, or `None` when nothing is stored there.

use crate::error::ConfigError;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

/// A named backend that `#from` can read values from
#[async_trait]
pub trait ConfigSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, ConfigError>;
}

/// `configSources` subtree
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SourceConfig {
    #[serde(default)]
    pub consul: Option<ConsulSourceConfig>,
    #[serde(default)]
    pub etcd2: Option<Etcd2SourceConfig>,
    #[serde(default)]
    pub vault: Option<VaultSourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConsulSourceConfig {
    pub endpoint: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub datacenter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Etcd2SourceConfig {
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VaultSourceConfig {
    pub vault_addr: String,
    pub vault_token: String,
}

fn source_error(source: &str, path: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Source {
        source_name: source.to_string(),
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

/// Files on the local filesystem, relative to the config file's directory
pub struct FileSource {
    base_dir: PathBuf,
}

impl FileSource {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

#[async_trait]
impl ConfigSource for FileSource {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, ConfigError> {
        let full = if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            self.base_dir.join(path)
        };
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(source_error("file", path, e)),
        }
    }
}

/// Environment variables captured at startup
pub struct EnvSource {
    env: HashMap<String, String>,
}

impl EnvSource {
    pub fn new(env: HashMap<String, String>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl ConfigSource for EnvSource {
    fn name(&self) -> &'static str {
        "env"
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, ConfigError> {
        Ok(self.env.get(path).map(|v| v.as_bytes().to_vec()))
    }
}

fn http_client(source: &str) -> Result<reqwest::Client, ConfigError> {
    reqwest::Client::builder()
        .timeout(REMOTE_TIMEOUT)
        .build()
        .map_err(|e| source_error(source, "", e))
}

/// Consul KV store over its HTTP API
pub struct ConsulSource {
    client: reqwest::Client,
    conf: ConsulSourceConfig,
}

impl ConsulSource {
    pub fn new(conf: ConsulSourceConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            client: http_client("consul")?,
            conf,
        })
    }
}

#[async_trait]
impl ConfigSource for ConsulSource {
    fn name(&self) -> &'static str {
        "consul"
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, ConfigError> {
        let url = format!(
            "{}/v1/kv/{}",
            self.conf.endpoint.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let mut req = self.client.get(&url).query(&[("raw", "true")]);
        if let Some(dc) = &self.conf.datacenter {
            req = req.query(&[("dc", dc)]);
        }
        if let Some(token) = &self.conf.token {
            req = req.header("X-Consul-Token", token);
        }

        let resp = req.send().await.map_err(|e| source_error("consul", path, e))?;
        match resp.status().as_u16() {
            200 => Ok(Some(
                resp.bytes()
                    .await
                    .map_err(|e| source_error("consul", path, e))?
                    .to_vec(),
            )),
            404 => Ok(None),
            status => Err(source_error("consul", path, format!("status {}", status))),
        }
    }
}

/// etcd v2 keys API
pub struct Etcd2Source {
    client: reqwest::Client,
    conf: Etcd2SourceConfig,
}

impl Etcd2Source {
    pub fn new(conf: Etcd2SourceConfig) -> Result<Self, ConfigError> {
        if conf.endpoints.is_empty() {
            return Err(ConfigError::validation(
                "configSources.etcd2.endpoints must not be empty",
            ));
        }
        Ok(Self {
            client: http_client("etcd2")?,
            conf,
        })
    }
}

#[derive(Deserialize)]
struct EtcdResponse {
    node: EtcdNode,
}

#[derive(Deserialize)]
struct EtcdNode {
    #[serde(default)]
    value: Option<String>,
}

#[async_trait]
impl ConfigSource for Etcd2Source {
    fn name(&self) -> &'static str {
        "etcd2"
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, ConfigError> {
        let mut last_err = None;
        for endpoint in &self.conf.endpoints {
            let url = format!(
                "{}/v2/keys/{}",
                endpoint.trim_end_matches('/'),
                path.trim_start_matches('/')
            );
            let mut req = self.client.get(&url);
            if let Some(user) = &self.conf.username {
                req = req.basic_auth(user, self.conf.password.as_ref());
            }

            match req.send().await {
                Ok(resp) if resp.status().as_u16() == 404 => return Ok(None),
                Ok(resp) if resp.status().is_success() => {
                    let body: EtcdResponse = resp
                        .json()
                        .await
                        .map_err(|e| source_error("etcd2", path, e))?;
                    return Ok(body.node.value.map(String::into_bytes));
                }
                Ok(resp) => last_err = Some(format!("status {}", resp.status())),
                Err(e) => last_err = Some(e.to_string()),
            }
        }
        Err(source_error(
            "etcd2",
            path,
            last_err.unwrap_or_else(|| "no endpoints".to_string()),
        ))
    }
}

/// HashiCorp Vault. Paths are written `secret/data/app[password]` where the
/// bracketed part selects a key from the secret's data.
pub struct VaultSource {
    client: reqwest::Client,
    conf: VaultSourceConfig,
}

impl VaultSource {
    pub fn new(conf: VaultSourceConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            client: http_client("vault")?,
            conf,
        })
    }

    fn split_path(path: &str) -> Result<(&str, &str), ConfigError> {
        let open = path.find('[');
        match (open, path.ends_with(']')) {
            (Some(open), true) => Ok((&path[..open], &path[open + 1..path.len() - 1])),
            _ => Err(source_error(
                "vault",
                path,
                "path must be of the form 'secret/path[key]'",
            )),
        }
    }
}

#[async_trait]
impl ConfigSource for VaultSource {
    fn name(&self) -> &'static str {
        "vault"
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, ConfigError> {
        let (secret_path, key) = Self::split_path(path)?;
        let url = format!(
            "{}/v1/{}",
            self.conf.vault_addr.trim_end_matches('/'),
            secret_path.trim_start_matches('/')
        );
        let resp = self
            .client
            .get(&url)
            .header("X-Vault-Token", &self.conf.vault_token)
            .send()
            .await
            .map_err(|e| source_error("vault", path, e))?;

        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(source_error(
                "vault",
                path,
                format!("status {}", resp.status()),
            ));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| source_error("vault", path, e))?;
        // KV v2 nests the secret under data.data
        let data = body
            .get("data")
            .map(|d| d.get("data").unwrap_or(d))
            .and_then(|d| d.get(key));

        Ok(data.map(|v| match v {
            serde_json::Value::String(s) => s.clone().into_bytes(),
            other => other.to_string().into_bytes(),
        }))
    }
}

/// The sources available while resolving one config document
#[derive(Clone, Default)]
pub struct SourceSet {
    sources: HashMap<&'static str, Arc<dyn ConfigSource>>,
}

impl SourceSet {
    pub fn new(
        conf: &SourceConfig,
        config_dir: &Path,
        env: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let mut set = Self::default();
        set.insert(Arc::new(FileSource::new(config_dir)));
        set.insert(Arc::new(EnvSource::new(env.clone())));
        if let Some(c) = &conf.consul {
            set.insert(Arc::new(ConsulSource::new(c.clone())?));
        }
        if let Some(c) = &conf.etcd2 {
            set.insert(Arc::new(Etcd2Source::new(c.clone())?));
        }
        if let Some(c) = &conf.vault {
            set.insert(Arc::new(VaultSource::new(c.clone())?));
        }
        Ok(set)
    }

    pub fn insert(&mut self, source: Arc<dyn ConfigSource>) {
        self.sources.insert(source.name(), source);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ConfigSource>> {
        self.sources.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_source_relative_and_missing() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("token"), "s3cret").unwrap();

        let source = FileSource::new(dir.path());
        assert_eq!(source.get("token").await.unwrap(), Some(b"s3cret".to_vec()));
        assert_eq!(source.get("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_env_source() {
        let mut env = HashMap::new();
        env.insert("REGION".to_string(), "us-east-1".to_string());
        let source = EnvSource::new(env);
        assert_eq!(source.get("REGION").await.unwrap(), Some(b"us-east-1".to_vec()));
        assert_eq!(source.get("OTHER").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_consul_source_reads_raw_value() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/kv/agent/token")
            .match_query(mockito::Matcher::UrlEncoded("raw".into(), "true".into()))
            .with_status(200)
            .with_body("from-consul")
            .create_async()
            .await;
        server
            .mock("GET", "/v1/kv/agent/missing")
            .match_query(mockito::Matcher::Any)
            .with_status(404)
            .create_async()
            .await;

        let source = ConsulSource::new(ConsulSourceConfig {
            endpoint: server.url(),
            token: None,
            datacenter: None,
        })
        .unwrap();

        assert_eq!(
            source.get("agent/token").await.unwrap(),
            Some(b"from-consul".to_vec())
        );
        assert_eq!(source.get("agent/missing").await.unwrap(), None);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_vault_source_selects_key() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/secret/data/agent")
            .match_header("X-Vault-Token", "root")
            .with_status(200)
            .with_body(r#"{"data":{"data":{"token":"v-token"}}}"#)
            .create_async()
            .await;

        let source = VaultSource::new(VaultSourceConfig {
            vault_addr: server.url(),
            vault_token: "root".to_string(),
        })
        .unwrap();

        assert_eq!(
            source.get("secret/data/agent[token]").await.unwrap(),
            Some(b"v-token".to_vec())
        );
        assert!(source.get("secret/data/agent").await.is_err());
    }

    #[test]
    fn test_etcd_requires_endpoints() {
        assert!(Etcd2Source::new(Etcd2SourceConfig {
            endpoints: vec![],
            username: None,
            password: None,
        })
        .is_err());
    }
}
