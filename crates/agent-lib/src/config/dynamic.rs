//! Resolution of `#from` dynamic values

use super::sources::SourceSet;
use crate::error::ConfigError;
use serde_yaml::{Mapping, Value};
use std::future::Future;
use std::pin::Pin;

const FROM_KEY: &str = "#from";

type ResolveFuture<'a> = Pin<Box<dyn Future<Output = Result<Resolved, ConfigError>> + Send + 'a>>;

/// Outcome of resolving one node
enum Resolved {
    Value(Value),
    /// Contents to merge into the parent mapping or splice into the parent sequence
    Flatten(Value),
}

/// A parsed `{"#from": ...}` directive
#[derive(Debug, PartialEq)]
struct FromDirective {
    source: String,
    path: String,
    optional: bool,
    default: Option<Value>,
    flatten: bool,
}

impl FromDirective {
    fn parse(map: &Mapping) -> Result<Option<Self>, ConfigError> {
        let Some(from) = map.get(FROM_KEY) else {
            return Ok(None);
        };
        let spec = from
            .as_str()
            .ok_or_else(|| ConfigError::validation("#from must be a string"))?;

        for key in map.keys() {
            match key.as_str() {
                Some(FROM_KEY | "optional" | "default" | "flatten") => {}
                _ => {
                    return Err(ConfigError::validation(format!(
                        "unexpected key {:?} next to #from",
                        key
                    )))
                }
            }
        }

        let (source, path) = match spec.split_once(':') {
            Some((source, path)) => (source.to_string(), path.to_string()),
            None => ("file".to_string(), spec.to_string()),
        };
        let flag = |key: &str| map.get(key).and_then(Value::as_bool).unwrap_or(false);

        Ok(Some(Self {
            source,
            path,
            optional: flag("optional"),
            default: map.get("default").cloned(),
            flatten: flag("flatten"),
        }))
    }
}

/// Replace every `#from` node in `root` with the value it references
pub(crate) async fn resolve(root: Value, sources: &SourceSet) -> Result<Value, ConfigError> {
    match resolve_node(root, sources).await? {
        Resolved::Value(v) | Resolved::Flatten(v) => Ok(v),
    }
}

fn resolve_node<'a>(node: Value, sources: &'a SourceSet) -> ResolveFuture<'a> {
    Box::pin(async move {
        match node {
            Value::Mapping(map) => {
                if let Some(directive) = FromDirective::parse(&map)? {
                    return fetch(directive, sources).await;
                }

                let mut out = Mapping::new();
                for (key, value) in map {
                    match resolve_node(value, sources).await? {
                        Resolved::Value(v) => {
                            out.insert(key, v);
                        }
                        Resolved::Flatten(Value::Mapping(inner)) => out.extend(inner),
                        Resolved::Flatten(Value::Null) => {}
                        Resolved::Flatten(_) => {
                            return Err(ConfigError::validation(format!(
                                "flattened value for {:?} is not a mapping",
                                key
                            )))
                        }
                    }
                }
                Ok(Resolved::Value(Value::Mapping(out)))
            }
            Value::Sequence(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match resolve_node(item, sources).await? {
                        Resolved::Value(v) => out.push(v),
                        Resolved::Flatten(Value::Sequence(inner)) => out.extend(inner),
                        Resolved::Flatten(Value::Null) => {}
                        Resolved::Flatten(other) => out.push(other),
                    }
                }
                Ok(Resolved::Value(Value::Sequence(out)))
            }
            other => Ok(Resolved::Value(other)),
        }
    })
}

async fn fetch(directive: FromDirective, sources: &SourceSet) -> Result<Resolved, ConfigError> {
    let source = sources.get(&directive.source).ok_or_else(|| {
        ConfigError::validation(format!(
            "#from references unknown config source {:?}",
            directive.source
        ))
    })?;

    let value = match source.get(&directive.path).await? {
        Some(bytes) => parse_fetched(&bytes),
        None if directive.optional => directive.default.clone().unwrap_or(Value::Null),
        None => match directive.default.clone() {
            Some(default) => default,
            None => {
                return Err(ConfigError::Source {
                    source_name: directive.source.clone(),
                    path: directive.path.clone(),
                    reason: "no value found and not optional".to_string(),
                })
            }
        },
    };

    if directive.flatten {
        Ok(Resolved::Flatten(value))
    } else {
        Ok(Resolved::Value(value))
    }
}

/// Fetched bytes are YAML; anything that fails to parse is kept as a string
fn parse_fetched(bytes: &[u8]) -> Value {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim_end_matches(['\n', '\r']);
    match serde_yaml::from_str::<Value>(trimmed) {
        Ok(Value::Null) if !trimmed.is_empty() => Value::String(trimmed.to_string()),
        Ok(v) => v,
        Err(_) => Value::String(trimmed.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::sources::SourceConfig;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn sources(dir: &TempDir, env: &[(&str, &str)]) -> SourceSet {
        let env: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SourceSet::new(&SourceConfig::default(), dir.path(), &env).unwrap()
    }

    #[tokio::test]
    async fn test_resolves_env_and_file_values() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("dims.yaml"), "team: infra\nregion: eu\n").unwrap();
        let set = sources(&dir, &[("TOKEN", "abc")]);

        let doc: Value = serde_yaml::from_str(
            r##"
signalFxAccessToken: {"#from": "env:TOKEN"}
globalDimensions: {"#from": "dims.yaml"}
"##,
        )
        .unwrap();

        let out = resolve(doc, &set).await.unwrap();
        assert_eq!(out["signalFxAccessToken"], Value::from("abc"));
        assert_eq!(out["globalDimensions"]["team"], Value::from("infra"));
    }

    #[tokio::test]
    async fn test_flatten_into_mapping_and_sequence() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("extra.yaml"), "region: eu\n").unwrap();
        std::fs::write(
            dir.path().join("monitors.yaml"),
            "- type: cpu\n- type: memory\n",
        )
        .unwrap();
        let set = sources(&dir, &[]);

        let doc: Value = serde_yaml::from_str(
            r##"
globalDimensions:
  team: infra
  _extra: {"#from": "extra.yaml", flatten: true}
monitors:
  - type: http-check
  - {"#from": "monitors.yaml", flatten: true}
"##,
        )
        .unwrap();

        let out = resolve(doc, &set).await.unwrap();
        let dims = out["globalDimensions"].as_mapping().unwrap();
        assert_eq!(dims.len(), 2);
        assert_eq!(out["globalDimensions"]["region"], Value::from("eu"));
        assert_eq!(out["monitors"].as_sequence().unwrap().len(), 3);
        assert_eq!(out["monitors"][2]["type"], Value::from("memory"));
    }

    #[tokio::test]
    async fn test_missing_value_required_vs_optional() {
        let dir = TempDir::new().unwrap();
        let set = sources(&dir, &[]);

        let required: Value = serde_yaml::from_str(r##"x: {"#from": "env:NOPE"}"##).unwrap();
        assert!(matches!(
            resolve(required, &set).await,
            Err(ConfigError::Source { .. })
        ));

        let optional: Value =
            serde_yaml::from_str(r##"x: {"#from": "env:NOPE", optional: true, default: 7}"##)
                .unwrap();
        let out = resolve(optional, &set).await.unwrap();
        assert_eq!(out["x"], Value::from(7));
    }

    #[tokio::test]
    async fn test_unknown_source_is_rejected() {
        let dir = TempDir::new().unwrap();
        let set = sources(&dir, &[]);
        let doc: Value = serde_yaml::from_str(r##"x: {"#from": "zookeeper:/a"}"##).unwrap();
        assert!(resolve(doc, &set).await.is_err());
    }

    #[test]
    fn test_parse_fetched_keeps_plain_strings() {
        assert_eq!(parse_fetched(b"abc\n"), Value::from("abc"));
        assert_eq!(parse_fetched(b"42"), Value::from(42));
        assert_eq!(parse_fetched(b"a: [unclosed"), Value::from("a: [unclosed"));
    }
}
