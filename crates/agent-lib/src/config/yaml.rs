//! Text-level YAML helpers: env expansion, line lookup, and hashing

use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Expand `${VAR}` references from the captured environment. Unknown
/// variables expand to the empty string; `$${VAR}` escapes the expansion.
pub(crate) fn expand_env(text: &str, env: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find("${") {
        if pos > 0 && rest[..pos].ends_with('$') {
            out.push_str(&rest[..pos - 1]);
            out.push_str("${");
            rest = &rest[pos + 2..];
            continue;
        }

        out.push_str(&rest[..pos]);
        let after = &rest[pos + 2..];
        match after.find('}') {
            Some(end) => {
                let name = after[..end].trim();
                if let Some(value) = env.get(name) {
                    out.push_str(value);
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[pos..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

/// Line numbers (1-based) of the items of a top-level block sequence.
/// Returns an empty list for flow sequences or when the key is absent.
pub(crate) fn sequence_item_lines(text: &str, key: &str) -> Vec<usize> {
    let mut lines = Vec::new();
    let mut in_key = false;
    let mut item_indent: Option<usize> = None;
    let header = format!("{}:", key);

    for (idx, line) in text.lines().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let indent = line.len() - trimmed.len();

        if indent == 0 && !trimmed.starts_with('-') {
            in_key = trimmed.trim_end() == header;
            item_indent = None;
            continue;
        }

        if !in_key {
            continue;
        }

        if trimmed.starts_with("- ") || trimmed == "-" {
            match item_indent {
                None => {
                    item_indent = Some(indent);
                    lines.push(idx + 1);
                }
                Some(i) if i == indent => lines.push(idx + 1),
                _ => {}
            }
        }
    }

    lines
}

/// SHA-256 of a JSON value with sorted keys
pub(crate) fn hash_json(value: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Convert a YAML value to JSON, stringifying non-string map keys
pub(crate) fn yaml_to_json(value: &serde_yaml::Value) -> serde_json::Value {
    use serde_yaml::Value as Y;
    match value {
        Y::Null => serde_json::Value::Null,
        Y::Bool(b) => serde_json::Value::Bool(*b),
        Y::Number(n) => {
            if let Some(i) = n.as_i64() {
                serde_json::Value::from(i)
            } else if let Some(u) = n.as_u64() {
                serde_json::Value::from(u)
            } else {
                n.as_f64()
                    .and_then(serde_json::Number::from_f64)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null)
            }
        }
        Y::String(s) => serde_json::Value::String(s.clone()),
        Y::Sequence(items) => serde_json::Value::Array(items.iter().map(yaml_to_json).collect()),
        Y::Mapping(m) => {
            let mut out = serde_json::Map::new();
            for (k, v) in m {
                let key = match k {
                    Y::String(s) => s.clone(),
                    other => serde_yaml::to_string(other)
                        .map(|s| s.trim().to_string())
                        .unwrap_or_default(),
                };
                out.insert(key, yaml_to_json(v));
            }
            serde_json::Value::Object(out)
        }
        Y::Tagged(tagged) => yaml_to_json(&tagged.value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env() {
        let mut env = HashMap::new();
        env.insert("TOKEN".to_string(), "abc".to_string());

        assert_eq!(expand_env("token: ${TOKEN}", &env), "token: abc");
        assert_eq!(expand_env("x: ${MISSING}!", &env), "x: !");
        assert_eq!(expand_env("x: $${TOKEN}", &env), "x: ${TOKEN}");
        assert_eq!(expand_env("x: ${unterminated", &env), "x: ${unterminated");
    }

    #[test]
    fn test_sequence_item_lines() {
        let text = r#"signalFxAccessToken: abc
# comment
monitors:
  - type: cpu
    intervalSeconds: 5
    metricsToExclude:
      - metricName: a
  - type: memory

observers:
- type: host
"#;
        assert_eq!(sequence_item_lines(text, "monitors"), vec![4, 8]);
        assert_eq!(sequence_item_lines(text, "observers"), vec![11]);
        assert!(sequence_item_lines(text, "missing").is_empty());
    }

    #[test]
    fn test_hash_is_key_order_independent() {
        let a: serde_json::Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        assert_eq!(hash_json(&a), hash_json(&b));
    }
}
