//! String and string-map filters

use crate::error::ConfigError;
use regex::Regex;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct RegexMatcher {
    re: Regex,
    negated: bool,
}

/// Matches a string against a list of static, glob, or regex patterns.
/// A string matches when any pattern matches it.
#[derive(Debug, Clone, Default)]
pub struct StringFilter {
    statics: HashMap<String, bool>,
    regexps: Vec<RegexMatcher>,
}

impl StringFilter {
    pub fn new<S: AsRef<str>>(items: &[S]) -> Result<Self, ConfigError> {
        let mut statics = HashMap::new();
        let mut regexps = Vec::new();

        for item in items {
            let (pattern, negated) = strip_negation(item.as_ref());
            if let Some(re) = compile_pattern(pattern)? {
                regexps.push(RegexMatcher { re, negated });
            } else {
                statics.insert(pattern.to_string(), negated);
            }
        }

        Ok(Self { statics, regexps })
    }

    pub fn is_empty(&self) -> bool {
        self.statics.is_empty() && self.regexps.is_empty()
    }

    pub fn matches(&self, s: &str) -> bool {
        let static_match = self
            .statics
            .iter()
            .any(|(val, negated)| (val == s) != *negated);

        static_match
            || self
                .regexps
                .iter()
                .any(|m| m.re.is_match(s) != m.negated)
    }
}

/// Matches a string map where every configured key must be present and its
/// value must satisfy that key's filter.
#[derive(Debug, Clone, Default)]
pub struct StringMapFilter {
    fields: HashMap<String, StringFilter>,
}

impl StringMapFilter {
    pub fn new(spec: &HashMap<String, Vec<String>>) -> Result<Self, ConfigError> {
        let mut fields = HashMap::with_capacity(spec.len());
        for (key, values) in spec {
            if values.is_empty() {
                return Err(ConfigError::validation(format!(
                    "dimension filter for '{}' has no values",
                    key
                )));
            }
            fields.insert(key.clone(), StringFilter::new(values)?);
        }
        Ok(Self { fields })
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn matches(&self, m: &HashMap<String, String>) -> bool {
        self.fields.iter().all(|(key, filter)| match m.get(key) {
            Some(value) => filter.matches(value),
            None => false,
        })
    }
}

fn strip_negation(s: &str) -> (&str, bool) {
    match s.strip_prefix('!') {
        Some(rest) => (rest, true),
        None => (s, false),
    }
}

fn is_regex(s: &str) -> bool {
    s.len() > 2 && s.starts_with('/') && s.ends_with('/')
}

fn is_glob(s: &str) -> bool {
    s.contains('*') || s.contains('?')
}

/// Returns `None` for a static pattern
fn compile_pattern(pattern: &str) -> Result<Option<Regex>, ConfigError> {
    let source = if is_regex(pattern) {
        pattern[1..pattern.len() - 1].to_string()
    } else if is_glob(pattern) {
        glob_to_regex(pattern)
    } else {
        return Ok(None);
    };

    Regex::new(&source)
        .map(Some)
        .map_err(|e| ConfigError::validation(format!("invalid pattern '{}': {}", pattern, e)))
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push('^');
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    out.push('$');
    out
}
