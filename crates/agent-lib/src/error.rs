//! Error taxonomy for the agent runtime
//!
//! Each component surfaces one of these kinds to its supervising task,
//! which turns it into a log record. Only writer startup failures and the
//! first config load are fatal.

use thiserror::Error;

/// Configuration parse or validation failure
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("could not read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("{}", format_with_line(.message, .line))]
    Parse { message: String, line: Option<usize> },

    #[error("{}", format_with_line(.message, .line))]
    Validation { message: String, line: Option<usize> },

    #[error("config source {source_name} failed for {path}: {reason}")]
    Source {
        source_name: String,
        path: String,
        reason: String,
    },
}

fn format_with_line(message: &str, line: &Option<usize>) -> String {
    match line {
        Some(line) => format!("line {}: {}", line, message),
        None => message.to_string(),
    }
}

impl ConfigError {
    pub fn validation(message: impl Into<String>) -> Self {
        ConfigError::Validation {
            message: message.into(),
            line: None,
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        ConfigError::Parse {
            message: message.into(),
            line: None,
        }
    }

    /// Attach a line number if the error does not carry one yet
    pub fn at_line(self, at: Option<usize>) -> Self {
        match self {
            ConfigError::Validation { message, line } => ConfigError::Validation {
                message,
                line: line.or(at),
            },
            ConfigError::Parse { message, line } => ConfigError::Parse {
                message,
                line: line.or(at),
            },
            other => other,
        }
    }

    pub fn line(&self) -> Option<usize> {
        match self {
            ConfigError::Parse { line, .. } | ConfigError::Validation { line, .. } => *line,
            _ => None,
        }
    }
}

/// Failed exchange with the ingest or dimension API
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {url} returned status {status}: {body_snippet}")]
    Status {
        url: String,
        status: u16,
        body_snippet: String,
    },

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("could not encode payload for {url}: {reason}")]
    Encode { url: String, reason: String },
}

impl TransportError {
    /// Truncate a response body to something that fits in a log line
    pub fn snippet(body: &str) -> String {
        const MAX_SNIPPET: usize = 200;
        if body.len() <= MAX_SNIPPET {
            return body.to_string();
        }
        let mut end = MAX_SNIPPET;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    }
}

/// A monitor or observer refused its configuration
#[derive(Debug, Clone, Error, PartialEq)]
#[error("could not configure {kind} of type {component_type}: {reason}")]
pub struct InstantiationError {
    pub kind: &'static str,
    pub component_type: String,
    pub reason: String,
}

impl InstantiationError {
    pub fn monitor(monitor_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: "monitor",
            component_type: monitor_type.into(),
            reason: reason.into(),
        }
    }

    pub fn observer(observer_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: "observer",
            component_type: observer_type.into(),
            reason: reason.into(),
        }
    }
}

/// Top-level error for the agent runtime
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Instantiation(#[from] InstantiationError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        AgentError::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T, E = AgentError> = std::result::Result<T, E>;
