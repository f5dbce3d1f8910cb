//! Host telemetry agent library
//!
//! This crate provides the core functionality for:
//! - Loading and watching the agent config
//! - Discovering service endpoints on the host
//! - Running monitors statically or against discovered endpoints
//! - Batching and sending datapoints, events, spans and dimension
//!   properties to ingest
//! - Diagnostics sockets, health checks and observability

pub mod agent;
pub mod config;
pub mod diagnostics;
pub mod endpoint;
pub mod error;
pub mod filters;
pub mod health;
pub mod models;
pub mod monitors;
pub mod observability;
pub mod observers;
pub mod process;
pub mod proto;
pub mod subproc;
pub mod writer;

pub use agent::{run, Agent, AgentOptions, ExitReason, StartupError, StatusSource};
pub use config::{Config, DEFAULT_CONFIG_PATH};
pub use error::{AgentError, ConfigError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
pub use process::ProcessContext;
