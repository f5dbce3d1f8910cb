//! Local diagnostics
//!
//! This module provides:
//! - A stream-socket server answering one request per connection
//! - The status text dump read by `signalfx-agent status`
//! - The JSON internal-metrics dump read by the `internal-metrics` monitor

mod internal;
mod server;
mod status;


pub use internal::{internal_metrics, render_internal_metrics};
pub use server::{read_socket, request, serve, Handler, REQUEST_WINDOW, RESPONSE_BUDGET};
pub use status::{render_status, AgentStatus, SECTIONS};
