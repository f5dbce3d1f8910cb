//! Framed message pipe to external monitor runners
//!
//! Each frame is a big-endian `u32` payload length, a big-endian `u32`
//! message type, then the payload. The agent writes `Configure` and reads
//! `ConfigureResult`, `Log` and `ValueList` frames back.

mod collectd;

pub use collectd::{convert_value_lists, ValueListEntry};

use crate::error::AgentError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

/// Largest payload accepted from a runner
pub const MAX_FRAME_SIZE: u32 = 32 * 1024 * 1024;

/// Kinds of frames on the pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Configure,
    ConfigureResult,
    Log,
    ValueList,
    /// Sent by newer runners; logged and skipped
    Unknown(u32),
}

impl From<u32> for MessageType {
    fn from(v: u32) -> Self {
        match v {
            1 => MessageType::Configure,
            2 => MessageType::ConfigureResult,
            3 => MessageType::Log,
            100 => MessageType::ValueList,
            other => MessageType::Unknown(other),
        }
    }
}

impl From<MessageType> for u32 {
    fn from(t: MessageType) -> u32 {
        match t {
            MessageType::Configure => 1,
            MessageType::ConfigureResult => 2,
            MessageType::Log => 3,
            MessageType::ValueList => 100,
            MessageType::Unknown(other) => other,
        }
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(message_type: MessageType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            message_type,
            payload: payload.into(),
        }
    }

    /// Frame carrying a JSON payload
    pub fn json<T: Serialize>(message_type: MessageType, value: &T) -> Result<Self, AgentError> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| AgentError::Internal(format!("could not encode frame: {}", e)))?;
        Ok(Self::new(message_type, payload))
    }

    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, AgentError> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            AgentError::Internal(format!(
                "malformed {:?} payload: {}",
                self.message_type, e
            ))
        })
    }
}

/// Read the next frame. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, AgentError>
where
    R: AsyncRead + Unpin,
{
    let length = match reader.read_u32().await {
        Ok(n) => n,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(AgentError::io("reading frame length", e)),
    };
    if length > MAX_FRAME_SIZE {
        return Err(AgentError::Internal(format!(
            "frame of {} bytes exceeds the {} byte limit",
            length, MAX_FRAME_SIZE
        )));
    }

    let message_type = reader
        .read_u32()
        .await
        .map_err(|e| AgentError::io("reading frame type", e))?;

    let mut payload = vec![0u8; length as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| AgentError::io("reading frame payload", e))?;

    Ok(Some(Frame {
        message_type: message_type.into(),
        payload,
    }))
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), AgentError>
where
    W: AsyncWrite + Unpin,
{
    let length = u32::try_from(frame.payload.len())
        .ok()
        .filter(|n| *n <= MAX_FRAME_SIZE)
        .ok_or_else(|| AgentError::Internal("frame payload too large".to_string()))?;

    let mut buf = Vec::with_capacity(8 + frame.payload.len());
    buf.extend_from_slice(&length.to_be_bytes());
    buf.extend_from_slice(&u32::from(frame.message_type).to_be_bytes());
    buf.extend_from_slice(&frame.payload);

    writer
        .write_all(&buf)
        .await
        .map_err(|e| AgentError::io("writing frame", e))?;
    writer
        .flush()
        .await
        .map_err(|e| AgentError::io("flushing frame", e))
}

/// Payload of a `ConfigureResult` frame
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload of a `Log` frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub message: String,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub logger: String,
    #[serde(default)]
    pub source_path: String,
    #[serde(default)]
    pub lineno: u32,
    #[serde(default)]
    pub created: f64,
}

impl LogRecord {
    /// Re-emit the runner's log line through the agent's logger
    pub fn emit(&self, monitor_id: &str) {
        macro_rules! log_at {
            ($mac:ident) => {
                $mac!(
                    monitor_id = %monitor_id,
                    logger = %self.logger,
                    source = %format!("{}:{}", self.source_path, self.lineno),
                    "{}",
                    self.message
                )
            };
        }
        match self.level.to_ascii_uppercase().as_str() {
            "DEBUG" => log_at!(debug),
            "WARNING" | "WARN" => log_at!(warn),
            "ERROR" | "CRITICAL" => log_at!(error),
            _ => log_at!(info),
        }
    }
}
