//! Protobuf messages for the trace ingest endpoint
//!
//! The span wire format is small and stable, so the messages are declared
//! directly with `prost` derives instead of being generated at build time.

use crate::models::{SpanAnnotation, SpanEndpoint, TraceSpan};
use prost::Message;

#[derive(Clone, PartialEq, Message)]
pub struct SpanList {
    #[prost(message, repeated, tag = "1")]
    pub spans: Vec<Span>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Span {
    #[prost(string, tag = "1")]
    pub trace_id: String,
    #[prost(string, tag = "2")]
    pub id: String,
    #[prost(string, optional, tag = "3")]
    pub parent_id: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub kind: Option<String>,
    #[prost(int64, optional, tag = "6")]
    pub timestamp: Option<i64>,
    #[prost(int64, optional, tag = "7")]
    pub duration: Option<i64>,
    #[prost(message, optional, tag = "8")]
    pub local_endpoint: Option<Endpoint>,
    #[prost(message, optional, tag = "9")]
    pub remote_endpoint: Option<Endpoint>,
    #[prost(message, repeated, tag = "10")]
    pub annotations: Vec<Annotation>,
    #[prost(map = "string, string", tag = "11")]
    pub tags: std::collections::HashMap<String, String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Endpoint {
    #[prost(string, optional, tag = "1")]
    pub service_name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub ipv4: Option<String>,
    #[prost(uint32, optional, tag = "3")]
    pub port: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Annotation {
    #[prost(int64, tag = "1")]
    pub timestamp: i64,
    #[prost(string, tag = "2")]
    pub value: String,
}

impl From<&SpanEndpoint> for Endpoint {
    fn from(ep: &SpanEndpoint) -> Self {
        Self {
            service_name: ep.service_name.clone(),
            ipv4: ep.ipv4.clone(),
            port: ep.port,
        }
    }
}

impl From<&SpanAnnotation> for Annotation {
    fn from(a: &SpanAnnotation) -> Self {
        Self {
            timestamp: a.timestamp,
            value: a.value.clone(),
        }
    }
}

impl From<TraceSpan> for Span {
    fn from(s: TraceSpan) -> Self {
        Self {
            local_endpoint: s.local_endpoint.as_ref().map(Endpoint::from),
            remote_endpoint: s.remote_endpoint.as_ref().map(Endpoint::from),
            annotations: s.annotations.iter().map(Annotation::from).collect(),
            trace_id: s.trace_id,
            id: s.id,
            parent_id: s.parent_id,
            name: s.name,
            kind: s.kind,
            timestamp: s.timestamp,
            duration: s.duration,
            tags: s.tags,
        }
    }
}

/// Encode spans as a `SpanList` body
pub fn encode_spans(spans: Vec<TraceSpan>) -> Vec<u8> {
    SpanList {
        spans: spans.into_iter().map(Span::from).collect(),
    }
    .encode_to_vec()
}
