//! Message types flowing through the pipeline.
//!
//! `DestinationMessage` is what arrives from upstream (already decoded).
//! `WrappedMessage` is what the input task publishes after assigning
//! per-stream indices.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::Reserved;

// =============================================================================
// Stream identity
// =============================================================================

/// Identity of a stream for the duration of a sync.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl StreamDescriptor {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(str::to_owned),
            name: name.to_owned(),
        }
    }
}

impl fmt::Display for StreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}.{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Parses `namespace.name` or a bare `name`. Only the first dot separates.
impl FromStr for StreamDescriptor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty stream name".to_string());
        }
        match s.split_once('.') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => {
                Ok(StreamDescriptor::new(Some(ns), name))
            }
            Some(_) => Err(format!("invalid stream descriptor: {s}")),
            None => Ok(StreamDescriptor::new(None, s)),
        }
    }
}

// =============================================================================
// Upstream messages
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationRecord {
    pub stream: StreamDescriptor,
    pub data: Value,
    #[serde(default)]
    pub emitted_at_ms: i64,
    /// Size of the record as serialized upstream; drives memory and batch accounting.
    #[serde(default)]
    pub serialized_size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamCheckpoint {
    pub stream: StreamDescriptor,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_record_count: Option<u64>,
    /// Records this destination routed for the stream since its previous checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_record_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalCheckpoint {
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_record_count: Option<u64>,
    #[serde(default)]
    pub per_stream_checkpoints: Vec<StreamCheckpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_record_count: Option<u64>,
}

/// A decoded message from the upstream source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DestinationMessage {
    Record(DestinationRecord),
    StreamComplete {
        stream: StreamDescriptor,
        #[serde(default)]
        emitted_at_ms: i64,
    },
    StreamIncomplete {
        stream: StreamDescriptor,
        #[serde(default)]
        emitted_at_ms: i64,
    },
    StreamCheckpoint(StreamCheckpoint),
    GlobalCheckpoint(GlobalCheckpoint),
}

impl DestinationMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            DestinationMessage::Record(_) => "record",
            DestinationMessage::StreamComplete { .. } => "stream complete",
            DestinationMessage::StreamIncomplete { .. } => "stream incomplete",
            DestinationMessage::StreamCheckpoint(_) => "stream checkpoint",
            DestinationMessage::GlobalCheckpoint(_) => "global checkpoint",
        }
    }

    /// The stream this message belongs to; `None` for global checkpoints.
    pub fn stream(&self) -> Option<&StreamDescriptor> {
        match self {
            DestinationMessage::Record(r) => Some(&r.stream),
            DestinationMessage::StreamComplete { stream, .. }
            | DestinationMessage::StreamIncomplete { stream, .. } => Some(stream),
            DestinationMessage::StreamCheckpoint(c) => Some(&c.stream),
            DestinationMessage::GlobalCheckpoint(_) => None,
        }
    }

    /// Bytes to reserve for this message while it is in flight.
    pub fn estimated_size_bytes(&self) -> u64 {
        match self {
            DestinationMessage::Record(r) => r.serialized_size_bytes,
            DestinationMessage::StreamComplete { .. }
            | DestinationMessage::StreamIncomplete { .. } => 0,
            DestinationMessage::StreamCheckpoint(c) => json_len(&c.payload),
            DestinationMessage::GlobalCheckpoint(g) => {
                json_len(&g.payload)
                    + g.per_stream_checkpoints
                        .iter()
                        .map(|c| json_len(&c.payload))
                        .sum::<u64>()
            }
        }
    }
}

fn json_len(value: &Value) -> u64 {
    serde_json::to_vec(value).map(|v| v.len() as u64).unwrap_or(0)
}

/// A checkpoint ready to be handed back to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointMessage {
    Stream(StreamCheckpoint),
    Global(GlobalCheckpoint),
}

// =============================================================================
// Indexed messages
// =============================================================================

/// A message after the input task assigned it a position.
///
/// Stream queues carry `Record` and `StreamComplete`; the checkpoint queue
/// carries the two checkpoint variants.
#[derive(Debug)]
pub enum WrappedMessage {
    Record {
        index: u64,
        size_bytes: u64,
        record: Reserved<DestinationRecord>,
    },
    /// Terminal marker. `index` is the stream's final record count.
    StreamComplete { index: u64 },
    StreamCheckpoint {
        index: u64,
        checkpoint: Reserved<StreamCheckpoint>,
    },
    GlobalCheckpoint {
        stream_indexes: Vec<(StreamDescriptor, u64)>,
        checkpoint: Reserved<GlobalCheckpoint>,
    },
}

impl WrappedMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WrappedMessage::Record { .. } => "record",
            WrappedMessage::StreamComplete { .. } => "stream complete",
            WrappedMessage::StreamCheckpoint { .. } => "stream checkpoint",
            WrappedMessage::GlobalCheckpoint { .. } => "global checkpoint",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_descriptor_display_and_parse() {
        let d: StreamDescriptor = "public.users".parse().unwrap();
        assert_eq!(d, StreamDescriptor::new(Some("public"), "users"));
        assert_eq!(d.to_string(), "public.users");

        let bare: StreamDescriptor = "events".parse().unwrap();
        assert_eq!(bare.namespace, None);
        assert_eq!(bare.to_string(), "events");

        assert!(".users".parse::<StreamDescriptor>().is_err());
        assert!("".parse::<StreamDescriptor>().is_err());
    }

    #[test]
    fn test_message_json_shape() {
        let line = r#"{"type":"RECORD","stream":{"name":"users"},"data":{"id":1},"serialized_size_bytes":8}"#;
        let msg: DestinationMessage = serde_json::from_str(line).unwrap();
        match &msg {
            DestinationMessage::Record(r) => {
                assert_eq!(r.stream.name, "users");
                assert_eq!(r.data, json!({"id": 1}));
                assert_eq!(r.emitted_at_ms, 0);
            }
            other => panic!("Expected record, got {:?}", other),
        }
        assert_eq!(msg.estimated_size_bytes(), 8);
        assert_eq!(msg.kind(), "record");

        let complete: DestinationMessage =
            serde_json::from_str(r#"{"type":"STREAM_COMPLETE","stream":{"name":"users"}}"#)
                .unwrap();
        assert_eq!(complete.estimated_size_bytes(), 0);
        assert_eq!(complete.stream().map(|s| s.name.as_str()), Some("users"));
    }

    #[test]
    fn test_checkpoint_size_estimate() {
        let msg = DestinationMessage::GlobalCheckpoint(GlobalCheckpoint {
            payload: json!({"cursor": 10}),
            source_record_count: None,
            per_stream_checkpoints: vec![StreamCheckpoint {
                stream: StreamDescriptor::new(None, "a"),
                payload: json!([1]),
                source_record_count: None,
                destination_record_count: None,
            }],
            destination_record_count: None,
        });
        assert_eq!(msg.stream(), None);
        // {"cursor":10} + [1]
        assert_eq!(msg.estimated_size_bytes(), 13 + 3);
    }
}
