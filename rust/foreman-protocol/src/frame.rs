//! Envelope framing: `{ id, type, payload, timestamp }`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::message::{Message, MessageKind};

/// The raw wire envelope.
///
/// `payload` stays opaque here; [`Frame::decode`] resolves it into a typed
/// [`Message`] once the kind tag is known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Unique message id.
    pub id: String,
    /// Kind tag from the closed enumeration.
    #[serde(rename = "type")]
    pub kind: String,
    /// Kind-specific payload object.
    pub payload: serde_json::Value,
    /// Wall clock in epoch milliseconds.
    pub timestamp: i64,
}

/// A fully parsed inbound message.
#[derive(Debug, Clone)]
pub struct Inbound {
    /// Envelope id, used for idempotent downstream handling.
    pub id: String,
    /// Sender wall clock in epoch milliseconds.
    pub timestamp: i64,
    /// The validated payload.
    pub message: Message,
}

impl Frame {
    /// Build a fresh envelope with a server-generated id and timestamp.
    pub fn new(message: &Message) -> Result<Self, ProtocolError> {
        Self::with_id(Uuid::new_v4().to_string(), message)
    }

    /// Build an envelope with a caller-provided id (replays keep their id so
    /// downstream de-duplication keeps working).
    pub fn with_id(id: String, message: &Message) -> Result<Self, ProtocolError> {
        Ok(Self {
            id,
            kind: message.kind().as_str().to_string(),
            payload: message.to_payload()?,
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }

    /// Serialize the envelope to its wire form.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode {
            kind: self.kind.clone(),
            reason: e.to_string(),
        })
    }

    /// Parse and validate a wire frame.
    ///
    /// Distinguishes the failure modes the connection layer cares about:
    /// [`ProtocolError::Malformed`] for schema mismatches (drop the message,
    /// keep the connection) and [`ProtocolError::UnknownKind`] for tags
    /// outside the enumeration (report, keep the connection).
    pub fn decode(text: &str) -> Result<Inbound, ProtocolError> {
        let frame: Frame = serde_json::from_str(text)
            .map_err(|e| ProtocolError::malformed("envelope", e.to_string()))?;
        if frame.id.is_empty() {
            return Err(ProtocolError::malformed("envelope", "id must not be empty"));
        }
        let kind: MessageKind = frame.kind.parse()?;
        let message = Message::from_payload(kind, frame.payload)?;
        Ok(Inbound {
            id: frame.id,
            timestamp: frame.timestamp,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{HeartbeatPing, TaskStream};

    #[test]
    fn test_encode_decode_round_trip() {
        let frame = Frame::new(&Message::TaskStream(TaskStream {
            task_id: "t1".into(),
            delta: "Done.".into(),
            timestamp: 42,
        }))
        .unwrap();
        let text = frame.encode().unwrap();

        let inbound = Frame::decode(&text).unwrap();
        assert_eq!(inbound.id, frame.id);
        match inbound.message {
            Message::TaskStream(p) => {
                assert_eq!(p.task_id, "t1");
                assert_eq!(p.delta, "Done.");
            }
            other => panic!("unexpected message: {:?}", other.kind()),
        }
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let text = r#"{"id":"m1","type":"task_explode","payload":{},"timestamp":0}"#;
        let err = Frame::decode(text).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownKind { .. }));
    }

    #[test]
    fn test_decode_rejects_schema_mismatch() {
        // heartbeat_ping requires serverTime
        let text = r#"{"id":"m1","type":"heartbeat_ping","payload":{},"timestamp":0}"#;
        let err = Frame::decode(text).unwrap_err();
        match err {
            ProtocolError::Malformed { kind, .. } => assert_eq!(kind, "heartbeat_ping"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_decode_rejects_bad_envelope() {
        let err = Frame::decode("not json").unwrap_err();
        match err {
            ProtocolError::Malformed { kind, .. } => assert_eq!(kind, "envelope"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_frame_ids_are_unique() {
        let message = Message::HeartbeatPing(HeartbeatPing { server_time: 0 });
        let a = Frame::new(&message).unwrap();
        let b = Frame::new(&message).unwrap();
        assert_ne!(a.id, b.id);
    }
}
