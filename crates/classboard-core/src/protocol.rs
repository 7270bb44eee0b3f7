//! Relay wire protocol.
//!
//! Messages are JSON objects tagged by `type`:
//! ```json
//! { "type": "subscribe", "topic": "session-s1-main" }
//! { "type": "publish", "topic": "session-s1-main", "operation": { "operation_type": "undo", ... } }
//! { "type": "operation", "topic": "session-s1-main", "from": "<peer>", "operation": { ... } }
//! ```
//! Operations travel as opaque JSON so the relay forwards kinds it does not
//! know about; clients decode them into [`crate::Operation`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors decoding relay frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Empty topic")]
    EmptyTopic,
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Messages sent to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving operations published to a topic.
    Subscribe { topic: String },
    /// Stop receiving operations for a topic.
    Unsubscribe { topic: String },
    /// Publish an operation to every other subscriber of a topic.
    Publish {
        topic: String,
        operation: serde_json::Value,
    },
}

impl ClientMessage {
    /// Decode a client frame, rejecting empty topics.
    pub fn decode(text: &str) -> ProtocolResult<Self> {
        let msg: ClientMessage = serde_json::from_str(text)?;
        if msg.topic().is_empty() {
            return Err(ProtocolError::EmptyTopic);
        }
        Ok(msg)
    }

    pub fn topic(&self) -> &str {
        match self {
            ClientMessage::Subscribe { topic }
            | ClientMessage::Unsubscribe { topic }
            | ClientMessage::Publish { topic, .. } => topic,
        }
    }
}

/// Messages received from the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Subscription confirmed.
    Subscribed {
        topic: String,
        subscriber_count: usize,
    },
    Unsubscribed { topic: String },
    /// An operation published by another connection.
    Operation {
        topic: String,
        from: String,
        operation: serde_json::Value,
    },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_serialize() {
        let msg = ClientMessage::Subscribe { topic: "session-s1-main".to_string() };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"subscribe","topic":"session-s1-main"}"#);
    }

    #[test]
    fn test_client_message_decode() {
        let msg = ClientMessage::decode(r#"{"type":"publish","topic":"t","operation":{"operation_type":"undo"}}"#).unwrap();
        assert_eq!(msg.topic(), "t");

        assert!(matches!(
            ClientMessage::decode(r#"{"type":"subscribe","topic":""}"#),
            Err(ProtocolError::EmptyTopic)
        ));
        assert!(matches!(ClientMessage::decode("{"), Err(ProtocolError::Json(_))));
        assert!(ClientMessage::decode(r#"{"type":"shout","topic":"t"}"#).is_err());
    }

    #[test]
    fn test_server_message_deserialize() {
        let json = r#"{"type":"subscribed","topic":"t","subscriber_count":2}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            ServerMessage::Subscribed { topic: "t".to_string(), subscriber_count: 2 }
        );
    }

    #[test]
    fn test_operation_payload_is_opaque() {
        let json = r#"{"type":"operation","topic":"t","from":"p","operation":{"operation_type":"future_kind","x":1}}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        match msg {
            ServerMessage::Operation { operation, .. } => {
                assert_eq!(operation["operation_type"], "future_kind");
            }
            _ => panic!("Wrong message type"),
        }
    }
}
