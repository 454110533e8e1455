use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub mod logging;
pub mod validation;

pub use validation::{room_id_fits, ValidationError, MAX_ROOM_ID_CHARS};

// ============================================================================
// Chat Message
// ============================================================================

/// Kind of chat event carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Text,
    Join,
    Leave,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "TEXT",
            MessageType::Join => "JOIN",
            MessageType::Leave => "LEAVE",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The message that flows sender -> ingress -> broker -> subscribers -> store.
///
/// `message_id` is assigned once at creation and is the idempotency key for
/// every downstream stage. Field names on the wire are camelCase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub message_id: Uuid,
    pub user_id: String,
    pub username: String,
    /// Message body (1-500 chars)
    pub message: String,
    pub room_id: String,
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    /// Instance that accepted the message (stamped at ingress)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// Peer address of the sending connection (stamped at ingress)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
}

impl ChatMessage {
    /// Create a message with a fresh id and the current time.
    pub fn new(
        user_id: impl Into<String>,
        username: impl Into<String>,
        message: impl Into<String>,
        room_id: impl Into<String>,
        message_type: MessageType,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            user_id: user_id.into(),
            username: username.into(),
            message: message.into(),
            room_id: room_id.into(),
            message_type,
            timestamp: Utc::now(),
            server_id: None,
            client_ip: None,
        }
    }

    /// Parse an inbound text frame and run field validation.
    pub fn parse_validated(text: &str) -> Result<Self, ValidationError> {
        let message: ChatMessage = serde_json::from_str(text)?;
        message.validate()?;
        Ok(message)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validation::validate_message(self)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// ============================================================================
// Acknowledgment
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckStatus {
    Received,
}

/// Frame sent back on the originating connection once per accepted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckFrame {
    pub message_id: Uuid,
    pub status: AckStatus,
    pub timestamp: DateTime<Utc>,
}

impl AckFrame {
    pub fn received(message_id: Uuid) -> Self {
        Self {
            message_id,
            status: AckStatus::Received,
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// Inbound frame classification (send side)
// ============================================================================

/// A text frame received by a sender, demultiplexed by the presence of a
/// `status` field.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Acknowledgment for one of our pending sends
    Ack(AckFrame),
    /// Anything else: a room broadcast, kept raw
    Broadcast(String),
}

impl InboundFrame {
    pub fn classify(text: &str) -> serde_json::Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        if value.get("status").is_some() {
            Ok(InboundFrame::Ack(serde_json::from_value(value)?))
        } else {
            Ok(InboundFrame::Broadcast(text.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_shape() {
        let msg = ChatMessage::new("42", "alice01", "hello", "room7", MessageType::Text);
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["messageId"], msg.message_id.to_string());
        assert_eq!(value["userId"], "42");
        assert_eq!(value["roomId"], "room7");
        assert_eq!(value["messageType"], "TEXT");
        assert_eq!(value["message"], "hello");
        assert!(value.get("serverId").is_none());
        assert!(value.get("clientIp").is_none());
    }

    #[test]
    fn test_message_roundtrip_keeps_identity() {
        let mut msg = ChatMessage::new("7", "bob", "hi there", "room1", MessageType::Join);
        msg.server_id = Some("node-a".to_string());

        let parsed: ChatMessage = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_ack_frame_shape() {
        let id = Uuid::new_v4();
        let ack = AckFrame::received(id);
        let value: serde_json::Value = serde_json::to_value(&ack).unwrap();

        assert_eq!(value["messageId"], id.to_string());
        assert_eq!(value["status"], "RECEIVED");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_classify_ack() {
        let ack = AckFrame::received(Uuid::new_v4());
        let text = serde_json::to_string(&ack).unwrap();

        match InboundFrame::classify(&text).unwrap() {
            InboundFrame::Ack(parsed) => assert_eq!(parsed.message_id, ack.message_id),
            other => panic!("expected ack, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_broadcast() {
        let msg = ChatMessage::new("7", "bob", "hi", "room1", MessageType::Text);
        let text = msg.to_json().unwrap();

        assert_eq!(
            InboundFrame::classify(&text).unwrap(),
            InboundFrame::Broadcast(text.clone())
        );
    }

    #[test]
    fn test_classify_garbage() {
        assert!(InboundFrame::classify("not json").is_err());
    }
}
