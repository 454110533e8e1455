//! Inbound message field validation
//!
//! - `userId`: 1-6 digits, no leading zero
//! - `username`: 3-20 ASCII alphanumerics
//! - `message`: 1-500 characters
//! - `roomId`: required, at most 50 characters
//!
//! `messageId`, `timestamp` and `messageType` are enforced by deserialization.

use regex::Regex;
use thiserror::Error;

use crate::ChatMessage;

pub const MAX_BODY_CHARS: usize = 500;

/// Width of the stored `room_id` column
pub const MAX_ROOM_ID_CHARS: usize = 50;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid userId: {0}")]
    InvalidUserId(String),

    #[error("Invalid username: {0}")]
    InvalidUsername(String),

    #[error("Message length {0} outside 1..={MAX_BODY_CHARS}")]
    InvalidBodyLength(usize),

    #[error("roomId is required")]
    MissingRoom,

    #[error("roomId longer than {MAX_ROOM_ID_CHARS} characters: {0}")]
    InvalidRoomId(String),
}

fn user_id_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[1-9][0-9]{0,5}$").unwrap())
}

fn username_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9]{3,20}$").unwrap())
}

pub fn room_id_fits(room_id: &str) -> bool {
    room_id.chars().count() <= MAX_ROOM_ID_CHARS
}

pub fn validate_message(message: &ChatMessage) -> Result<(), ValidationError> {
    if !user_id_pattern().is_match(&message.user_id) {
        return Err(ValidationError::InvalidUserId(message.user_id.clone()));
    }

    if !username_pattern().is_match(&message.username) {
        return Err(ValidationError::InvalidUsername(message.username.clone()));
    }

    let body_chars = message.message.chars().count();
    if body_chars == 0 || body_chars > MAX_BODY_CHARS {
        return Err(ValidationError::InvalidBodyLength(body_chars));
    }

    if message.room_id.trim().is_empty() {
        return Err(ValidationError::MissingRoom);
    }
    if !room_id_fits(&message.room_id) {
        return Err(ValidationError::InvalidRoomId(message.room_id.clone()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageType;

    fn valid() -> ChatMessage {
        ChatMessage::new("123", "alice", "hello world", "room3", MessageType::Text)
    }

    #[test]
    fn test_valid_message_passes() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_user_id_rules() {
        for bad in ["", "0", "012", "1234567", "12a", "-5"] {
            let mut msg = valid();
            msg.user_id = bad.to_string();
            assert!(
                matches!(msg.validate(), Err(ValidationError::InvalidUserId(_))),
                "userId {:?} should be rejected",
                bad
            );
        }
        for good in ["1", "9", "100000", "999999"] {
            let mut msg = valid();
            msg.user_id = good.to_string();
            assert!(msg.validate().is_ok(), "userId {:?} should pass", good);
        }
    }

    #[test]
    fn test_username_rules() {
        for bad in ["ab", "with space", "under_score", "abcdefghijklmnopqrstu"] {
            let mut msg = valid();
            msg.username = bad.to_string();
            assert!(matches!(msg.validate(), Err(ValidationError::InvalidUsername(_))));
        }
    }

    #[test]
    fn test_body_length_counts_chars() {
        let mut msg = valid();
        msg.message = String::new();
        assert!(matches!(msg.validate(), Err(ValidationError::InvalidBodyLength(0))));

        msg.message = "é".repeat(MAX_BODY_CHARS);
        assert!(msg.validate().is_ok());

        msg.message = "x".repeat(MAX_BODY_CHARS + 1);
        assert!(matches!(msg.validate(), Err(ValidationError::InvalidBodyLength(501))));
    }

    #[test]
    fn test_missing_room() {
        let mut msg = valid();
        msg.room_id = " ".to_string();
        assert!(matches!(msg.validate(), Err(ValidationError::MissingRoom)));
    }

    #[test]
    fn test_room_id_bounded_by_column_width() {
        let mut msg = valid();
        msg.room_id = "r".repeat(MAX_ROOM_ID_CHARS);
        assert!(msg.validate().is_ok());

        msg.room_id = "r".repeat(MAX_ROOM_ID_CHARS + 10);
        assert!(matches!(msg.validate(), Err(ValidationError::InvalidRoomId(_))));
    }

    #[test]
    fn test_parse_validated_rejects_bad_type_and_timestamp() {
        let msg = valid();
        let mut value = serde_json::to_value(&msg).unwrap();
        value["messageType"] = "SHOUT".into();
        assert!(matches!(
            ChatMessage::parse_validated(&value.to_string()),
            Err(ValidationError::Malformed(_))
        ));

        let mut value = serde_json::to_value(&msg).unwrap();
        value["timestamp"] = "yesterday".into();
        assert!(matches!(
            ChatMessage::parse_validated(&value.to_string()),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_validated_accepts_iso_timestamp() {
        let text = r#"{
            "messageId": "6f1c2a56-8a5e-4a39-9a0b-0d7f5c1e2b3a",
            "userId": "55",
            "username": "carol",
            "message": "hey",
            "roomId": "room2",
            "messageType": "LEAVE",
            "timestamp": "2025-03-01T12:00:00Z"
        }"#;
        let msg = ChatMessage::parse_validated(text).unwrap();
        assert_eq!(msg.message_type, MessageType::Leave);
        assert_eq!(msg.room_id, "room2");
    }
}
