//! Wire message types.
//!
//! Packets travel as camelCase JSON in both directions: over the WebSocket,
//! over the fanout bus and through the admin API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Packet
// ============================================================================

/// Delivery mode: `0` direct, `1` broadcast to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SendType {
    Direct,
    Broadcast,
}

impl From<SendType> for u8 {
    fn from(value: SendType) -> Self {
        match value {
            SendType::Direct => 0,
            SendType::Broadcast => 1,
        }
    }
}

impl TryFrom<u8> for SendType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SendType::Direct),
            1 => Ok(SendType::Broadcast),
            other => Err(format!("unknown sendType {}", other)),
        }
    }
}

/// Payload kind: `0` text, `1` image, `2` audio, `3` video, `4` location.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ContentType {
    #[default]
    Text,
    Image,
    Audio,
    Video,
    Location,
}

impl From<ContentType> for u8 {
    fn from(value: ContentType) -> Self {
        match value {
            ContentType::Text => 0,
            ContentType::Image => 1,
            ContentType::Audio => 2,
            ContentType::Video => 3,
            ContentType::Location => 4,
        }
    }
}

impl TryFrom<u8> for ContentType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ContentType::Text),
            1 => Ok(ContentType::Image),
            2 => Ok(ContentType::Audio),
            3 => Ok(ContentType::Video),
            4 => Ok(ContentType::Location),
            other => Err(format!("unknown contentType {}", other)),
        }
    }
}

/// A chat message.
///
/// `receiveId` is meaningful for direct packets, `chanName` for broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Packet {
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub receive_id: String,
    pub send_type: SendType,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default)]
    pub content: String,
    #[serde(default = "Utc::now")]
    pub send_date: DateTime<Utc>,
    #[serde(default)]
    pub chan_name: String,
}

impl Packet {
    /// Direct text packet stamped with the current time.
    pub fn direct(sender: &str, recipient: &str, content: &str) -> Self {
        Self {
            sender_id: sender.to_string(),
            receive_id: recipient.to_string(),
            send_type: SendType::Direct,
            content_type: ContentType::Text,
            content: content.to_string(),
            send_date: Utc::now(),
            chan_name: String::new(),
        }
    }

    /// Broadcast text packet stamped with the current time.
    pub fn broadcast(sender: &str, channel: &str, content: &str) -> Self {
        Self {
            sender_id: sender.to_string(),
            receive_id: String::new(),
            send_type: SendType::Broadcast,
            content_type: ContentType::Text,
            content: content.to_string(),
            send_date: Utc::now(),
            chan_name: channel.to_string(),
        }
    }

    /// Copy of this packet addressed to `recipient`.
    pub fn addressed_to(&self, recipient: &str) -> Self {
        Self {
            receive_id: recipient.to_string(),
            ..self.clone()
        }
    }
}

// ============================================================================
// Admin API Envelope
// ============================================================================

/// `code` is 0 on success and 1 on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResult {
    pub code: i32,
    pub message: String,
    pub data: Value,
}

impl ApiResult {
    pub fn ok(message: impl Into<String>, data: Value) -> Self {
        Self {
            code: 0,
            message: message.into(),
            data,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            code: 1,
            message: message.into(),
            data: Value::Object(Default::default()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}
