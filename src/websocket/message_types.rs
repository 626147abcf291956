use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Message;

/// Kind of event carried by a frame or envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// Chat line, persisted and delivered to every member.
    Message,
    /// Read acknowledgement, only moves the sender's read cursor.
    Read,
    /// Local disconnect request, never published.
    Leave,
}

/// Inbound frame from the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFrame {
    pub message_type: MessageType,
    #[serde(default)]
    pub message: String,
}

/// Unit published on a group channel.
///
/// `message_id` is assigned once by the stamping gateway, so every persistence
/// consumer that sees the envelope writes the same row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub message_id: Uuid,
    pub message_type: MessageType,
    pub message: String,
    /// Unix seconds on the wire.
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub user_id: Uuid,
    pub conversation_id: Uuid,
}

impl Envelope {
    /// Stamp a client frame with its sender, conversation and server time.
    pub fn from_frame(frame: ClientFrame, user_id: Uuid, conversation_id: Uuid) -> Self {
        Self {
            // time ordered, breaks created_at ties within a second
            message_id: Uuid::now_v7(),
            message_type: frame.message_type,
            message: frame.message,
            timestamp: Utc::now(),
            user_id,
            conversation_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundItem {
    pub sender_id: Uuid,
    pub message: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    pub message_type: MessageType,
}

/// Batch written to a client: full history once after connect, then one item per
/// live message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundBatch {
    pub messages: Vec<OutboundItem>,
}

impl OutboundBatch {
    pub fn history(messages: &[Message]) -> Self {
        Self {
            messages: messages
                .iter()
                .map(|m| OutboundItem {
                    sender_id: m.sender_id,
                    message: m.body.clone(),
                    created_at: m.created_at,
                    message_type: MessageType::Message,
                })
                .collect(),
        }
    }

    pub fn single(envelope: &Envelope) -> Self {
        Self {
            messages: vec![OutboundItem {
                sender_id: envelope.user_id,
                message: envelope.message.clone(),
                created_at: envelope.timestamp,
                message_type: envelope.message_type,
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Error frame sent on an open connection (the connection stays open).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundError {
    pub error: ErrorBody,
}

impl OutboundError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }
}
