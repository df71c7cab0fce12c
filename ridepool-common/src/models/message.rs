// File: ridepool-common/src/models/message.rs

use std::fmt;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    File,
    Location,
    System,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Text => write!(f, "text"),
            MessageKind::Image => write!(f, "image"),
            MessageKind::File => write!(f, "file"),
            MessageKind::Location => write!(f, "location"),
            MessageKind::System => write!(f, "system"),
        }
    }
}

impl FromStr for MessageKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(MessageKind::Text),
            "image" => Ok(MessageKind::Image),
            "file" => Ok(MessageKind::File),
            "location" => Ok(MessageKind::Location),
            "system" => Ok(MessageKind::System),
            _ => Err(format!("Unknown message kind: {}", s)),
        }
    }
}

/// Descriptor for a stored attachment. The bytes themselves live behind the
/// backend's object storage; the core only carries the reference.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AttachmentRef {
    pub url: String,
    pub name: Option<String>,
    pub size_bytes: Option<i64>,
    pub mime_type: Option<String>,
    pub extra: Option<Value>,
}

/// Derived per-message status. Ordered: transitions only ever move forward.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageStatus::Sent => write!(f, "sent"),
            MessageStatus::Delivered => write!(f, "delivered"),
            MessageStatus::Read => write!(f, "read"),
        }
    }
}

/// Local lifecycle of an optimistic write. A failed send stays visible as
/// `Failed` so the user can retry or discard it explicitly.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub message_id: Uuid,
    pub room_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub kind: MessageKind,
    pub attachment: Option<AttachmentRef>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_edited: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

impl ChatMessage {
    /// Status derived from the delivery/read timestamps. `read_at` implies
    /// delivered even if no delivered timestamp was ever recorded.
    pub fn status(&self) -> MessageStatus {
        if self.read_at.is_some() {
            MessageStatus::Read
        } else if self.delivered_at.is_some() {
            MessageStatus::Delivered
        } else {
            MessageStatus::Sent
        }
    }
}

/// Payload for a send. The message id is generated client-side so the
/// optimistic local copy and the server-confirmed record share an identity.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NewMessage {
    pub message_id: Uuid,
    pub room_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub kind: MessageKind,
    pub attachment: Option<AttachmentRef>,
    pub created_at: DateTime<Utc>,
}

impl NewMessage {
    pub fn text(room_id: Uuid, sender_id: Uuid, content: &str) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            room_id,
            sender_id,
            content: content.to_string(),
            kind: MessageKind::Text,
            attachment: None,
            created_at: Utc::now(),
        }
    }

    pub fn into_message(self) -> ChatMessage {
        ChatMessage {
            message_id: self.message_id,
            room_id: self.room_id,
            sender_id: self.sender_id,
            content: self.content,
            kind: self.kind,
            attachment: self.attachment,
            created_at: self.created_at,
            edited_at: None,
            is_edited: false,
            delivered_at: None,
            read_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_derived_from_timestamps() {
        let mut msg = NewMessage::text(Uuid::new_v4(), Uuid::new_v4(), "hi").into_message();
        assert_eq!(msg.status(), MessageStatus::Sent);

        msg.delivered_at = Some(Utc::now());
        assert_eq!(msg.status(), MessageStatus::Delivered);

        msg.read_at = Some(Utc::now());
        assert_eq!(msg.status(), MessageStatus::Read);
    }

    #[test]
    fn read_without_delivered_still_reads_as_read() {
        let mut msg = NewMessage::text(Uuid::new_v4(), Uuid::new_v4(), "hi").into_message();
        msg.read_at = Some(Utc::now());
        assert_eq!(msg.status(), MessageStatus::Read);
    }

    #[test]
    fn status_ordering_is_monotonic() {
        assert!(MessageStatus::Sent < MessageStatus::Delivered);
        assert!(MessageStatus::Delivered < MessageStatus::Read);
    }

    #[test]
    fn message_kind_round_trips_through_strings() {
        for kind in [
            MessageKind::Text,
            MessageKind::Image,
            MessageKind::File,
            MessageKind::Location,
            MessageKind::System,
        ] {
            assert_eq!(kind.to_string().parse::<MessageKind>(), Ok(kind));
        }
        assert!("gif".parse::<MessageKind>().is_err());
    }
}
