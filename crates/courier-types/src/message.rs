//! Canonical message model handed to the host runtime.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind of content carried by an inbound or outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Photo,
    Audio,
    Video,
    Voice,
    VideoNote,
    Document,
    Sticker,
    Location,
    Contact,
    Animation,
}

impl MessageType {
    /// Wire name used in the canonical schema.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Photo => "photo",
            MessageType::Audio => "audio",
            MessageType::Video => "video",
            MessageType::Voice => "voice",
            MessageType::VideoNote => "video_note",
            MessageType::Document => "document",
            MessageType::Sticker => "sticker",
            MessageType::Location => "location",
            MessageType::Contact => "contact",
            MessageType::Animation => "animation",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "text" => Ok(MessageType::Text),
            "photo" | "image" => Ok(MessageType::Photo),
            "audio" => Ok(MessageType::Audio),
            "video" => Ok(MessageType::Video),
            "voice" => Ok(MessageType::Voice),
            "video_note" => Ok(MessageType::VideoNote),
            "document" | "file" => Ok(MessageType::Document),
            "sticker" => Ok(MessageType::Sticker),
            "location" => Ok(MessageType::Location),
            "contact" => Ok(MessageType::Contact),
            "animation" | "gif" => Ok(MessageType::Animation),
            other => Err(format!("unknown message type '{other}'")),
        }
    }
}

/// File metadata attached to an inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub message_type: MessageType,
    /// Opaque remote reference, resolvable later through the channel's download operation.
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_unique_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Declared size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    /// Duration in seconds (audio, video, voice, video notes, animations).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl Attachment {
    /// Attachment with only a type and a file reference set.
    pub fn new(message_type: MessageType, file_id: impl Into<String>) -> Self {
        Self {
            message_type,
            file_id: file_id.into(),
            file_unique_id: None,
            mime_type: None,
            file_name: None,
            file_size: None,
            duration: None,
            width: None,
            height: None,
        }
    }
}

/// Unified representation of an inbound chat message, independent of the
/// provider's wire format. Created once per inbound update and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalMessage {
    /// Provider message id.
    pub id: String,
    /// Chat the message arrived in; replies are addressed here.
    pub channel_id: String,
    pub message_type: MessageType,
    pub sender_id: String,
    pub sender_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
    /// Text body, or the media caption. Empty when neither is present.
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    /// Forum topic id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub is_group: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_title: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CanonicalMessage {
    /// Timestamp as a UTC date, if representable.
    pub fn received_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp_millis(self.timestamp)
    }

    /// Whether the message was forwarded from another chat or user.
    pub fn is_forwarded(&self) -> bool {
        self.metadata
            .get("forwarded")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Bot command name (without the leading slash), when the message is one.
    pub fn command(&self) -> Option<&str> {
        self.metadata.get("command").and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_serde_names() {
        let json = serde_json::to_string(&MessageType::VideoNote).unwrap();
        assert_eq!(json, "\"video_note\"");
        let back: MessageType = serde_json::from_str("\"animation\"").unwrap();
        assert_eq!(back, MessageType::Animation);
        assert_eq!(MessageType::VideoNote.to_string(), "video_note");
    }

    #[test]
    fn test_message_type_from_str_aliases() {
        assert_eq!("video-note".parse::<MessageType>(), Ok(MessageType::VideoNote));
        assert_eq!("GIF".parse::<MessageType>(), Ok(MessageType::Animation));
        assert!("hologram".parse::<MessageType>().is_err());
    }

    #[test]
    fn test_canonical_message_camel_case() {
        let mut metadata = HashMap::new();
        metadata.insert("forwarded".to_string(), serde_json::json!(true));
        metadata.insert("command".to_string(), serde_json::json!("start"));
        let msg = CanonicalMessage {
            id: "42".to_string(),
            channel_id: "-100".to_string(),
            message_type: MessageType::Photo,
            sender_id: "7".to_string(),
            sender_name: "Alice".to_string(),
            sender_username: None,
            content: "look".to_string(),
            attachments: vec![Attachment::new(MessageType::Photo, "AgAD")],
            reply_to_id: Some("41".to_string()),
            thread_id: None,
            timestamp: 1_700_000_000_000,
            is_group: true,
            chat_title: Some("Team".to_string()),
            metadata,
        };

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["channelId"], "-100");
        assert_eq!(value["messageType"], "photo");
        assert_eq!(value["replyToId"], "41");
        assert_eq!(value["attachments"][0]["fileId"], "AgAD");
        assert!(value.get("threadId").is_none());

        assert!(msg.is_forwarded());
        assert_eq!(msg.command(), Some("start"));
        assert_eq!(msg.received_at().unwrap().timestamp(), 1_700_000_000);
    }
}
