//! Message normalizer: Bot API payloads to `CanonicalMessage`.

use super::wire::{Message, PhotoSize, Update, UpdateKind};
use courier_types::config::ChannelConfig;
use courier_types::message::{Attachment, CanonicalMessage, MessageType};
use serde_json::json;
use std::collections::HashMap;
use tracing::debug;

/// Resolve the message type. Fields are tested in a fixed priority order,
/// first match wins, so a payload carrying several media fields always
/// resolves the same way.
pub fn resolve_message_type(msg: &Message) -> MessageType {
    if msg.photo.as_ref().is_some_and(|p| !p.is_empty()) {
        MessageType::Photo
    } else if msg.animation.is_some() {
        MessageType::Animation
    } else if msg.video.is_some() {
        MessageType::Video
    } else if msg.video_note.is_some() {
        MessageType::VideoNote
    } else if msg.voice.is_some() {
        MessageType::Voice
    } else if msg.audio.is_some() {
        MessageType::Audio
    } else if msg.sticker.is_some() {
        MessageType::Sticker
    } else if msg.document.is_some() {
        MessageType::Document
    } else if msg.contact.is_some() {
        MessageType::Contact
    } else if msg.location.is_some() {
        MessageType::Location
    } else {
        MessageType::Text
    }
}

/// Largest variant by declared byte size; ties keep the earlier one.
fn largest_photo(sizes: &[PhotoSize]) -> Option<&PhotoSize> {
    sizes.iter().fold(None, |best: Option<&PhotoSize>, candidate| match best {
        Some(b) if candidate.file_size.unwrap_or(0) <= b.file_size.unwrap_or(0) => Some(b),
        _ => Some(candidate),
    })
}

/// Extract file metadata for the resolved type. Contacts and locations carry
/// no file and yield `None`.
pub fn resolve_attachment(msg: &Message) -> Option<Attachment> {
    let kind = resolve_message_type(msg);
    match kind {
        MessageType::Photo => {
            let photo = largest_photo(msg.photo.as_deref()?)?;
            Some(Attachment {
                file_unique_id: photo.file_unique_id.clone(),
                file_size: photo.file_size,
                width: Some(photo.width),
                height: Some(photo.height),
                mime_type: Some("image/jpeg".to_string()),
                ..Attachment::new(kind, &photo.file_id)
            })
        }
        MessageType::Animation => {
            let a = msg.animation.as_ref()?;
            Some(Attachment {
                file_unique_id: a.file_unique_id.clone(),
                mime_type: a.mime_type.clone(),
                file_name: a.file_name.clone(),
                file_size: a.file_size,
                duration: a.duration,
                width: a.width,
                height: a.height,
                ..Attachment::new(kind, &a.file_id)
            })
        }
        MessageType::Video => {
            let v = msg.video.as_ref()?;
            Some(Attachment {
                file_unique_id: v.file_unique_id.clone(),
                mime_type: v.mime_type.clone(),
                file_name: v.file_name.clone(),
                file_size: v.file_size,
                duration: v.duration,
                width: v.width,
                height: v.height,
                ..Attachment::new(kind, &v.file_id)
            })
        }
        MessageType::VideoNote => {
            let v = msg.video_note.as_ref()?;
            Some(Attachment {
                file_unique_id: v.file_unique_id.clone(),
                mime_type: Some("video/mp4".to_string()),
                file_size: v.file_size,
                duration: v.duration,
                width: v.length,
                height: v.length,
                ..Attachment::new(kind, &v.file_id)
            })
        }
        MessageType::Voice => {
            let v = msg.voice.as_ref()?;
            Some(Attachment {
                file_unique_id: v.file_unique_id.clone(),
                mime_type: v.mime_type.clone().or_else(|| Some("audio/ogg".to_string())),
                file_size: v.file_size,
                duration: v.duration,
                ..Attachment::new(kind, &v.file_id)
            })
        }
        MessageType::Audio => {
            let a = msg.audio.as_ref()?;
            Some(Attachment {
                file_unique_id: a.file_unique_id.clone(),
                mime_type: a.mime_type.clone(),
                file_name: a.file_name.clone(),
                file_size: a.file_size,
                duration: a.duration,
                ..Attachment::new(kind, &a.file_id)
            })
        }
        MessageType::Sticker => {
            let s = msg.sticker.as_ref()?;
            let mime = if s.is_animated {
                "application/x-tgsticker"
            } else if s.is_video {
                "video/webm"
            } else {
                "image/webp"
            };
            Some(Attachment {
                file_unique_id: s.file_unique_id.clone(),
                mime_type: Some(mime.to_string()),
                file_size: s.file_size,
                width: s.width,
                height: s.height,
                ..Attachment::new(kind, &s.file_id)
            })
        }
        MessageType::Document => {
            let d = msg.document.as_ref()?;
            Some(Attachment {
                file_unique_id: d.file_unique_id.clone(),
                mime_type: d.mime_type.clone(),
                file_name: d.file_name.clone(),
                file_size: d.file_size,
                ..Attachment::new(kind, &d.file_id)
            })
        }
        MessageType::Contact | MessageType::Location | MessageType::Text => None,
    }
}

/// Sender id: the user, or for anonymous/channel posts the sending chat.
fn sender_id(msg: &Message) -> Option<i64> {
    msg.from
        .as_ref()
        .map(|u| u.id)
        .or_else(|| msg.sender_chat.as_ref().map(|c| c.id))
}

/// Allowlist check. An unset or empty allowlist admits everyone; otherwise
/// the sender must be listed, and a message with no sender is denied.
pub fn is_allowed(msg: &Message, config: &ChannelConfig) -> bool {
    if config.allows_everyone() {
        return true;
    }
    let allowed = config.allowed_sender_ids.as_deref().unwrap_or_default();
    sender_id(msg).is_some_and(|id| allowed.contains(&id))
}

fn sender_name(msg: &Message) -> String {
    if let Some(user) = &msg.from {
        let name = [Some(user.first_name.as_str()), user.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if !name.is_empty() {
            return name;
        }
        if let Some(username) = &user.username {
            return username.clone();
        }
    }
    msg.sender_chat
        .as_ref()
        .and_then(|c| c.title.clone())
        .unwrap_or_default()
}

/// Bot command at the start of the text: `/agent@mybot a b` → ("agent", ["a", "b"]).
fn parse_command(msg: &Message, text: &str) -> Option<(String, Vec<String>)> {
    let is_command = msg
        .entities
        .iter()
        .any(|e| e.kind == "bot_command" && e.offset == 0);
    if !is_command {
        return None;
    }
    let mut parts = text.splitn(2, char::is_whitespace);
    let head = parts.next()?.trim_start_matches('/');
    let name = head.split('@').next().unwrap_or(head);
    let args = parts
        .next()
        .map(|rest| rest.split_whitespace().map(String::from).collect())
        .unwrap_or_default();
    Some((name.to_string(), args))
}

/// Assemble the canonical record for one provider message.
pub fn convert(msg: &Message, kind: UpdateKind) -> CanonicalMessage {
    let message_type = resolve_message_type(msg);
    let content = msg
        .text
        .clone()
        .or_else(|| msg.caption.clone())
        .unwrap_or_default();

    let mut metadata: HashMap<String, serde_json::Value> = HashMap::new();
    metadata.insert("chat_type".to_string(), json!(msg.chat.kind));
    metadata.insert("chat_id".to_string(), json!(msg.chat.id));
    metadata.insert("message_id".to_string(), json!(msg.message_id));
    metadata.insert("update_kind".to_string(), json!(kind.as_str()));
    metadata.insert("forwarded".to_string(), json!(msg.is_forwarded()));
    metadata.insert("edited".to_string(), json!(kind.is_edit() || msg.edit_date.is_some()));
    if let Some(from) = &msg.from {
        metadata.insert("from_id".to_string(), json!(from.id));
        metadata.insert("is_bot".to_string(), json!(from.is_bot));
    }
    if let Some(origin) = &msg.forward_origin {
        metadata.insert("forward_origin".to_string(), origin.clone());
    }
    if let Some((name, args)) = msg.text.as_deref().and_then(|t| parse_command(msg, t)) {
        metadata.insert("command".to_string(), json!(name));
        metadata.insert("command_args".to_string(), json!(args));
    }
    if let Some(loc) = &msg.location {
        metadata.insert("latitude".to_string(), json!(loc.latitude));
        metadata.insert("longitude".to_string(), json!(loc.longitude));
    }
    if let Some(emoji) = msg.sticker.as_ref().and_then(|s| s.emoji.as_deref()) {
        metadata.insert("sticker_emoji".to_string(), json!(emoji));
    }
    if let Some(audio) = &msg.audio {
        if let Some(performer) = &audio.performer {
            metadata.insert("audio_performer".to_string(), json!(performer));
        }
        if let Some(title) = &audio.title {
            metadata.insert("audio_title".to_string(), json!(title));
        }
    }
    if let Some(contact) = &msg.contact {
        let name = match contact.last_name.as_deref() {
            Some(last) if !last.is_empty() => format!("{} {last}", contact.first_name),
            _ => contact.first_name.clone(),
        };
        metadata.insert("phone_number".to_string(), json!(contact.phone_number));
        metadata.insert("contact_name".to_string(), json!(name));
        if let Some(uid) = contact.user_id {
            metadata.insert("contact_user_id".to_string(), json!(uid));
        }
    }

    CanonicalMessage {
        id: msg.message_id.to_string(),
        channel_id: msg.chat.id.to_string(),
        message_type,
        sender_id: sender_id(msg).map(|id| id.to_string()).unwrap_or_default(),
        sender_name: sender_name(msg),
        sender_username: msg.from.as_ref().and_then(|u| u.username.clone()),
        content,
        attachments: resolve_attachment(msg).into_iter().collect(),
        reply_to_id: msg
            .reply_to_message
            .as_ref()
            .map(|r| r.message_id.to_string()),
        thread_id: msg.message_thread_id.map(|t| t.to_string()),
        timestamp: msg.date.saturating_mul(1000),
        is_group: msg.chat.is_group(),
        chat_title: msg.chat.title.clone(),
        metadata,
    }
}

/// Pick the message out of an update, apply the allowlist and convert.
///
/// Returns `None` for update kinds the adapter ignores and for senders the
/// allowlist rejects; neither is an error.
pub fn normalize_update(update: &Update, config: &ChannelConfig) -> Option<CanonicalMessage> {
    let (kind, msg) = update.message()?;
    if !is_allowed(msg, config) {
        debug!(
            update_id = update.update_id,
            sender = ?sender_id(msg),
            "Telegram: ignoring message from unlisted sender"
        );
        return None;
    }
    Some(convert(msg, kind))
}
