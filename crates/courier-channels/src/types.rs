//! Channel-agnostic adapter trait and outbound request types.

use crate::events::{EventHandler, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use courier_types::config::ChannelConfig;
use courier_types::error::ChannelResult;
use courier_types::event::{BotIdentity, EventKind};
use courier_types::message::MessageType;

/// How outbound text should be interpreted before delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TextFormat {
    /// Lightweight markdown, converted to the provider's rich text.
    #[default]
    Markdown,
    /// Sent verbatim with no markup flag.
    Plain,
}

/// Per-send options shared by text and media delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub format: TextFormat,
    /// Message to reply to (applied to the first chunk only).
    pub reply_to_message_id: Option<i64>,
    /// Forum topic to post into.
    pub message_thread_id: Option<i64>,
    pub disable_notification: bool,
}

impl SendOptions {
    pub fn plain() -> Self {
        Self {
            format: TextFormat::Plain,
            ..Default::default()
        }
    }

    pub fn reply_to(mut self, message_id: i64) -> Self {
        self.reply_to_message_id = Some(message_id);
        self
    }

    pub fn in_thread(mut self, thread_id: i64) -> Self {
        self.message_thread_id = Some(thread_id);
        self
    }
}

/// Where outbound media comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaSource {
    /// A provider file id or a public URL the provider fetches itself.
    Remote(String),
    /// Raw bytes uploaded as multipart.
    Bytes { data: Bytes, file_name: String },
}

/// A media item to deliver.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMedia {
    pub kind: MessageType,
    pub source: MediaSource,
    pub caption: Option<String>,
}

impl OutboundMedia {
    pub fn remote(kind: MessageType, reference: impl Into<String>) -> Self {
        Self {
            kind,
            source: MediaSource::Remote(reference.into()),
            caption: None,
        }
    }

    pub fn bytes(kind: MessageType, data: impl Into<Bytes>, file_name: impl Into<String>) -> Self {
        Self {
            kind,
            source: MediaSource::Bytes {
                data: data.into(),
                file_name: file_name.into(),
            },
            caption: None,
        }
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }
}

/// A bidirectional messaging channel the host runtime can drive.
///
/// Implementations own their transport and ingestion state; inbound traffic is
/// observed through `subscribe`.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Short identifier of the channel (e.g. "telegram").
    fn name(&self) -> &str;

    /// Validate the config, verify the credential and start ingestion.
    async fn connect(&self, config: ChannelConfig) -> ChannelResult<BotIdentity>;

    /// Stop ingestion and drop the transport.
    async fn disconnect(&self, reason: Option<String>) -> ChannelResult<()>;

    /// Send text, returning the id of the last message delivered.
    async fn send_text(&self, chat_id: &str, text: &str, options: &SendOptions)
        -> ChannelResult<i64>;

    /// Send one media item, returning the delivered message id.
    async fn send_media(
        &self,
        chat_id: &str,
        media: OutboundMedia,
        options: &SendOptions,
    ) -> ChannelResult<i64>;

    /// Show a typing indicator (default no-op).
    async fn send_typing(&self, _chat_id: &str) -> ChannelResult<()> {
        Ok(())
    }

    /// Register an event handler. Dropping the returned token does not
    /// unsubscribe; call `Subscription::unsubscribe`.
    fn subscribe(&self, kind: EventKind, handler: EventHandler) -> Subscription;
}
