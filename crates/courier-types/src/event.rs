//! Events emitted by a channel to its subscribers.

use crate::error::ChannelError;
use crate::message::CanonicalMessage;
use serde::{Deserialize, Serialize};

/// Bot account the credential belongs to, as reported by the identity probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotIdentity {
    pub id: i64,
    pub username: String,
    pub display_name: String,
}

/// Discriminant used to key subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    Error,
    Message,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Connected => write!(f, "connected"),
            EventKind::Disconnected => write!(f, "disconnected"),
            EventKind::Error => write!(f, "error"),
            EventKind::Message => write!(f, "message"),
        }
    }
}

/// Something that happened on a channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The identity probe succeeded and ingestion started.
    Connected(BotIdentity),
    /// The session ended, with an optional reason.
    Disconnected(Option<String>),
    /// An asynchronous failure the caller could not otherwise observe.
    Error(ChannelError),
    /// A normalized inbound message that passed the allowlist.
    Message(Box<CanonicalMessage>),
}

impl ChannelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChannelEvent::Connected(_) => EventKind::Connected,
            ChannelEvent::Disconnected(_) => EventKind::Disconnected,
            ChannelEvent::Error(_) => EventKind::Error,
            ChannelEvent::Message(_) => EventKind::Message,
        }
    }
}
