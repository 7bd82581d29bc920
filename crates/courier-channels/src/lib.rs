//! Channel adapter layer for Courier.
//!
//! Converts Telegram Bot API traffic into unified `CanonicalMessage` events for
//! the host runtime, and delivers outbound text and media back to the provider.

pub mod chunker;
pub mod events;
pub mod formatter;
pub mod telegram;
pub mod types;

pub use telegram::TelegramChannel;
pub use types::{ChannelAdapter, MediaSource, OutboundMedia, SendOptions, TextFormat};
