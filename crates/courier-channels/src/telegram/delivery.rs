//! Outbound delivery: text chunking with markup fallback, media routing.

use super::api::TelegramApi;
use super::wire::SentMessage;
use crate::chunker::{split_message, truncate_caption, TELEGRAM_CAPTION_LIMIT, TELEGRAM_MESSAGE_LIMIT};
use crate::formatter::{escape_html, markdown_to_telegram_html};
use crate::types::{MediaSource, OutboundMedia, SendOptions, TextFormat};
use courier_types::error::{ChannelError, ChannelResult};
use courier_types::message::MessageType;
use reqwest::multipart::{Form, Part};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Endpoint and upload field for a media kind. Unknown kinds go out as documents.
pub fn media_endpoint(kind: MessageType) -> (&'static str, &'static str) {
    match kind {
        MessageType::Photo => ("sendPhoto", "photo"),
        MessageType::Audio => ("sendAudio", "audio"),
        MessageType::Video => ("sendVideo", "video"),
        MessageType::Voice => ("sendVoice", "voice"),
        MessageType::Animation => ("sendAnimation", "animation"),
        MessageType::VideoNote => ("sendVideoNote", "video_note"),
        _ => ("sendDocument", "document"),
    }
}

/// Chat ids are numeric, or `@channelusername` for public channels.
pub fn chat_id_value(chat_id: &str) -> ChannelResult<Value> {
    let chat_id = chat_id.trim();
    if chat_id.starts_with('@') && chat_id.len() > 1 {
        return Ok(json!(chat_id));
    }
    chat_id
        .parse::<i64>()
        .map(|id| json!(id))
        .map_err(|_| ChannelError::InvalidInput(format!("invalid chat id: {chat_id:?}")))
}

fn chat_id_text(chat: &Value) -> String {
    match chat {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Caption text plus whether it should be sent with `parse_mode=HTML`.
#[derive(Debug, Clone)]
struct Caption {
    text: String,
    html: bool,
}

/// Sends text and media through the Bot API.
pub struct Delivery {
    api: Arc<TelegramApi>,
}

impl Delivery {
    pub fn new(api: Arc<TelegramApi>) -> Self {
        Self { api }
    }

    /// Send text, splitting at 4096 characters. Returns the id of the last
    /// message sent.
    pub async fn send_text(
        &self,
        chat_id: &str,
        text: &str,
        options: &SendOptions,
    ) -> ChannelResult<i64> {
        if text.trim().is_empty() {
            return Err(ChannelError::InvalidInput("text must not be empty".to_string()));
        }
        let chat = chat_id_value(chat_id)?;
        let html = options.format == TextFormat::Markdown;
        let body = if html {
            markdown_to_telegram_html(text)
        } else {
            text.to_string()
        };

        let chunks = split_message(&body, TELEGRAM_MESSAGE_LIMIT);
        let mut last_id = 0;
        for (i, chunk) in chunks.iter().enumerate() {
            let reply_to = if i == 0 { options.reply_to_message_id } else { None };
            last_id = self
                .send_chunk(&chat, chunk, html, reply_to, options)
                .await?;
        }
        debug!(chat_id, chunks = chunks.len(), "Telegram text delivered");
        Ok(last_id)
    }

    async fn send_chunk(
        &self,
        chat: &Value,
        chunk: &str,
        html: bool,
        reply_to: Option<i64>,
        options: &SendOptions,
    ) -> ChannelResult<i64> {
        let mut params = json!({ "chat_id": chat, "text": chunk });
        apply_options(&mut params, reply_to, options);
        if !html {
            let sent: SentMessage = self.api.call_method("sendMessage", &params, None).await?;
            return Ok(sent.message_id);
        }

        params["parse_mode"] = json!("HTML");
        match self
            .api
            .call_method::<SentMessage>("sendMessage", &params, None)
            .await
        {
            Ok(sent) => Ok(sent.message_id),
            Err(ChannelError::MarkupParse(reason)) => {
                warn!(chat_id = %chat, "Telegram rejected HTML ({reason}); retrying as plain text");
                let mut plain = json!({ "chat_id": chat, "text": escape_html(chunk) });
                apply_options(&mut plain, reply_to, options);
                let sent: SentMessage = self.api.call_method("sendMessage", &plain, None).await?;
                Ok(sent.message_id)
            }
            Err(e) => Err(e),
        }
    }

    /// Send one media item to the endpoint matching its kind.
    pub async fn send_media(
        &self,
        chat_id: &str,
        media: OutboundMedia,
        options: &SendOptions,
    ) -> ChannelResult<i64> {
        let chat = chat_id_value(chat_id)?;
        let (method, field) = media_endpoint(media.kind);

        // Video notes do not accept captions.
        let caption = match media.caption.as_deref() {
            Some(c) if !c.trim().is_empty() && media.kind != MessageType::VideoNote => {
                let c = truncate_caption(c, TELEGRAM_CAPTION_LIMIT);
                Some(match options.format {
                    TextFormat::Markdown => Caption {
                        text: markdown_to_telegram_html(&c),
                        html: true,
                    },
                    TextFormat::Plain => Caption { text: c, html: false },
                })
            }
            _ => None,
        };

        debug!(chat_id, method, kind = %media.kind, "Telegram media delivery");
        match self
            .post_media(method, field, &chat, &media.source, caption.as_ref(), options)
            .await
        {
            Ok(sent) => Ok(sent.message_id),
            Err(ChannelError::MarkupParse(reason)) => {
                warn!(chat_id, method, "Telegram rejected caption HTML ({reason}); retrying as plain text");
                let plain = caption.map(|c| Caption {
                    text: escape_html(&c.text),
                    html: false,
                });
                let sent = self
                    .post_media(method, field, &chat, &media.source, plain.as_ref(), options)
                    .await?;
                Ok(sent.message_id)
            }
            Err(e) => Err(e),
        }
    }

    async fn post_media(
        &self,
        method: &str,
        field: &str,
        chat: &Value,
        source: &MediaSource,
        caption: Option<&Caption>,
        options: &SendOptions,
    ) -> ChannelResult<SentMessage> {
        match source {
            MediaSource::Remote(reference) => {
                let mut params = json!({ "chat_id": chat });
                params[field] = json!(reference);
                if let Some(c) = caption {
                    params["caption"] = json!(c.text);
                    if c.html {
                        params["parse_mode"] = json!("HTML");
                    }
                }
                apply_options(&mut params, options.reply_to_message_id, options);
                self.api.call_method(method, &params, None).await
            }
            MediaSource::Bytes { data, file_name } => {
                let part = Part::bytes(data.to_vec()).file_name(file_name.clone());
                let mut form = Form::new()
                    .text("chat_id", chat_id_text(chat))
                    .part(field.to_string(), part);
                if let Some(c) = caption {
                    form = form.text("caption", c.text.clone());
                    if c.html {
                        form = form.text("parse_mode", "HTML");
                    }
                }
                if let Some(id) = options.reply_to_message_id {
                    form = form.text("reply_to_message_id", id.to_string());
                }
                if let Some(id) = options.message_thread_id {
                    form = form.text("message_thread_id", id.to_string());
                }
                if options.disable_notification {
                    form = form.text("disable_notification", "true");
                }
                self.api.send_multipart(method, form).await
            }
        }
    }

    /// Show the "typing…" indicator.
    pub async fn send_typing(&self, chat_id: &str) -> ChannelResult<()> {
        let chat = chat_id_value(chat_id)?;
        self.api.send_chat_action(&chat, "typing").await
    }
}

fn apply_options(params: &mut Value, reply_to: Option<i64>, options: &SendOptions) {
    if let Some(id) = reply_to {
        params["reply_to_message_id"] = json!(id);
    }
    if let Some(id) = options.message_thread_id {
        params["message_thread_id"] = json!(id);
    }
    if options.disable_notification {
        params["disable_notification"] = json!(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_types::config::ChannelConfig;
    use httpmock::Method::POST;
    use httpmock::MockServer;

    const SENT: &str = r#"{"ok":true,"result":{"message_id":77,"date":1700000000,"chat":{"id":5,"type":"private"}}}"#;
    const MARKUP_REJECTED: &str = r#"{"ok":false,"error_code":400,"description":"Bad Request: can't parse entities: Unsupported start tag"}"#;

    fn delivery_for(server: &MockServer) -> Delivery {
        let config = ChannelConfig::new("123:test-token").with_api_base(server.base_url());
        Delivery::new(Arc::new(TelegramApi::new(&config)))
    }

    #[test]
    fn test_media_endpoint_routing() {
        assert_eq!(media_endpoint(MessageType::Photo), ("sendPhoto", "photo"));
        assert_eq!(media_endpoint(MessageType::VideoNote), ("sendVideoNote", "video_note"));
        assert_eq!(media_endpoint(MessageType::Voice), ("sendVoice", "voice"));
        assert_eq!(media_endpoint(MessageType::Document), ("sendDocument", "document"));
        // No dedicated upload endpoint: generic document.
        assert_eq!(media_endpoint(MessageType::Sticker), ("sendDocument", "document"));
        assert_eq!(media_endpoint(MessageType::Text), ("sendDocument", "document"));
    }

    #[test]
    fn test_chat_id_value() {
        assert_eq!(chat_id_value("123").unwrap(), json!(123));
        assert_eq!(chat_id_value("-100456").unwrap(), json!(-100456));
        assert_eq!(chat_id_value("@news").unwrap(), json!("@news"));
        assert!(matches!(chat_id_value("abc"), Err(ChannelError::InvalidInput(_))));
        assert!(matches!(chat_id_value("@"), Err(ChannelError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_send_text_formats_and_sets_options() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/bot123:test-token/sendMessage")
                .body_includes("\"text\":\"<b>hi</b>\"")
                .body_includes("\"parse_mode\":\"HTML\"")
                .body_includes("\"reply_to_message_id\":3")
                .body_includes("\"message_thread_id\":9");
            then.status(200).header("content-type", "application/json").body(SENT);
        });

        let id = delivery_for(&server)
            .send_text("5", "**hi**", &SendOptions::default().reply_to(3).in_thread(9))
            .await
            .unwrap();
        assert_eq!(id, 77);
        mock.assert();
    }

    #[tokio::test]
    async fn test_send_text_splits_long_messages() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST).path("/bot123:test-token/sendMessage");
            then.status(200).header("content-type", "application/json").body(SENT);
        });

        let text = format!("{}\n\n{}", "a".repeat(2400), "b".repeat(2598));
        delivery_for(&server)
            .send_text("5", &text, &SendOptions::plain())
            .await
            .unwrap();
        mock.assert_calls(2);
    }

    #[tokio::test]
    async fn test_plain_text_has_no_parse_mode() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/bot123:test-token/sendMessage")
                .body_includes("\"text\":\"**raw** <b>\"")
                .body_excludes("parse_mode");
            then.status(200).header("content-type", "application/json").body(SENT);
        });

        delivery_for(&server)
            .send_text("5", "**raw** <b>", &SendOptions::plain())
            .await
            .unwrap();
        mock.assert();
    }

    #[tokio::test]
    async fn test_markup_rejection_retries_once_escaped() {
        let server = MockServer::start_async().await;
        let rich = server.mock(|when, then| {
            when.method(POST)
                .path("/bot123:test-token/sendMessage")
                .body_includes("\"parse_mode\":\"HTML\"");
            then.status(400)
                .header("content-type", "application/json")
                .body(MARKUP_REJECTED);
        });
        let plain = server.mock(|when, then| {
            when.method(POST)
                .path("/bot123:test-token/sendMessage")
                .body_excludes("parse_mode")
                .body_includes("&lt;b&gt;a&lt;/b&gt;");
            then.status(200).header("content-type", "application/json").body(SENT);
        });

        let id = delivery_for(&server)
            .send_text("5", "**a** <b", &SendOptions::default())
            .await
            .unwrap();
        assert_eq!(id, 77);
        rich.assert_calls(1);
        plain.assert_calls(1);
    }

    #[tokio::test]
    async fn test_other_errors_propagate() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST).path("/bot123:test-token/sendMessage");
            then.status(403)
                .header("content-type", "application/json")
                .body(r#"{"ok":false,"error_code":403,"description":"Forbidden: bot was blocked by the user"}"#);
        });

        let err = delivery_for(&server)
            .send_text("5", "hello", &SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::RemoteApi { status: 403, .. }));
        mock.assert_calls(1);
    }

    #[tokio::test]
    async fn test_empty_text_rejected() {
        let server = MockServer::start_async().await;
        let err = delivery_for(&server)
            .send_text("5", "  ", &SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_send_remote_photo_with_caption() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/bot123:test-token/sendPhoto")
                .body_includes("\"photo\":\"https://example.com/cat.jpg\"")
                .body_includes("\"caption\":\"<i>cat</i>\"")
                .body_includes("\"parse_mode\":\"HTML\"");
            then.status(200).header("content-type", "application/json").body(SENT);
        });

        let media = OutboundMedia::remote(MessageType::Photo, "https://example.com/cat.jpg")
            .with_caption("*cat*");
        let id = delivery_for(&server)
            .send_media("5", media, &SendOptions::default())
            .await
            .unwrap();
        assert_eq!(id, 77);
        mock.assert();
    }

    #[tokio::test]
    async fn test_send_bytes_as_multipart() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/bot123:test-token/sendDocument")
                .body_includes("name=\"document\"; filename=\"notes.txt\"")
                .body_includes("hello file")
                .body_includes("name=\"chat_id\"");
            then.status(200).header("content-type", "application/json").body(SENT);
        });

        let media = OutboundMedia::bytes(MessageType::Document, b"hello file".to_vec(), "notes.txt");
        delivery_for(&server)
            .send_media("5", media, &SendOptions::default())
            .await
            .unwrap();
        mock.assert();
    }

    #[tokio::test]
    async fn test_unknown_kind_falls_back_to_document() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/bot123:test-token/sendDocument")
                .body_includes("\"document\":\"FILEID\"");
            then.status(200).header("content-type", "application/json").body(SENT);
        });

        let media = OutboundMedia::remote(MessageType::Sticker, "FILEID");
        delivery_for(&server)
            .send_media("5", media, &SendOptions::default())
            .await
            .unwrap();
        mock.assert();
    }

    #[tokio::test]
    async fn test_video_note_drops_caption() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/bot123:test-token/sendVideoNote")
                .body_excludes("caption");
            then.status(200).header("content-type", "application/json").body(SENT);
        });

        let media = OutboundMedia::remote(MessageType::VideoNote, "VN").with_caption("ignored");
        delivery_for(&server)
            .send_media("5", media, &SendOptions::default())
            .await
            .unwrap();
        mock.assert();
    }

    #[tokio::test]
    async fn test_caption_markup_rejection_retries_plain() {
        let server = MockServer::start_async().await;
        let rich = server.mock(|when, then| {
            when.method(POST)
                .path("/bot123:test-token/sendAudio")
                .body_includes("\"parse_mode\":\"HTML\"");
            then.status(400)
                .header("content-type", "application/json")
                .body(MARKUP_REJECTED);
        });
        let plain = server.mock(|when, then| {
            when.method(POST)
                .path("/bot123:test-token/sendAudio")
                .body_excludes("parse_mode")
                .body_includes("&lt;b&gt;song&lt;/b&gt;");
            then.status(200).header("content-type", "application/json").body(SENT);
        });

        let media = OutboundMedia::remote(MessageType::Audio, "AUD").with_caption("**song**");
        delivery_for(&server)
            .send_media("5", media, &SendOptions::default())
            .await
            .unwrap();
        rich.assert_calls(1);
        plain.assert_calls(1);
    }
}
