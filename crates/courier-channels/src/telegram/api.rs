//! Bot API transport client.
//!
//! Stateless wrapper over `reqwest` for JSON method calls, multipart uploads
//! and size-guarded file downloads.

use super::wire::{ApiResponse, FileInfo, Update, User};
use bytes::Bytes;
use courier_types::config::ChannelConfig;
use courier_types::error::{ChannelError, ChannelResult};
use courier_types::event::BotIdentity;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Extra client-side time on top of the server-side long-poll wait, so the
/// provider always answers before our own timeout fires.
pub const LONG_POLL_BUFFER: Duration = Duration::from_secs(10);
/// Upper bound for a single file download.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);
/// Update kinds requested from `getUpdates`.
pub const ALLOWED_UPDATES: &[&str] = &["message", "edited_message", "channel_post"];
/// Longest slice of a non-JSON error body kept in an error message.
const MAX_ERROR_BODY_CHARS: usize = 200;

/// Telegram Bot API client.
pub struct TelegramApi {
    /// SECURITY: Bot token is zeroized on drop to prevent memory disclosure.
    token: Zeroizing<String>,
    api_base: String,
    client: reqwest::Client,
    request_timeout: Duration,
}

impl TelegramApi {
    /// Create a client from a validated channel config.
    pub fn new(config: &ChannelConfig) -> Self {
        Self {
            token: config.credential.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            request_timeout: config.request_timeout(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.token.as_str())
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{file_path}", self.api_base, self.token.as_str())
    }

    /// Invoke a Bot API method with a JSON body.
    ///
    /// `timeout_override` replaces the default per-call timeout (long polls
    /// need more than the default).
    pub async fn call_method<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &Value,
        timeout_override: Option<Duration>,
    ) -> ChannelResult<T> {
        let timeout = timeout_override.unwrap_or(self.request_timeout);
        debug!(method, timeout_ms = timeout.as_millis() as u64, "Telegram API call");
        let resp = self
            .client
            .post(self.method_url(method))
            .json(params)
            .timeout(timeout)
            .send()
            .await
            .map_err(transport_error)?;
        decode_response(method, resp).await
    }

    /// Invoke a Bot API method with a multipart body (file uploads).
    pub async fn send_multipart<T: DeserializeOwned>(
        &self,
        method: &str,
        form: reqwest::multipart::Form,
    ) -> ChannelResult<T> {
        debug!(method, "Telegram multipart API call");
        let resp = self
            .client
            .post(self.method_url(method))
            .multipart(form)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;
        decode_response(method, resp).await
    }

    /// Identity probe: fails fast on a bad credential.
    pub async fn get_me(&self) -> ChannelResult<BotIdentity> {
        let me: User = self
            .call_method("getMe", &serde_json::json!({}), None)
            .await?;
        let display_name = match me.last_name.as_deref() {
            Some(last) if !last.is_empty() => format!("{} {last}", me.first_name),
            _ => me.first_name.clone(),
        };
        Ok(BotIdentity {
            id: me.id,
            username: me.username.unwrap_or_else(|| "unknown".to_string()),
            display_name,
        })
    }

    /// Long-poll for updates after `offset`, letting the server hold the
    /// request for up to `timeout_secs`.
    ///
    /// Entries are decoded one at a time. One that does not match the schema
    /// comes back as [`Update::bare`] so the cursor still moves past it.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> ChannelResult<Vec<Update>> {
        let mut params = serde_json::json!({
            "timeout": timeout_secs,
            "allowed_updates": ALLOWED_UPDATES,
        });
        if let Some(off) = offset {
            params["offset"] = serde_json::json!(off);
        }
        let request_timeout = Duration::from_secs(timeout_secs) + LONG_POLL_BUFFER;
        let raw: Vec<Value> = self
            .call_method("getUpdates", &params, Some(request_timeout))
            .await?;
        Ok(raw.into_iter().filter_map(decode_update).collect())
    }

    /// Resolve a file id to a downloadable path.
    pub async fn get_file(&self, file_id: &str) -> ChannelResult<FileInfo> {
        self.call_method("getFile", &serde_json::json!({ "file_id": file_id }), None)
            .await
    }

    /// Show a chat action ("typing", "upload_photo", ...).
    pub async fn send_chat_action(&self, chat_id: &Value, action: &str) -> ChannelResult<()> {
        let _: bool = self
            .call_method(
                "sendChatAction",
                &serde_json::json!({ "chat_id": chat_id, "action": action }),
                None,
            )
            .await?;
        Ok(())
    }

    /// Download a file by its resolved path, refusing anything above `max_bytes`.
    ///
    /// The size is checked against the declared `Content-Length` before reading
    /// and against the bytes actually received while streaming, since the
    /// header may be missing or wrong.
    pub async fn download_file(&self, file_path: &str, max_bytes: Option<u64>) -> ChannelResult<Bytes> {
        validate_file_path(file_path)?;

        let resp = self
            .client
            .get(self.file_url(file_path))
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ChannelError::RemoteApi {
                status: status.as_u16(),
                description: format!("file download failed ({status})"),
                retry_after: None,
            });
        }

        if let (Some(limit), Some(declared)) = (max_bytes, resp.content_length()) {
            if declared > limit {
                warn!(declared, limit, "Refusing oversized download (declared length)");
                return Err(ChannelError::SizeLimit {
                    limit,
                    actual: declared,
                });
            }
        }

        collect_limited(resp.bytes_stream(), max_bytes).await
    }

    /// `getFile` followed by `download_file`.
    pub async fn download_attachment(&self, file_id: &str, max_bytes: Option<u64>) -> ChannelResult<Bytes> {
        let info = self.get_file(file_id).await?;
        if let (Some(limit), Some(declared)) = (max_bytes, info.file_size) {
            if declared > limit {
                return Err(ChannelError::SizeLimit {
                    limit,
                    actual: declared,
                });
            }
        }
        let path = info.file_path.ok_or_else(|| {
            ChannelError::InvalidInput(format!("file {file_id} has no downloadable path"))
        })?;
        self.download_file(&path, max_bytes).await
    }
}

/// Decode one `getUpdates` entry. Entries without a readable `update_id`
/// are dropped.
fn decode_update(raw: Value) -> Option<Update> {
    let update_id = raw.get("update_id").and_then(Value::as_i64);
    match serde_json::from_value::<Update>(raw) {
        Ok(update) => Some(update),
        Err(e) => {
            warn!(update_id = ?update_id, error = %e, "Skipping malformed Telegram update");
            update_id.map(Update::bare)
        }
    }
}

/// Reject paths that could escape the bot's file namespace.
fn validate_file_path(path: &str) -> ChannelResult<()> {
    let unsafe_path = path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path.contains("://")
        || path.split('/').any(|seg| seg == "..");
    if unsafe_path {
        return Err(ChannelError::InvalidInput(format!(
            "refusing unsafe file path: {path}"
        )));
    }
    Ok(())
}

/// Drain a byte stream, aborting as soon as the running total passes `limit`.
pub(crate) async fn collect_limited<S>(stream: S, limit: Option<u64>) -> ChannelResult<Bytes>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>>,
{
    let mut stream = std::pin::pin!(stream);
    let mut buf: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(transport_error)?;
        let total = (buf.len() + chunk.len()) as u64;
        if let Some(limit) = limit {
            if total > limit {
                warn!(received = total, limit, "Aborting oversized download (streamed length)");
                return Err(ChannelError::SizeLimit {
                    limit,
                    actual: total,
                });
            }
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buf))
}

/// Map a reqwest failure, making sure the token-bearing URL never leaks.
fn transport_error(e: reqwest::Error) -> ChannelError {
    if e.is_timeout() {
        return ChannelError::Transport("request timed out".to_string());
    }
    ChannelError::Transport(e.without_url().to_string())
}

async fn decode_response<T: DeserializeOwned>(
    method: &str,
    resp: reqwest::Response,
) -> ChannelResult<T> {
    let status = resp.status();
    let body = resp.text().await.map_err(transport_error)?;

    match serde_json::from_str::<ApiResponse<T>>(&body) {
        Ok(envelope) if envelope.ok => envelope.result.ok_or_else(|| {
            ChannelError::Serialization(format!("{method}: response has no result"))
        }),
        Ok(envelope) => Err(classify_failure(status.as_u16(), envelope)),
        Err(e) if status.is_success() => Err(ChannelError::Serialization(format!(
            "{method}: {e}"
        ))),
        Err(_) => Err(ChannelError::RemoteApi {
            status: status.as_u16(),
            description: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            retry_after: None,
        }),
    }
}

/// Turn an `ok: false` envelope into the error taxonomy.
fn classify_failure<T>(http_status: u16, envelope: ApiResponse<T>) -> ChannelError {
    let status = envelope.error_code.unwrap_or(http_status);
    let description = envelope
        .description
        .unwrap_or_else(|| "unknown error".to_string());
    let retry_after = envelope.parameters.and_then(|p| p.retry_after);

    if status == 400 && is_markup_rejection(&description) {
        return ChannelError::MarkupParse(description);
    }
    ChannelError::RemoteApi {
        status,
        description,
        retry_after,
    }
}

fn is_markup_rejection(description: &str) -> bool {
    let lower = description.to_ascii_lowercase();
    lower.contains("can't parse entities")
        || lower.contains("can't find end of")
        || lower.contains("unsupported start tag")
}
