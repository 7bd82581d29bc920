//! Channel configuration schema and validation.
//!
//! A `ChannelConfig` is supplied at connect time, validated before any
//! network call, and immutable for the lifetime of the session.

use crate::error::{ChannelError, ChannelResult};
use serde_json::Value;
use std::time::Duration;
use zeroize::Zeroizing;

/// Default server-side long-poll wait (seconds).
pub const DEFAULT_POLL_TIMEOUT_SECS: u64 = 30;
/// Largest long-poll wait the provider accepts (seconds).
pub const MAX_POLL_TIMEOUT_SECS: u64 = 50;
/// Default attachment download cap (20 MB, the provider's own bot download limit).
pub const DEFAULT_MAX_ATTACHMENT_BYTES: u64 = 20 * 1024 * 1024;
/// Default Bot API base URL.
pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";
/// Default first backoff delay after a failed poll (milliseconds).
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
/// Default backoff ceiling (milliseconds).
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 60_000;
/// Default timeout for non-polling API calls (seconds).
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Configuration for one channel session.
#[derive(Clone)]
pub struct ChannelConfig {
    /// SECURITY: Bot token is zeroized on drop.
    pub credential: Zeroizing<String>,
    /// Sender ids allowed to reach the host. `None` or empty = allow all.
    pub allowed_sender_ids: Option<Vec<i64>>,
    pub poll_timeout_seconds: u64,
    pub max_attachment_bytes: u64,
    pub api_base: String,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub request_timeout_seconds: u64,
}

impl std::fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("credential", &"<redacted>")
            .field("allowed_sender_ids", &self.allowed_sender_ids)
            .field("poll_timeout_seconds", &self.poll_timeout_seconds)
            .field("max_attachment_bytes", &self.max_attachment_bytes)
            .field("api_base", &self.api_base)
            .field("backoff_base_ms", &self.backoff_base_ms)
            .field("backoff_max_ms", &self.backoff_max_ms)
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .finish()
    }
}

impl ChannelConfig {
    /// Config with the given credential and every other field defaulted.
    pub fn new(credential: impl Into<String>) -> Self {
        Self {
            credential: Zeroizing::new(credential.into()),
            allowed_sender_ids: None,
            poll_timeout_seconds: DEFAULT_POLL_TIMEOUT_SECS,
            max_attachment_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
            api_base: DEFAULT_API_BASE.to_string(),
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            request_timeout_seconds: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }

    pub fn with_allowed_sender_ids(mut self, ids: Vec<i64>) -> Self {
        self.allowed_sender_ids = Some(ids);
        self
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn with_poll_timeout(mut self, seconds: u64) -> Self {
        self.poll_timeout_seconds = seconds;
        self
    }

    pub fn with_backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.backoff_base_ms = base_ms;
        self.backoff_max_ms = max_ms;
        self
    }

    pub fn with_max_attachment_bytes(mut self, bytes: u64) -> Self {
        self.max_attachment_bytes = bytes;
        self
    }

    /// Build a config from an untyped JSON object, validating its shape.
    ///
    /// Accepts both camelCase (`allowedSenderIds`) and snake_case
    /// (`allowed_sender_ids`) keys. Unknown keys are ignored.
    pub fn from_value(value: &Value) -> ChannelResult<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| invalid("configuration must be an object"))?;
        let field = |camel: &str, snake: &str| {
            obj.get(camel)
                .or_else(|| obj.get(snake))
                .filter(|v| !v.is_null())
        };

        let credential = match field("credential", "credential") {
            Some(Value::String(s)) => s.clone(),
            Some(_) => return Err(invalid("credential must be a string")),
            None => return Err(invalid("credential is required")),
        };
        let mut config = ChannelConfig::new(credential);

        if let Some(raw) = field("allowedSenderIds", "allowed_sender_ids") {
            let items = raw
                .as_array()
                .ok_or_else(|| invalid("allowedSenderIds must be an array of numeric ids"))?;
            let ids = items
                .iter()
                .map(|item| {
                    integral_id(item).ok_or_else(|| {
                        invalid(&format!("allowedSenderIds contains a non-numeric id: {item}"))
                    })
                })
                .collect::<ChannelResult<Vec<i64>>>()?;
            config.allowed_sender_ids = Some(ids);
        }
        if let Some(v) = field("pollTimeoutSeconds", "poll_timeout_seconds") {
            config.poll_timeout_seconds = unsigned(v, "pollTimeoutSeconds")?;
        }
        if let Some(v) = field("maxAttachmentBytes", "max_attachment_bytes") {
            config.max_attachment_bytes = unsigned(v, "maxAttachmentBytes")?;
        }
        if let Some(v) = field("apiBase", "api_base") {
            config.api_base = v
                .as_str()
                .ok_or_else(|| invalid("apiBase must be a string"))?
                .to_string();
        }
        if let Some(v) = field("backoffBaseMs", "backoff_base_ms") {
            config.backoff_base_ms = unsigned(v, "backoffBaseMs")?;
        }
        if let Some(v) = field("backoffMaxMs", "backoff_max_ms") {
            config.backoff_max_ms = unsigned(v, "backoffMaxMs")?;
        }
        if let Some(v) = field("requestTimeoutSeconds", "request_timeout_seconds") {
            config.request_timeout_seconds = unsigned(v, "requestTimeoutSeconds")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check field ranges. Called by `connect` before any network traffic.
    pub fn validate(&self) -> ChannelResult<()> {
        let token = self.credential.trim();
        if token.is_empty() {
            return Err(invalid("credential is required"));
        }
        // The token is interpolated into request paths.
        if token.contains(['/', '?', '#']) || token.chars().any(char::is_whitespace) {
            return Err(invalid("credential contains characters not allowed in a bot token"));
        }
        if self.poll_timeout_seconds > MAX_POLL_TIMEOUT_SECS {
            return Err(invalid(&format!(
                "pollTimeoutSeconds must be at most {MAX_POLL_TIMEOUT_SECS}"
            )));
        }
        if self.max_attachment_bytes == 0 {
            return Err(invalid("maxAttachmentBytes must be greater than zero"));
        }
        if !(self.api_base.starts_with("http://") || self.api_base.starts_with("https://")) {
            return Err(invalid("apiBase must be an http(s) URL"));
        }
        if self.backoff_base_ms == 0 || self.backoff_max_ms < self.backoff_base_ms {
            return Err(invalid(
                "backoffBaseMs must be positive and not exceed backoffMaxMs",
            ));
        }
        if self.request_timeout_seconds == 0 {
            return Err(invalid("requestTimeoutSeconds must be greater than zero"));
        }
        Ok(())
    }

    /// Whether the allowlist is unset or empty.
    pub fn allows_everyone(&self) -> bool {
        self.allowed_sender_ids
            .as_ref()
            .map_or(true, |ids| ids.is_empty())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

fn invalid(reason: &str) -> ChannelError {
    ChannelError::ConfigValidation(reason.to_string())
}

/// Accepts JSON integers and floats with no fractional part (`5.0`).
fn integral_id(value: &Value) -> Option<i64> {
    if let Some(i) = value.as_i64() {
        return Some(i);
    }
    let f = value.as_f64()?;
    if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

fn unsigned(value: &Value, name: &str) -> ChannelResult<u64> {
    integral_id(value)
        .and_then(|i| u64::try_from(i).ok())
        .ok_or_else(|| invalid(&format!("{name} must be a non-negative integer")))
}
