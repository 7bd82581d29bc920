//! Telegram Bot API channel.
//!
//! Uses long-polling via `getUpdates` with exponential backoff on failures.
//! No external Telegram crate, just `reqwest`.

pub mod api;
pub mod delivery;
pub mod normalize;
pub mod poller;
pub mod wire;

use crate::events::{EventHandler, EventRegistry, HandlerError, Subscription};
use crate::types::{ChannelAdapter, OutboundMedia, SendOptions};
use api::TelegramApi;
use async_trait::async_trait;
use bytes::Bytes;
use courier_types::config::ChannelConfig;
use courier_types::error::{ChannelError, ChannelResult};
use courier_types::event::{BotIdentity, ChannelEvent, EventKind};
use courier_types::message::CanonicalMessage;
use delivery::Delivery;
use futures::Stream;
use poller::{PollState, Poller, PollerConfig, UpdateHandler};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};
use wire::Update;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Inbound messages in arrival order. Dropping the stream removes its
/// handler from the channel.
pub struct MessageStream {
    inner: UnboundedReceiverStream<CanonicalMessage>,
    subscription: Option<Subscription>,
}

impl Stream for MessageStream {
    type Item = CanonicalMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}

#[derive(Default)]
struct Session {
    state: ConnectionState,
    config: Option<ChannelConfig>,
    api: Option<Arc<TelegramApi>>,
    delivery: Option<Arc<Delivery>>,
    poller: Option<Poller>,
    identity: Option<BotIdentity>,
}

impl Session {
    /// A connected session whose poller stopped on a fatal error counts as
    /// disconnected.
    fn effective_state(&self) -> ConnectionState {
        match (self.state, &self.poller) {
            (ConnectionState::Connected, Some(poller)) if !poller.is_running() => {
                ConnectionState::Disconnected
            }
            (state, _) => state,
        }
    }

    /// Join a poller that already stopped on its own and reset the session.
    async fn reap_dead_poller(&mut self) {
        if self.state == ConnectionState::Connected
            && self.effective_state() == ConnectionState::Disconnected
        {
            if let Some(mut poller) = self.poller.take() {
                poller.stop().await;
            }
            *self = Session::default();
        }
    }
}

/// Normalizes polled updates and publishes them as `message` events.
struct ChannelUpdateHandler {
    config: ChannelConfig,
    events: Arc<EventRegistry>,
}

#[async_trait]
impl UpdateHandler for ChannelUpdateHandler {
    async fn handle(&self, update: Update) -> ChannelResult<()> {
        if let Some(msg) = normalize::normalize_update(&update, &self.config) {
            debug!(
                update_id = update.update_id,
                chat_id = %msg.channel_id,
                kind = %msg.message_type,
                "Telegram message received"
            );
            self.events.emit(&ChannelEvent::Message(Box::new(msg)));
        }
        Ok(())
    }

    async fn on_fatal(&self, err: ChannelError) {
        error!(error = %err, "Telegram ingestion stopped");
        self.events.emit(&ChannelEvent::Error(err));
    }
}

/// A Telegram bot session: ingestion, event fan-out and outbound delivery.
pub struct TelegramChannel {
    events: Arc<EventRegistry>,
    session: Mutex<Session>,
}

impl Default for TelegramChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl TelegramChannel {
    pub fn new() -> Self {
        Self {
            events: EventRegistry::new(),
            session: Mutex::new(Session::default()),
        }
    }

    /// Validate `config`, probe the credential with `getMe` and start polling.
    ///
    /// Config errors are returned before any network traffic.
    pub async fn connect(&self, config: ChannelConfig) -> ChannelResult<BotIdentity> {
        config.validate()?;

        let mut session = self.session.lock().await;
        session.reap_dead_poller().await;
        if session.state != ConnectionState::Disconnected {
            return Err(ChannelError::InvalidState(
                "channel is already connected".to_string(),
            ));
        }
        session.state = ConnectionState::Connecting;

        let api = Arc::new(TelegramApi::new(&config));
        let identity = match api.get_me().await {
            Ok(identity) => identity,
            Err(e) => {
                session.state = ConnectionState::Disconnected;
                warn!(error = %e, "Telegram identity probe failed");
                return Err(e);
            }
        };
        info!("Telegram bot @{} connected", identity.username);

        let handler = Arc::new(ChannelUpdateHandler {
            config: config.clone(),
            events: self.events.clone(),
        });
        let mut poller = Poller::new(api.clone(), handler, PollerConfig::from(&config));

        session.delivery = Some(Arc::new(Delivery::new(api.clone())));
        session.api = Some(api);
        session.identity = Some(identity.clone());
        session.config = Some(config);
        session.state = ConnectionState::Connected;
        self.events.emit(&ChannelEvent::Connected(identity.clone()));

        poller.start();
        session.poller = Some(poller);
        Ok(identity)
    }

    /// Stop polling, drop the transport and emit `disconnected`. A no-op when
    /// already disconnected.
    pub async fn disconnect(&self, reason: Option<String>) -> ChannelResult<()> {
        let mut session = self.session.lock().await;
        if session.state == ConnectionState::Disconnected {
            return Ok(());
        }
        if let Some(mut poller) = session.poller.take() {
            if let Some(outcome) = poller.stop().await {
                debug!(offset = ?outcome.state.offset, "Telegram poller stopped");
            }
        }
        *session = Session::default();
        drop(session);

        info!(reason = reason.as_deref().unwrap_or("none"), "Telegram channel disconnected");
        self.events.emit(&ChannelEvent::Disconnected(reason));
        Ok(())
    }

    /// Register a closure for events of `kind`.
    pub fn on<F>(&self, kind: EventKind, f: F) -> Subscription
    where
        F: Fn(&ChannelEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.events.on(kind, f)
    }

    /// Inbound messages as a stream. Messages queue until the consumer reads
    /// them; the stream does not end on disconnect.
    pub fn message_stream(&self) -> MessageStream {
        let (tx, rx) = mpsc::unbounded_channel::<CanonicalMessage>();
        let subscription = self.events.on(EventKind::Message, move |event| {
            if let ChannelEvent::Message(msg) = event {
                tx.send((**msg).clone())
                    .map_err(|e| format!("message stream: {e}"))?;
            }
            Ok(())
        });
        MessageStream {
            inner: UnboundedReceiverStream::new(rx),
            subscription: Some(subscription),
        }
    }

    /// Session state. Reports `Disconnected` once ingestion has stopped on a
    /// fatal error, even before `disconnect` is called.
    pub async fn state(&self) -> ConnectionState {
        self.session.lock().await.effective_state()
    }

    /// Ingestion loop state, if connected.
    pub async fn poll_state(&self) -> Option<PollState> {
        self.session.lock().await.poller.as_ref().map(Poller::state)
    }

    /// Identity reported by the last successful `connect`.
    pub async fn bot_identity(&self) -> Option<BotIdentity> {
        self.session.lock().await.identity.clone()
    }

    async fn delivery(&self) -> ChannelResult<Arc<Delivery>> {
        let session = self.session.lock().await;
        match (&session.effective_state(), &session.delivery) {
            (ConnectionState::Connected, Some(delivery)) => Ok(delivery.clone()),
            _ => Err(ChannelError::NotConnected),
        }
    }

    pub async fn send_text(
        &self,
        chat_id: &str,
        text: &str,
        options: &SendOptions,
    ) -> ChannelResult<i64> {
        self.delivery().await?.send_text(chat_id, text, options).await
    }

    pub async fn send_media(
        &self,
        chat_id: &str,
        media: OutboundMedia,
        options: &SendOptions,
    ) -> ChannelResult<i64> {
        self.delivery().await?.send_media(chat_id, media, options).await
    }

    pub async fn send_typing(&self, chat_id: &str) -> ChannelResult<()> {
        self.delivery().await?.send_typing(chat_id).await
    }

    /// Fetch an inbound attachment by file id, capped at the configured
    /// `max_attachment_bytes`.
    pub async fn download_attachment(&self, file_id: &str) -> ChannelResult<Bytes> {
        let (api, limit) = {
            let session = self.session.lock().await;
            match (&session.effective_state(), &session.api, &session.config) {
                (ConnectionState::Connected, Some(api), Some(config)) => {
                    (api.clone(), config.max_attachment_bytes)
                }
                _ => return Err(ChannelError::NotConnected),
            }
        };
        api.download_attachment(file_id, Some(limit)).await
    }
}

#[async_trait]
impl ChannelAdapter for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn connect(&self, config: ChannelConfig) -> ChannelResult<BotIdentity> {
        TelegramChannel::connect(self, config).await
    }

    async fn disconnect(&self, reason: Option<String>) -> ChannelResult<()> {
        TelegramChannel::disconnect(self, reason).await
    }

    async fn send_text(
        &self,
        chat_id: &str,
        text: &str,
        options: &SendOptions,
    ) -> ChannelResult<i64> {
        TelegramChannel::send_text(self, chat_id, text, options).await
    }

    async fn send_media(
        &self,
        chat_id: &str,
        media: OutboundMedia,
        options: &SendOptions,
    ) -> ChannelResult<i64> {
        TelegramChannel::send_media(self, chat_id, media, options).await
    }

    async fn send_typing(&self, chat_id: &str) -> ChannelResult<()> {
        TelegramChannel::send_typing(self, chat_id).await
    }

    fn subscribe(&self, kind: EventKind, handler: EventHandler) -> Subscription {
        self.events.subscribe(kind, handler)
    }
}
