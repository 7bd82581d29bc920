//! Long-poll ingestion loop.
//!
//! One background task repeatedly asks an [`UpdateSource`] for updates after
//! the current cursor and hands each one to an [`UpdateHandler`]. The cursor
//! is advanced *before* the handler runs, so a failing handler never causes
//! redelivery (at-most-once). Failures back off exponentially; provider
//! throttles wait exactly as long as asked; 401/409 stop the loop for good.

use super::api::TelegramApi;
use super::wire::Update;
use async_trait::async_trait;
use courier_types::config::ChannelConfig;
use courier_types::error::{ChannelError, ChannelResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Something that can be long-polled for updates.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Fetch updates with id >= `offset`, waiting server-side up to `timeout`.
    async fn fetch_updates(
        &self,
        offset: Option<i64>,
        timeout: Duration,
    ) -> ChannelResult<Vec<Update>>;
}

#[async_trait]
impl UpdateSource for TelegramApi {
    async fn fetch_updates(
        &self,
        offset: Option<i64>,
        timeout: Duration,
    ) -> ChannelResult<Vec<Update>> {
        self.get_updates(offset, timeout.as_secs()).await
    }
}

/// Receives every update the loop pulls.
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    /// Process one update. Errors are logged and never stop the loop.
    async fn handle(&self, update: Update) -> ChannelResult<()>;

    /// Called once when the loop stops on an unrecoverable error.
    async fn on_fatal(&self, err: ChannelError) {
        error!(error = %err, "Telegram polling stopped on fatal error");
    }
}

/// Timing parameters of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    pub poll_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl From<&ChannelConfig> for PollerConfig {
    fn from(config: &ChannelConfig) -> Self {
        Self {
            poll_timeout: config.poll_timeout(),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }
}

/// What the loop is doing right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PollPhase {
    #[default]
    Idle,
    Polling,
    Backoff,
    RateLimited,
    Stopped,
}

/// Observable loop state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollState {
    pub running: bool,
    /// Next update id to request; `None` until the first update arrives.
    pub offset: Option<i64>,
    /// Failures since the last successful fetch. Throttles are not counted.
    pub consecutive_errors: u32,
    pub phase: PollPhase,
}

impl PollState {
    /// Move the cursor past `update_id`. The cursor never goes backwards.
    pub fn advance(&mut self, update_id: i64) {
        let next = update_id.saturating_add(1);
        if self.offset.map_or(true, |cur| next > cur) {
            self.offset = Some(next);
        }
    }
}

/// Result of a finished loop.
#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome {
    pub state: PollState,
    /// Set when the loop ended on a fatal error rather than `stop()`.
    pub error: Option<ChannelError>,
}

/// `min(base * 2^(attempt-1), max)`; attempt 0 is treated as 1.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exp).min(max)
}

/// Fallback wait when a throttle response carries no usable duration.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Owns the background polling task.
pub struct Poller {
    source: Arc<dyn UpdateSource>,
    handler: Arc<dyn UpdateHandler>,
    config: PollerConfig,
    state: Arc<watch::Sender<PollState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<PollOutcome>>,
}

impl Poller {
    pub fn new(
        source: Arc<dyn UpdateSource>,
        handler: Arc<dyn UpdateHandler>,
        config: PollerConfig,
    ) -> Self {
        let (state, _) = watch::channel(PollState::default());
        Self {
            source,
            handler,
            config,
            state: Arc::new(state),
            shutdown_tx: None,
            task: None,
        }
    }

    /// Spawn the loop. Returns `false` (and does nothing) if it is already
    /// running. A restarted loop resumes from the last cursor.
    pub fn start(&mut self) -> bool {
        if self.task.as_ref().is_some_and(|t| !t.is_finished()) {
            return false;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.state.send_modify(|s| {
            s.running = true;
            s.consecutive_errors = 0;
            s.phase = PollPhase::Polling;
        });
        self.task = Some(tokio::spawn(run_loop(
            self.source.clone(),
            self.handler.clone(),
            self.config,
            self.state.clone(),
            shutdown_rx,
        )));
        self.shutdown_tx = Some(shutdown_tx);
        true
    }

    pub fn is_running(&self) -> bool {
        self.state.borrow().running
    }

    /// Snapshot of the loop state.
    pub fn state(&self) -> PollState {
        self.state.borrow().clone()
    }

    /// Watch state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<PollState> {
        self.state.subscribe()
    }

    /// Signal the loop and wait for it to exit. Interrupts an in-flight
    /// fetch and any backoff or throttle sleep. Returns `None` if the loop
    /// was never started (or already stopped).
    pub async fn stop(&mut self) -> Option<PollOutcome> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        let task = self.task.take()?;
        let outcome = match task.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!("Telegram polling task failed: {e}");
                None
            }
        };
        self.state.send_modify(|s| {
            s.running = false;
            s.phase = PollPhase::Stopped;
        });
        outcome
    }
}

/// Sleep for `duration` unless shutdown is signalled first.
/// Returns `false` when interrupted.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = shutdown.changed() => false,
    }
}

async fn run_loop(
    source: Arc<dyn UpdateSource>,
    handler: Arc<dyn UpdateHandler>,
    config: PollerConfig,
    state: Arc<watch::Sender<PollState>>,
    mut shutdown: watch::Receiver<bool>,
) -> PollOutcome {
    let mut fatal = None;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let offset = state.borrow().offset;
        state.send_modify(|s| s.phase = PollPhase::Polling);

        let result = tokio::select! {
            r = source.fetch_updates(offset, config.poll_timeout) => r,
            _ = shutdown.changed() => {
                debug!("Telegram polling interrupted by shutdown");
                break;
            }
        };

        match result {
            Ok(updates) => {
                state.send_modify(|s| s.consecutive_errors = 0);
                for update in updates {
                    let update_id = update.update_id;
                    state.send_modify(|s| s.advance(update_id));
                    if let Err(e) = handler.handle(update).await {
                        error!(update_id, error = %e, "Telegram update handler failed");
                    }
                }
            }
            Err(e) if e.is_fatal() => {
                match &e {
                    ChannelError::RemoteApi { status: 409, .. } => {
                        error!("Telegram 409 Conflict: another poller is using this token. Stopping.")
                    }
                    _ => error!("Telegram rejected the credential ({e}). Stopping."),
                }
                state.send_modify(|s| {
                    s.running = false;
                    s.phase = PollPhase::Stopped;
                });
                handler.on_fatal(e.clone()).await;
                fatal = Some(e);
                break;
            }
            Err(e) if e.is_rate_limited() => {
                let secs = e.retry_after().unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                warn!(retry_after = secs, "Telegram rate limited, retry after {secs}s");
                state.send_modify(|s| s.phase = PollPhase::RateLimited);
                if !sleep_or_shutdown(Duration::from_secs(secs), &mut shutdown).await {
                    break;
                }
            }
            Err(e) => {
                let mut attempt = 0;
                state.send_modify(|s| {
                    s.consecutive_errors = s.consecutive_errors.saturating_add(1);
                    s.phase = PollPhase::Backoff;
                    attempt = s.consecutive_errors;
                });
                let delay = backoff_delay(config.backoff_base, config.backoff_max, attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Telegram getUpdates failed, backing off"
                );
                if !sleep_or_shutdown(delay, &mut shutdown).await {
                    break;
                }
            }
        }
    }

    state.send_modify(|s| {
        s.running = false;
        s.phase = PollPhase::Stopped;
    });
    info!("Telegram polling loop stopped");
    PollOutcome {
        state: state.borrow().clone(),
        error: fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn update(id: i64) -> Update {
        serde_json::from_value(serde_json::json!({ "update_id": id })).unwrap()
    }

    fn transport() -> ChannelError {
        ChannelError::Transport("connection reset".to_string())
    }

    /// Replays a fixed script of fetch results, then blocks forever.
    struct ScriptedSource {
        script: Mutex<VecDeque<ChannelResult<Vec<Update>>>>,
        calls: Mutex<Vec<(Instant, Option<i64>)>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<ChannelResult<Vec<Update>>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn offsets(&self) -> Vec<Option<i64>> {
            self.calls.lock().unwrap().iter().map(|(_, o)| *o).collect()
        }

        fn gaps_ms(&self) -> Vec<u128> {
            let calls = self.calls.lock().unwrap();
            calls
                .windows(2)
                .map(|w| (w[1].0 - w[0].0).as_millis())
                .collect()
        }
    }

    #[async_trait]
    impl UpdateSource for ScriptedSource {
        async fn fetch_updates(
            &self,
            offset: Option<i64>,
            _timeout: Duration,
        ) -> ChannelResult<Vec<Update>> {
            self.calls.lock().unwrap().push((Instant::now(), offset));
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(result) => result,
                None => std::future::pending().await,
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<i64>>,
        fail_on: Option<i64>,
        fatal: Mutex<Option<ChannelError>>,
        running_at_fatal: Mutex<Option<bool>>,
        state: Mutex<Option<watch::Receiver<PollState>>>,
    }

    #[async_trait]
    impl UpdateHandler for Recorder {
        async fn handle(&self, update: Update) -> ChannelResult<()> {
            self.seen.lock().unwrap().push(update.update_id);
            if self.fail_on == Some(update.update_id) {
                return Err(ChannelError::InvalidInput("boom".to_string()));
            }
            Ok(())
        }

        async fn on_fatal(&self, err: ChannelError) {
            let running = self
                .state
                .lock()
                .unwrap()
                .as_ref()
                .map(|rx| rx.borrow().running);
            *self.running_at_fatal.lock().unwrap() = running;
            *self.fatal.lock().unwrap() = Some(err);
        }
    }

    fn config(base_ms: u64, max_ms: u64) -> PollerConfig {
        PollerConfig {
            poll_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_millis(base_ms),
            backoff_max: Duration::from_millis(max_ms),
        }
    }

    #[test]
    fn test_backoff_delay() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        assert_eq!(backoff_delay(base, max, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, max, 7), Duration::from_secs(60));
        assert_eq!(backoff_delay(base, max, 200), Duration::from_secs(60));
    }

    #[test]
    fn test_cursor_never_moves_backwards() {
        let mut state = PollState::default();
        state.advance(10);
        assert_eq!(state.offset, Some(11));
        state.advance(4);
        assert_eq!(state.offset, Some(11));
        state.advance(11);
        assert_eq!(state.offset, Some(12));
    }

    #[test]
    fn test_config_from_channel_config() {
        let cfg = PollerConfig::from(&ChannelConfig::new("1:a").with_backoff(250, 8000));
        assert_eq!(cfg.poll_timeout, Duration::from_secs(30));
        assert_eq!(cfg.backoff_base, Duration::from_millis(250));
        assert_eq!(cfg.backoff_max, Duration::from_millis(8000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_advances_past_failed_handler() {
        let source = ScriptedSource::new(vec![
            Ok(vec![update(5), update(6), update(9)]),
            Ok(vec![update(10)]),
        ]);
        let handler = Arc::new(Recorder {
            fail_on: Some(6),
            ..Default::default()
        });
        let mut poller = Poller::new(source.clone(), handler.clone(), config(1000, 60_000));
        assert!(poller.start());

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*handler.seen.lock().unwrap(), vec![5, 6, 9, 10]);
        assert_eq!(source.offsets(), vec![None, Some(10), Some(11)]);
        assert_eq!(poller.state().offset, Some(11));

        let outcome = poller.stop().await.unwrap();
        assert!(outcome.error.is_none());
        assert_eq!(outcome.state.offset, Some(11));
        assert!(!poller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_update_still_moves_cursor() {
        let source = ScriptedSource::new(vec![
            Ok(vec![Update::bare(5), update(6)]),
            Ok(vec![]),
        ]);
        let handler = Arc::new(Recorder::default());
        let mut poller = Poller::new(source.clone(), handler.clone(), config(1000, 60_000));
        poller.start();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*handler.seen.lock().unwrap(), vec![5, 6]);
        assert_eq!(source.offsets(), vec![None, Some(7), Some(7)]);
        assert_eq!(poller.state().consecutive_errors, 0);
        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_and_resets_after_success() {
        let source = ScriptedSource::new(vec![
            Err(transport()),
            Err(transport()),
            Err(transport()),
            Ok(vec![]),
            Err(transport()),
        ]);
        let handler = Arc::new(Recorder::default());
        let mut poller = Poller::new(source.clone(), handler, config(1000, 60_000));
        poller.start();

        tokio::time::sleep(Duration::from_secs(20)).await;

        assert_eq!(source.gaps_ms(), vec![1000, 2000, 4000, 0, 1000]);
        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_waits_retry_after_without_counting() {
        let source = ScriptedSource::new(vec![
            Err(transport()),
            Err(ChannelError::RemoteApi {
                status: 429,
                description: "Too Many Requests: retry after 5".to_string(),
                retry_after: Some(5),
            }),
            Err(transport()),
        ]);
        let handler = Arc::new(Recorder::default());
        let mut poller = Poller::new(source.clone(), handler, config(1000, 60_000));
        poller.start();

        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(source.gaps_ms(), vec![1000, 5000, 2000]);
        // Two transport failures; the throttle in between is not counted.
        assert_eq!(poller.state().consecutive_errors, 2);
        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_inflight_fetch() {
        let source = ScriptedSource::new(vec![]);
        let handler = Arc::new(Recorder::default());
        let mut poller = Poller::new(source.clone(), handler, config(1000, 60_000));
        poller.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(poller.is_running());
        assert_eq!(poller.state().phase, PollPhase::Polling);

        let started = Instant::now();
        let outcome = tokio::time::timeout(Duration::from_secs(1), poller.stop())
            .await
            .expect("stop should not wait for the long poll");
        assert!(outcome.is_some());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(poller.state().phase, PollPhase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_backoff_sleep() {
        let source = ScriptedSource::new(vec![Err(transport())]);
        let handler = Arc::new(Recorder::default());
        let mut poller = Poller::new(source.clone(), handler, config(60_000, 60_000));
        poller.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(poller.state().phase, PollPhase::Backoff);
        assert_eq!(poller.state().consecutive_errors, 1);

        let started = Instant::now();
        tokio::time::timeout(Duration::from_secs(1), poller.stop())
            .await
            .expect("stop should interrupt the backoff sleep");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(source.offsets().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_is_fatal() {
        let source = ScriptedSource::new(vec![Err(ChannelError::RemoteApi {
            status: 409,
            description: "Conflict: terminated by other getUpdates request".to_string(),
            retry_after: None,
        })]);
        let handler = Arc::new(Recorder::default());
        let mut poller = Poller::new(source.clone(), handler.clone(), config(1000, 60_000));
        *handler.state.lock().unwrap() = Some(poller.subscribe_state());
        poller.start();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(!poller.is_running());
        assert_eq!(source.offsets().len(), 1);
        assert!(handler.fatal.lock().unwrap().as_ref().is_some_and(|e| e.is_fatal()));
        // The loop already reports itself stopped when the handler hears of it.
        assert_eq!(*handler.running_at_fatal.lock().unwrap(), Some(false));

        let outcome = poller.stop().await.unwrap();
        assert!(matches!(
            outcome.error,
            Some(ChannelError::RemoteApi { status: 409, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let source = ScriptedSource::new(vec![]);
        let handler = Arc::new(Recorder::default());
        let mut poller = Poller::new(source.clone(), handler, config(1000, 60_000));
        assert!(poller.start());
        assert!(!poller.start());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.offsets().len(), 1);

        poller.stop().await;
        assert!(poller.stop().await.is_none());
    }
}
