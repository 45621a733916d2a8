use rand::Rng as _;
use serde::Serialize;
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{sleep, Instant},
};

use crate::{
    consts::{
        LOG_PAYLOAD_CHARS, STREAM_CONNECT_TIMEOUT_SECS, STREAM_INACTIVITY_SECS,
        STREAM_MAX_RECONNECT_ATTEMPTS, STREAM_RECONNECT_BASE_SECS, STREAM_RECONNECT_JITTER_MS,
        STREAM_RECONNECT_MAX_SECS,
    },
    core::{truncate_message, unix_now_secs},
    diagnostics::StreamDiagnostics,
    protocol::{decode_message, StreamMessage},
    transport::Connector,
    Error, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    GivenUp,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::GivenUp => "given-up",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub connect_timeout: Duration,
    pub inactivity_window: Duration,
    pub max_reconnect_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(STREAM_CONNECT_TIMEOUT_SECS),
            inactivity_window: Duration::from_secs(STREAM_INACTIVITY_SECS),
            max_reconnect_attempts: STREAM_MAX_RECONNECT_ATTEMPTS,
            base_delay: Duration::from_secs(STREAM_RECONNECT_BASE_SECS),
            max_delay: Duration::from_secs(STREAM_RECONNECT_MAX_SECS),
            jitter: Duration::from_millis(STREAM_RECONNECT_JITTER_MS),
        }
    }
}

impl StreamConfig {
    /// Delay before reconnect attempt `attempt` (1-based), without jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        self.backoff_delay(attempt) + Duration::from_millis(extra)
    }
}

/// What the manager hands to its consumer, in transport order.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A transport opened. Nothing missed while disconnected is replayed.
    Connected,
    Message(StreamMessage),
    Error { message: String, terminal: bool },
}

struct RuntimeState {
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
    /// Bumped on every connect/disconnect. A task only writes state while its
    /// captured epoch is still current, so a late-exiting task cannot clobber
    /// its replacement or resurrect a disconnected manager.
    stream_epoch: u64,
    connection_state: ConnectionState,
    last_connected_at: Option<u64>,
    last_stream_event_at: Option<u64>,
    last_error: Option<String>,
    backoff_seconds: u64,
    reconnect_attempts: u32,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            stop_tx: None,
            task: None,
            stream_epoch: 0,
            connection_state: ConnectionState::Disconnected,
            last_connected_at: None,
            last_stream_event_at: None,
            last_error: None,
            backoff_seconds: 0,
            reconnect_attempts: 0,
        }
    }
}

impl RuntimeState {
    fn release(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Shared {
    config: StreamConfig,
    connector: Arc<dyn Connector>,
    runtime: Mutex<RuntimeState>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::UnboundedSender<StreamEvent>,
}

impl Shared {
    fn lock_runtime(&self) -> Result<MutexGuard<'_, RuntimeState>> {
        self.runtime
            .lock()
            .map_err(|_| Error::Poisoned("stream runtime"))
    }

    fn set_state_locked(&self, runtime: &mut RuntimeState, state: ConnectionState) {
        if runtime.connection_state != state {
            log::debug!("stream state {} -> {}", runtime.connection_state, state);
        }
        runtime.connection_state = state;
        self.state_tx.send_replace(state);
    }

    /// Runs `apply` only while `epoch` is current.
    fn with_current<R>(&self, epoch: u64, apply: impl FnOnce(&mut RuntimeState) -> R) -> Option<R> {
        let mut runtime = self.runtime.lock().ok()?;
        if runtime.stream_epoch != epoch {
            return None;
        }
        Some(apply(&mut runtime))
    }

    fn set_state(&self, epoch: u64, state: ConnectionState) -> bool {
        self.with_current(epoch, |runtime| self.set_state_locked(runtime, state))
            .is_some()
    }

    fn mark_connected(&self, epoch: u64) -> bool {
        self.with_current(epoch, |runtime| {
            let now = unix_now_secs();
            runtime.last_connected_at = Some(now);
            runtime.last_stream_event_at = Some(now);
            runtime.last_error = None;
            runtime.backoff_seconds = 0;
            self.set_state_locked(runtime, ConnectionState::Connected);
            let _ = self.events_tx.send(StreamEvent::Connected);
        })
        .is_some()
    }

    /// Decodes one frame and forwards it. Returns false for frames that did
    /// not parse; those neither count as liveness nor reach the consumer.
    fn handle_frame(&self, epoch: u64, text: &str) -> bool {
        let message = match decode_message(text) {
            Ok(message) => message,
            Err(error) => {
                log::warn!(
                    "stream decode failed: {error} payload={}",
                    truncate_message(text, LOG_PAYLOAD_CHARS)
                );
                return false;
            }
        };
        log::trace!("stream message type={} bytes={}", message.kind(), text.len());

        self.with_current(epoch, |runtime| {
            runtime.last_stream_event_at = Some(unix_now_secs());
            match &message {
                StreamMessage::ConnectionEstablished { user_id } => {
                    log::info!("stream established for user {user_id}");
                    runtime.reconnect_attempts = 0;
                    let _ = self.events_tx.send(StreamEvent::Message(message.clone()));
                }
                StreamMessage::Heartbeat => {}
                StreamMessage::Unknown => {
                    log::debug!(
                        "ignoring unknown stream message: {}",
                        truncate_message(text, LOG_PAYLOAD_CHARS)
                    );
                }
                StreamMessage::Error { message: reason } => {
                    log::warn!("server reported stream error: {reason}");
                    runtime.last_error = Some(truncate_message(reason, 300));
                    let _ = self.events_tx.send(StreamEvent::Error {
                        message: reason.clone(),
                        terminal: false,
                    });
                }
                _ => {
                    let _ = self.events_tx.send(StreamEvent::Message(message.clone()));
                }
            }
        });
        true
    }

    /// Records a failed session and returns the consecutive failure count.
    fn record_failure(&self, epoch: u64, failure: &str) -> Option<u32> {
        self.with_current(epoch, |runtime| {
            runtime.last_error = Some(truncate_message(failure, 300));
            runtime.reconnect_attempts = runtime.reconnect_attempts.saturating_add(1);
            runtime.reconnect_attempts
        })
    }

    fn schedule_retry(&self, epoch: u64, delay: Duration) -> bool {
        self.with_current(epoch, |runtime| {
            runtime.backoff_seconds = delay.as_secs();
            self.set_state_locked(runtime, ConnectionState::Reconnecting);
        })
        .is_some()
    }

    fn give_up(&self, epoch: u64, attempts: u32, failure: &str) {
        self.with_current(epoch, |runtime| {
            runtime.stop_tx = None;
            runtime.task = None;
            runtime.backoff_seconds = 0;
            self.set_state_locked(runtime, ConnectionState::GivenUp);
            let _ = self.events_tx.send(StreamEvent::Error {
                message: format!(
                    "Live updates unavailable after {attempts} failed attempts: {failure}"
                ),
                terminal: true,
            });
        });
    }

    fn finish(&self, epoch: u64) {
        self.with_current(epoch, |runtime| {
            runtime.stop_tx = None;
            runtime.task = None;
            runtime.backoff_seconds = 0;
            self.set_state_locked(runtime, ConnectionState::Disconnected);
        });
    }
}

/// Owns the single push connection of a session.
///
/// The transport lives inside one spawned task together with its backoff and
/// watchdog timers; `connect` and `disconnect` replace or cancel that task as
/// a unit, so no timer outlives the transport it belongs to.
pub struct StreamManager {
    shared: Arc<Shared>,
}

impl StreamManager {
    pub fn new(
        config: StreamConfig,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            config,
            connector,
            runtime: Mutex::new(RuntimeState::default()),
            state_tx,
            events_tx,
        });
        (Self { shared }, events_rx)
    }

    /// Starts a fresh connection, tearing down any existing one first.
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) -> Result<()> {
        let mut runtime = self.shared.lock_runtime()?;
        if runtime.stop_tx.is_some() || runtime.task.is_some() {
            log::debug!("connect requested while a stream is active, replacing it");
        }
        runtime.release();

        let (stop_tx, stop_rx) = watch::channel(false);
        runtime.stop_tx = Some(stop_tx);
        runtime.stream_epoch = runtime.stream_epoch.wrapping_add(1);
        runtime.reconnect_attempts = 0;
        runtime.backoff_seconds = 0;
        runtime.last_error = None;
        let epoch = runtime.stream_epoch;
        self.shared
            .set_state_locked(&mut runtime, ConnectionState::Connecting);

        let shared = Arc::clone(&self.shared);
        runtime.task = Some(tokio::spawn(run_stream_loop(shared, stop_rx, epoch)));
        Ok(())
    }

    /// Cancels any pending reconnect and releases the transport. Safe to call
    /// in every state.
    pub fn disconnect(&self) -> Result<()> {
        let mut runtime = self.shared.lock_runtime()?;
        runtime.release();
        runtime.stream_epoch = runtime.stream_epoch.wrapping_add(1);
        runtime.backoff_seconds = 0;
        self.shared
            .set_state_locked(&mut runtime, ConnectionState::Disconnected);
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn config(&self) -> &StreamConfig {
        &self.shared.config
    }

    pub fn diagnostics(&self) -> Result<StreamDiagnostics> {
        let runtime = self.shared.lock_runtime()?;
        Ok(StreamDiagnostics::capture(
            runtime.connection_state,
            runtime.last_connected_at,
            runtime.last_stream_event_at,
            runtime.last_error.clone(),
            runtime.backoff_seconds,
            runtime.reconnect_attempts,
        ))
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        if let Ok(mut runtime) = self.shared.runtime.lock() {
            runtime.release();
            runtime.stream_epoch = runtime.stream_epoch.wrapping_add(1);
        }
    }
}

enum SessionEnd {
    Stopped,
    Idle(Duration),
}

async fn run_stream_loop(shared: Arc<Shared>, mut stop_rx: watch::Receiver<bool>, epoch: u64) {
    log::debug!("stream task started epoch={epoch}");

    loop {
        if *stop_rx.borrow() || !shared.set_state(epoch, ConnectionState::Connecting) {
            break;
        }

        let failure = match stream_once(&shared, &mut stop_rx, epoch).await {
            Ok(SessionEnd::Stopped) => break,
            Ok(SessionEnd::Idle(idle)) => {
                format!("No stream activity for {}s, cycling connection", idle.as_secs())
            }
            Err(error) => error.to_string(),
        };
        if *stop_rx.borrow() {
            break;
        }

        let Some(attempt) = shared.record_failure(epoch, &failure) else {
            break;
        };
        let max_attempts = shared.config.max_reconnect_attempts;
        if attempt >= max_attempts {
            log::warn!("stream giving up after {attempt} consecutive failures: {failure}");
            shared.give_up(epoch, attempt, &failure);
            return;
        }

        let delay = shared.config.jittered_delay(attempt);
        if !shared.schedule_retry(epoch, delay) {
            break;
        }
        log::info!(
            "stream reconnect {attempt}/{max_attempts} in {}ms: {failure}",
            delay.as_millis()
        );
        tokio::select! {
            _ = stop_rx.changed() => break,
            _ = sleep(delay) => {}
        }
    }

    shared.finish(epoch);
    log::debug!("stream task finished epoch={epoch}");
}

async fn stream_once(
    shared: &Shared,
    stop_rx: &mut watch::Receiver<bool>,
    epoch: u64,
) -> Result<SessionEnd> {
    let connect_timeout = shared.config.connect_timeout;
    let opened = tokio::select! {
        _ = stop_rx.changed() => return Ok(SessionEnd::Stopped),
        opened = tokio::time::timeout(connect_timeout, shared.connector.open()) => opened,
    };
    let mut transport = opened.map_err(|_| Error::ConnectTimeout(connect_timeout.as_secs()))??;

    if !shared.mark_connected(epoch) {
        transport.close().await;
        return Ok(SessionEnd::Stopped);
    }

    let window = shared.config.inactivity_window;
    let mut last_activity = Instant::now();
    let watchdog = sleep(window);
    tokio::pin!(watchdog);

    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                transport.close().await;
                return Ok(SessionEnd::Stopped);
            }
            frame = transport.next_frame() => match frame {
                Some(Ok(text)) => {
                    if shared.handle_frame(epoch, &text) {
                        last_activity = Instant::now();
                        watchdog.as_mut().reset(last_activity + window);
                    }
                }
                Some(Err(error)) => return Err(error),
                None => return Err(Error::Transport("Stream ended unexpectedly".to_string())),
            },
            () = &mut watchdog => {
                log::warn!("stream silent for {}s, forcing reconnect", window.as_secs());
                transport.close().await;
                return Ok(SessionEnd::Idle(last_activity.elapsed()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_is_capped() {
        let config = StreamConfig {
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(30),
            ..StreamConfig::default()
        };
        let delays: Vec<u64> = (1..=6).map(|n| config.backoff_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![3, 6, 12, 24, 30, 30]);
        assert_eq!(config.backoff_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let config = StreamConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(1),
            jitter: Duration::from_millis(250),
            ..StreamConfig::default()
        };
        for _ in 0..50 {
            let delay = config.jittered_delay(1);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn given_up_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&ConnectionState::GivenUp).unwrap(),
            "\"given-up\""
        );
        assert_eq!(ConnectionState::GivenUp.to_string(), "given-up");
    }
}
