use std::sync::{Arc, Mutex, MutexGuard};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    api::{NotificationApi, RestClient},
    badges::BadgeBoard,
    diagnostics::StreamDiagnostics,
    model::Category,
    settings::Settings,
    store::{NotificationStore, StoreConfig, StoreEvent},
    stream::{ConnectionState, StreamConfig, StreamEvent, StreamManager},
    transport::{connector_from_settings, Connector},
    Error, Result,
};

type EventReceiver = mpsc::UnboundedReceiver<StreamEvent>;

struct StreamPump {
    cancel: CancellationToken,
    task: JoinHandle<EventReceiver>,
}

#[derive(Default)]
struct Pumps {
    /// Parked here whenever no stream pump is running.
    events_rx: Option<EventReceiver>,
    stream: Option<StreamPump>,
    badges: Option<JoinHandle<()>>,
}

/// One signed-in user's live notification state.
pub struct LiveSession {
    store: Arc<NotificationStore>,
    badges: Arc<BadgeBoard>,
    manager: StreamManager,
    pumps: Mutex<Pumps>,
}

impl LiveSession {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let api: Arc<dyn NotificationApi> = Arc::new(RestClient::from_settings(settings)?);
        let connector: Arc<dyn Connector> = Arc::from(connector_from_settings(settings)?);
        Ok(Self::with_parts(
            api,
            connector,
            settings.stream_config(),
            settings.store_config(),
            &settings.badge_categories,
        ))
    }

    pub fn with_parts(
        api: Arc<dyn NotificationApi>,
        connector: Arc<dyn Connector>,
        stream_config: StreamConfig,
        store_config: StoreConfig,
        badge_categories: &[Category],
    ) -> Self {
        let (manager, events_rx) = StreamManager::new(stream_config, connector);
        Self {
            store: Arc::new(NotificationStore::new(api, store_config)),
            badges: Arc::new(BadgeBoard::new(badge_categories)),
            manager,
            pumps: Mutex::new(Pumps {
                events_rx: Some(events_rx),
                ..Pumps::default()
            }),
        }
    }

    pub fn store(&self) -> &Arc<NotificationStore> {
        &self.store
    }

    pub fn badges(&self) -> &Arc<BadgeBoard> {
        &self.badges
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.subscribe_state()
    }

    pub fn diagnostics(&self) -> Result<StreamDiagnostics> {
        self.manager.diagnostics()
    }

    fn lock_pumps(&self) -> Result<MutexGuard<'_, Pumps>> {
        self.pumps.lock().map_err(|_| Error::Poisoned("session pumps"))
    }

    /// Opens (or reopens) the push stream. Every successful open triggers a
    /// resync of the unread counter and badges, since nothing is replayed.
    pub fn connect_sse(&self) -> Result<()> {
        {
            let mut pumps = self.lock_pumps()?;
            if pumps.stream.is_none() {
                let events_rx = pumps
                    .events_rx
                    .take()
                    .ok_or_else(|| Error::Transport("stream events already consumed".to_string()))?;
                let cancel = CancellationToken::new();
                let task = tokio::spawn(pump_stream(
                    events_rx,
                    Arc::clone(&self.store),
                    Arc::clone(&self.badges),
                    cancel.clone(),
                ));
                pumps.stream = Some(StreamPump { cancel, task });
            }
            if pumps.badges.is_none() {
                let events = self.store.events();
                let task = tokio::spawn(Arc::clone(&self.badges).run(events, self.store.api()));
                pumps.badges = Some(task);
            }
        }
        self.manager.connect()
    }

    pub fn disconnect_sse(&self) -> Result<()> {
        self.manager.disconnect()?;
        self.store.cancel_fetches()?;
        self.badges.set_live(false)
    }

    /// Disconnects and forgets all cached state, e.g. on logout. The session
    /// can be connected again afterwards.
    pub async fn shutdown(&self) -> Result<()> {
        self.disconnect_sse()?;

        let (stream, badges) = {
            let mut pumps = self.lock_pumps()?;
            (pumps.stream.take(), pumps.badges.take())
        };
        if let Some(badges) = badges {
            badges.abort();
        }
        if let Some(StreamPump { cancel, task }) = stream {
            cancel.cancel();
            match task.await {
                Ok(mut events_rx) => {
                    let mut stale = 0usize;
                    while events_rx.try_recv().is_ok() {
                        stale += 1;
                    }
                    if stale > 0 {
                        log::debug!("dropped {stale} stream events queued before shutdown");
                    }
                    self.lock_pumps()?.events_rx = Some(events_rx);
                }
                Err(error) => log::error!("stream pump ended abnormally: {error}"),
            }
        }

        self.store.clear()?;
        self.badges.apply(&StoreEvent::Cleared)?;
        log::info!("live session shut down");
        Ok(())
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        if let Ok(mut pumps) = self.pumps.lock() {
            if let Some(stream) = pumps.stream.take() {
                stream.cancel.cancel();
                stream.task.abort();
            }
            if let Some(badges) = pumps.badges.take() {
                badges.abort();
            }
        }
    }
}

/// Feeds stream events into the store in arrival order. Hands the receiver
/// back when cancelled so a later connect can reuse it.
async fn pump_stream(
    mut events: EventReceiver,
    store: Arc<NotificationStore>,
    badges: Arc<BadgeBoard>,
    cancel: CancellationToken,
) -> EventReceiver {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            StreamEvent::Connected => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = resync(&store, &badges) => {}
                }
            }
            StreamEvent::Message(message) => {
                let kind = message.kind();
                if let Err(error) = store.apply_stream_message(message) {
                    log::warn!("failed to apply {kind} message: {error}");
                }
            }
            StreamEvent::Error { message, terminal } => {
                if terminal {
                    log::error!("{message}");
                    if let Err(error) = badges.set_live(false) {
                        log::warn!("failed to flag live updates unavailable: {error}");
                    }
                } else {
                    log::warn!("stream reported an error: {message}");
                }
            }
        }
    }
    events
}

async fn resync(store: &NotificationStore, badges: &BadgeBoard) {
    if let Err(error) = badges.set_live(true) {
        log::warn!("failed to flag live updates available: {error}");
    }
    match store.fetch_unread_count().await {
        Ok(count) => log::debug!("resynced unread count: {count}"),
        Err(error) => log::warn!("unread count resync failed: {error}"),
    }
    if let Err(error) = badges.refresh(store.api().as_ref()).await {
        log::warn!("badge resync failed: {error}");
    }
}
