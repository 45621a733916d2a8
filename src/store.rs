//! Process-wide notification cache.
//!
//! Three independent writers feed this store: page fetches against the REST
//! backend, the user's own mutations, and events pushed by the stream. They
//! all go through the operations below and converge on one state:
//!
//! - ids are unique across the loaded list; a record seen through any path is
//!   never inserted twice,
//! - `read` is monotonic: no fetch response or stream event can flip a record
//!   back to unread,
//! - the unread counter moves by exactly the number of unread->read
//!   transitions an operation caused, or is overwritten by an authoritative
//!   push, and never goes below zero.
//!
//! Readers get immutable [`StoreSnapshot`]s through a watch channel and a
//! broadcast of [`StoreEvent`]s; nothing outside this module mutates records.

use chrono::Utc;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{
    sync::{broadcast, watch},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    api::NotificationApi,
    consts::{
        DEFAULT_CACHE_LIMIT, DEFAULT_FRESHNESS_SECS, DEFAULT_PAGE_SIZE, STORE_EVENT_CAPACITY,
        TRACKED_IDS_PER_CACHED,
    },
    model::{
        Category, Notification, NotificationFilter, NotificationId, NotificationPage,
        NotificationPatch,
    },
    protocol::StreamMessage,
    Error, Result,
};

#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub page_size: u32,
    pub cache_limit: usize,
    pub freshness: Duration,
    /// Most off-list ids remembered; the oldest are forgotten first.
    pub tracked_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_limit: DEFAULT_CACHE_LIMIT,
            freshness: Duration::from_secs(DEFAULT_FRESHNESS_SECS),
            tracked_limit: DEFAULT_CACHE_LIMIT * TRACKED_IDS_PER_CACHED,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Added {
        id: NotificationId,
        category: Category,
        read: bool,
    },
    /// Confirmed unread->read transitions, one entry per record.
    ReadApplied { categories: Vec<Category> },
    UnreadCountSet(u64),
    PageLoaded { page: u32, reset: bool },
    Cleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Applied { page: u32, received: usize },
    CacheHit,
    Superseded,
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub notifications: Vec<Notification>,
    pub unread_count: u64,
    pub filter: NotificationFilter,
    pub page: u32,
    pub has_more: bool,
    pub total: Option<u64>,
    pub loading: bool,
    pub error: Option<String>,
}

/// A record the store has seen but does not hold in the visible list
/// (filtered out, evicted, replaced by a reset, or dismissed).
#[derive(Debug, Clone, Copy)]
struct Tracked {
    category: Category,
    read: bool,
    seq: u64,
}

struct StoreState {
    notifications: Vec<Notification>,
    tracked: HashMap<NotificationId, Tracked>,
    /// Insertion order of `tracked`; entries whose seq no longer matches are stale.
    tracked_order: VecDeque<(NotificationId, u64)>,
    tracked_seq: u64,
    tracked_limit: usize,
    unread_count: u64,
    filter: NotificationFilter,
    page: u32,
    has_more: bool,
    total: Option<u64>,
    loading: bool,
    error: Option<String>,
    generation: u64,
    /// Fetches of the current generation still awaiting a response.
    in_flight: usize,
    cancel: CancellationToken,
    last_fetched_at: Option<Instant>,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            notifications: Vec::new(),
            tracked: HashMap::new(),
            tracked_order: VecDeque::new(),
            tracked_seq: 0,
            tracked_limit: DEFAULT_CACHE_LIMIT * TRACKED_IDS_PER_CACHED,
            unread_count: 0,
            filter: NotificationFilter::default(),
            page: 0,
            has_more: false,
            total: None,
            loading: false,
            error: None,
            generation: 0,
            in_flight: 0,
            cancel: CancellationToken::new(),
            last_fetched_at: None,
        }
    }
}

impl StoreState {
    fn position(&self, id: NotificationId) -> Option<usize> {
        self.notifications.iter().position(|item| item.id == id)
    }

    fn knows(&self, id: NotificationId) -> bool {
        self.tracked.contains_key(&id) || self.position(id).is_some()
    }

    fn is_fresh(&self, page: u32, window: Duration) -> bool {
        page <= self.page
            && self
                .last_fetched_at
                .is_some_and(|at| at.elapsed() < window)
    }

    fn supersede(&mut self) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.generation = self.generation.wrapping_add(1);
        self.in_flight = 0;
    }

    fn retire(&mut self, notification: &Notification) {
        if let Some(tracked) = self.tracked.get_mut(&notification.id) {
            tracked.category = notification.category;
            tracked.read |= notification.read;
            return;
        }
        self.tracked_seq = self.tracked_seq.wrapping_add(1);
        let seq = self.tracked_seq;
        self.tracked.insert(
            notification.id,
            Tracked {
                category: notification.category,
                read: notification.read,
                seq,
            },
        );
        self.tracked_order.push_back((notification.id, seq));
        self.trim_tracked();
    }

    fn trim_tracked(&mut self) {
        let mut forgotten = 0usize;
        while self.tracked.len() > self.tracked_limit {
            let Some((id, seq)) = self.tracked_order.pop_front() else {
                break;
            };
            if self.tracked.get(&id).is_some_and(|tracked| tracked.seq == seq) {
                self.tracked.remove(&id);
                forgotten += 1;
            }
        }
        if forgotten > 0 {
            log::debug!("forgot {forgotten} off-list ids, limit {}", self.tracked_limit);
        }
        if self.tracked_order.len() > self.tracked_limit.saturating_mul(2) {
            let tracked = &self.tracked;
            self.tracked_order
                .retain(|(id, seq)| tracked.get(id).is_some_and(|entry| entry.seq == *seq));
        }
    }

    /// Flips every locally known, unread id to read. Returns the categories of
    /// the records that actually transitioned.
    fn flip_read(&mut self, ids: &[NotificationId]) -> Vec<Category> {
        let now = Utc::now();
        let mut seen = HashSet::with_capacity(ids.len());
        let mut transitioned = Vec::new();
        for id in ids {
            if !seen.insert(*id) {
                continue;
            }
            if let Some(pos) = self.position(*id) {
                let item = &mut self.notifications[pos];
                if item.mark_read_at(now) {
                    transitioned.push(item.category);
                }
            } else if let Some(tracked) = self.tracked.get_mut(id) {
                if !tracked.read {
                    tracked.read = true;
                    transitioned.push(tracked.category);
                }
            }
        }
        transitioned
    }

    fn decrement_unread(&mut self, by: usize) {
        self.unread_count = self.unread_count.saturating_sub(by as u64);
    }

    /// Prepares a fetched record for insertion: read state known locally wins.
    fn reconcile(&mut self, incoming: Notification, previous: Option<&Notification>) -> Notification {
        let mut merged = match previous {
            Some(existing) => existing.merged_with(incoming),
            None => incoming.normalized(),
        };
        if let Some(tracked) = self.tracked.remove(&merged.id) {
            if tracked.read && !merged.read {
                merged.mark_read_at(Utc::now());
            }
        }
        merged
    }

    fn apply_page(&mut self, page: u32, reset: bool, data: NotificationPage) -> usize {
        let mut unique = HashSet::with_capacity(data.results.len());
        let incoming: Vec<Notification> = data
            .results
            .into_iter()
            .filter(|item| unique.insert(item.id))
            .collect();
        let received = incoming.len();

        if reset {
            let mut previous: HashMap<NotificationId, Notification> = self
                .notifications
                .drain(..)
                .map(|item| (item.id, item))
                .collect();
            let mut next = Vec::with_capacity(incoming.len());
            for item in incoming {
                let existing = previous.remove(&item.id);
                next.push(self.reconcile(item, existing.as_ref()));
            }
            for dropped in previous.values() {
                self.retire(dropped);
            }
            self.notifications = next;
            self.page = page;
        } else {
            for item in incoming {
                match self.position(item.id) {
                    Some(pos) => {
                        let existing = self.notifications[pos].clone();
                        let merged = self.reconcile(item, Some(&existing));
                        self.notifications[pos] = merged;
                    }
                    None => {
                        let merged = self.reconcile(item, None);
                        self.notifications.push(merged);
                    }
                }
            }
            self.page = self.page.max(page);
        }

        self.has_more = data.next.is_some();
        self.total = Some(data.count);
        received
    }

    /// Evicts from the tail once the list grows past `limit`.
    fn enforce_limit(&mut self, limit: usize) {
        if self.notifications.len() <= limit {
            return;
        }
        let evicted: Vec<Notification> = self.notifications.split_off(limit);
        for item in &evicted {
            self.retire(item);
        }
        self.has_more = true;
        log::debug!("cache limit {limit} reached, evicted {} records", evicted.len());
    }

    fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            notifications: self.notifications.clone(),
            unread_count: self.unread_count,
            filter: self.filter,
            page: self.page,
            has_more: self.has_more,
            total: self.total,
            loading: self.loading,
            error: self.error.clone(),
        }
    }
}

pub struct NotificationStore {
    api: Arc<dyn NotificationApi>,
    config: StoreConfig,
    state: Mutex<StoreState>,
    snapshot_tx: watch::Sender<Arc<StoreSnapshot>>,
    events_tx: broadcast::Sender<StoreEvent>,
}

impl NotificationStore {
    pub fn new(api: Arc<dyn NotificationApi>, config: StoreConfig) -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(StoreSnapshot::default()));
        let (events_tx, _) = broadcast::channel(STORE_EVENT_CAPACITY);
        let tracked_limit = config.tracked_limit.max(1);
        Self {
            api,
            config,
            state: Mutex::new(StoreState {
                tracked_limit,
                ..StoreState::default()
            }),
            snapshot_tx,
            events_tx,
        }
    }

    pub fn api(&self) -> Arc<dyn NotificationApi> {
        Arc::clone(&self.api)
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<StoreSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
        self.events_tx.subscribe()
    }

    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        Arc::clone(&self.snapshot_tx.borrow())
    }

    pub fn unread_count(&self) -> u64 {
        self.snapshot_tx.borrow().unread_count
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| Error::Poisoned("notification store"))
    }

    fn publish(&self, state: &StoreState) {
        self.snapshot_tx.send_replace(Arc::new(state.snapshot()));
    }

    fn emit(&self, event: StoreEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Loads `page` for the current filter.
    ///
    /// `reset` replaces the list, otherwise results are appended. Any fetch of
    /// page 1 supersedes fetches still in flight; their responses are dropped.
    pub async fn fetch_page(&self, page: u32, reset: bool) -> Result<FetchOutcome> {
        let page = page.max(1);
        let (generation, cancel, query) = {
            let mut state = self.lock()?;
            if !reset && state.is_fresh(page, self.config.freshness) {
                log::debug!("page {page} served from cache");
                return Ok(FetchOutcome::CacheHit);
            }
            if reset || page == 1 {
                state.supersede();
            }
            state.in_flight += 1;
            state.loading = true;
            self.publish(&state);
            (
                state.generation,
                state.cancel.clone(),
                state.filter.query(page, self.config.page_size),
            )
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::debug!("page {page} fetch cancelled (generation {generation})");
                return Ok(FetchOutcome::Cancelled);
            }
            result = self.api.list(&query) => result,
        };

        let mut state = self.lock()?;
        if state.generation != generation || cancel.is_cancelled() {
            log::debug!(
                "discarding page {page} response from generation {generation}, current is {}",
                state.generation
            );
            return Ok(FetchOutcome::Superseded);
        }
        state.in_flight = state.in_flight.saturating_sub(1);
        state.loading = state.in_flight > 0;

        match result {
            Ok(data) => {
                let received = state.apply_page(page, reset, data);
                state.error = None;
                state.last_fetched_at = Some(Instant::now());
                self.publish(&state);
                drop(state);
                self.emit(StoreEvent::PageLoaded { page, reset });
                Ok(FetchOutcome::Applied { page, received })
            }
            Err(error) => {
                log::warn!("failed to fetch notifications page {page}: {error}");
                state.error = Some(error.to_string());
                self.publish(&state);
                Err(error)
            }
        }
    }

    pub async fn refresh(&self) -> Result<FetchOutcome> {
        self.fetch_page(1, true).await
    }

    /// Fetches the page after the last loaded one, if the backend has more.
    pub async fn load_more(&self) -> Result<Option<FetchOutcome>> {
        let next_page = {
            let state = self.lock()?;
            if !state.has_more {
                return Ok(None);
            }
            state.page + 1
        };
        self.fetch_page(next_page, false).await.map(Some)
    }

    pub async fn set_filter(&self, filter: NotificationFilter) -> Result<FetchOutcome> {
        {
            let mut state = self.lock()?;
            state.filter = filter;
            state.page = 0;
            state.has_more = false;
            state.last_fetched_at = None;
        }
        self.fetch_page(1, true).await
    }

    /// Authoritative resync of the counter, used after every (re)connect.
    pub async fn fetch_unread_count(&self) -> Result<u64> {
        match self.api.unread_count().await {
            Ok(count) => {
                self.set_unread_count(count as i64)?;
                Ok(count)
            }
            Err(error) => {
                log::warn!("failed to fetch unread count: {error}");
                let mut state = self.lock()?;
                state.error = Some(error.to_string());
                self.publish(&state);
                Err(error)
            }
        }
    }

    pub async fn mark_read(&self, id: NotificationId) -> Result<()> {
        let transitioned = {
            let mut state = self.lock()?;
            let transitioned = state.flip_read(&[id]);
            self.publish(&state);
            transitioned
        };

        let updated = match self.api.mark_read(id).await {
            Ok(updated) => updated,
            Err(error) => {
                log::warn!("mark_read {id} failed, keeping local read state: {error}");
                return Err(error);
            }
        };

        let mut state = self.lock()?;
        state.decrement_unread(transitioned.len());
        if let Some(pos) = state.position(id) {
            let existing = state.notifications[pos].clone();
            state.notifications[pos] = existing.merged_with(updated);
        }
        self.publish(&state);
        drop(state);
        if !transitioned.is_empty() {
            self.emit(StoreEvent::ReadApplied {
                categories: transitioned,
            });
        }
        Ok(())
    }

    pub async fn bulk_mark_read(&self, ids: &[NotificationId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let transitioned = {
            let mut state = self.lock()?;
            let transitioned = state.flip_read(ids);
            self.publish(&state);
            transitioned
        };

        let confirmed = match self.api.bulk_mark_read(ids).await {
            Ok(confirmed) => confirmed,
            Err(error) => {
                log::warn!(
                    "bulk mark read of {} ids failed, keeping local read state: {error}",
                    ids.len()
                );
                return Err(error);
            }
        };
        log::debug!(
            "bulk mark read: backend transitioned {confirmed}, locally unread {}",
            transitioned.len()
        );

        let mut state = self.lock()?;
        state.decrement_unread(transitioned.len());
        self.publish(&state);
        drop(state);
        if !transitioned.is_empty() {
            self.emit(StoreEvent::ReadApplied {
                categories: transitioned,
            });
        }
        Ok(confirmed)
    }

    pub async fn set_completed(&self, id: NotificationId, completed: bool) -> Result<()> {
        {
            let mut state = self.lock()?;
            if let Some(pos) = state.position(id) {
                state.notifications[pos].is_completed = completed;
                self.publish(&state);
            }
        }

        let patch = NotificationPatch {
            is_completed: Some(completed),
            ..NotificationPatch::default()
        };
        let updated = match self.api.update(id, &patch).await {
            Ok(updated) => updated,
            Err(error) => {
                log::warn!("set_completed {id} failed, keeping local state: {error}");
                return Err(error);
            }
        };

        let mut state = self.lock()?;
        if let Some(pos) = state.position(id) {
            let existing = state.notifications[pos].clone();
            state.notifications[pos] = existing.merged_with(updated);
            self.publish(&state);
        }
        Ok(())
    }

    /// Drops a record from the local list only; the backend keeps it.
    pub fn dismiss(&self, id: NotificationId) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(pos) = state.position(id) else {
            return Ok(false);
        };
        let removed = state.notifications.remove(pos);
        state.retire(&removed);
        self.publish(&state);
        Ok(true)
    }

    pub fn add_from_stream(&self, notification: Notification) -> Result<bool> {
        let mut state = self.lock()?;
        if state.knows(notification.id) {
            log::debug!("stream notification {} already known", notification.id);
            return Ok(false);
        }

        let notification = notification.normalized();
        let event = StoreEvent::Added {
            id: notification.id,
            category: notification.category,
            read: notification.read,
        };
        if !notification.read {
            state.unread_count = state.unread_count.saturating_add(1);
        }
        if state.filter.matches(&notification) {
            state.notifications.insert(0, notification);
            state.enforce_limit(self.config.cache_limit);
        } else {
            state.retire(&notification);
        }
        self.publish(&state);
        drop(state);
        self.emit(event);
        Ok(true)
    }

    /// Applies reads made in another session. Ids this store never saw do not
    /// move the counter; the next authoritative count corrects any drift.
    pub fn mark_read_from_stream(&self, ids: &[NotificationId]) -> Result<usize> {
        let mut state = self.lock()?;
        let transitioned = state.flip_read(ids);
        let count = transitioned.len();
        if count == 0 {
            return Ok(0);
        }
        state.decrement_unread(count);
        self.publish(&state);
        drop(state);
        self.emit(StoreEvent::ReadApplied {
            categories: transitioned,
        });
        Ok(count)
    }

    /// Overwrites the counter. Negative input clamps to zero.
    pub fn set_unread_count(&self, count: i64) -> Result<()> {
        let count = count.max(0) as u64;
        let mut state = self.lock()?;
        state.unread_count = count;
        self.publish(&state);
        drop(state);
        self.emit(StoreEvent::UnreadCountSet(count));
        Ok(())
    }

    pub fn apply_stream_message(&self, message: StreamMessage) -> Result<()> {
        match message {
            StreamMessage::NotificationMessage { notification } => {
                self.add_from_stream(notification)?;
            }
            StreamMessage::NotificationRead { notification_ids } => {
                self.mark_read_from_stream(&notification_ids)?;
            }
            StreamMessage::UnreadCountUpdate { unread_count } => {
                self.set_unread_count(unread_count)?;
            }
            StreamMessage::ConnectionEstablished { .. }
            | StreamMessage::Heartbeat
            | StreamMessage::Error { .. }
            | StreamMessage::Unknown => {}
        }
        Ok(())
    }

    /// Cancels in-flight page fetches without touching cached data.
    pub fn cancel_fetches(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.supersede();
        state.loading = false;
        self.publish(&state);
        Ok(())
    }

    /// Forgets everything, e.g. on logout.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.cancel.cancel();
        let generation = state.generation.wrapping_add(1);
        let tracked_limit = state.tracked_limit;
        *state = StoreState {
            generation,
            tracked_limit,
            ..StoreState::default()
        };
        self.publish(&state);
        drop(state);
        self.emit(StoreEvent::Cleared);
        Ok(())
    }
}
