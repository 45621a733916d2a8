use serde::Serialize;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::{broadcast, watch};

use crate::{
    api::NotificationApi,
    model::{Category, NotificationQuery},
    store::StoreEvent,
    Error, Result,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BadgeSnapshot {
    pub counts: BTreeMap<Category, u64>,
    /// False once live updates are unavailable (given up or disconnected).
    pub live: bool,
}

impl BadgeSnapshot {
    pub fn count(&self, category: Category) -> u64 {
        self.counts.get(&category).copied().unwrap_or(0)
    }
}

struct BadgeState {
    counts: BTreeMap<Category, u64>,
    live: bool,
    refresh_generation: u64,
}

/// Per-category unread counters.
///
/// Seeded from the backend by [`BadgeBoard::refresh`] and kept current by
/// the store's events, which carry exactly one entry per confirmed
/// transition, so optimistic flips and stream merges of the same record are
/// never counted twice.
pub struct BadgeBoard {
    categories: Vec<Category>,
    state: Mutex<BadgeState>,
    snapshot_tx: watch::Sender<BadgeSnapshot>,
}

impl BadgeBoard {
    pub fn new(categories: &[Category]) -> Self {
        let mut tracked: Vec<Category> = categories.to_vec();
        tracked.sort();
        tracked.dedup();
        let counts: BTreeMap<Category, u64> =
            tracked.iter().map(|category| (*category, 0)).collect();
        let (snapshot_tx, _) = watch::channel(BadgeSnapshot {
            counts: counts.clone(),
            live: false,
        });
        Self {
            categories: tracked,
            state: Mutex::new(BadgeState {
                counts,
                live: false,
                refresh_generation: 0,
            }),
            snapshot_tx,
        }
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    pub fn subscribe(&self) -> watch::Receiver<BadgeSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> BadgeSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BadgeState>> {
        self.state.lock().map_err(|_| Error::Poisoned("badges"))
    }

    fn publish(&self, state: &BadgeState) {
        self.snapshot_tx.send_replace(BadgeSnapshot {
            counts: state.counts.clone(),
            live: state.live,
        });
    }

    pub fn apply(&self, event: &StoreEvent) -> Result<()> {
        let mut state = self.lock()?;
        let changed = match event {
            StoreEvent::Added {
                category,
                read: false,
                ..
            } => match state.counts.get_mut(category) {
                Some(count) => {
                    *count = count.saturating_add(1);
                    true
                }
                None => false,
            },
            StoreEvent::ReadApplied { categories } => {
                let mut changed = false;
                for category in categories {
                    if let Some(count) = state.counts.get_mut(category) {
                        *count = count.saturating_sub(1);
                        changed = true;
                    }
                }
                changed
            }
            StoreEvent::Cleared => {
                state.counts.values_mut().for_each(|count| *count = 0);
                true
            }
            _ => false,
        };
        if changed {
            self.publish(&state);
        }
        Ok(())
    }

    /// Replaces every counter with the backend's unread count for it. A
    /// refresh that finishes after a newer one started is discarded.
    pub async fn refresh(&self, api: &dyn NotificationApi) -> Result<()> {
        let generation = {
            let mut state = self.lock()?;
            state.refresh_generation = state.refresh_generation.wrapping_add(1);
            state.refresh_generation
        };

        let mut fresh = BTreeMap::new();
        for category in &self.categories {
            let query = NotificationQuery {
                category: Some(*category),
                include_read: false,
                page: 1,
                page_size: 1,
            };
            let page = api.list(&query).await?;
            fresh.insert(*category, page.count);
        }

        let mut state = self.lock()?;
        if state.refresh_generation != generation {
            log::debug!("discarding badge refresh {generation}, superseded");
            return Ok(());
        }
        state.counts = fresh;
        self.publish(&state);
        Ok(())
    }

    pub fn set_live(&self, live: bool) -> Result<()> {
        let mut state = self.lock()?;
        if state.live != live {
            state.live = live;
            self.publish(&state);
        }
        Ok(())
    }

    /// Follows the store's events until the store goes away. Falls back to a
    /// full refresh if it lagged behind the broadcast buffer.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<StoreEvent>,
        api: Arc<dyn NotificationApi>,
    ) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(error) = self.apply(&event) {
                        log::warn!("failed to apply store event to badges: {error}");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("badges missed {skipped} store events, refreshing");
                    if let Err(error) = self.refresh(api.as_ref()).await {
                        log::warn!("badge refresh failed: {error}");
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Notification, NotificationId, NotificationPage, NotificationPatch};
    use async_trait::async_trait;

    struct CountingApi {
        counts: BTreeMap<Category, u64>,
    }

    #[async_trait]
    impl NotificationApi for CountingApi {
        async fn list(&self, query: &NotificationQuery) -> Result<NotificationPage> {
            assert!(!query.include_read);
            let category = query.category.expect("badge queries are per category");
            Ok(NotificationPage {
                count: self.counts.get(&category).copied().unwrap_or(0),
                next: None,
                results: Vec::new(),
            })
        }

        async fn unread_count(&self) -> Result<u64> {
            Ok(self.counts.values().sum())
        }

        async fn mark_read(&self, _id: NotificationId) -> Result<Notification> {
            Err(Error::Cancelled)
        }

        async fn bulk_mark_read(&self, _ids: &[NotificationId]) -> Result<u64> {
            Err(Error::Cancelled)
        }

        async fn update(&self, _id: NotificationId, _patch: &NotificationPatch) -> Result<Notification> {
            Err(Error::Cancelled)
        }
    }

    #[tokio::test]
    async fn refresh_seeds_tracked_categories() {
        let board = BadgeBoard::new(&[Category::Task, Category::Reminder, Category::Task]);
        let api = CountingApi {
            counts: BTreeMap::from([(Category::Task, 4), (Category::SystemAlert, 9)]),
        };

        board.refresh(&api).await.unwrap();

        let snapshot = board.snapshot();
        assert_eq!(snapshot.counts.len(), 2);
        assert_eq!(snapshot.count(Category::Task), 4);
        assert_eq!(snapshot.count(Category::Reminder), 0);
        assert_eq!(snapshot.count(Category::SystemAlert), 0);
    }

    #[test]
    fn events_move_counts_once_per_transition() {
        let board = BadgeBoard::new(&[Category::Task, Category::Reminder]);
        board
            .apply(&StoreEvent::Added {
                id: 1,
                category: Category::Task,
                read: false,
            })
            .unwrap();
        board
            .apply(&StoreEvent::Added {
                id: 2,
                category: Category::Task,
                read: true,
            })
            .unwrap();
        board
            .apply(&StoreEvent::Added {
                id: 3,
                category: Category::SystemAlert,
                read: false,
            })
            .unwrap();
        assert_eq!(board.snapshot().count(Category::Task), 1);

        board
            .apply(&StoreEvent::ReadApplied {
                categories: vec![Category::Task, Category::Task, Category::Reminder],
            })
            .unwrap();
        let snapshot = board.snapshot();
        assert_eq!(snapshot.count(Category::Task), 0);
        assert_eq!(snapshot.count(Category::Reminder), 0);
    }

    #[test]
    fn cleared_resets_and_live_flag_toggles() {
        let board = BadgeBoard::new(&Category::KNOWN);
        board
            .apply(&StoreEvent::Added {
                id: 1,
                category: Category::Reminder,
                read: false,
            })
            .unwrap();
        board.set_live(true).unwrap();
        assert!(board.snapshot().live);

        board.apply(&StoreEvent::Cleared).unwrap();
        board.set_live(false).unwrap();

        let snapshot = board.snapshot();
        assert!(!snapshot.live);
        assert!(snapshot.counts.values().all(|count| *count == 0));
    }

    #[tokio::test]
    async fn run_follows_store_events() {
        let board = Arc::new(BadgeBoard::new(&[Category::Task]));
        let (tx, rx) = broadcast::channel(8);
        let api: Arc<dyn NotificationApi> = Arc::new(CountingApi {
            counts: BTreeMap::new(),
        });
        let task = tokio::spawn(Arc::clone(&board).run(rx, api));

        tx.send(StoreEvent::Added {
            id: 5,
            category: Category::Task,
            read: false,
        })
        .unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(board.snapshot().count(Category::Task), 1);
    }
}
