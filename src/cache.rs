//! Read-through cache of joined booking views.
//!
//! Entries are filled from [`Engine::get_booking_details`] and dropped when a
//! committed event touches the booking, its slot, or its holder.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::{BookingError, Engine};
use crate::model::{BookingDetails, Event};
use crate::notify::Channel;

pub struct BookingCache {
    engine: Arc<Engine>,
    entries: DashMap<Ulid, BookingDetails>,
    /// Bumped on every invalidation so a fill that raced one is discarded.
    generation: AtomicU64,
}

impl BookingCache {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            entries: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    pub async fn get(&self, id: Ulid) -> Result<BookingDetails, BookingError> {
        if let Some(hit) = self.entries.get(&id) {
            return Ok(hit.value().clone());
        }
        let seen = self.generation.load(Ordering::Acquire);
        let details = self.engine.get_booking_details(&id).await?;
        if self.generation.load(Ordering::Acquire) == seen {
            self.entries.insert(id, details.clone());
            if self.generation.load(Ordering::Acquire) != seen {
                self.entries.remove(&id);
            }
        }
        Ok(details)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.entries.contains_key(id)
    }

    pub fn forget(&self, id: &Ulid) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.entries.remove(id);
    }

    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.entries.clear();
    }

    /// Drop every entry the event could have made stale.
    pub fn invalidate(&self, event: &Event) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(id) = event.booking_id() {
            self.entries.remove(&id);
        }
        match event {
            Event::SlotUpdated { slot } => self.retain(|d| d.booking.slot_id != Some(slot.id)),
            Event::SlotDeleted { id, .. } => self.retain(|d| d.booking.slot_id != Some(*id)),
            Event::UserRegistered { user } => {
                self.retain(|d| d.booking.user_id != Some(user.id))
            }
            Event::MembershipSet { user_id, .. } => {
                self.retain(|d| d.booking.user_id != Some(*user_id))
            }
            Event::HoursDeducted { deduction }
            | Event::BookingCreated {
                deduction: Some(deduction),
                ..
            }
            | Event::BookingExtended {
                deduction: Some(deduction),
                ..
            } => self.retain(|d| d.booking.user_id != Some(deduction.user_id)),
            _ => {}
        }
    }

    fn retain(&self, keep: impl Fn(&BookingDetails) -> bool) {
        self.entries.retain(|_, d| keep(d));
    }

    /// Follow every committed event until cancelled. A lagged receiver may
    /// have missed anything, so it clears the whole cache.
    pub fn spawn_invalidator(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let mut events = cache.engine.notify.subscribe(Channel::All);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    recv = events.recv() => match recv {
                        Ok(event) => cache.invalidate(&event),
                        Err(RecvError::Lagged(n)) => {
                            warn!("cache invalidator lagged by {n} events, clearing");
                            cache.clear();
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("cache invalidator stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use crate::time::ManualClock;
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("rigtime_test_cache");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn setup(name: &str) -> (Arc<Engine>, Ulid, Ulid) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap(),
        ));
        let engine = Arc::new(
            Engine::new(
                test_wal_path(name),
                Arc::new(NotifyHub::new()),
                clock,
                EngineConfig::default(),
            )
            .unwrap(),
        );
        let slot = engine
            .create_slot(NewSlot {
                platform: Platform::Console,
                title: None,
                start_time: "10:00".into(),
                end_time: "22:00".into(),
                price: 100.0,
                max_players: 1,
                status: SlotStatus::Available,
                is_public: true,
            })
            .await
            .unwrap();
        let user = engine
            .register_user(Ulid::new(), "Meera".into(), None)
            .await
            .unwrap();
        let mut req = CreateOfflineBooking::new(slot.id);
        req.user_id = Some(user.id);
        req.start_time = Some("14:00".into());
        req.duration = Some(60);
        let booking = engine.create_offline_booking(req).await.unwrap().booking;
        (engine, booking.id, user.id)
    }

    #[tokio::test]
    async fn read_through_fills_once() {
        let (engine, booking_id, _) = setup("read_through.wal").await;
        let cache = BookingCache::new(engine);
        assert!(cache.is_empty());

        let first = cache.get(booking_id).await.unwrap();
        assert!(cache.contains(&booking_id));
        let second = cache.get(booking_id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn missing_booking_is_not_cached() {
        let (engine, _, _) = setup("missing.wal").await;
        let cache = BookingCache::new(engine);
        let id = Ulid::new();
        assert!(matches!(cache.get(id).await, Err(BookingError::NotFound(_))));
        assert!(!cache.contains(&id));
    }

    #[tokio::test]
    async fn events_invalidate_by_booking_and_holder() {
        let (engine, booking_id, user_id) = setup("invalidate.wal").await;
        let cache = BookingCache::new(engine);

        cache.get(booking_id).await.unwrap();
        cache.invalidate(&Event::MembershipSet {
            user_id,
            membership: Membership::default(),
        });
        assert!(!cache.contains(&booking_id));

        cache.get(booking_id).await.unwrap();
        cache.invalidate(&Event::BookingDeleted {
            id: booking_id,
            slot_id: None,
            platform: Platform::Console,
        });
        assert!(!cache.contains(&booking_id));

        cache.get(booking_id).await.unwrap();
        cache.invalidate(&Event::MembershipSet {
            user_id: Ulid::new(),
            membership: Membership::default(),
        });
        assert!(cache.contains(&booking_id));
    }

    #[tokio::test]
    async fn invalidator_follows_engine_events() {
        let (engine, booking_id, _) = setup("invalidator.wal").await;
        let cache = Arc::new(BookingCache::new(engine.clone()));
        let cancel = CancellationToken::new();
        let handle = cache.spawn_invalidator(cancel.clone());

        let before = cache.get(booking_id).await.unwrap();
        assert_eq!(before.booking.status, BookingStatus::Upcoming);

        engine
            .update_booking_status(booking_id, BookingStatus::Completed, Some(100.0), None)
            .await
            .unwrap();

        // The invalidator runs on its own task; poll briefly.
        for _ in 0..50 {
            if !cache.contains(&booking_id) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let after = cache.get(booking_id).await.unwrap();
        assert_eq!(after.booking.status, BookingStatus::Completed);

        cancel.cancel();
        handle.await.unwrap();
    }
}
