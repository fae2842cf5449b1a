//! In-process [`TrackingStore`] with push subscriptions.
//!
//! Every write is stamped from the store's clock, stamps never move
//! backwards, and listeners are notified in write order. The fault hooks
//! (`set_available`, `interrupt_listeners`, `redeliver_events`,
//! `lock_event`) let callers exercise the failure paths a networked store
//! produces.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use realtime::{
    BoardingEvent, Clock, Error, EventFilter, EventId, NewBoarding, Result, Subscription,
    SubscriptionSender, SystemClock, TrackingPatch, TrackingStore, VehicleCode,
    VehicleTrackingRecord, not_found,
};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    clock: Arc<dyn Clock>,
    last_stamp: Mutex<DateTime<Utc>>,
    records: DashMap<VehicleCode, VehicleTrackingRecord>,
    events: RwLock<Vec<BoardingEvent>>,
    record_watchers: DashMap<u64, RecordWatcher>,
    event_watchers: DashMap<u64, EventWatcher>,
    next_watcher: AtomicU64,
    available: AtomicBool,
    locked: DashSet<EventId>,
    writes: DashMap<VehicleCode, usize>,
}

struct RecordWatcher {
    code: VehicleCode,
    sender: SubscriptionSender<Option<VehicleTrackingRecord>>,
}

struct EventWatcher {
    filter: EventFilter,
    sender: SubscriptionSender<Vec<BoardingEvent>>,
    delivered: Vec<BoardingEvent>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("records", &self.inner.records.len())
            .field("record_listeners", &self.inner.record_watchers.len())
            .field("event_listeners", &self.inner.event_watchers.len())
            .finish_non_exhaustive()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Store stamping writes from the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(SystemClock::new())
    }

    #[must_use]
    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(clock);
        let origin = clock.now_utc();

        Self {
            inner: Arc::new(Inner {
                clock,
                last_stamp: Mutex::new(origin),
                records: DashMap::new(),
                events: RwLock::new(Vec::new()),
                record_watchers: DashMap::new(),
                event_watchers: DashMap::new(),
                next_watcher: AtomicU64::new(0),
                available: AtomicBool::new(true),
                locked: DashSet::new(),
                writes: DashMap::new(),
            }),
        }
    }

    /// Simulate losing (or regaining) the connection to the store. While
    /// unavailable every read, write and new subscription fails.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Push a read failure to every open subscription.
    pub fn interrupt_listeners(&self) {
        for watcher in &self.inner.record_watchers {
            watcher.sender.push(Err(Error::Unavailable("record listener interrupted".into())));
        }
        for watcher in &self.inner.event_watchers {
            watcher.sender.push(Err(Error::Unavailable("event listener interrupted".into())));
        }
    }

    /// Deliver the current result set again to every event subscription.
    pub fn redeliver_events(&self) {
        for watcher in &self.inner.event_watchers {
            watcher.sender.push(Ok(watcher.delivered.clone()));
        }
    }

    /// Make deletes of `id` fail until the store is dropped.
    pub fn lock_event(&self, id: EventId) {
        self.inner.locked.insert(id);
    }

    /// Open record subscriptions.
    #[must_use]
    pub fn record_listeners(&self) -> usize {
        self.inner.record_watchers.len()
    }

    /// Open event subscriptions.
    #[must_use]
    pub fn event_listeners(&self) -> usize {
        self.inner.event_watchers.len()
    }

    /// Number of merges applied to the record for `code`.
    #[must_use]
    pub fn writes(&self, code: &VehicleCode) -> usize {
        self.inner.writes.get(code).map_or(0, |count| *count)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Unavailable("tracking store is unreachable".into()))
        }
    }

    fn next_watcher(&self) -> u64 {
        self.inner.next_watcher.fetch_add(1, Ordering::Relaxed)
    }
}

impl Inner {
    fn stamp(&self) -> DateTime<Utc> {
        let mut last = self.last_stamp.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now_utc().max(*last);
        *last = now;
        now
    }

    fn notify_record(&self, record: &VehicleTrackingRecord) {
        let mut closed = Vec::new();
        for watcher in &self.record_watchers {
            if watcher.code == record.vehicle_code && !watcher.sender.push(Ok(Some(record.clone())))
            {
                closed.push(*watcher.key());
            }
        }
        for id in closed {
            self.record_watchers.remove(&id);
        }
    }

    fn notify_events(&self, events: &[BoardingEvent]) {
        let mut closed = Vec::new();
        for mut watcher in self.event_watchers.iter_mut() {
            let matching = select(events, &watcher.filter);
            if matching == watcher.delivered {
                continue;
            }
            if watcher.sender.push(Ok(matching.clone())) {
                watcher.delivered = matching;
            } else {
                closed.push(*watcher.key());
            }
        }
        for id in closed {
            self.event_watchers.remove(&id);
        }
    }
}

fn select(events: &[BoardingEvent], filter: &EventFilter) -> Vec<BoardingEvent> {
    events.iter().filter(|event| filter.matches(event)).cloned().collect()
}

impl TrackingStore for MemoryStore {
    fn server_time(&self) -> DateTime<Utc> {
        self.inner.clock.now_utc()
    }

    async fn merge_record(
        &self, code: &VehicleCode, patch: TrackingPatch,
    ) -> Result<VehicleTrackingRecord> {
        self.ensure_available()?;

        let stamped_at = self.inner.stamp();
        let mut entry = self
            .inner
            .records
            .entry(code.clone())
            .or_insert_with(|| VehicleTrackingRecord::new(code.clone(), stamped_at));
        entry.merge(&patch, stamped_at);
        let record = entry.value().clone();

        *self.inner.writes.entry(code.clone()).or_insert(0) += 1;
        debug!(vehicle = %code, heartbeat = patch.is_heartbeat(), "merged tracking record");

        // notify under the entry lock so listeners see writes in order
        self.inner.notify_record(&record);
        drop(entry);

        Ok(record)
    }

    async fn get_record(&self, code: &VehicleCode) -> Result<Option<VehicleTrackingRecord>> {
        self.ensure_available()?;
        Ok(self.inner.records.get(code).map(|record| record.value().clone()))
    }

    async fn subscribe_record(
        &self, code: &VehicleCode,
    ) -> Result<Subscription<Option<VehicleTrackingRecord>>> {
        self.ensure_available()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let sender = SubscriptionSender::new(tx);
        let id = self.next_watcher();

        // hold the record entry so no merge slips between snapshot and registration
        let entry = self.inner.records.entry(code.clone());
        let snapshot = match &entry {
            Entry::Occupied(record) => Some(record.get().clone()),
            Entry::Vacant(_) => None,
        };
        sender.push(Ok(snapshot));
        self.inner.record_watchers.insert(id, RecordWatcher { code: code.clone(), sender });
        drop(entry);

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Ok(Subscription::new(rx, move || {
            if let Some(inner) = weak.upgrade() {
                inner.record_watchers.remove(&id);
            }
        }))
    }

    async fn append_event(&self, boarding: NewBoarding) -> Result<BoardingEvent> {
        self.ensure_available()?;

        let mut events = self.inner.events.write().unwrap_or_else(PoisonError::into_inner);
        let event = boarding.into_event(EventId::new(), self.inner.stamp());
        events.push(event.clone());
        debug!(vehicle = %event.vehicle_code, passenger = %event.passenger_id, "appended boarding");

        self.inner.notify_events(&events);
        Ok(event)
    }

    async fn query_events(&self, filter: &EventFilter) -> Result<Vec<BoardingEvent>> {
        self.ensure_available()?;
        let events = self.inner.events.read().unwrap_or_else(PoisonError::into_inner);
        Ok(select(&events, filter))
    }

    async fn subscribe_events(
        &self, filter: &EventFilter,
    ) -> Result<Subscription<Vec<BoardingEvent>>> {
        self.ensure_available()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let sender = SubscriptionSender::new(tx);
        let id = self.next_watcher();

        let events = self.inner.events.read().unwrap_or_else(PoisonError::into_inner);
        let delivered = select(&events, filter);
        sender.push(Ok(delivered.clone()));
        self.inner
            .event_watchers
            .insert(id, EventWatcher { filter: filter.clone(), sender, delivered });
        drop(events);

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Ok(Subscription::new(rx, move || {
            if let Some(inner) = weak.upgrade() {
                inner.event_watchers.remove(&id);
            }
        }))
    }

    async fn drop_off_event(&self, id: EventId) -> Result<BoardingEvent> {
        self.ensure_available()?;

        let mut events = self.inner.events.write().unwrap_or_else(PoisonError::into_inner);
        let Some(event) = events.iter_mut().find(|event| event.id == id) else {
            return Err(not_found!("boarding {id} does not exist"));
        };
        event.drop_off(self.inner.stamp())?;
        let event = event.clone();
        debug!(vehicle = %event.vehicle_code, passenger = %event.passenger_id, "dropped off");

        self.inner.notify_events(&events);
        Ok(event)
    }

    async fn delete_event(&self, id: EventId) -> Result<()> {
        self.ensure_available()?;
        if self.inner.locked.contains(&id) {
            return Err(Error::Unavailable(format!("boarding {id} is locked")));
        }

        let mut events = self.inner.events.write().unwrap_or_else(PoisonError::into_inner);
        let Some(index) = events.iter().position(|event| event.id == id) else {
            return Err(not_found!("boarding {id} does not exist"));
        };
        events.remove(index);

        self.inner.notify_events(&events);
        Ok(())
    }
}
