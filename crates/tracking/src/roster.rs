//! Driver-side roster of onboard passengers.
//!
//! The tracker follows the vehicle's `Boarded` events and mirrors their count
//! into the tracking record, so a headcount change also refreshes liveness.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use realtime::{
    BoardingEvent, BoardingStatus, EventFilter, EventId, PassengerId, Result, TrackingPatch,
    TrackingStore, VehicleCode, bad_request,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::writer::StoreWriter;
use crate::{Config, NoticeSource, Notices};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnboardPassenger {
    pub event_id: EventId,
    pub passenger_id: PassengerId,
    pub name: String,
    pub boarded_at: DateTime<Utc>,
}

impl From<&BoardingEvent> for OnboardPassenger {
    fn from(event: &BoardingEvent) -> Self {
        Self {
            event_id: event.id,
            passenger_id: event.passenger_id.clone(),
            name: event.passenger_name.clone(),
            boarded_at: event.boarded_at,
        }
    }
}

/// Passengers currently onboard, in boarding order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    pub passengers: Vec<OnboardPassenger>,
}

impl Roster {
    #[must_use]
    pub fn count(&self) -> u32 {
        u32::try_from(self.passengers.len()).unwrap_or(u32::MAX)
    }

    fn ids(&self) -> Vec<EventId> {
        let mut ids: Vec<EventId> = self.passengers.iter().map(|p| p.event_id).collect();
        ids.sort_unstable();
        ids
    }
}

/// Explicit driver confirmation for the destructive clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearRoster {
    vehicle_code: VehicleCode,
}

impl ClearRoster {
    #[must_use]
    pub const fn confirm(vehicle_code: VehicleCode) -> Self {
        Self { vehicle_code }
    }
}

/// Outcome of a best-effort roster clear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClearReport {
    pub removed: usize,
    pub failed: Vec<EventId>,
}

impl ClearReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

fn boarded(vehicle_code: &VehicleCode) -> EventFilter {
    EventFilter::vehicle(vehicle_code.clone()).and_status(BoardingStatus::Boarded)
}

pub struct RosterTracker<S> {
    store: Arc<S>,
    vehicle_code: VehicleCode,
    writer: StoreWriter,
    roster: watch::Receiver<Roster>,
    cancel: DropGuard,
    task: JoinHandle<()>,
}

impl<S> RosterTracker<S>
where
    S: TrackingStore + 'static,
{
    /// Subscribe to the vehicle's onboard passengers.
    ///
    /// # Errors
    ///
    /// Returns the store error when the subscription cannot be opened.
    pub async fn start(
        store: Arc<S>, vehicle_code: VehicleCode, config: &Config, notices: Notices,
    ) -> Result<Self> {
        let subscription = store.subscribe_events(&boarded(&vehicle_code)).await?;
        let writer = StoreWriter::spawn(Arc::clone(&store), config.write_timeout);
        let (roster_tx, roster) = watch::channel(Roster::default());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(sync_roster(
            subscription,
            writer.clone(),
            vehicle_code.clone(),
            roster_tx,
            notices,
            cancel.child_token(),
        ));

        Ok(Self { store, vehicle_code, writer, roster, cancel: cancel.drop_guard(), task })
    }

    #[must_use]
    pub const fn vehicle_code(&self) -> &VehicleCode {
        &self.vehicle_code
    }

    #[must_use]
    pub fn roster(&self) -> Roster {
        self.roster.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Roster> {
        self.roster.clone()
    }

    /// Delete every `Boarded` event for the vehicle and reset the count.
    ///
    /// Deletes are independent: a partial failure leaves the surviving
    /// events in place. The count is never written here; the live roster
    /// re-syncs it from whatever events remain, including boardings that
    /// land while the clear runs.
    ///
    /// # Errors
    ///
    /// Returns `Error::BadRequest` when `confirmation` names another vehicle,
    /// or the store error when the onboard events cannot be listed.
    pub async fn clear(&self, confirmation: ClearRoster) -> Result<ClearReport> {
        if confirmation.vehicle_code != self.vehicle_code {
            return Err(bad_request!(
                "confirmation for {} does not match vehicle {}",
                confirmation.vehicle_code,
                self.vehicle_code
            ));
        }

        let events = self.store.query_events(&boarded(&self.vehicle_code)).await?;
        let results =
            join_all(events.iter().map(|event| self.store.delete_event(event.id))).await;

        let mut report = ClearReport::default();
        for (event, result) in events.iter().zip(results) {
            match result {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    warn!(vehicle = %self.vehicle_code, event = %event.id, error = %e, "failed to remove boarding");
                    report.failed.push(event.id);
                }
            }
        }

        if report.is_complete() {
            info!(vehicle = %self.vehicle_code, removed = report.removed, "roster cleared");
        } else {
            warn!(
                vehicle = %self.vehicle_code,
                removed = report.removed,
                failed = report.failed.len(),
                "roster partially cleared"
            );
        }
        Ok(report)
    }

    /// Wait until every count write issued so far has been attempted.
    pub async fn flush(&self) {
        self.writer.flush().await;
    }

    /// Cancel the subscription and wait for it to be released.
    pub async fn stop(self) {
        let Self { cancel, task, .. } = self;
        drop(cancel);
        if let Err(e) = task.await {
            warn!(error = %e, "roster task failed");
        }
    }
}

async fn sync_roster(
    mut subscription: realtime::Subscription<Vec<BoardingEvent>>, writer: StoreWriter,
    vehicle_code: VehicleCode, roster: watch::Sender<Roster>, notices: Notices,
    cancel: CancellationToken,
) {
    let mut synced: Option<Vec<EventId>> = None;

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = subscription.next() => next,
        };

        match next {
            Some(Ok(events)) => {
                let current = Roster { passengers: events.iter().map(OnboardPassenger::from).collect() };
                let ids = current.ids();
                if synced.as_ref() == Some(&ids) {
                    debug!(vehicle = %vehicle_code, "roster unchanged");
                    continue;
                }

                let count = current.count();
                writer.write(&vehicle_code, TrackingPatch::passenger_count(count));
                roster.send_replace(current);
                synced = Some(ids);
                debug!(vehicle = %vehicle_code, count, "roster synced");
            }
            Some(Err(e)) => {
                warn!(vehicle = %vehicle_code, error = %e, "roster subscription failed");
                notices.post(NoticeSource::Roster, "Live passenger list could not be refreshed");
            }
            None => {
                debug!(vehicle = %vehicle_code, "roster subscription closed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use realtime::NewBoarding;

    use super::*;
    use crate::MemoryStore;

    fn code(s: &str) -> VehicleCode {
        s.parse().expect("valid code")
    }

    fn boarding(vehicle: &str, passenger: &str) -> NewBoarding {
        NewBoarding {
            vehicle_code: code(vehicle),
            passenger_id: PassengerId::new(passenger),
            passenger_name: format!("Passenger {passenger}"),
        }
    }

    async fn settle(tracker: &RosterTracker<MemoryStore>) {
        tokio::time::sleep(Duration::from_millis(10)).await;
        tracker.flush().await;
    }

    async fn passenger_count(store: &MemoryStore, vehicle: &str) -> u32 {
        store.get_record(&code(vehicle)).await.expect("read").map_or(0, |r| r.passenger_count)
    }

    #[tokio::test(start_paused = true)]
    async fn count_follows_boardings() {
        let store = Arc::new(MemoryStore::new());
        let tracker =
            RosterTracker::start(Arc::clone(&store), code("3A"), &Config::default(), Notices::new())
                .await
                .expect("start");

        let first = store.append_event(boarding("3A", "s-1")).await.expect("append");
        store.append_event(boarding("3A", "s-2")).await.expect("append");
        store.append_event(boarding("7B", "s-3")).await.expect("append");
        settle(&tracker).await;

        assert_eq!(passenger_count(&store, "3A").await, 2);
        assert_eq!(tracker.roster().count(), 2);
        assert_eq!(tracker.roster().passengers[0].name, "Passenger s-1");

        store.drop_off_event(first.id).await.expect("drop off");
        settle(&tracker).await;
        assert_eq!(passenger_count(&store, "3A").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn redelivery_does_not_rewrite() {
        let store = Arc::new(MemoryStore::new());
        let tracker =
            RosterTracker::start(Arc::clone(&store), code("3A"), &Config::default(), Notices::new())
                .await
                .expect("start");

        store.append_event(boarding("3A", "s-1")).await.expect("append");
        settle(&tracker).await;
        let writes = store.writes(&code("3A"));

        for _ in 0..5 {
            store.redeliver_events();
        }
        settle(&tracker).await;

        assert_eq!(store.writes(&code("3A")), writes);
        assert_eq!(passenger_count(&store, "3A").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn read_failure_posts_notice_and_keeps_listening() {
        let store = Arc::new(MemoryStore::new());
        let notices = Notices::new();
        let tracker =
            RosterTracker::start(Arc::clone(&store), code("3A"), &Config::default(), notices.clone())
                .await
                .expect("start");

        store.interrupt_listeners();
        store.interrupt_listeners();
        settle(&tracker).await;
        assert_eq!(notices.current().len(), 1);
        assert_eq!(notices.current()[0].source, NoticeSource::Roster);

        store.append_event(boarding("3A", "s-1")).await.expect("append");
        settle(&tracker).await;
        assert_eq!(tracker.roster().count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_requires_matching_confirmation() {
        let store = Arc::new(MemoryStore::new());
        let tracker =
            RosterTracker::start(Arc::clone(&store), code("3A"), &Config::default(), Notices::new())
                .await
                .expect("start");

        let err = tracker.clear(ClearRoster::confirm(code("7B"))).await.unwrap_err();
        assert_eq!(err.code(), http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_removes_onboard_events() {
        let store = Arc::new(MemoryStore::new());
        let tracker =
            RosterTracker::start(Arc::clone(&store), code("3A"), &Config::default(), Notices::new())
                .await
                .expect("start");

        store.append_event(boarding("3A", "s-1")).await.expect("append");
        store.append_event(boarding("3A", "s-2")).await.expect("append");
        settle(&tracker).await;

        let report = tracker.clear(ClearRoster::confirm(code("3A"))).await.expect("clear");
        settle(&tracker).await;

        assert_eq!(report, ClearReport { removed: 2, failed: Vec::new() });
        assert_eq!(passenger_count(&store, "3A").await, 0);
        assert_eq!(tracker.roster(), Roster::default());
    }

    #[tokio::test(start_paused = true)]
    async fn count_after_clear_comes_from_live_roster() {
        let store = Arc::new(MemoryStore::new());
        let tracker =
            RosterTracker::start(Arc::clone(&store), code("3A"), &Config::default(), Notices::new())
                .await
                .expect("start");
        settle(&tracker).await;

        // nothing onboard: clearing writes nothing
        let writes = store.writes(&code("3A"));
        let report = tracker.clear(ClearRoster::confirm(code("3A"))).await.expect("clear");
        settle(&tracker).await;
        assert_eq!(report, ClearReport::default());
        assert_eq!(store.writes(&code("3A")), writes);

        store.append_event(boarding("3A", "s-1")).await.expect("append");
        settle(&tracker).await;
        tracker.clear(ClearRoster::confirm(code("3A"))).await.expect("clear");
        store.append_event(boarding("3A", "s-2")).await.expect("append");
        settle(&tracker).await;

        assert_eq!(passenger_count(&store, "3A").await, 1);
        assert_eq!(tracker.roster().count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_clear_keeps_survivors_counted() {
        let store = Arc::new(MemoryStore::new());
        let tracker =
            RosterTracker::start(Arc::clone(&store), code("3A"), &Config::default(), Notices::new())
                .await
                .expect("start");

        store.append_event(boarding("3A", "s-1")).await.expect("append");
        let stuck = store.append_event(boarding("3A", "s-2")).await.expect("append");
        store.append_event(boarding("3A", "s-3")).await.expect("append");
        store.lock_event(stuck.id);
        settle(&tracker).await;

        let report = tracker.clear(ClearRoster::confirm(code("3A"))).await.expect("clear");
        settle(&tracker).await;

        assert_eq!(report, ClearReport { removed: 2, failed: vec![stuck.id] });
        assert_eq!(passenger_count(&store, "3A").await, 1);
        assert_eq!(tracker.roster().passengers[0].event_id, stuck.id);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_releases_subscription() {
        let store = Arc::new(MemoryStore::new());
        let tracker =
            RosterTracker::start(Arc::clone(&store), code("3A"), &Config::default(), Notices::new())
                .await
                .expect("start");
        assert_eq!(store.event_listeners(), 1);

        tracker.stop().await;
        assert_eq!(store.event_listeners(), 0);
    }
}
