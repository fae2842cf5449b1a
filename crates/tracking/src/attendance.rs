//! Passenger attendance history, newest boarding first.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use realtime::{
    BoardingEvent, BoardingStatus, EventFilter, EventId, PassengerId, Result, Subscription,
    TrackingStore, VehicleCode,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::{NoticeSource, Notices};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceRecord {
    pub event_id: EventId,
    pub vehicle_code: VehicleCode,
    pub status: BoardingStatus,
    pub boarded_at: DateTime<Utc>,
    pub dropped_off_at: Option<DateTime<Utc>>,
}

impl AttendanceRecord {
    /// Drop-off time once dropped off, boarding time before that.
    #[must_use]
    pub fn at(&self) -> DateTime<Utc> {
        self.dropped_off_at.unwrap_or(self.boarded_at)
    }

    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self.status {
            BoardingStatus::Boarded => "On Board",
            BoardingStatus::DroppedOff => "Safe Arrival",
        }
    }
}

impl From<BoardingEvent> for AttendanceRecord {
    fn from(event: BoardingEvent) -> Self {
        Self {
            event_id: event.id,
            vehicle_code: event.vehicle_code,
            status: event.status,
            boarded_at: event.boarded_at,
            dropped_off_at: event.dropped_off_at,
        }
    }
}

fn newest_first(events: Vec<BoardingEvent>) -> Vec<AttendanceRecord> {
    let mut records: Vec<AttendanceRecord> = events.into_iter().map(Into::into).collect();
    records.reverse();
    records.sort_by(|a, b| b.boarded_at.cmp(&a.boarded_at));
    records
}

/// Every boarding of `passenger_id`.
///
/// # Errors
///
/// Returns the store error when the events cannot be read.
pub async fn history<S: TrackingStore>(
    store: &S, passenger_id: &PassengerId,
) -> Result<Vec<AttendanceRecord>> {
    let events = store.query_events(&EventFilter::passenger(passenger_id.clone())).await?;
    Ok(newest_first(events))
}

/// Live attendance history.
pub struct AttendanceFeed {
    records: watch::Receiver<Vec<AttendanceRecord>>,
    cancel: DropGuard,
    task: JoinHandle<()>,
}

impl AttendanceFeed {
    /// # Errors
    ///
    /// Returns the store error when the subscription cannot be opened.
    pub async fn start<S: TrackingStore + 'static>(
        store: Arc<S>, passenger_id: PassengerId, notices: Notices,
    ) -> Result<Self> {
        let subscription = store.subscribe_events(&EventFilter::passenger(passenger_id)).await?;
        let (records_tx, records) = watch::channel(Vec::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(follow(subscription, records_tx, notices, cancel.child_token()));

        Ok(Self { records, cancel: cancel.drop_guard(), task })
    }

    #[must_use]
    pub fn records(&self) -> Vec<AttendanceRecord> {
        self.records.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Vec<AttendanceRecord>> {
        self.records.clone()
    }

    pub async fn stop(self) {
        let Self { cancel, task, .. } = self;
        drop(cancel);
        if let Err(e) = task.await {
            warn!(error = %e, "attendance task failed");
        }
    }
}

async fn follow(
    mut subscription: Subscription<Vec<BoardingEvent>>, records: watch::Sender<Vec<AttendanceRecord>>,
    notices: Notices, cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = subscription.next() => next,
        };
        match next {
            Some(Ok(events)) => {
                records.send_replace(newest_first(events));
            }
            Some(Err(e)) => {
                warn!(error = %e, "attendance subscription failed");
                notices.post(NoticeSource::Attendance, "Attendance history could not be refreshed");
            }
            None => {
                debug!("attendance subscription closed");
                break;
            }
        }
    }
}
