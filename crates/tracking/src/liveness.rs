//! Passenger-side liveness classification.
//!
//! A vehicle is online while its record keeps being written. The monitor
//! re-evaluates on every record change and on a fixed poll, because a
//! vehicle that has gone silent produces no changes at all.

use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use realtime::{Result, Subscription, TrackingStore, VehicleCode, VehicleTrackingRecord};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::{Config, NoticeSource, Notices};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Online,
    Offline,
}

impl Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => f.write_str("online"),
            Self::Offline => f.write_str("offline"),
        }
    }
}

/// Offline when there is no record or `now - last_updated` exceeds
/// `threshold`. A record stamped ahead of `now` counts as fresh.
#[must_use]
pub fn classify(
    record: Option<&VehicleTrackingRecord>, now: DateTime<Utc>, threshold: Duration,
) -> Liveness {
    let Some(record) = record else {
        return Liveness::Offline;
    };
    match now.signed_duration_since(record.last_updated).to_std() {
        Ok(age) if age > threshold => Liveness::Offline,
        _ => Liveness::Online,
    }
}

/// Latest record together with its classification.
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleStatus {
    pub liveness: Liveness,
    pub record: Option<VehicleTrackingRecord>,
}

impl Default for VehicleStatus {
    fn default() -> Self {
        Self { liveness: Liveness::Offline, record: None }
    }
}

pub struct LivenessMonitor {
    vehicle_code: VehicleCode,
    status: watch::Receiver<VehicleStatus>,
    cancel: DropGuard,
    task: JoinHandle<()>,
}

impl LivenessMonitor {
    /// Follow `vehicle_code`'s record.
    ///
    /// # Errors
    ///
    /// Returns the store error when the record subscription cannot be opened.
    pub async fn start<S>(
        store: Arc<S>, vehicle_code: VehicleCode, config: &Config, notices: Notices,
    ) -> Result<Self>
    where
        S: TrackingStore + 'static,
    {
        let subscription = store.subscribe_record(&vehicle_code).await?;
        let (status_tx, status) = watch::channel(VehicleStatus::default());
        let cancel = CancellationToken::new();

        let watcher = Watcher {
            store,
            vehicle_code: vehicle_code.clone(),
            threshold: config.offline_threshold,
            status: status_tx,
            notices,
        };
        let task = tokio::spawn(watcher.run(
            subscription,
            config.liveness_poll_interval,
            cancel.child_token(),
        ));

        Ok(Self { vehicle_code, status, cancel: cancel.drop_guard(), task })
    }

    #[must_use]
    pub const fn vehicle_code(&self) -> &VehicleCode {
        &self.vehicle_code
    }

    #[must_use]
    pub fn status(&self) -> VehicleStatus {
        self.status.borrow().clone()
    }

    #[must_use]
    pub fn liveness(&self) -> Liveness {
        self.status.borrow().liveness
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<VehicleStatus> {
        self.status.clone()
    }

    /// Cancel the subscription and poll, waiting for both to be released.
    pub async fn stop(self) {
        let Self { cancel, task, .. } = self;
        drop(cancel);
        if let Err(e) = task.await {
            warn!(error = %e, "liveness task failed");
        }
    }
}

struct Watcher<S> {
    store: Arc<S>,
    vehicle_code: VehicleCode,
    threshold: Duration,
    status: watch::Sender<VehicleStatus>,
    notices: Notices,
}

impl<S: TrackingStore> Watcher<S> {
    async fn run(
        self, mut subscription: Subscription<Option<VehicleTrackingRecord>>, poll: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut record = None;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = subscription.next() => match next {
                    Some(Ok(latest)) => record = latest,
                    Some(Err(e)) => {
                        warn!(vehicle = %self.vehicle_code, error = %e, "record subscription failed");
                        self.notices.post(NoticeSource::Tracking, "Live vehicle updates could not be refreshed");
                        continue;
                    }
                    None => {
                        debug!(vehicle = %self.vehicle_code, "record subscription closed");
                        break;
                    }
                },
                _ = ticker.tick() => {}
            }

            self.evaluate(record.as_ref());
        }
    }

    fn evaluate(&self, record: Option<&VehicleTrackingRecord>) {
        // server time, never the local clock
        let now = self.store.server_time();
        let liveness = classify(record, now, self.threshold);

        self.status.send_if_modified(|status| {
            if status.liveness == liveness && status.record.as_ref() == record {
                return false;
            }
            if status.liveness != liveness {
                info!(vehicle = %self.vehicle_code, from = %status.liveness, to = %liveness, "liveness changed");
            }
            *status = VehicleStatus { liveness, record: record.cloned() };
            true
        });
    }
}
