//! Driver-side location publishing.
//!
//! While a trip is active the publisher takes a fix immediately, follows the
//! device's position watch and writes a heartbeat on a fixed interval. Every
//! write goes through a [`StoreWriter`] so failures are logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use realtime::{Fix, Geolocation, PositionOptions, TrackingPatch, TrackingStore, VehicleCode};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::Config;
use crate::writer::StoreWriter;

/// Speed in km/h from a raw device reading in m/s. Unavailable, negative or
/// non-finite readings count as stationary.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn speed_kmh(speed_mps: Option<f64>) -> u32 {
    speed_mps
        .filter(|mps| mps.is_finite() && *mps > 0.0)
        .map_or(0, |mps| (mps * 3.6).round().min(f64::from(u32::MAX)) as u32)
}

struct ActiveTrip {
    vehicle_code: VehicleCode,
    started: Instant,
    tasks: JoinSet<()>,
    cancel: DropGuard,
}

/// Publishes position, speed and heartbeats for one vehicle at a time.
pub struct LocationPublisher<G> {
    geolocation: Arc<G>,
    writer: StoreWriter,
    heartbeat_interval: Duration,
    position_options: PositionOptions,
    speed: Arc<watch::Sender<u32>>,
    trip: Option<ActiveTrip>,
}

impl<G> LocationPublisher<G>
where
    G: Geolocation + 'static,
{
    pub fn new<S>(store: Arc<S>, geolocation: Arc<G>, config: &Config) -> Self
    where
        S: TrackingStore + 'static,
    {
        let (speed, _) = watch::channel(0);
        Self {
            geolocation,
            writer: StoreWriter::spawn(store, config.write_timeout),
            heartbeat_interval: config.heartbeat_interval,
            position_options: config.position_options,
            speed: Arc::new(speed),
            trip: None,
        }
    }

    /// Start publishing for `vehicle_code`. Re-activating the same vehicle is
    /// a no-op; activating another one tears the current trip down first.
    pub async fn activate(&mut self, vehicle_code: VehicleCode) {
        if self.vehicle_code() == Some(&vehicle_code) {
            return;
        }
        self.deactivate().await;

        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        tasks.spawn(heartbeat(
            self.writer.clone(),
            vehicle_code.clone(),
            self.heartbeat_interval,
            cancel.child_token(),
        ));
        tasks.spawn(follow_position(
            Arc::clone(&self.geolocation),
            self.writer.clone(),
            vehicle_code.clone(),
            self.position_options,
            Arc::clone(&self.speed),
            cancel.child_token(),
        ));

        info!(vehicle = %vehicle_code, "trip started");
        self.trip = Some(ActiveTrip {
            vehicle_code,
            started: Instant::now(),
            tasks,
            cancel: cancel.drop_guard(),
        });
    }

    /// Move an active trip to `vehicle_code`. The previous vehicle's watch
    /// and heartbeat are released; the trip keeps its start time. Does
    /// nothing when no trip is active.
    pub async fn switch_vehicle(&mut self, vehicle_code: VehicleCode) {
        let Some(started) = self.trip.as_ref().map(|trip| trip.started) else {
            return;
        };
        self.activate(vehicle_code).await;
        if let Some(trip) = self.trip.as_mut() {
            trip.started = started;
        }
    }

    /// Stop publishing. Speed is reset locally; nothing is written to the
    /// store.
    pub async fn deactivate(&mut self) {
        let Some(trip) = self.trip.take() else {
            return;
        };
        let ActiveTrip { vehicle_code, started, mut tasks, cancel } = trip;

        // cancel and wait so the position watch is released before returning
        drop(cancel);
        while tasks.join_next().await.is_some() {}

        self.speed.send_replace(0);
        info!(vehicle = %vehicle_code, elapsed = ?started.elapsed(), "trip ended");
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.trip.is_some()
    }

    #[must_use]
    pub fn vehicle_code(&self) -> Option<&VehicleCode> {
        self.trip.as_ref().map(|trip| &trip.vehicle_code)
    }

    /// Last displayed speed in km/h.
    #[must_use]
    pub fn speed_kmh(&self) -> u32 {
        *self.speed.borrow()
    }

    #[must_use]
    pub fn subscribe_speed(&self) -> watch::Receiver<u32> {
        self.speed.subscribe()
    }

    /// Time since the current trip was activated, zero when inactive.
    #[must_use]
    pub fn trip_elapsed(&self) -> Duration {
        self.trip.as_ref().map_or(Duration::ZERO, |trip| trip.started.elapsed())
    }

    /// Wait until every write issued so far has been attempted.
    pub async fn flush(&self) {
        self.writer.flush().await;
    }
}

async fn heartbeat(
    writer: StoreWriter, vehicle_code: VehicleCode, period: Duration, cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                debug!(vehicle = %vehicle_code, "heartbeat");
                writer.write(&vehicle_code, TrackingPatch::heartbeat());
            }
        }
    }
}

async fn follow_position<G: Geolocation>(
    geolocation: Arc<G>, writer: StoreWriter, vehicle_code: VehicleCode,
    options: PositionOptions, speed: Arc<watch::Sender<u32>>, cancel: CancellationToken,
) {
    let publish = |fix: Fix| {
        let kmh = speed_kmh(fix.speed_mps);
        speed.send_replace(kmh);
        writer.write(&vehicle_code, TrackingPatch::location(fix.coordinates, kmh));
    };

    let started = tokio::select! {
        () = cancel.cancelled() => return,
        started = async {
            tokio::join!(
                geolocation.current_position(options),
                geolocation.watch_position(options)
            )
        } => started,
    };

    let (first, watch) = started;
    match first {
        Ok(fix) => publish(fix),
        Err(e) => warn!(vehicle = %vehicle_code, error = %e, "initial position fix failed"),
    }
    let mut fixes = match watch {
        Ok(fixes) => fixes,
        Err(e) => {
            warn!(vehicle = %vehicle_code, error = %e, "position watch failed to start");
            return;
        }
    };

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = fixes.next() => match next {
                Some(Ok(fix)) => publish(fix),
                Some(Err(e)) => warn!(vehicle = %vehicle_code, error = %e, "position update failed"),
                None => {
                    debug!(vehicle = %vehicle_code, "position watch closed");
                    break;
                }
            },
        }
    }
}
