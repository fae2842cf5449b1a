//! Passenger dashboard: tracks one vehicle and the rider's boarding on it.
//!
//! While tracking, the dashboard holds a liveness monitor, a route metrics
//! estimator and, until the rider boards, a watch on the rider's own
//! position feeding the estimator's target. Switching vehicle or leaving the
//! dashboard releases all of them.

use std::sync::Arc;

use realtime::{
    BoardingEvent, Coordinates, Error, Geolocation, PositionOptions, Result, TrackingStore,
    VehicleCode,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use tracking::attendance::{self, AttendanceFeed, AttendanceRecord};
use tracking::boarding::{BoardingSession, BoardingState, DropOff, Rider};
use tracking::liveness::{Liveness, LivenessMonitor, VehicleStatus};
use tracking::route_metrics::{RouteMetrics, RouteMetricsEstimator, RoutingService};
use tracking::scan::{QrDecode, decode_vehicle};
use tracking::{Config, NoticeSource, Notices};

type Target = Arc<watch::Sender<Option<Coordinates>>>;

struct OwnPosition {
    cancel: DropGuard,
    task: JoinHandle<()>,
}

impl OwnPosition {
    async fn stop(self) {
        let Self { cancel, task } = self;
        drop(cancel);
        if let Err(e) = task.await {
            warn!(error = %e, "own position task failed");
        }
    }
}

struct Tracking<S> {
    vehicle_code: VehicleCode,
    session: BoardingSession<S>,
    liveness: LivenessMonitor,
    metrics: RouteMetricsEstimator,
    target: Target,
    own_position: Option<OwnPosition>,
}

impl<S> Tracking<S> {
    async fn stop(self) {
        let Self { vehicle_code, liveness, metrics, own_position, .. } = self;
        if let Some(own_position) = own_position {
            own_position.stop().await;
        }
        liveness.stop().await;
        metrics.stop().await;
        info!(vehicle = %vehicle_code, "tracking stopped");
    }
}

pub struct PassengerDashboard<S, G, R> {
    store: Arc<S>,
    geolocation: Arc<G>,
    routing: Arc<R>,
    config: Config,
    notices: Notices,
    rider: Rider,
    tracking: Option<Tracking<S>>,
}

impl<S, G, R> PassengerDashboard<S, G, R>
where
    S: TrackingStore + 'static,
    G: Geolocation + 'static,
    R: RoutingService + 'static,
{
    pub fn new(
        store: Arc<S>, geolocation: Arc<G>, routing: Arc<R>, config: Config, rider: Rider,
    ) -> Self {
        Self {
            store,
            geolocation,
            routing,
            config,
            notices: Notices::new(),
            rider,
            tracking: None,
        }
    }

    /// Start tracking `code`, resuming an open boarding on it if there is
    /// one. Any previously tracked vehicle is released first.
    ///
    /// # Errors
    ///
    /// Returns `Error::MissingField` for a blank code, or the store error
    /// when the vehicle cannot be followed.
    pub async fn track(&mut self, code: &str) -> Result<VehicleCode> {
        let vehicle_code: VehicleCode = code.parse()?;
        if self.vehicle_code() == Some(&vehicle_code) {
            return Ok(vehicle_code);
        }
        self.exit_tracking().await;

        let session = match BoardingSession::resume(
            Arc::clone(&self.store),
            self.rider.clone(),
            vehicle_code.clone(),
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!(vehicle = %vehicle_code, error = %e, "could not restore boarding");
                BoardingSession::new(Arc::clone(&self.store), self.rider.clone())
            }
        };

        let liveness = match LivenessMonitor::start(
            Arc::clone(&self.store),
            vehicle_code.clone(),
            &self.config,
            self.notices.clone(),
        )
        .await
        {
            Ok(liveness) => liveness,
            Err(e) => return Err(self.tracking_failed(&vehicle_code, e)),
        };

        let boarded = session.state().is_boarded();
        let (target_tx, target_rx) = watch::channel(boarded.then_some(self.config.campus));
        let target = Arc::new(target_tx);

        let metrics = match RouteMetricsEstimator::start(
            Arc::clone(&self.store),
            Arc::clone(&self.routing),
            vehicle_code.clone(),
            target_rx,
            &self.config,
            self.notices.clone(),
        )
        .await
        {
            Ok(metrics) => metrics,
            Err(e) => {
                liveness.stop().await;
                return Err(self.tracking_failed(&vehicle_code, e));
            }
        };

        let own_position = (!boarded).then(|| {
            follow_own_position(
                Arc::clone(&self.geolocation),
                Arc::clone(&target),
                self.config.position_options,
            )
        });

        info!(vehicle = %vehicle_code, boarded, "tracking started");
        self.tracking = Some(Tracking {
            vehicle_code: vehicle_code.clone(),
            session,
            liveness,
            metrics,
            target,
            own_position,
        });
        Ok(vehicle_code)
    }

    fn tracking_failed(&self, vehicle_code: &VehicleCode, error: Error) -> Error {
        warn!(vehicle = %vehicle_code, error = %error, "tracking unavailable");
        self.notices.post(NoticeSource::Tracking, "Live vehicle updates are unavailable");
        error
    }

    /// Stop tracking and release every subscription and timer.
    pub async fn exit_tracking(&mut self) {
        if let Some(tracking) = self.tracking.take() {
            tracking.stop().await;
        }
    }

    #[must_use]
    pub fn vehicle_code(&self) -> Option<&VehicleCode> {
        self.tracking.as_ref().map(|tracking| &tracking.vehicle_code)
    }

    /// Board `code`, tracking it first when needed. The route target
    /// switches to the campus.
    ///
    /// # Errors
    ///
    /// As [`Self::track`] and [`BoardingSession::board`].
    pub async fn board(&mut self, code: &str) -> Result<BoardingEvent> {
        let vehicle_code = self.track(code).await?;
        let Some(tracking) = self.tracking.as_mut() else {
            return Err(Error::Internal(format!("tracking {vehicle_code} did not start")));
        };

        let event = tracking.session.board(vehicle_code).await?;
        if let Some(own_position) = tracking.own_position.take() {
            own_position.stop().await;
        }
        tracking.target.send_replace(Some(self.config.campus));
        Ok(event)
    }

    /// Decode a vehicle code from `source` and board it.
    ///
    /// # Errors
    ///
    /// Returns `Error::Decode` when no vehicle code could be read, otherwise
    /// as [`Self::board`].
    pub async fn board_scanned(&mut self, source: &mut dyn QrDecode) -> Result<BoardingEvent> {
        let vehicle_code = decode_vehicle(source).await?;
        self.board(vehicle_code.as_str()).await
    }

    /// Confirm arrival. Tracking ends whatever the store reports.
    ///
    /// # Errors
    ///
    /// Returns `Error::Conflict` when the rider is not boarded on the
    /// tracked vehicle.
    pub async fn drop_off(&mut self) -> Result<DropOff> {
        let Some(tracking) = self.tracking.as_mut() else {
            return Err(Error::Conflict("no vehicle is being tracked".into()));
        };
        let outcome = tracking.session.drop_off().await?;
        self.exit_tracking().await;
        Ok(outcome)
    }

    #[must_use]
    pub fn boarding_state(&self) -> BoardingState {
        self.tracking
            .as_ref()
            .map_or(BoardingState::Unboarded, |tracking| tracking.session.state().clone())
    }

    #[must_use]
    pub fn status(&self) -> Option<VehicleStatus> {
        self.tracking.as_ref().map(|tracking| tracking.liveness.status())
    }

    /// Offline when nothing is tracked or the vehicle has gone quiet.
    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.tracking
            .as_ref()
            .is_none_or(|tracking| tracking.liveness.liveness() == Liveness::Offline)
    }

    #[must_use]
    pub fn metrics(&self) -> RouteMetrics {
        self.tracking.as_ref().map_or(RouteMetrics::Pending, |tracking| tracking.metrics.metrics())
    }

    /// Free seats on the tracked vehicle, once its record exists.
    #[must_use]
    pub fn seats_left(&self) -> Option<u32> {
        let record = self.status()?.record?;
        Some(self.config.total_seats.saturating_sub(record.passenger_count))
    }

    /// # Errors
    ///
    /// Returns the store error when the history cannot be read.
    pub async fn attendance(&self) -> Result<Vec<AttendanceRecord>> {
        attendance::history(self.store.as_ref(), &self.rider.id).await
    }

    /// # Errors
    ///
    /// Returns the store error when the subscription cannot be opened.
    pub async fn attendance_feed(&self) -> Result<AttendanceFeed> {
        AttendanceFeed::start(Arc::clone(&self.store), self.rider.id.clone(), self.notices.clone())
            .await
    }

    #[must_use]
    pub const fn notices(&self) -> &Notices {
        &self.notices
    }

    pub async fn close(mut self) {
        self.exit_tracking().await;
    }
}

/// Feed the rider's live position into `target` until cancelled.
fn follow_own_position<G: Geolocation + 'static>(
    geolocation: Arc<G>, target: Target, options: PositionOptions,
) -> OwnPosition {
    let cancel = CancellationToken::new();
    let token = cancel.child_token();

    let task = tokio::spawn(async move {
        let started = tokio::select! {
            () = token.cancelled() => return,
            started = async {
                tokio::join!(geolocation.current_position(options), geolocation.watch_position(options))
            } => started,
        };

        let (first, watch) = started;
        match first {
            Ok(fix) => {
                target.send_replace(Some(fix.coordinates));
            }
            Err(e) => debug!(error = %e, "own position unavailable"),
        }
        let Ok(mut fixes) = watch.inspect_err(|e| warn!(error = %e, "own position watch failed"))
        else {
            return;
        };

        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                next = fixes.next() => match next {
                    Some(Ok(fix)) => {
                        target.send_replace(Some(fix.coordinates));
                    }
                    Some(Err(e)) => debug!(error = %e, "own position update failed"),
                    None => break,
                },
            }
        }
    });

    OwnPosition { cancel: cancel.drop_guard(), task }
}
