//! Passenger-side distance and ETA to the current target.
//!
//! Requests are issued on every vehicle position or target change and on a
//! fixed refresh interval. Each request carries a generation number and a
//! response is applied only when it is newer than the last one resolved,
//! successfully or not, so an out-of-order response can never replace a
//! fresher value.

use std::sync::Arc;
use std::time::Duration;

use realtime::{
    Coordinates, Error, Result, Subscription, TrackingStore, VehicleCode, VehicleTrackingRecord,
};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::{Config, NoticeSource, Notices};

/// Route totals reported by a routing service.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteSummary {
    pub distance_m: f64,
    pub duration_s: f64,
}

/// The `RoutingService` trait computes a driving route between two points.
pub trait RoutingService: Send + Sync {
    /// `Ok(None)` when no viable route exists.
    fn route(
        &self, origin: Coordinates, destination: Coordinates,
    ) -> impl Future<Output = Result<Option<RouteSummary>>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteEstimate {
    /// Kilometres, one decimal place.
    pub distance_km: f64,
    pub eta_minutes: u32,
}

impl RouteEstimate {
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_summary(summary: RouteSummary) -> Self {
        let distance_km = (summary.distance_m.max(0.0) / 100.0).round() / 10.0;
        let eta_minutes = (summary.duration_s.max(0.0) / 60.0).round().min(f64::from(u32::MAX));
        Self { distance_km, eta_minutes: eta_minutes as u32 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum RouteMetrics {
    /// Nothing computed yet, or a precondition (position, target) is missing.
    #[default]
    Pending,
    /// The routing service found no route.
    Unavailable,
    Ready(RouteEstimate),
}

pub struct RouteMetricsEstimator {
    metrics: watch::Receiver<RouteMetrics>,
    cancel: DropGuard,
    task: JoinHandle<()>,
}

impl RouteMetricsEstimator {
    /// Estimate the route from `vehicle_code`'s position to `target`.
    ///
    /// # Errors
    ///
    /// Returns the store error when the record subscription cannot be opened.
    pub async fn start<S, R>(
        store: Arc<S>, routing: Arc<R>, vehicle_code: VehicleCode,
        target: watch::Receiver<Option<Coordinates>>, config: &Config, notices: Notices,
    ) -> Result<Self>
    where
        S: TrackingStore + 'static,
        R: RoutingService + 'static,
    {
        let subscription = store.subscribe_record(&vehicle_code).await?;
        let (metrics_tx, metrics) = watch::channel(RouteMetrics::Pending);
        let cancel = CancellationToken::new();

        let estimator = Estimator {
            routing,
            vehicle_code,
            request_timeout: config.route_timeout,
            metrics: metrics_tx,
            notices,
            origin: None,
            destination: None,
            issued: 0,
            resolved: 0,
            in_flight: JoinSet::new(),
        };
        let task = tokio::spawn(estimator.run(
            subscription,
            target,
            config.route_refresh_interval,
            cancel.child_token(),
        ));

        Ok(Self { metrics, cancel: cancel.drop_guard(), task })
    }

    #[must_use]
    pub fn metrics(&self) -> RouteMetrics {
        *self.metrics.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RouteMetrics> {
        self.metrics.clone()
    }

    /// Cancel the subscription, timer and in-flight requests.
    pub async fn stop(self) {
        let Self { cancel, task, .. } = self;
        drop(cancel);
        if let Err(e) = task.await {
            warn!(error = %e, "route metrics task failed");
        }
    }
}

type Outcome = (u64, Result<Option<RouteSummary>>);

struct Estimator<R> {
    routing: Arc<R>,
    vehicle_code: VehicleCode,
    request_timeout: Duration,
    metrics: watch::Sender<RouteMetrics>,
    notices: Notices,
    origin: Option<Coordinates>,
    destination: Option<Coordinates>,
    issued: u64,
    resolved: u64,
    in_flight: JoinSet<Outcome>,
}

impl<R: RoutingService + 'static> Estimator<R> {
    async fn run(
        mut self, mut subscription: Subscription<Option<VehicleTrackingRecord>>,
        mut target: watch::Receiver<Option<Coordinates>>, refresh: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(refresh);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.destination = *target.borrow_and_update();
        let mut target_open = true;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(joined) = self.in_flight.join_next() => match joined {
                    Ok((generation, outcome)) => self.apply(generation, outcome),
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => warn!(vehicle = %self.vehicle_code, error = %e, "routing task failed"),
                },
                next = subscription.next() => match next {
                    Some(Ok(record)) => {
                        let origin = record.and_then(|record| record.position);
                        if origin != self.origin {
                            self.origin = origin;
                            self.request();
                        }
                    }
                    Some(Err(e)) => {
                        warn!(vehicle = %self.vehicle_code, error = %e, "record subscription failed");
                        self.notices.post(NoticeSource::Tracking, "Live vehicle updates could not be refreshed");
                    }
                    None => break,
                },
                changed = target.changed(), if target_open => {
                    if changed.is_err() {
                        target_open = false;
                        continue;
                    }
                    let destination = *target.borrow_and_update();
                    if destination != self.destination {
                        self.destination = destination;
                        self.request();
                    }
                }
                _ = ticker.tick() => {
                    if self.in_flight.is_empty() {
                        self.request();
                    }
                }
            }
        }

        self.in_flight.shutdown().await;
    }

    /// Issue a request for the current origin and destination, or go idle
    /// when either is missing.
    fn request(&mut self) {
        let (Some(origin), Some(destination)) = (self.origin, self.destination) else {
            // nothing in flight may land once the precondition is gone
            self.in_flight.abort_all();
            self.resolved = self.issued;
            self.metrics.send_if_modified(|metrics| {
                let changed = *metrics != RouteMetrics::Pending;
                *metrics = RouteMetrics::Pending;
                changed
            });
            return;
        };

        self.issued += 1;
        let generation = self.issued;
        let routing = Arc::clone(&self.routing);
        let request_timeout = self.request_timeout;
        debug!(vehicle = %self.vehicle_code, generation, "requesting route");

        self.in_flight.spawn(async move {
            let outcome =
                match tokio::time::timeout(request_timeout, routing.route(origin, destination)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Error::Timeout(format!(
                        "routing request exceeded {}s",
                        request_timeout.as_secs()
                    ))),
                };
            (generation, outcome)
        });
    }

    /// Responses at or below the resolved watermark are obsolete, including
    /// older requests overtaken by a newer one that failed.
    fn apply(&mut self, generation: u64, outcome: Result<Option<RouteSummary>>) {
        if generation <= self.resolved {
            debug!(vehicle = %self.vehicle_code, generation, resolved = self.resolved, "stale route response ignored");
            return;
        }
        self.resolved = generation;

        let metrics = match outcome {
            Ok(Some(summary)) => RouteMetrics::Ready(RouteEstimate::from_summary(summary)),
            Ok(None) => RouteMetrics::Unavailable,
            Err(e) => {
                // keep showing the previous value
                warn!(vehicle = %self.vehicle_code, generation, error = %e, "route request failed");
                return;
            }
        };
        self.metrics.send_replace(metrics);
    }
}
