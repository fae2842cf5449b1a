#![allow(missing_docs, dead_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use realtime::{
    Coordinates, Error, Fix, Geolocation, PositionOptions, Result, Subscription,
    SubscriptionSender, SymbolReader,
};
use tokio::sync::mpsc;
use tracking::route_metrics::{RouteSummary, RoutingService};

/// Device positioning driven by the test.
#[derive(Clone, Default)]
pub struct MockGeolocation {
    inner: Arc<GeoInner>,
}

#[derive(Default)]
struct GeoInner {
    first: Mutex<Option<Fix>>,
    watches: DashMap<u64, SubscriptionSender<Fix>>,
    next_watch: AtomicU64,
    requests: AtomicUsize,
}

impl MockGeolocation {
    #[must_use]
    pub fn new(first: Option<Fix>) -> Self {
        let geolocation = Self::default();
        *geolocation.inner.first.lock().unwrap() = first;
        geolocation
    }

    /// Push a fix to every open watch.
    pub fn push(&self, fix: Fix) {
        for watch in &self.inner.watches {
            watch.push(Ok(fix));
        }
    }

    pub fn fail(&self, error: Error) {
        for watch in &self.inner.watches {
            watch.push(Err(error.clone()));
        }
    }

    #[must_use]
    pub fn active_watches(&self) -> usize {
        self.inner.watches.len()
    }

    #[must_use]
    pub fn fix_requests(&self) -> usize {
        self.inner.requests.load(Ordering::SeqCst)
    }
}

impl Geolocation for MockGeolocation {
    async fn current_position(&self, options: PositionOptions) -> Result<Fix> {
        assert!(options.high_accuracy);
        self.inner.requests.fetch_add(1, Ordering::SeqCst);
        let first = *self.inner.first.lock().unwrap();
        first.ok_or_else(|| Error::Timeout("no position fix".to_string()))
    }

    async fn watch_position(&self, _options: PositionOptions) -> Result<Subscription<Fix>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_watch.fetch_add(1, Ordering::SeqCst);
        self.inner.watches.insert(id, SubscriptionSender::new(tx));

        let inner = Arc::clone(&self.inner);
        Ok(Subscription::new(rx, move || {
            inner.watches.remove(&id);
        }))
    }
}

#[must_use]
pub fn fix(latitude: f64, longitude: f64, speed_mps: Option<f64>) -> Fix {
    Fix { coordinates: Coordinates::new(latitude, longitude), speed_mps }
}

struct Plan {
    origin: Coordinates,
    delay: Duration,
    outcome: Result<Option<RouteSummary>>,
}

/// Routing service with scripted per-origin delays and answers. Every
/// request's destination is kept for inspection.
#[derive(Default)]
pub struct MockRouting {
    plans: Mutex<Vec<Plan>>,
    destinations: Mutex<Vec<Coordinates>>,
}

impl MockRouting {
    /// Answer requests from `origin` with `outcome` after `delay`.
    pub fn respond(
        &self, origin: Coordinates, delay: Duration, outcome: Result<Option<RouteSummary>>,
    ) {
        self.plans.lock().unwrap().push(Plan { origin, delay, outcome });
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.destinations.lock().unwrap().len()
    }

    /// Destination of the most recent request.
    #[must_use]
    pub fn last_destination(&self) -> Option<Coordinates> {
        self.destinations.lock().unwrap().last().copied()
    }
}

impl RoutingService for MockRouting {
    async fn route(
        &self, origin: Coordinates, destination: Coordinates,
    ) -> Result<Option<RouteSummary>> {
        self.destinations.lock().unwrap().push(destination);

        let scripted = {
            let plans = self.plans.lock().unwrap();
            plans
                .iter()
                .rev()
                .find(|plan| plan.origin == origin)
                .map(|plan| (plan.delay, plan.outcome.clone()))
        };
        let (delay, outcome) = scripted.unwrap_or((
            Duration::ZERO,
            Ok(Some(RouteSummary { distance_m: 1_000.0, duration_s: 120.0 })),
        ));

        tokio::time::sleep(delay).await;
        outcome
    }
}

/// Treats images of the form `qr:<text>` as readable symbols.
pub struct PrefixReader;

impl SymbolReader for PrefixReader {
    fn read(&self, image: &[u8]) -> Result<String> {
        std::str::from_utf8(image)
            .ok()
            .and_then(|text| text.strip_prefix("qr:"))
            .map(ToString::to_string)
            .ok_or_else(|| Error::Decode("no symbol".to_string()))
    }
}
