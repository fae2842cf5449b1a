mod provider;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pretty_assertions::assert_eq;
use realtime::{
    BoardingStatus, Coordinates, Error, NewBoarding, PassengerId, TrackingPatch, TrackingStore,
    VehicleCode,
};
use tracking::boarding::{BoardingState, DropOff, Rider};
use tracking::route_metrics::{RouteEstimate, RouteMetrics};
use tracking::scan::StillImage;
use tracking::{Config, MemoryStore};
use transit::PassengerDashboard;

use self::provider::{MockGeolocation, MockRouting, PrefixReader, fix};

const CAMPUS: Coordinates = Coordinates::new(12.957_952, 80.160_793);
const BUS: Coordinates = Coordinates::new(12.90, 80.10);
const STOP: Coordinates = Coordinates::new(12.92, 80.12);

type Dashboard = PassengerDashboard<MemoryStore, MockGeolocation, MockRouting>;

fn code(s: &str) -> VehicleCode {
    s.parse().expect("valid code")
}

struct Harness {
    store: Arc<MemoryStore>,
    geolocation: MockGeolocation,
    routing: Arc<MockRouting>,
    dashboard: Dashboard,
}

async fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    for vehicle in ["3A", "7B"] {
        store.merge_record(&code(vehicle), TrackingPatch::location(BUS, 30)).await.expect("write");
    }
    store.merge_record(&code("3A"), TrackingPatch::passenger_count(3)).await.expect("write");

    let geolocation = MockGeolocation::new(Some(fix(STOP.latitude, STOP.longitude, None)));
    let routing = Arc::new(MockRouting::default());
    let dashboard = PassengerDashboard::new(
        Arc::clone(&store),
        Arc::new(geolocation.clone()),
        Arc::clone(&routing),
        Config::default(),
        Rider::new("s-1", "Asha"),
    );

    Harness { store, geolocation, routing, dashboard }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn tracking_routes_to_the_rider_then_campus() {
    let mut h = harness().await;

    h.dashboard.track(" 3a").await.expect("track");
    settle().await;
    assert_eq!(h.dashboard.vehicle_code(), Some(&code("3A")));
    assert_eq!(h.dashboard.boarding_state(), BoardingState::Unboarded);
    assert!(!h.dashboard.is_offline());
    assert_eq!(h.dashboard.seats_left(), Some(47));
    assert_eq!(h.geolocation.active_watches(), 1);
    assert_eq!(h.routing.last_destination(), Some(STOP));
    assert_eq!(
        h.dashboard.metrics(),
        RouteMetrics::Ready(RouteEstimate { distance_km: 1.0, eta_minutes: 2 })
    );

    let event = h.dashboard.board("3A").await.expect("board");
    settle().await;
    assert_eq!(event.status, BoardingStatus::Boarded);
    assert!(h.dashboard.boarding_state().is_boarded());
    assert_eq!(h.geolocation.active_watches(), 0);
    assert_eq!(h.routing.last_destination(), Some(CAMPUS));

    // rider movement no longer steers the estimate
    let calls = h.routing.calls();
    h.geolocation.push(fix(12.0, 80.0, None));
    settle().await;
    assert_eq!(h.routing.calls(), calls);

    h.dashboard.close().await;
    assert_eq!(h.store.record_listeners(), 0);
}

#[tokio::test(start_paused = true)]
async fn drop_off_ends_tracking() {
    let mut h = harness().await;

    let not_tracking = h.dashboard.drop_off().await;
    assert!(matches!(not_tracking, Err(Error::Conflict(_))));

    h.dashboard.track("3A").await.expect("track");
    let not_boarded = h.dashboard.drop_off().await;
    assert!(matches!(not_boarded, Err(Error::Conflict(_))));
    assert_eq!(h.dashboard.vehicle_code(), Some(&code("3A")));

    let mut image = StillImage::new(Arc::new(PrefixReader), Bytes::from_static(b"qr:3A"));
    let boarded = h.dashboard.board_scanned(&mut image).await.expect("board");
    settle().await;

    let outcome = h.dashboard.drop_off().await.expect("drop off");
    assert!(matches!(outcome, DropOff::Confirmed(ref event) if event.id == boarded.id));
    assert_eq!(h.dashboard.vehicle_code(), None);
    assert!(h.dashboard.is_offline());
    assert_eq!(h.dashboard.metrics(), RouteMetrics::Pending);
    assert_eq!(h.store.record_listeners(), 0);
    assert_eq!(h.geolocation.active_watches(), 0);

    let attendance = h.dashboard.attendance().await.expect("attendance");
    assert_eq!(attendance.len(), 1);
    assert_eq!(attendance[0].label(), "Safe Arrival");
    h.dashboard.close().await;
}

#[tokio::test(start_paused = true)]
async fn tracking_resumes_an_open_boarding() {
    let mut h = harness().await;
    let open = h
        .store
        .append_event(NewBoarding {
            vehicle_code: code("3A"),
            passenger_id: PassengerId::new("s-1"),
            passenger_name: "Asha".to_string(),
        })
        .await
        .expect("boarding");

    h.dashboard.track("3A").await.expect("track");
    settle().await;
    assert_eq!(
        h.dashboard.boarding_state(),
        BoardingState::Boarded { vehicle_code: code("3A"), event_id: open.id }
    );
    assert_eq!(h.geolocation.active_watches(), 0);
    assert_eq!(h.routing.last_destination(), Some(CAMPUS));
    h.dashboard.close().await;
}

#[tokio::test(start_paused = true)]
async fn switching_vehicle_releases_subscriptions() {
    let mut h = harness().await;

    h.dashboard.track("3A").await.expect("track");
    settle().await;
    let per_vehicle = h.store.record_listeners();
    assert!(per_vehicle > 0);

    h.dashboard.track("7B").await.expect("switch");
    settle().await;
    assert_eq!(h.dashboard.vehicle_code(), Some(&code("7B")));
    assert_eq!(h.store.record_listeners(), per_vehicle);
    assert_eq!(h.geolocation.active_watches(), 1);
    assert_eq!(h.dashboard.seats_left(), Some(50));

    h.dashboard.exit_tracking().await;
    assert_eq!(h.store.record_listeners(), 0);
    assert_eq!(h.geolocation.active_watches(), 0);
    h.dashboard.close().await;
}

#[tokio::test(start_paused = true)]
async fn silent_vehicle_goes_offline() {
    let mut h = harness().await;

    h.dashboard.track("3A").await.expect("track");
    settle().await;
    assert!(!h.dashboard.is_offline());

    tokio::time::sleep(Duration::from_secs(131)).await;
    assert!(h.dashboard.is_offline());

    h.store.merge_record(&code("3A"), TrackingPatch::heartbeat()).await.expect("write");
    settle().await;
    assert!(!h.dashboard.is_offline());
    h.dashboard.close().await;
}

#[tokio::test(start_paused = true)]
async fn unavailable_store_posts_a_notice() {
    let mut h = harness().await;
    h.store.set_available(false);

    assert!(h.dashboard.track("3A").await.is_err());
    assert_eq!(h.dashboard.vehicle_code(), None);
    assert!(!h.dashboard.notices().current().is_empty());
    assert_eq!(h.store.record_listeners(), 0);
    h.dashboard.close().await;
}
