use std::env;
use std::time::Duration;

use realtime::{Coordinates, PositionOptions};

const DEFAULT_ROUTING_URL: &str = "https://router.project-osrm.org";
const DEFAULT_CAMPUS: Coordinates = Coordinates::new(12.957_952, 80.160_793);

/// Cadences and thresholds shared by the tracking components.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Liveness write interval while a trip is active.
    pub heartbeat_interval: Duration,
    /// Maximum age of `last_updated` before a vehicle is considered offline.
    pub offline_threshold: Duration,
    /// Re-evaluation interval for the liveness monitor.
    pub liveness_poll_interval: Duration,
    /// Refresh interval for route metrics.
    pub route_refresh_interval: Duration,
    /// Client-side bound on a single routing request.
    pub route_timeout: Duration,
    /// Client-side bound on a single store write.
    pub write_timeout: Duration,
    pub routing_url: String,
    /// Destination used once the passenger has boarded.
    pub campus: Coordinates,
    /// Seat capacity of a vehicle.
    pub total_seats: u32,
    pub position_options: PositionOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            offline_threshold: Duration::from_millis(120_000),
            liveness_poll_interval: Duration::from_secs(10),
            route_refresh_interval: Duration::from_secs(10),
            route_timeout: Duration::from_secs(8),
            write_timeout: Duration::from_secs(10),
            routing_url: DEFAULT_ROUTING_URL.to_string(),
            campus: DEFAULT_CAMPUS,
            total_seats: 50,
            position_options: PositionOptions::default(),
        }
    }
}

impl Config {
    /// Defaults overridden from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let campus = Coordinates::new(
            env_f64("CAMPUS_LAT", defaults.campus.latitude),
            env_f64("CAMPUS_LNG", defaults.campus.longitude),
        );

        Self {
            heartbeat_interval: env_secs("HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval),
            offline_threshold: env_millis("OFFLINE_THRESHOLD_MS", defaults.offline_threshold),
            liveness_poll_interval: env_secs("LIVENESS_POLL_SECS", defaults.liveness_poll_interval),
            route_refresh_interval: env_secs("ROUTE_REFRESH_SECS", defaults.route_refresh_interval),
            route_timeout: env_secs("ROUTE_TIMEOUT_SECS", defaults.route_timeout),
            write_timeout: env_secs("WRITE_TIMEOUT_SECS", defaults.write_timeout),
            routing_url: env::var("ROUTING_URL").unwrap_or(defaults.routing_url),
            campus,
            total_seats: env_u32("TOTAL_SEATS", defaults.total_seats),
            position_options: defaults.position_options,
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.trim().parse::<u64>().ok())
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env_u64(key).filter(|secs| *secs > 0).map_or(default, Duration::from_secs)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env_u64(key).filter(|millis| *millis > 0).map_or(default, Duration::from_millis)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key).ok().and_then(|value| value.trim().parse::<u32>().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
}
