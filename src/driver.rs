//! Driver console: one selected vehicle, its trip and its roster.

use std::sync::Arc;
use std::time::Duration;

use realtime::{Error, Geolocation, Result, TrackingStore, VehicleCode, bad_request};
use tracing::{info, warn};
use tracking::publisher::LocationPublisher;
use tracking::roster::{ClearReport, ClearRoster, Roster, RosterTracker};
use tracking::{Config, NoticeSource, Notices};

/// Trip timer display, `MM:SS`. Minutes keep counting past the hour.
#[must_use]
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

pub struct DriverConsole<S, G> {
    store: Arc<S>,
    config: Config,
    notices: Notices,
    publisher: LocationPublisher<G>,
    vehicle_code: Option<VehicleCode>,
    roster: Option<RosterTracker<S>>,
}

impl<S, G> DriverConsole<S, G>
where
    S: TrackingStore + 'static,
    G: Geolocation + 'static,
{
    pub fn new(store: Arc<S>, geolocation: Arc<G>, config: Config) -> Self {
        let publisher = LocationPublisher::new(Arc::clone(&store), geolocation, &config);
        Self {
            store,
            config,
            notices: Notices::new(),
            publisher,
            vehicle_code: None,
            roster: None,
        }
    }

    /// Select the vehicle being driven. Changing vehicle restarts the roster
    /// for the new code; an active trip carries over and publishes under the
    /// new code from then on.
    ///
    /// # Errors
    ///
    /// Returns `Error::MissingField` when `code` is blank.
    pub async fn select_vehicle(&mut self, code: &str) -> Result<VehicleCode> {
        let vehicle_code: VehicleCode = code.parse()?;
        if self.vehicle_code.as_ref() == Some(&vehicle_code) {
            return Ok(vehicle_code);
        }

        if let Some(roster) = self.roster.take() {
            roster.stop().await;
        }

        match RosterTracker::start(
            Arc::clone(&self.store),
            vehicle_code.clone(),
            &self.config,
            self.notices.clone(),
        )
        .await
        {
            Ok(roster) => self.roster = Some(roster),
            Err(e) => {
                warn!(vehicle = %vehicle_code, error = %e, "roster unavailable");
                self.notices.post(NoticeSource::Roster, "Passenger list is unavailable");
            }
        }

        self.publisher.switch_vehicle(vehicle_code.clone()).await;

        info!(vehicle = %vehicle_code, trip_active = self.publisher.is_active(), "vehicle selected");
        self.vehicle_code = Some(vehicle_code.clone());
        Ok(vehicle_code)
    }

    #[must_use]
    pub const fn vehicle_code(&self) -> Option<&VehicleCode> {
        self.vehicle_code.as_ref()
    }

    /// Begin publishing location and heartbeats.
    ///
    /// # Errors
    ///
    /// Returns `Error::MissingField` when no vehicle has been selected.
    pub async fn start_trip(&mut self) -> Result<()> {
        let Some(vehicle_code) = self.vehicle_code.clone() else {
            return Err(Error::MissingField("vehicle code".into()));
        };
        self.publisher.activate(vehicle_code).await;
        Ok(())
    }

    pub async fn end_trip(&mut self) {
        self.publisher.deactivate().await;
    }

    #[must_use]
    pub fn is_trip_active(&self) -> bool {
        self.publisher.is_active()
    }

    #[must_use]
    pub fn speed_kmh(&self) -> u32 {
        self.publisher.speed_kmh()
    }

    #[must_use]
    pub fn trip_elapsed(&self) -> Duration {
        self.publisher.trip_elapsed()
    }

    #[must_use]
    pub fn trip_clock(&self) -> String {
        format_elapsed(self.trip_elapsed())
    }

    #[must_use]
    pub fn roster(&self) -> Roster {
        self.roster.as_ref().map(RosterTracker::roster).unwrap_or_default()
    }

    /// Clear the selected vehicle's roster.
    ///
    /// # Errors
    ///
    /// Returns `Error::BadRequest` when no roster is running or the
    /// confirmation names another vehicle.
    pub async fn clear_roster(&self, confirmation: ClearRoster) -> Result<ClearReport> {
        let Some(roster) = &self.roster else {
            return Err(bad_request!("no vehicle roster to clear"));
        };
        roster.clear(confirmation).await
    }

    #[must_use]
    pub const fn notices(&self) -> &Notices {
        &self.notices
    }

    /// Wait until queued store writes have been attempted.
    pub async fn flush(&self) {
        self.publisher.flush().await;
        if let Some(roster) = &self.roster {
            roster.flush().await;
        }
    }

    /// End the trip and release every subscription.
    pub async fn close(mut self) {
        self.publisher.deactivate().await;
        if let Some(roster) = self.roster.take() {
            roster.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trip_clock_format() {
        assert_eq!(format_elapsed(Duration::ZERO), "00:00");
        assert_eq!(format_elapsed(Duration::from_millis(65_900)), "01:05");
        assert_eq!(format_elapsed(Duration::from_secs(3_725)), "62:05");
    }
}
