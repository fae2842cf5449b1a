//! # Model
//!
//! Records shared by every client through the tracking store.

use std::fmt::{self, Display};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Human-assigned short identifier for a vehicle (e.g. "3A").
///
/// Codes are trimmed and upper-cased so that "3a " and "3A" key the same
/// tracking record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VehicleCode(String);

impl VehicleCode {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for VehicleCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_uppercase();
        if code.is_empty() {
            return Err(Error::MissingField("vehicle code".to_string()));
        }
        Ok(Self(code))
    }
}

impl TryFrom<String> for VehicleCode {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VehicleCode> for String {
    fn from(code: VehicleCode) -> Self {
        code.0
    }
}

impl Display for VehicleCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a passenger account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PassengerId(String);

impl PassengerId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PassengerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// WGS84 position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    #[serde(rename = "lat")]
    pub latitude: f64,
    #[serde(rename = "lng")]
    pub longitude: f64,
}

impl Coordinates {
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

/// Per-vehicle record consumed by every passenger client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleTrackingRecord {
    /// Key the record is stored under.
    pub vehicle_code: VehicleCode,

    /// Last reported fix. Absent until the first position write and may lag
    /// `last_updated` when only heartbeats arrive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Coordinates>,

    /// Vehicle speed in km/h, rounded.
    pub speed_kmh: u32,

    /// Onboard headcount as last synced by the roster tracker.
    pub passenger_count: u32,

    /// Server-assigned time of the most recent write of any kind.
    pub last_updated: DateTime<Utc>,
}

impl VehicleTrackingRecord {
    /// Record created by the first write for `vehicle_code`.
    #[must_use]
    pub fn new(vehicle_code: VehicleCode, stamped_at: DateTime<Utc>) -> Self {
        Self {
            vehicle_code,
            position: None,
            speed_kmh: 0,
            passenger_count: 0,
            last_updated: stamped_at,
        }
    }

    /// Field-level merge. Fields absent from `patch` keep their value and
    /// `last_updated` never moves backwards.
    pub fn merge(&mut self, patch: &TrackingPatch, stamped_at: DateTime<Utc>) {
        if let Some(position) = patch.position {
            self.position = Some(position);
        }
        if let Some(speed) = patch.speed_kmh {
            self.speed_kmh = speed;
        }
        if let Some(count) = patch.passenger_count {
            self.passenger_count = count;
        }
        self.last_updated = self.last_updated.max(stamped_at);
    }
}

/// Partial update for a [`VehicleTrackingRecord`].
///
/// `last_updated` is not part of the patch: the store stamps every merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Coordinates>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_kmh: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passenger_count: Option<u32>,
}

impl TrackingPatch {
    /// Liveness-only write.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn location(position: Coordinates, speed_kmh: u32) -> Self {
        Self { position: Some(position), speed_kmh: Some(speed_kmh), passenger_count: None }
    }

    #[must_use]
    pub const fn passenger_count(count: u32) -> Self {
        Self { position: None, speed_kmh: None, passenger_count: Some(count) }
    }

    /// Fold `later` over this patch; fields set in `later` win.
    #[must_use]
    pub fn then(self, later: Self) -> Self {
        Self {
            position: later.position.or(self.position),
            speed_kmh: later.speed_kmh.or(self.speed_kmh),
            passenger_count: later.passenger_count.or(self.passenger_count),
        }
    }

    #[must_use]
    pub const fn is_heartbeat(&self) -> bool {
        self.position.is_none() && self.speed_kmh.is_none() && self.passenger_count.is_none()
    }
}

/// Store-assigned identifier of a boarding event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoardingStatus {
    Boarded,
    #[serde(rename = "Dropped Off")]
    DroppedOff,
}

impl Display for BoardingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boarded => f.write_str("Boarded"),
            Self::DroppedOff => f.write_str("Dropped Off"),
        }
    }
}

/// One passenger boarding one vehicle. Retained as attendance history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardingEvent {
    pub id: EventId,
    pub vehicle_code: VehicleCode,
    pub passenger_id: PassengerId,
    pub passenger_name: String,
    pub status: BoardingStatus,
    pub boarded_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dropped_off_at: Option<DateTime<Utc>>,
}

impl BoardingEvent {
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == BoardingStatus::Boarded
    }

    /// Terminal transition. An event is mutated at most once.
    ///
    /// # Errors
    ///
    /// Returns `Error::Conflict` when the event has already been dropped off.
    pub fn drop_off(&mut self, at: DateTime<Utc>) -> Result<(), Error> {
        if !self.is_open() {
            return Err(Error::Conflict(format!("boarding {} is already dropped off", self.id)));
        }
        self.status = BoardingStatus::DroppedOff;
        self.dropped_off_at = Some(at.max(self.boarded_at));
        Ok(())
    }

    /// Time of the latest transition.
    #[must_use]
    pub fn last_transition_at(&self) -> DateTime<Utc> {
        self.dropped_off_at.unwrap_or(self.boarded_at)
    }
}

/// Boarding request before the store assigns its identity and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBoarding {
    pub vehicle_code: VehicleCode,
    pub passenger_id: PassengerId,
    pub passenger_name: String,
}

impl NewBoarding {
    /// Materialise the event with store-assigned identity and time.
    #[must_use]
    pub fn into_event(self, id: EventId, boarded_at: DateTime<Utc>) -> BoardingEvent {
        BoardingEvent {
            id,
            vehicle_code: self.vehicle_code,
            passenger_id: self.passenger_id,
            passenger_name: self.passenger_name,
            status: BoardingStatus::Boarded,
            boarded_at,
            dropped_off_at: None,
        }
    }
}

/// Equality predicates for boarding event queries and subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub vehicle_code: Option<VehicleCode>,
    pub passenger_id: Option<PassengerId>,
    pub status: Option<BoardingStatus>,
}

impl EventFilter {
    #[must_use]
    pub fn vehicle(code: VehicleCode) -> Self {
        Self { vehicle_code: Some(code), ..Self::default() }
    }

    #[must_use]
    pub fn passenger(id: PassengerId) -> Self {
        Self { passenger_id: Some(id), ..Self::default() }
    }

    #[must_use]
    pub fn and_vehicle(mut self, code: VehicleCode) -> Self {
        self.vehicle_code = Some(code);
        self
    }

    #[must_use]
    pub fn and_passenger(mut self, id: PassengerId) -> Self {
        self.passenger_id = Some(id);
        self
    }

    #[must_use]
    pub const fn and_status(mut self, status: BoardingStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn matches(&self, event: &BoardingEvent) -> bool {
        self.vehicle_code.as_ref().is_none_or(|code| *code == event.vehicle_code)
            && self.passenger_id.as_ref().is_none_or(|id| *id == event.passenger_id)
            && self.status.is_none_or(|status| status == event.status)
    }
}
