//! Per-passenger boarding lifecycle: `Unboarded -> Boarded -> DroppedOff`.
//!
//! Each confirmed scan appends a `Boarded` event. Re-scanning while boarded
//! appends another one; scans are not deduplicated here. Drop-off closes the
//! most recent open event and always reaches the terminal state, even when
//! the store cannot confirm it.

use std::sync::Arc;

use realtime::{
    BoardingEvent, BoardingStatus, Error, EventFilter, EventId, NewBoarding, PassengerId, Result,
    TrackingStore, VehicleCode,
};
use tracing::{info, warn};

use crate::scan::{QrDecode, decode_vehicle};

/// The signed-in passenger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rider {
    pub id: PassengerId,
    pub name: String,
}

impl Rider {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self { id: PassengerId::new(id), name: name.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardingState {
    Unboarded,
    Boarded { vehicle_code: VehicleCode, event_id: EventId },
    DroppedOff { vehicle_code: VehicleCode },
}

impl BoardingState {
    #[must_use]
    pub const fn is_boarded(&self) -> bool {
        matches!(self, Self::Boarded { .. })
    }

    #[must_use]
    pub const fn vehicle_code(&self) -> Option<&VehicleCode> {
        match self {
            Self::Unboarded => None,
            Self::Boarded { vehicle_code, .. } | Self::DroppedOff { vehicle_code } => {
                Some(vehicle_code)
            }
        }
    }
}

/// What the store made of a drop-off request. The session is `DroppedOff`
/// whichever outcome is reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropOff {
    /// The open event was closed.
    Confirmed(BoardingEvent),
    /// No open event was left to close, e.g. it was closed elsewhere.
    NoOpenEvent,
    /// The store could not be updated.
    Unconfirmed(Error),
}

pub struct BoardingSession<S> {
    store: Arc<S>,
    rider: Rider,
    state: BoardingState,
}

impl<S: TrackingStore> BoardingSession<S> {
    pub const fn new(store: Arc<S>, rider: Rider) -> Self {
        Self { store, rider, state: BoardingState::Unboarded }
    }

    /// Restore the session from the rider's most recent open boarding on
    /// `vehicle_code`.
    ///
    /// # Errors
    ///
    /// Returns the store error when boarding events cannot be read.
    pub async fn resume(store: Arc<S>, rider: Rider, vehicle_code: VehicleCode) -> Result<Self> {
        let open = latest_open(store.as_ref(), &rider.id, &vehicle_code).await?;
        let state = open.map_or(BoardingState::Unboarded, |event| BoardingState::Boarded {
            vehicle_code,
            event_id: event.id,
        });
        Ok(Self { store, rider, state })
    }

    #[must_use]
    pub const fn state(&self) -> &BoardingState {
        &self.state
    }

    #[must_use]
    pub const fn rider(&self) -> &Rider {
        &self.rider
    }

    /// Record a boarding on `vehicle_code`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Conflict` once the session has dropped off, or the
    /// store error when the event cannot be appended. A failed append leaves
    /// the state unchanged.
    pub async fn board(&mut self, vehicle_code: VehicleCode) -> Result<BoardingEvent> {
        if let BoardingState::DroppedOff { vehicle_code: previous } = &self.state {
            return Err(Error::Conflict(format!("trip on {previous} has already ended")));
        }
        if let BoardingState::Boarded { vehicle_code: current, .. } = &self.state {
            warn!(passenger = %self.rider.id, current = %current, vehicle = %vehicle_code, "boarding again while boarded");
        }

        let event = self
            .store
            .append_event(NewBoarding {
                vehicle_code: vehicle_code.clone(),
                passenger_id: self.rider.id.clone(),
                passenger_name: self.rider.name.clone(),
            })
            .await?;

        info!(passenger = %self.rider.id, vehicle = %vehicle_code, "boarded");
        self.state = BoardingState::Boarded { vehicle_code, event_id: event.id };
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
        self.board(vehicle_code).await
    }

    /// Close the current boarding.
    ///
    /// # Errors
    ///
    /// Returns `Error::Conflict` unless the session is boarded. Store
    /// failures are reported through [`DropOff`], not as errors.
    pub async fn drop_off(&mut self) -> Result<DropOff> {
        let vehicle_code = match &self.state {
            BoardingState::Boarded { vehicle_code, .. } => vehicle_code.clone(),
            BoardingState::Unboarded => {
                return Err(Error::Conflict("cannot drop off before boarding".into()));
            }
            BoardingState::DroppedOff { vehicle_code } => {
                return Err(Error::Conflict(format!("already dropped off {vehicle_code}")));
            }
        };

        let outcome = self.close_open_event(&vehicle_code).await;
        match &outcome {
            DropOff::Confirmed(event) => {
                info!(passenger = %self.rider.id, vehicle = %vehicle_code, event = %event.id, "dropped off");
            }
            DropOff::NoOpenEvent => {
                warn!(passenger = %self.rider.id, vehicle = %vehicle_code, "no open boarding to close");
            }
            DropOff::Unconfirmed(e) => {
                warn!(passenger = %self.rider.id, vehicle = %vehicle_code, error = %e, "drop off not recorded");
            }
        }

        self.state = BoardingState::DroppedOff { vehicle_code };
        Ok(outcome)
    }

    async fn close_open_event(&self, vehicle_code: &VehicleCode) -> DropOff {
        let open = match latest_open(self.store.as_ref(), &self.rider.id, vehicle_code).await {
            Ok(Some(event)) => event,
            Ok(None) => return DropOff::NoOpenEvent,
            Err(e) => return DropOff::Unconfirmed(e),
        };

        match self.store.drop_off_event(open.id).await {
            Ok(event) => DropOff::Confirmed(event),
            // closed or removed between the lookup and the update
            Err(Error::Conflict(_) | Error::NotFound(_)) => DropOff::NoOpenEvent,
            Err(e) => DropOff::Unconfirmed(e),
        }
    }
}

/// Most recently created `Boarded` event for the passenger on the vehicle.
async fn latest_open<S: TrackingStore>(
    store: &S, passenger_id: &PassengerId, vehicle_code: &VehicleCode,
) -> Result<Option<BoardingEvent>> {
    let filter = EventFilter::passenger(passenger_id.clone())
        .and_vehicle(vehicle_code.clone())
        .and_status(BoardingStatus::Boarded);
    let events = store.query_events(&filter).await?;
    Ok(events.into_iter().max_by_key(|event| event.boarded_at))
}
