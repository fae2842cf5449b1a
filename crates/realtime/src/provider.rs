//! # Provider
//!
//! Provider defines external data interfaces for the crate. Each collaborator
//! is constructed by the host and passed into the components that use it.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{Request, Response};

use crate::error::Result;
use crate::model::{
    BoardingEvent, Coordinates, EventFilter, EventId, NewBoarding, TrackingPatch, VehicleCode,
    VehicleTrackingRecord,
};
use crate::subscription::Subscription;

/// The `TrackingStore` trait defines the shared realtime document store: one
/// mutable record per vehicle plus the boarding event log.
///
/// Implementations must stamp every write with server time and merge record
/// writes field by field.
pub trait TrackingStore: Send + Sync {
    /// Server time used to stamp writes.
    fn server_time(&self) -> DateTime<Utc>;

    /// Field-level upsert of a vehicle record, creating it on first write.
    fn merge_record(
        &self, code: &VehicleCode, patch: TrackingPatch,
    ) -> impl Future<Output = Result<VehicleTrackingRecord>> + Send;

    fn get_record(
        &self, code: &VehicleCode,
    ) -> impl Future<Output = Result<Option<VehicleTrackingRecord>>> + Send;

    /// Current record followed by every subsequent change.
    fn subscribe_record(
        &self, code: &VehicleCode,
    ) -> impl Future<Output = Result<Subscription<Option<VehicleTrackingRecord>>>> + Send;

    /// Append a boarding event; the store assigns its id and `boarded_at`.
    fn append_event(
        &self, boarding: NewBoarding,
    ) -> impl Future<Output = Result<BoardingEvent>> + Send;

    /// Events matching `filter`, oldest first.
    fn query_events(
        &self, filter: &EventFilter,
    ) -> impl Future<Output = Result<Vec<BoardingEvent>>> + Send;

    /// Matching result set now and after every change to it.
    fn subscribe_events(
        &self, filter: &EventFilter,
    ) -> impl Future<Output = Result<Subscription<Vec<BoardingEvent>>>> + Send;

    /// Terminal status transition; the store assigns `dropped_off_at`.
    fn drop_off_event(&self, id: EventId) -> impl Future<Output = Result<BoardingEvent>> + Send;

    fn delete_event(&self, id: EventId) -> impl Future<Output = Result<()>> + Send;
}

/// Position sample from the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fix {
    pub coordinates: Coordinates,
    /// Ground speed in metres per second, when the device reports one.
    pub speed_mps: Option<f64>,
}

/// Device positioning request options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionOptions {
    pub high_accuracy: bool,
    pub timeout: Duration,
    pub maximum_age: Duration,
}

impl Default for PositionOptions {
    fn default() -> Self {
        Self { high_accuracy: true, timeout: Duration::from_secs(5), maximum_age: Duration::ZERO }
    }
}

/// The `Geolocation` trait defines device positioning.
pub trait Geolocation: Send + Sync {
    /// One-shot fix.
    fn current_position(
        &self, options: PositionOptions,
    ) -> impl Future<Output = Result<Fix>> + Send;

    /// Continuous watch; dropping the subscription clears the watch.
    fn watch_position(
        &self, options: PositionOptions,
    ) -> impl Future<Output = Result<Subscription<Fix>>> + Send;
}

/// The `HttpRequest` trait defines the behavior for fetching data from a source.
pub trait HttpRequest: Send + Sync {
    /// Make outbound HTTP request.
    fn fetch(&self, request: Request<Bytes>) -> impl Future<Output = Result<Response<Bytes>>> + Send;
}

/// The `SymbolReader` trait decodes a QR symbol from one image.
pub trait SymbolReader: Send + Sync {
    /// Decoded text of the first symbol found in `image`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Decode` when no readable symbol is present.
    fn read(&self, image: &[u8]) -> Result<String>;
}
