//! # Clock
//!
//! Time source shared by the store and the components that compare against
//! store-assigned timestamps.

use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::Instant;

/// Wall-clock source.
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Wall clock anchored to the tokio timer.
///
/// Readings advance with `tokio::time`, so a paused test runtime drives this
/// clock forward together with every interval and sleep.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin_utc: DateTime<Utc>,
    origin: Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Clock reading `origin_utc` at the moment of construction.
    #[must_use]
    pub fn starting_at(origin_utc: DateTime<Utc>) -> Self {
        Self { origin_utc, origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.origin.elapsed()).unwrap_or_default();
        self.origin_utc.checked_add_signed(elapsed).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
