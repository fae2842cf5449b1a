//! Realtime vehicle tracking and boarding-state synchronisation.
//!
//! Driver side: [`publisher`] and [`roster`] write into the tracking store.
//! Passenger side: [`liveness`] and [`route_metrics`] read from it, while
//! [`boarding`] records the passenger's trip lifecycle as boarding events.

pub mod attendance;
pub mod boarding;
pub mod config;
pub mod liveness;
pub mod notice;
pub mod osrm;
pub mod publisher;
pub mod roster;
pub mod route_metrics;
pub mod scan;
pub mod store;
pub mod writer;

pub use config::Config;
pub use notice::{Notice, NoticeSource, Notices};
pub use store::MemoryStore;
