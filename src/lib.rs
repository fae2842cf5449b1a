//! # Transit
//!
//! Driver and passenger views over the realtime tracking engine. Each view is
//! constructed with its collaborators (tracking store, geolocation, routing)
//! and owns every subscription and timer it starts.

pub mod driver;
pub mod logging;
pub mod passenger;

pub use driver::DriverConsole;
pub use logging::{Verbosity, init_logging};
pub use passenger::PassengerDashboard;
