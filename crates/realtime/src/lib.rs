//! # Realtime Core
//!
//! Core modules for the campus transit realtime platform: the shared data
//! model, the collaborator interfaces, and the error taxonomy.

mod clock;
mod error;
mod model;
mod provider;
mod subscription;

pub use crate::clock::*;
pub use crate::error::*;
pub use crate::model::*;
pub use crate::provider::*;
pub use crate::subscription::*;
