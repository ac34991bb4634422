//! Core services for the synchronized playback coordinator
//!
//! Everything here is transport-agnostic: the server binary wires these
//! services to its HTTP and WebSocket surfaces.

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod service;

pub use config::Config;
pub use error::{Error, Result};
