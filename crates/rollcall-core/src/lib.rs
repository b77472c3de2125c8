//! `rollcall-core`: configuration, shared types and the config error.

pub mod config;
pub mod error;
pub mod types;

pub use config::RollcallConfig;
pub use error::{ConfigError, Result};
pub use types::{Event, EventStatus, NewEvent};
