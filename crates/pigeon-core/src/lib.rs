//! # Pigeon Core
//!
//! Shared data model, collaborator traits, error type, and configuration
//! for the Pigeon scheduled-notification engine.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::PigeonConfig;
pub use error::{PigeonError, Result, ScheduleError};
pub use traits::*;
pub use types::*;
