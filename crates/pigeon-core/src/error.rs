//! Unified error types for Pigeon.

use thiserror::Error;

/// Result type alias using PigeonError.
pub type Result<T> = std::result::Result<T, PigeonError>;

#[derive(Error, Debug)]
pub enum PigeonError {
    // Persistence errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // Delivery errors
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    // Scheduling errors
    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    // General errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl PigeonError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Failures while resolving when a schedule should fire.
///
/// Kept separate from [`PigeonError`] so callers can tell "the recurrence
/// ended" (`Ok(None)`) apart from "the schedule is misconfigured" (`Err`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Unknown time zone: '{0}'")]
    UnknownTimeZone(String),

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Cron expression '{0}' has no upcoming occurrence")]
    NoOccurrence(String),

    #[error("Invalid recurrence pattern: {0}")]
    InvalidPattern(String),
}
