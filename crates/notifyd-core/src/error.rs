//! Unified error types for notifyd.

use thiserror::Error;

/// Result type alias using NotifydError.
pub type Result<T> = std::result::Result<T, NotifydError>;

#[derive(Error, Debug)]
pub enum NotifydError {
    // Scheduler errors
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// No task is registered under this notification id.
    #[error("could not find task {0} within the task list")]
    IdNotFound(i64),

    // Delivery errors
    #[error("Send error: {0}")]
    Send(String),

    #[error("Event bus error: {0}")]
    Bus(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The orchestration loop observed the shutdown signal.
    #[error("context done is received, stop sending messages")]
    Stopped,

    // General errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NotifydError {
    pub fn invalid_task(msg: impl Into<String>) -> Self {
        Self::InvalidTask(msg.into())
    }

    pub fn send(msg: impl Into<String>) -> Self {
        Self::Send(msg.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True for the expected "no such task" sentinel used for control flow.
    pub fn is_id_not_found(&self) -> bool {
        matches!(self, Self::IdNotFound(_))
    }
}
