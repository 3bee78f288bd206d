//! Error types for the directory monitor.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for monitor operations.
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Errors that can occur in the directory monitor.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// A directory could not be registered with the watch handle.
    #[error("failed to register {path}: {source}")]
    Registration {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    /// The watch session can no longer deliver events.
    #[error("watch session invalidated: {0}")]
    SessionInvalidated(String),

    /// `start` was called on a monitor that already ran.
    #[error("monitor already started: {0}")]
    AlreadyStarted(String),

    /// The sink rejected an event.
    #[error("sink rejected event: {0}")]
    Sink(anyhow::Error),

    /// Notify error.
    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}
