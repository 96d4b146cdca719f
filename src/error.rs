use std::io;
use std::path::PathBuf;

/// Errors produced by the delta logger.
///
/// None of these ever escape into the host: the lifecycle turns configuration
/// errors into a `Disabled` state plus a status report, and every per-event or
/// per-file failure is logged and dropped at the boundary where it happens.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The configuration is unusable (missing log directory, bad interval, ...).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The log directory could not be created or is not a directory.
    #[error("log directory {path} is unusable: {source}")]
    LogDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Another writer holds the advisory lock on the log directory.
    #[error("log directory {path} is locked by another writer")]
    Locked { path: PathBuf },

    /// The marker file could not be written.
    #[error("failed to update marker file {path}: {source}")]
    Marker {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A single event could not be appended to the current log file.
    #[error("failed to append to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A single event could not be serialized.
    #[error("failed to serialize delta: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A compression run failed. The uncompressed file is left in place.
    #[error("compression of {path} failed: {reason}")]
    Compression { path: PathBuf, reason: String },

    /// The host's subscription mechanism reported a problem.
    #[error("subscription error: {0}")]
    Subscription(String),

    /// The writer task is gone (the logger was stopped).
    #[error("logger is not running")]
    NotRunning,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
