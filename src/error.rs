use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

use crate::fingerprint::TransformError;

#[derive(Error, Debug)]
pub enum BackfillError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error), // Converts io::Error into BackfillError automatically

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError), // Converts rusqlite::Error automatically

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Insufficient free space: {percent_free:.2}% free, minimum is {min_percent_free:.2}%")]
    InsufficientSpace {
        percent_free: f64,
        min_percent_free: f64,
    },

    #[error("Record '{id}' failed and stop-on-error is set: {source}")]
    RecordFailed {
        id: String,
        #[source]
        source: TransformError,
    },

    #[error("Migration interrupted")]
    Interrupted,

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}

impl From<figment::Error> for BackfillError {
    fn from(err: figment::Error) -> Self {
        BackfillError::ConfigError(err.to_string())
    }
}
