// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Error types shared by the library and both binaries.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed sensor value in {}: {value:?}", path.display())]
    MalformedSensor { path: PathBuf, value: String },

    #[error("Hardware path not available: {0}")]
    MissingPath(&'static str),

    #[error("Cannot lock {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("Device I/O timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid curve: {0}")]
    InvalidCurve(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl Error {
    /// Attach the offending path to an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
