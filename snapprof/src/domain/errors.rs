//! Structured error types for snapprof
//!
//! Using thiserror for automatic Display implementation and error chaining.

use super::types::ProfileKind;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal outcomes of [`crate::ProfilerController::run`]
#[derive(Error, Debug)]
pub enum ProfilerError {
    #[error("Failed to create CPU profile {path}: {source}")]
    CpuArtifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Error parsing interval parameter: {0}")]
    InvalidInterval(#[from] IntervalError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntervalError {
    #[error("invalid duration {0:?}")]
    Malformed(String),

    #[error("missing unit in duration {0:?}")]
    MissingUnit(String),

    #[error("unknown unit {unit:?} in duration {input:?}")]
    UnknownUnit { unit: String, input: String },

    #[error("duration {0:?} overflows")]
    Overflow(String),

    #[error("interval {0:?} must be positive")]
    NotPositive(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Failures reported by an [`crate::Instrumentation`] backend
#[derive(Error, Debug)]
pub enum InstrumentationError {
    #[error("{0} profiling is not supported by this backend")]
    Unsupported(ProfileKind),

    #[error("CPU profiling already in progress")]
    CpuAlreadyRunning,

    #[error("profiler backend failed: {0}")]
    Backend(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Why one artifact of a snapshot was skipped
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Failed to create {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {kind} profile: {source}")]
    Write {
        kind: ProfileKind,
        #[source]
        source: InstrumentationError,
    },

    #[error("Failed to close {path}: {source}")]
    Close {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
