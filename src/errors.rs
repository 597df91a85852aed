//! Typed error hierarchy for the orchestration core.
//!
//! Each subsystem gets its own enum so callers can match on precise
//! failure modes instead of inspecting strings:
//! - `PlanError` — segment planning (bad durations)
//! - `StateError` — state store read/write and invariant failures
//! - `ResolveError` — resume resolution against on-disk artifacts
//! - `EngineError` — external engine subprocess lifecycle
//! - `LockError` — project-level single-orchestrator lock
//! - `RunError` — aggregate for the orchestration loop

use std::path::PathBuf;
use thiserror::Error;

/// Errors from segment planning.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },
}

/// Errors from the segment state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("No job state file found at {path}")]
    NotFound { path: PathBuf },

    #[error("Job state file at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("State store I/O failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No segment with index {index}")]
    UnknownSegment { index: usize },

    #[error("Ambiguous job state: {message}")]
    AmbiguousState { message: String },

    #[error("Job state invariant violated: {message}")]
    InvariantViolation { message: String },
}

/// Errors from resume resolution.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Failed to inspect {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Ambiguous resume state: {message}")]
    AmbiguousState { message: String },
}

/// Errors from the external engine subprocess.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to spawn engine process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to poll engine process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("Engine exited with non-zero code {code}")]
    NonZeroExit { code: i32 },

    #[error("Engine monitor task failed: {message}")]
    Monitor { message: String },
}

/// Errors from the project lock guarding against concurrent orchestrators.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Another orchestrator holds the lock at {path}")]
    Busy { path: PathBuf },

    #[error("Failed to acquire lock at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Aggregate error for the orchestration loop.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Segment {segment} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        segment: usize,
        attempts: u32,
        last_error: String,
    },
}
