//! Typed error hierarchy for the stagehand orchestrator.
//!
//! Four enums cover the subsystems:
//! - `PipelineError`: driver and resume failures (all pipeline-fatal)
//! - `StoreError`: durable cursor store failures
//! - `StepValidationError`: malformed step registrations (skipped, never fatal)
//! - `ConfigError`: missing or invalid `stagehand.toml`

use std::path::PathBuf;
use thiserror::Error;

/// Errors that terminate a pipeline run.
///
/// Every variant is fatal: the driver clears the cursor and the host process
/// exits with a failure status.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The step's action returned an error (as opposed to being interrupted).
    #[error("Step '{step}' failed: {source:#}")]
    StepFailed {
        step: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Step '{step}' exhausted its retries ({attempts} attempts, limit {limit})")]
    RetriesExhausted {
        step: String,
        attempts: u32,
        limit: u32,
    },

    /// A step with the Cancel policy was interrupted.
    #[error("Step '{step}' was interrupted and its policy is cancel")]
    Cancelled { step: String },

    #[error("Cursor points at step {index} but only {step_count} steps are registered")]
    UnknownStep { index: usize, step_count: usize },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the durable cursor store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Cursor store I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cursor store at {path} is held by another process")]
    Locked { path: PathBuf },

    #[error("Cursor store at {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Cursor key '{key}' holds an unexpected value: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to serialize cursor value for '{key}': {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Cursor store lock poisoned")]
    LockPoisoned,
}

/// Reasons a registered step descriptor is rejected during assembly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepValidationError {
    #[error("step '{name}' has no action")]
    MissingAction { name: String },

    #[error("step registered with a blank name")]
    BlankName,

    #[error("step name '{name}' may not contain whitespace or '.'")]
    InvalidName { name: String },

    #[error("step name '{name}' is already registered")]
    DuplicateName { name: String },
}

/// Errors from loading the static pipeline descriptor.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Failed to parse config at {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}
