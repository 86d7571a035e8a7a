//! Error types for voicetotex
//!
//! Uses thiserror for ergonomic error definitions with clear messages
//! that guide users toward fixing common issues.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the voicetotex host
#[derive(Error, Debug)]
pub enum HostError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Environment setup failed: {0}")]
    Provision(#[from] ProvisionError),

    #[error("Backend launch failed: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Supervisor is no longer running")]
    SupervisorGone,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while locating or bootstrapping the worker runtime
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Python 3 not found. Install python3 or set VOICETOTEX_PYTHON to an interpreter path.")]
    NoBaseInterpreter,

    #[error("Failed to create Python environment at {path}: {reason}")]
    VenvFailed { path: PathBuf, reason: String },

    #[error("Failed to install backend dependencies from {manifest}: {reason}")]
    InstallFailed { manifest: PathBuf, reason: String },

    #[error("{step} timed out after {secs}s")]
    Timeout { step: &'static str, secs: u64 },

    #[error(
        "Backend directory not found: {0}\n  \
         Set [worker] backend_dir in config or VOICETOTEX_BACKEND_DIR."
    )]
    BackendMissing(PathBuf),
}

/// Errors raised when the worker executable cannot be launched
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Cannot execute {program}: {source}")]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker {0} not available after spawn")]
    MissingPipe(&'static str),
}

/// Result type alias using HostError
pub type Result<T> = std::result::Result<T, HostError>;
