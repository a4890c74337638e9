//! Sandbox boundary errors
//!
//! A program that fails is not an error here; it is a classified
//! [`SandboxResult`](crate::SandboxResult). These variants cover the
//! boundary itself failing.

use thiserror::Error;

/// Result alias for boundary operations
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Failures of the execution boundary
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Failed to mirror project: {0}")]
    Mirror(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
