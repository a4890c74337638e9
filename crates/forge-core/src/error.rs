//! Error types for Forge Core
//!
//! Every fallible operation in the build engine returns [`Result`]. The
//! variant tells the caller what to do next: [`PlanningError`] aborts the
//! build, [`SynthesisError`] is folded into a per-file decision, and the
//! remaining variants cover persistence of state and memory documents.

use thiserror::Error;

/// Result type alias for Forge operations
pub type Result<T> = std::result::Result<T, ForgeError>;

/// Main error type for Forge operations
#[derive(Error, Debug)]
pub enum ForgeError {
    /// Manifest could not be produced (fatal)
    #[error("Planning error: {0}")]
    Planning(#[from] PlanningError),

    /// A single synthesis call failed (recoverable)
    #[error("Synthesis error: {0}")]
    Synthesis(#[from] SynthesisError),

    /// Build state document errors
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Constraint memory errors
    #[error("Constraint error: {0}")]
    Constraint(#[from] ConstraintError),

    /// Pre-build spend gate refused to start
    #[error("Daily spend cap reached: ${spent:.4} of ${cap:.2}")]
    DailySpendCap {
        /// Spend already recorded today
        spent: f64,
        /// Configured cap
        cap: f64,
    },

    /// Unknown platform profile name
    #[error("Unknown platform profile: {0}")]
    UnknownPlatform(String),

    /// Invalid focus glob
    #[error("Invalid focus pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        /// What was being attempted
        context: String,
        /// Underlying error
        source: Box<ForgeError>,
    },
}

/// Errors raised while turning a request into a manifest
#[derive(Error, Debug, Clone)]
pub enum PlanningError {
    #[error("Blueprint output is not valid JSON after strict retry: {0}")]
    Unparseable(String),

    #[error("Blueprint lists no files")]
    EmptyFileList,

    #[error("Blueprint lists path more than once: {0}")]
    DuplicatePath(String),

    #[error("Blueprint path escapes the project root: {0}")]
    UnsafePath(String),

    #[error("Blueprint is missing a run command")]
    MissingRunCommand,

    #[error("Planner backend failed: {0}")]
    Backend(String),
}

/// Errors from one call to a code-generation backend
#[derive(Error, Debug, Clone)]
pub enum SynthesisError {
    #[error("Rate limited by {provider}: {message}")]
    RateLimited { provider: String, message: String },

    #[error("Synthesis call timed out after {0}s")]
    Timeout(u64),

    #[error("HTTP error from {provider} (status {status}): {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Backend returned an empty completion")]
    EmptyResponse,

    #[error("No credentials configured for provider family {0}")]
    MissingCredentials(String),

    #[error("No backend registered for provider family {0}")]
    UnknownProvider(String),
}

impl SynthesisError {
    /// Whether this error should rotate credentials and back off
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, SynthesisError::RateLimited { .. })
    }
}

/// Errors related to the persisted build state
#[derive(Error, Debug, Clone)]
pub enum StateError {
    #[error("No blueprint.json to resume in {0}")]
    MissingManifest(String),

    #[error("Path is not part of the manifest: {0}")]
    UnknownPath(String),

    #[error("Content hash mismatch for {path}: stored {stored}, computed {computed}")]
    HashMismatch {
        path: String,
        stored: String,
        computed: String,
    },
}

/// Errors related to constraint memory
#[derive(Error, Debug, Clone)]
pub enum ConstraintError {
    #[error("Auto-fix rule is not idempotent: replacement contains pattern {0:?}")]
    NonIdempotentRule(String),

    #[error("Auto-fix rule has an empty pattern")]
    EmptyPattern,
}

impl ForgeError {
    /// Add context to an error
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Only planning failures abort a build
    pub fn is_fatal(&self) -> bool {
        match self {
            ForgeError::Planning(_) => true,
            ForgeError::WithContext { source, .. } => source.is_fatal(),
            _ => false,
        }
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to a Result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add lazy context to a Result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.context(f()))
    }
}
