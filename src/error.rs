//! Error types for annoflow operations.
//!
//! Defines error types for the major subsystems:
//! - Remote annotation service calls
//! - Response recovery and validation
//! - Source reading and backend/source pairing
//! - Progress checkpointing
//! - Configuration loading and validation

use thiserror::Error;

/// Errors that can occur when calling a remote annotation backend.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The backend was misconfigured (bad credentials, missing parameters).
    /// Detected at construction, never mid-batch.
    #[error("Service configuration error: {0}")]
    Config(String),

    /// The backend signaled throttling (HTTP 429 or equivalent).
    #[error("Rate limited by backend: {0}")]
    RateLimited(String),

    /// The call timed out or the connection failed.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The request could not be sent (connection refused, DNS, TLS).
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    /// The backend returned a non-success status code.
    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    /// The reply was received but could not be recovered into valid
    /// structured output.
    #[error("Failed to recover structured output: {0}")]
    Response(#[from] crate::parser::ParseError),

    /// The backend's circuit breaker is open; no network call was attempted.
    #[error("Circuit breaker open for backend '{backend}': {reason}")]
    BreakerOpen { backend: String, reason: String },

    /// The adapter does not implement streaming annotation.
    #[error("Backend family '{0}' does not support streaming")]
    StreamingUnsupported(String),
}

impl ServiceError {
    /// Whether retrying the call could plausibly succeed.
    ///
    /// Rate limiting, timeouts, connection failures and 5xx responses are
    /// transient. A reply that was received but failed recovery is not:
    /// re-requesting the same content is wasted budget.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::RateLimited(_) => true,
            ServiceError::Timeout(_) => true,
            ServiceError::RequestFailed(_) => true,
            ServiceError::Api { code, .. } => *code >= 500 || *code == 429,
            _ => false,
        }
    }
}

/// Errors raised while reading id sources or pairing them with backends.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Source file not found: {0}")]
    NotFound(String),

    #[error("Source directory '{dir}' contains no .txt files")]
    EmptyDirectory { dir: String },

    #[error(
        "Backend/source count mismatch: {backends} backends vs {files} files in '{dir}' \
         (counts must match when both exceed one)"
    )]
    PairingMismatch {
        backends: usize,
        files: usize,
        dir: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the progress checkpoint store.
#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while loading or validating backend configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Backend '{backend}': {message}")]
    InvalidBackend { backend: String, message: String },

    #[error("Unknown backend family '{family}' for backend '{backend}' (known: {known})")]
    UnknownFamily {
        backend: String,
        family: String,
        known: String,
    },

    #[error("Backend '{0}' is not configured")]
    BackendNotConfigured(String),

    #[error("No backends configured")]
    NoBackends,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that abort a batch run before or during orchestration.
///
/// Item-level failures never surface here; they become failed result
/// records. This enum is for conditions where continuing makes no sense.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Progress(#[from] ProgressError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("Health check failed for backend '{backend}': {detail}")]
    HealthCheck { backend: String, detail: String },

    #[error("Pipeline task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}
