use std::fmt::Write;
use thiserror::Error;

/// Formats an error and its entire source chain with each error on a new line
///
/// This produces output like:
/// ```
/// Error message
///   Caused by: First cause
///   Caused by: Second cause
///   Caused by: Root cause
/// ```
pub fn format_error_chain(err: &dyn std::error::Error) -> String {
    let mut output = String::new();
    write!(&mut output, "{}", err).ok();

    let mut source = err.source();
    while let Some(err) = source {
        write!(&mut output, "\n  Caused by: {}", err).ok();
        source = err.source();
    }

    output
}

/// Central application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Kubernetes-related errors (transport, TLS, auth and API failures)
    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    /// Object vanished between list and get
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency conflict that survived the retry budget
    #[error("Conflict updating {0}")]
    Conflict(String),

    /// Server resource unknown or lacking the verbs we need
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Malformed manifest bytes
    #[error("Decode error: {0}")]
    Decode(String),

    /// Serialization/Deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Git checkout errors
    #[error("Git error: {0}")]
    Git(String),

    /// Manifest rendering errors
    #[error("Template error: {0}")]
    Template(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal errors with context
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// True for the optimistic-concurrency status code worth retrying an update on
    pub fn is_conflict(err: &kube::Error) -> bool {
        matches!(err, kube::Error::Api(e) if e.code == 409)
    }

    /// The watch cursor expired and a fresh list is required
    pub fn is_expired_cursor(err: &kube::Error) -> bool {
        matches!(err, kube::Error::Api(e) if e.code == 410)
    }

    pub fn is_not_found(err: &kube::Error) -> bool {
        matches!(err, kube::Error::Api(e) if e.code == 404)
    }
}

// Implement From for common error types that don't have automatic conversion
impl From<String> for AppError {
    fn from(s: String) -> Self {
        AppError::Internal(s)
    }
}

impl From<&str> for AppError {
    fn from(s: &str) -> Self {
        AppError::Internal(s.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Internal(e.to_string())
    }
}
