//! Error types for the Storage Provisioner

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Storage Provisioner
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Object is not present in the cache or the API store
    #[error("{kind} {key:?} not found")]
    NotFound { kind: &'static str, key: String },

    /// A required annotation is missing on an object
    #[error("{object}: missing annotation {key:?}")]
    MissingAnnotation { key: &'static str, object: String },

    /// Object lacks data required to reference or derive from it
    #[error("Invalid object: {0}")]
    InvalidObject(String),

    /// Controller or process configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a not-found error for the given kind and key
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            key: key.into(),
        }
    }

    /// Check if this error indicates the target object vanished
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }

    /// Short label attached to sync failure logs
    pub fn category(&self) -> &'static str {
        match self {
            Error::Kube(_) => "kube",
            Error::NotFound { .. } => "not_found",
            Error::MissingAnnotation { .. } => "missing_annotation",
            Error::InvalidObject(_) => "invalid_object",
            Error::Config(_) => "config",
            Error::DurationParse(_) => "duration_parse",
            Error::Serialization(_) => "serialization",
            Error::Metrics(_) => "metrics",
            Error::Io(_) => "io",
            Error::Internal(_) => "internal",
        }
    }
}
