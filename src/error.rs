use std::path::PathBuf;
use thiserror::Error;

/// Main error type for SmartChat
#[derive(Error, Debug)]
pub enum SmartChatError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration validation errors
    #[error("Configuration validation failed: {errors:?}")]
    ConfigValidation { errors: Vec<ValidationError> },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Invalid configuration value
    #[error("Invalid configuration value at {path}: {message}")]
    InvalidConfigValue { path: String, message: String },

    /// Rejected request (empty query, too much history, ...)
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Both retrieval sources failed
    #[error("Retrieval unavailable [{correlation_id}]: {}", reasons.join("; "))]
    RetrievalUnavailable {
        correlation_id: String,
        reasons: Vec<String>,
    },

    /// Every configured provider failed for this query
    #[error("All providers failed [{correlation_id}]: {}", reasons.join("; "))]
    AllProvidersFailed {
        correlation_id: String,
        reasons: Vec<String>,
    },

    /// IO errors
    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },

    /// TOML deserialization errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    /// JSON errors
    #[error("JSON error: {context}: {source}")]
    Json {
        source: serde_json::Error,
        context: String,
    },

    /// Server / transport errors
    #[error("Server error: {0}")]
    Server(String),

    /// Generic errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SmartChatError {
    /// Correlation id for errors that are surfaced to callers
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            SmartChatError::RetrievalUnavailable { correlation_id, .. }
            | SmartChatError::AllProvidersFailed { correlation_id, .. } => Some(correlation_id),
            _ => None,
        }
    }

    /// Aggregated failure reasons, empty for errors without any
    pub fn reasons(&self) -> &[String] {
        match self {
            SmartChatError::RetrievalUnavailable { reasons, .. }
            | SmartChatError::AllProvidersFailed { reasons, .. } => reasons,
            _ => &[],
        }
    }

    /// Stable machine-readable kind, used in error events
    pub fn kind(&self) -> ErrorKind {
        match self {
            SmartChatError::RetrievalUnavailable { .. } => ErrorKind::RetrievalUnavailable,
            SmartChatError::AllProvidersFailed { .. } => ErrorKind::AllProvidersFailed,
            SmartChatError::InvalidQuery(_) => ErrorKind::InvalidQuery,
            _ => ErrorKind::Internal,
        }
    }
}

/// Kind tag carried by surfaced errors and stream error events
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RetrievalUnavailable,
    AllProvidersFailed,
    ProviderFailure,
    InvalidQuery,
    Internal,
}

/// Configuration validation error
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Path to the configuration key that failed validation
    pub path: String,
    /// Error message describing the validation failure
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result type for SmartChat operations
pub type Result<T> = std::result::Result<T, SmartChatError>;
