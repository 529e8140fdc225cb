//! Error types for modcheck
//!
//! All modules use `ModcheckResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for modcheck operations
pub type ModcheckResult<T> = Result<T, ModcheckError>;

/// All errors that can occur in modcheck
#[derive(Error, Debug)]
pub enum ModcheckError {
    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Cache errors
    #[error("Cache directory {path} is unusable: {source}")]
    CacheDirUnusable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode cache entry {key}: {reason}")]
    CacheEncode { key: String, reason: String },

    #[error("Cache writer stopped")]
    CacheWriterStopped,

    #[error("Cache store holds results of validator {store}, but the validator is {validator}")]
    ValidatorVersionMismatch { store: String, validator: String },

    // Batch errors
    #[error("Invalid concurrency: {0} (must be at least 1)")]
    InvalidConcurrency(usize),

    #[error("Invalid batch size: {0} (must be at least 1)")]
    InvalidBatchSize(usize),

    #[error("Task {task} panicked: {reason}")]
    TaskPanicked { task: String, reason: String },

    #[error("Task {0} was aborted before reporting a result")]
    TaskAborted(String),

    // Validation and package errors
    #[error("Validation of {package} failed: {reason}")]
    Validation { package: String, reason: String },

    #[error("Unknown package: {0}")]
    UnknownPackage(String),

    // Coordinator errors
    #[error("Incremental coordinator is not running")]
    CoordinatorStopped,

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ModcheckError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a validation failure for a package
    pub fn validation(package: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            package: package.into(),
            reason: reason.into(),
        }
    }

    /// Whether the caller can recover by running the cache memory-only
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(self, Self::CacheDirUnusable { .. } | Self::CacheWriterStopped)
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::CacheDirUnusable { .. } => {
                Some("Set cache.persistent = false to run with a memory-only cache")
            }
            Self::ValidatorVersionMismatch { .. } => {
                Some("Open the store with the validator's version tag")
            }
            Self::InvalidConcurrency(_) => Some("Set batch.concurrency to 1 or more"),
            Self::InvalidBatchSize(_) => Some("Set batch.batch_size to 1 or more"),
            Self::ConfigInvalid { .. } => Some("Run: modcheck config init --force to restore defaults"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ModcheckError::InvalidConcurrency(0);
        assert!(err.to_string().contains("Invalid concurrency: 0"));
    }

    #[test]
    fn error_hint() {
        let err = ModcheckError::InvalidBatchSize(0);
        assert_eq!(err.hint(), Some("Set batch.batch_size to 1 or more"));
    }

    #[test]
    fn unusable_dir_allows_fallback() {
        let err = ModcheckError::CacheDirUnusable {
            path: PathBuf::from("/nope"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(err.is_fallback_eligible());
        assert!(!ModcheckError::InvalidConcurrency(0).is_fallback_eligible());
    }
}
