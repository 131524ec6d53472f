//! Unified error types for Delegate.

use thiserror::Error;

/// Result type alias using DelegateError.
pub type Result<T> = std::result::Result<T, DelegateError>;

#[derive(Error, Debug)]
pub enum DelegateError {
    // Boundary validation (bad name, illegal transition, invalid model)
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    // Subsystems
    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Git error: {0}")]
    Git(String),

    #[error("Agent SDK error: {0}")]
    Sdk(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Daemon error: {0}")]
    Daemon(String),

    // General
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl DelegateError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    pub fn git(msg: impl Into<String>) -> Self {
        Self::Git(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn sdk(msg: impl Into<String>) -> Self {
        Self::Sdk(msg.into())
    }
}
