//! Error types shared across sceneshard crates

use thiserror::Error;

/// Result type alias for sceneshard operations
pub type Result<T> = std::result::Result<T, ShardError>;

/// Main error type for the database-free parts of sceneshard
#[derive(Error, Debug)]
pub enum ShardError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Invalid identifier '{name}': {reason}")]
    InvalidIdentifier { name: String, reason: String },

    #[error("Invalid naming rule: {0}")]
    NamingRule(#[from] regex::Error),
}
