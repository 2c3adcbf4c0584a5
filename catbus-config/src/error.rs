// Error types for configuration loading

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration key not found: {0}")]
    KeyNotFound(String),

    #[error("Invalid value for {key}: {value:?} ({reason})")]
    ParseError {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Failed to load .env file: {0}")]
    DotenvError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
