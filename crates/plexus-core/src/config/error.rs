//! # Plexus Configuration Errors
//!
//! Errors raised while reading configuration and manifest files.
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error during operation '{operation}' on path '{path}': {source}")]
    Io {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported configuration format for path: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("Deserialization from '{format}' failed: {source}")]
    Deserialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    pub fn io(source: std::io::Error, operation: impl Into<String>, path: PathBuf) -> Self {
        ConfigError::Io {
            source,
            operation: operation.into(),
            path,
        }
    }
}
