//! # Plexus Kernel Errors
//!
//! Defines error types specific to the Plexus kernel.
//!
//! [`Error`] wraps the typed errors of each subsystem and adds the kernel's
//! own lifecycle failures.
use std::result::Result as StdResult;

use crate::config::ConfigError;
use crate::plugin_system::error::PluginSystemError;
use thiserror::Error as ThisError;

/// Top-level error of the Plexus kernel
#[derive(Debug, ThisError)]
pub enum Error {
    /// Specific, typed plugin system error
    #[error("Plugin system error: {0}")]
    PluginSystem(#[from] PluginSystemError),

    /// Configuration or manifest file error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Error occurring during a specific kernel lifecycle phase.
    #[error("Kernel lifecycle error during {phase:?}: {message}")]
    KernelLifecycleError {
        phase: KernelLifecyclePhase,
        component_name: Option<String>,
        message: String,
        #[source]
        source: Option<Box<Error>>,
    },
}

/// Represents a specific phase in the kernel's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum KernelLifecyclePhase {
    #[error("Initialize")]
    Initialize,
    #[error("Start")]
    Start,
    #[error("Shutdown")]
    Shutdown,
}

/// Shorthand for Result with our Error type
pub type Result<T> = StdResult<T, Error>;

impl Error {
    pub fn lifecycle(phase: KernelLifecyclePhase, component_name: Option<&str>, message: impl Into<String>) -> Self {
        Error::KernelLifecycleError {
            phase,
            component_name: component_name.map(str::to_string),
            message: message.into(),
            source: None,
        }
    }

    /// Attach the error that caused this lifecycle error
    pub fn with_source(self, cause: Error) -> Self {
        match self {
            Error::KernelLifecycleError {
                phase,
                component_name,
                message,
                ..
            } => Error::KernelLifecycleError {
                phase,
                component_name,
                message,
                source: Some(Box::new(cause)),
            },
            other => other,
        }
    }
}
