//! # Plexus Plugin System Errors
//!
//! Defines error types specific to the plugin system.
//!
//! [`PluginSystemError`] is returned by manager operations (`load`, `unload`,
//! `reload`, descriptor registration, manifest parsing). Errors raised *inside*
//! plugin callbacks are [`PluginError`](crate::plugin_system::traits::PluginError)s
//! and reach callers wrapped in [`PluginSystemError::CallbackFailure`].
//! Every variant maps onto a [`ConditionKind`] so it can be recorded in the
//! manager's [`LoadReport`](crate::plugin_system::report::LoadReport).
use std::path::PathBuf;

use crate::plugin_system::dependency::DependencyError;
use crate::plugin_system::instance::Transition;
use crate::plugin_system::report::ConditionKind;
use crate::plugin_system::traits::PluginError;
use crate::plugin_system::version::{Version, VersionError};

pub type PluginResult<T> = std::result::Result<T, PluginSystemError>;

#[derive(Debug, thiserror::Error)]
pub enum PluginSystemError {
    #[error("Version parsing error: {0}")]
    InvalidVersionFormat(#[from] VersionError),

    #[error("Invalid descriptor for '{plugin_id}': {message}")]
    InvalidDescriptor { plugin_id: String, message: String },

    #[error("Descriptor '{plugin_id}' version {version} is already registered")]
    DuplicateDescriptor { plugin_id: String, version: Version },

    #[error("Unknown plugin: {0}")]
    UnknownPlugin(String),

    #[error("Plugin '{plugin_id}' is blocked: {reason}")]
    Blocked {
        plugin_id: String,
        #[source]
        reason: DependencyError,
    },

    #[error("Plugin '{plugin_id}' cannot load: dependency '{dependency_id}' is not active")]
    DependencyNotActive {
        plugin_id: String,
        dependency_id: String,
        #[source]
        source: Option<Box<PluginSystemError>>,
    },

    #[error("Plugin '{plugin_id}' is in use by active plugins: {}", .dependents.join(", "))]
    PluginInUse { plugin_id: String, dependents: Vec<String> },

    #[error("Plugin '{plugin_id}' is not active")]
    NotActive { plugin_id: String },

    #[error("Callback failure in plugin '{plugin_id}' during '{transition}': {source}")]
    CallbackFailure {
        plugin_id: String,
        transition: Transition,
        #[source]
        source: PluginError,
    },

    #[error("Plugin '{plugin_id}' names code unit '{unit}' but no factory is registered for it")]
    MissingCodeUnit { plugin_id: String, unit: String },

    #[error("Plugin manager is shutting down")]
    ShuttingDown,

    #[error("Plugin manifest error for '{path}': {message}")]
    ManifestError {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl PluginSystemError {
    /// Reporting category of this error
    pub fn kind(&self) -> ConditionKind {
        match self {
            PluginSystemError::InvalidVersionFormat(_) => ConditionKind::InvalidVersionFormat,
            PluginSystemError::Blocked { reason, .. } => match reason {
                DependencyError::Cycle(_) => ConditionKind::DependencyCycle,
                DependencyError::MissingPackage(_) => ConditionKind::PackageMissing,
                _ => ConditionKind::DependencyUnresolved,
            },
            PluginSystemError::DependencyNotActive { .. } | PluginSystemError::UnknownPlugin(_) => {
                ConditionKind::DependencyUnresolved
            }
            PluginSystemError::PluginInUse { .. } => ConditionKind::PluginInUse,
            PluginSystemError::CallbackFailure { .. } | PluginSystemError::MissingCodeUnit { .. } => {
                ConditionKind::CallbackFailure
            }
            PluginSystemError::InvalidDescriptor { .. }
            | PluginSystemError::DuplicateDescriptor { .. }
            | PluginSystemError::NotActive { .. }
            | PluginSystemError::ShuttingDown
            | PluginSystemError::ManifestError { .. } => ConditionKind::Configuration,
        }
    }

    /// Id of the plugin the error is about, when there is one
    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            PluginSystemError::InvalidDescriptor { plugin_id, .. }
            | PluginSystemError::DuplicateDescriptor { plugin_id, .. }
            | PluginSystemError::Blocked { plugin_id, .. }
            | PluginSystemError::DependencyNotActive { plugin_id, .. }
            | PluginSystemError::PluginInUse { plugin_id, .. }
            | PluginSystemError::NotActive { plugin_id }
            | PluginSystemError::CallbackFailure { plugin_id, .. }
            | PluginSystemError::MissingCodeUnit { plugin_id, .. } => Some(plugin_id),
            PluginSystemError::UnknownPlugin(plugin_id) => Some(plugin_id),
            PluginSystemError::InvalidVersionFormat(_)
            | PluginSystemError::ShuttingDown
            | PluginSystemError::ManifestError { .. } => None,
        }
    }
}
