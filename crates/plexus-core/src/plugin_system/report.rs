use std::fmt;

use serde::Serialize;

use crate::plugin_system::error::PluginSystemError;
use crate::plugin_system::instance::LifecycleState;

/// Category of a recorded condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConditionKind {
    InvalidVersionFormat,
    DependencyUnresolved,
    DependencyCycle,
    PluginInUse,
    CallbackFailure,
    /// An external package is absent (advisory unless enforced)
    PackageMissing,
    /// Malformed descriptor set or an operation refused by manager state
    Configuration,
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConditionKind::InvalidVersionFormat => "InvalidVersionFormat",
            ConditionKind::DependencyUnresolved => "DependencyUnresolved",
            ConditionKind::DependencyCycle => "DependencyCycle",
            ConditionKind::PluginInUse => "PluginInUse",
            ConditionKind::CallbackFailure => "CallbackFailure",
            ConditionKind::PackageMissing => "PackageMissing",
            ConditionKind::Configuration => "Configuration",
        };
        write!(f, "{}", name)
    }
}

/// A non-fatal problem recorded against one plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Condition {
    pub plugin_id: String,
    pub kind: ConditionKind,
    pub message: String,
}

impl Condition {
    pub fn new(plugin_id: &str, kind: ConditionKind, message: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            kind,
            message: message.into(),
        }
    }

    /// Record an error, attributing it to `plugin_id` when the error names no plugin
    pub fn from_error(plugin_id: &str, error: &PluginSystemError) -> Self {
        Self::new(error.plugin_id().unwrap_or(plugin_id), error.kind(), error.to_string())
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.plugin_id, self.message)
    }
}

/// Where one known plugin stands
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginStatus {
    pub id: String,
    pub version: String,
    pub state: LifecycleState,
    /// Why the plugin is blocked, if it is
    pub reason: Option<String>,
}

/// Snapshot of every known plugin plus every condition recorded so far
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub plugins: Vec<PluginStatus>,
    pub conditions: Vec<Condition>,
}

impl LoadReport {
    pub fn status(&self, id: &str) -> Option<&PluginStatus> {
        self.plugins.iter().find(|status| status.id == id)
    }

    pub fn ids_in_state(&self, state: LifecycleState) -> Vec<&str> {
        self.plugins
            .iter()
            .filter(|status| status.state == state)
            .map(|status| status.id.as_str())
            .collect()
    }

    pub fn conditions_for<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Condition> + 'a {
        self.conditions.iter().filter(move |condition| condition.plugin_id == id)
    }

    pub fn has_condition(&self, id: &str, kind: ConditionKind) -> bool {
        self.conditions_for(id).any(|condition| condition.kind == kind)
    }
}
