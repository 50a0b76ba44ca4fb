use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::plugin_system::dependency::{Dependency, PackageDependency, PluginDependency};
use crate::plugin_system::error::PluginSystemError;
use crate::plugin_system::version::{parse_version, Version};

/// When a plugin is activated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadingMode {
    /// Activated by `start_all`, in dependency order
    #[default]
    Eager,
    /// Activated on explicit `load` or on the first capability lookup that misses
    Lazy,
}

impl fmt::Display for LoadingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadingMode::Eager => write!(f, "eager"),
            LoadingMode::Lazy => write!(f, "lazy"),
        }
    }
}

/// Static, versioned contract of a pluggable unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDescriptor {
    id: String,
    version: Version,
    provides: BTreeSet<String>,
    consumes: BTreeSet<String>,
    requires: Vec<Dependency>,
    loading_mode: LoadingMode,
    code_units: Vec<String>,
}

impl PluginDescriptor {
    /// Create a descriptor with no capabilities, dependencies or code units.
    ///
    /// The id must be a dot-separated sequence of non-empty segments made of
    /// ASCII alphanumerics, `_` and `-` (for example `org.example.cache`).
    pub fn new(id: &str, version: &str) -> Result<Self, PluginSystemError> {
        validate_id(id)?;
        Ok(Self {
            id: id.to_string(),
            version: parse_version(version)?,
            provides: BTreeSet::new(),
            consumes: BTreeSet::new(),
            requires: Vec::new(),
            loading_mode: LoadingMode::Eager,
            code_units: Vec::new(),
        })
    }

    pub fn provides(mut self, tag: &str) -> Self {
        self.provides.insert(tag.to_string());
        self
    }

    pub fn consumes(mut self, tag: &str) -> Self {
        self.consumes.insert(tag.to_string());
        self
    }

    /// Append a hard or package dependency
    pub fn requires(mut self, dependency: impl Into<Dependency>) -> Self {
        self.requires.push(dependency.into());
        self
    }

    /// Shorthand for a hard dependency on `plugin_id` matching `pattern`
    pub fn requires_plugin(self, plugin_id: &str, pattern: &str) -> Result<Self, PluginSystemError> {
        Ok(self.requires(PluginDependency::new(plugin_id, pattern)?))
    }

    pub fn with_loading_mode(mut self, mode: LoadingMode) -> Self {
        self.loading_mode = mode;
        self
    }

    pub fn lazy(self) -> Self {
        self.with_loading_mode(LoadingMode::Lazy)
    }

    pub fn code_unit(mut self, name: &str) -> Self {
        self.code_units.push(name.to_string());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn provided(&self) -> &BTreeSet<String> {
        &self.provides
    }

    pub fn consumed(&self) -> &BTreeSet<String> {
        &self.consumes
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.requires
    }

    /// Hard dependencies in declaration order
    pub fn plugin_dependencies(&self) -> impl Iterator<Item = &PluginDependency> {
        self.requires.iter().filter_map(|dep| match dep {
            Dependency::Plugin(dep) => Some(dep),
            Dependency::Package(_) => None,
        })
    }

    pub fn package_dependencies(&self) -> impl Iterator<Item = &PackageDependency> {
        self.requires.iter().filter_map(|dep| match dep {
            Dependency::Package(dep) => Some(dep),
            Dependency::Plugin(_) => None,
        })
    }

    pub fn loading_mode(&self) -> LoadingMode {
        self.loading_mode
    }

    pub fn code_units(&self) -> &[String] {
        &self.code_units
    }
}

impl fmt::Display for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

fn validate_id(id: &str) -> Result<(), PluginSystemError> {
    let invalid = |message: &str| PluginSystemError::InvalidDescriptor {
        plugin_id: id.to_string(),
        message: message.to_string(),
    };
    if id.is_empty() {
        return Err(invalid("plugin id must not be empty"));
    }
    for segment in id.split('.') {
        if segment.is_empty() {
            return Err(invalid("plugin id contains an empty segment"));
        }
        if !segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(invalid("plugin id segments may only contain ASCII letters, digits, '_' and '-'"));
        }
    }
    Ok(())
}
