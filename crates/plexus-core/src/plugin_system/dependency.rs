use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::plugin_system::version::{parse_version, Version, VersionError, VersionPattern};

/// Hard dependency on another managed plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDependency {
    /// Id of the required plugin
    pub plugin_id: String,

    /// Accepted versions of the required plugin
    pub pattern: VersionPattern,

    /// Injection slot the provider is bound to; defaults to the plugin id
    pub slot: Option<String>,
}

impl PluginDependency {
    /// Create a dependency with a version pattern such as `"1.x.x"` or `"^1.2"`
    pub fn new(plugin_id: &str, pattern: &str) -> Result<Self, VersionError> {
        Ok(Self {
            plugin_id: plugin_id.to_string(),
            pattern: VersionPattern::parse(pattern)?,
            slot: None,
        })
    }

    /// Create a dependency accepting any version
    pub fn any(plugin_id: &str) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            pattern: VersionPattern::any(),
            slot: None,
        }
    }

    /// Bind the resolved provider to a named injection slot
    pub fn with_slot(mut self, slot: &str) -> Self {
        self.slot = Some(slot.to_string());
        self
    }

    /// Name of the slot the provider is injected into
    pub fn slot_name(&self) -> &str {
        self.slot.as_deref().unwrap_or(&self.plugin_id)
    }

    /// Check whether the given version satisfies this dependency
    pub fn is_satisfied_by(&self, version: &Version) -> bool {
        self.pattern.matches(version)
    }
}

impl fmt::Display for PluginDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Requires plugin: {} (version: {})", self.plugin_id, self.pattern)
    }
}

/// Operating system condition on a package dependency
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Platform {
    Windows,
    Linux,
    MacOs,
    /// Any unix-like target
    Unix,
    Other(String),
}

impl Platform {
    /// Whether the process is running on this platform
    pub fn is_current(&self) -> bool {
        match self {
            Platform::Windows => cfg!(windows),
            Platform::Linux => cfg!(target_os = "linux"),
            Platform::MacOs => cfg!(target_os = "macos"),
            Platform::Unix => cfg!(unix),
            Platform::Other(os) => os == std::env::consts::OS,
        }
    }
}

impl FromStr for Platform {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "windows" | "win32" | "win" => Platform::Windows,
            "linux" => Platform::Linux,
            "macos" | "darwin" | "osx" => Platform::MacOs,
            "unix" | "posix" => Platform::Unix,
            other => Platform::Other(other.to_string()),
        })
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Windows => write!(f, "windows"),
            Platform::Linux => write!(f, "linux"),
            Platform::MacOs => write!(f, "macos"),
            Platform::Unix => write!(f, "unix"),
            Platform::Other(os) => write!(f, "{}", os),
        }
    }
}

/// Dependency on an external, unmanaged library
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDependency {
    pub name: String,
    pub version: Option<VersionPattern>,
    /// Only checked when running on this platform
    pub platform: Option<Platform>,
}

impl PackageDependency {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: None,
            platform: None,
        }
    }

    pub fn with_version(mut self, pattern: &str) -> Result<Self, VersionError> {
        self.version = Some(VersionPattern::parse(pattern)?);
        Ok(self)
    }

    pub fn on_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Whether this dependency is relevant on the current platform
    pub fn applies_here(&self) -> bool {
        self.platform.as_ref().is_none_or(Platform::is_current)
    }
}

impl fmt::Display for PackageDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Requires package: {}", self.name)?;
        if let Some(version) = &self.version {
            write!(f, " (version: {})", version)?;
        }
        if let Some(platform) = &self.platform {
            write!(f, " [{} only]", platform)?;
        }
        Ok(())
    }
}

/// One entry of a descriptor's `requires` list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    Plugin(PluginDependency),
    Package(PackageDependency),
}

impl From<PluginDependency> for Dependency {
    fn from(dep: PluginDependency) -> Self {
        Dependency::Plugin(dep)
    }
}

impl From<PackageDependency> for Dependency {
    fn from(dep: PackageDependency) -> Self {
        Dependency::Package(dep)
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dependency::Plugin(dep) => dep.fmt(f),
            Dependency::Package(dep) => dep.fmt(f),
        }
    }
}

/// How a missing external package affects the plugin declaring it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackagePolicy {
    /// Report the absence, load anyway
    #[default]
    Advisory,
    /// Block the plugin until the package is present
    Enforce,
}

/// Answers whether an external package is installed
pub trait PackageProbe: Send + Sync {
    fn is_available(&self, dependency: &PackageDependency) -> bool;
}

/// Probe backed by a fixed table of installed packages and their versions
#[derive(Debug, Clone, Default)]
pub struct StaticPackageProbe {
    packages: BTreeMap<String, Option<Version>>,
}

impl StaticPackageProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a `name -> optional version string` table.
    pub fn from_table(table: &BTreeMap<String, Option<String>>) -> Result<Self, VersionError> {
        let mut probe = Self::new();
        for (name, version) in table {
            let version = version.as_deref().map(parse_version).transpose()?;
            probe.packages.insert(name.clone(), version);
        }
        Ok(probe)
    }

    pub fn with_package(mut self, name: &str, version: Option<Version>) -> Self {
        self.packages.insert(name.to_string(), version);
        self
    }
}

impl PackageProbe for StaticPackageProbe {
    fn is_available(&self, dependency: &PackageDependency) -> bool {
        match (self.packages.get(&dependency.name), &dependency.version) {
            (None, _) => false,
            (Some(_), None) => true,
            // Installed without a known version: any requirement is accepted
            (Some(None), Some(_)) => true,
            (Some(Some(installed)), Some(pattern)) => pattern.matches(installed),
        }
    }
}

/// Error that can occur when resolving dependencies
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyError {
    /// No descriptor satisfies a required plugin dependency
    #[error("Dependency '{dependency_id}' matching '{pattern}' cannot be resolved{}", .found.as_ref().map(|v| format!(" (found version {})", v)).unwrap_or_default())]
    Unresolved {
        dependency_id: String,
        pattern: VersionPattern,
        found: Option<Version>,
    },

    /// Dependency cycle detected
    #[error("Circular dependency detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    /// Depends on a plugin that is itself blocked
    #[error("Depends on blocked plugin '{0}'")]
    BlockedDependency(String),

    /// Enforced external package is absent
    #[error("Required package '{0}' is not available")]
    MissingPackage(String),
}
