//! Descriptor manifests.
//!
//! A manifest lists descriptors in any format the config loader understands:
//!
//! ```json
//! {
//!   "plugins": [
//!     { "id": "net.x", "version": "1.2.0", "provides": ["transport"], "code_units": ["net.x.main"] },
//!     { "id": "net.y", "version": "1.0.0", "loading": "lazy",
//!       "requires": [ { "plugin": "net.x", "version": "1.x" }, { "package": "openssl", "platform": "linux" } ] }
//!   ]
//! }
//! ```
use std::path::Path;

use serde::Deserialize;

use crate::config::{self, ConfigFormat};
use crate::plugin_system::dependency::{PackageDependency, Platform, PluginDependency};
use crate::plugin_system::descriptor::{LoadingMode, PluginDescriptor};
use crate::plugin_system::error::{PluginResult, PluginSystemError};
use crate::plugin_system::report::{Condition, ConditionKind};

/// Top level of a manifest file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DescriptorManifest {
    #[serde(default)]
    pub plugins: Vec<ManifestEntry>,
}

/// One descriptor as written in a manifest
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default)]
    pub consumes: Vec<String>,
    #[serde(default)]
    pub requires: Vec<ManifestDependency>,
    #[serde(default)]
    pub loading: LoadingMode,
    /// Defaults to a single unit named after the id
    #[serde(default)]
    pub code_units: Vec<String>,
}

/// A dependency entry: `{ "plugin": .. }` or `{ "package": .. }`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ManifestDependency {
    Plugin {
        plugin: String,
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        slot: Option<String>,
    },
    Package {
        package: String,
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        platform: Option<String>,
    },
}

/// Validated manifest: the accepted descriptors and the entries dropped for
/// a malformed version or version pattern
#[derive(Debug, Default)]
pub struct ManifestContents {
    pub descriptors: Vec<PluginDescriptor>,
    pub rejected: Vec<Condition>,
}

impl DescriptorManifest {
    pub fn parse(data: &str, format: ConfigFormat) -> config::Result<Self> {
        config::parse_str(data, format)
    }

    /// Validate every entry. An entry with a malformed version is rejected on
    /// its own; any other malformed entry fails the whole manifest.
    pub fn into_descriptors(self) -> PluginResult<ManifestContents> {
        let mut contents = ManifestContents::default();
        for entry in self.plugins {
            let id = entry.id.clone();
            match entry.into_descriptor() {
                Ok(descriptor) => contents.descriptors.push(descriptor),
                Err(error @ PluginSystemError::InvalidVersionFormat(_)) => {
                    log::warn!("Rejecting manifest entry '{}': {}", id, error);
                    contents
                        .rejected
                        .push(Condition::new(&id, ConditionKind::InvalidVersionFormat, error.to_string()));
                }
                Err(error) => return Err(error),
            }
        }
        Ok(contents)
    }
}

impl ManifestEntry {
    pub fn into_descriptor(self) -> PluginResult<PluginDescriptor> {
        let mut descriptor = PluginDescriptor::new(&self.id, &self.version)?.with_loading_mode(self.loading);
        for tag in &self.provides {
            descriptor = descriptor.provides(tag);
        }
        for tag in &self.consumes {
            descriptor = descriptor.consumes(tag);
        }
        for dependency in self.requires {
            descriptor = match dependency {
                ManifestDependency::Plugin { plugin, version, slot } => {
                    let mut dependency = match version {
                        Some(pattern) => PluginDependency::new(&plugin, &pattern)?,
                        None => PluginDependency::any(&plugin),
                    };
                    if let Some(slot) = slot {
                        dependency = dependency.with_slot(&slot);
                    }
                    descriptor.requires(dependency)
                }
                ManifestDependency::Package {
                    package,
                    version,
                    platform,
                } => {
                    let mut dependency = PackageDependency::new(&package);
                    if let Some(pattern) = version {
                        dependency = dependency.with_version(&pattern)?;
                    }
                    if let Some(platform) = platform {
                        // Platform parsing is infallible; unknown names never match
                        let platform: Platform = platform.parse().unwrap_or_else(|never| match never {});
                        dependency = dependency.on_platform(platform);
                    }
                    descriptor.requires(dependency)
                }
            };
        }
        if self.code_units.is_empty() {
            descriptor = descriptor.code_unit(&self.id);
        }
        for unit in &self.code_units {
            descriptor = descriptor.code_unit(unit);
        }
        Ok(descriptor)
    }
}

/// Read a manifest file (JSON, YAML or TOML, by extension) into descriptors
pub fn load_manifest(path: &Path) -> PluginResult<ManifestContents> {
    let manifest: DescriptorManifest = config::load_file(path).map_err(|e| PluginSystemError::ManifestError {
        path: path.to_path_buf(),
        message: e.to_string(),
        source: Some(Box::new(e)),
    })?;
    let contents = manifest.into_descriptors().map_err(|e| PluginSystemError::ManifestError {
        path: path.to_path_buf(),
        message: e.to_string(),
        source: Some(Box::new(e)),
    })?;
    log::info!(
        "Loaded {} descriptor(s) from {}, {} rejected",
        contents.descriptors.len(),
        path.display(),
        contents.rejected.len()
    );
    Ok(contents)
}
