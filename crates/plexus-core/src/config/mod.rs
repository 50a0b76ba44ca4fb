//! # Plexus Configuration
//!
//! Manager settings and the format-agnostic file loader shared with plugin
//! manifests. The format is picked from the file extension; YAML and TOML
//! support sit behind the `yaml-config` and `toml-config` features.
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::plugin_system::dependency::{PackagePolicy, StaticPackageProbe};

pub mod error;

pub use error::ConfigError;

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Supported configuration file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// JSON format (.json)
    Json,
    /// YAML format (.yaml, .yml) - requires "yaml-config" feature
    #[cfg(feature = "yaml-config")]
    Yaml,
    /// TOML format (.toml) - requires "toml-config" feature
    #[cfg(feature = "toml-config")]
    Toml,
}

impl ConfigFormat {
    /// Get the file extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            ConfigFormat::Json => "json",
            #[cfg(feature = "yaml-config")]
            ConfigFormat::Yaml => "yaml",
            #[cfg(feature = "toml-config")]
            ConfigFormat::Toml => "toml",
        }
    }

    /// Determine format from file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| match ext.to_lowercase().as_str() {
                "json" => Some(ConfigFormat::Json),
                #[cfg(feature = "yaml-config")]
                "yaml" | "yml" => Some(ConfigFormat::Yaml),
                #[cfg(feature = "toml-config")]
                "toml" => Some(ConfigFormat::Toml),
                _ => None,
            })
    }
}

/// Deserialize `data` written in `format`
pub fn parse_str<T: DeserializeOwned>(data: &str, format: ConfigFormat) -> Result<T> {
    let deserialization = |source: Box<dyn std::error::Error + Send + Sync>| ConfigError::Deserialization {
        format: format.extension().to_string(),
        source,
    };
    match format {
        ConfigFormat::Json => serde_json::from_str(data).map_err(|e| deserialization(Box::new(e))),
        #[cfg(feature = "yaml-config")]
        ConfigFormat::Yaml => serde_yaml::from_str(data).map_err(|e| deserialization(Box::new(e))),
        #[cfg(feature = "toml-config")]
        ConfigFormat::Toml => toml::from_str(data).map_err(|e| deserialization(Box::new(e))),
    }
}

/// Read and deserialize a file, choosing the format from its extension
pub fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let format = ConfigFormat::from_path(path).ok_or_else(|| ConfigError::UnsupportedFormat(path.to_path_buf()))?;
    let data = fs::read_to_string(path).map_err(|e| ConfigError::io(e, "read", path.to_path_buf()))?;
    parse_str(&data, format)
}

/// Settings of a [`DefaultPluginManager`](crate::plugin_system::DefaultPluginManager)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Whether missing external packages block the plugin
    pub package_policy: PackagePolicy,
    /// Load lazy providers when a capability lookup finds none
    pub lazy_on_miss: bool,
    /// External packages known to be installed, name -> version (if known)
    pub packages: BTreeMap<String, Option<String>>,
    /// Descriptor manifests loaded when the application initializes
    pub manifests: Vec<PathBuf>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            package_policy: PackagePolicy::Advisory,
            lazy_on_miss: true,
            packages: BTreeMap::new(),
            manifests: Vec::new(),
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_package_policy(mut self, policy: PackagePolicy) -> Self {
        self.package_policy = policy;
        self
    }

    pub fn with_lazy_on_miss(mut self, enabled: bool) -> Self {
        self.lazy_on_miss = enabled;
        self
    }

    pub fn with_package(mut self, name: &str, version: Option<&str>) -> Self {
        self.packages.insert(name.to_string(), version.map(str::to_string));
        self
    }

    pub fn with_manifest(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifests.push(path.into());
        self
    }

    /// Load from a JSON, YAML or TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut config: Self = load_file(path)?;
        // Manifest paths are relative to the config file
        if let Some(base) = path.parent() {
            for manifest in &mut config.manifests {
                if manifest.is_relative() {
                    *manifest = base.join(&*manifest);
                }
            }
        }
        Ok(config)
    }

    /// Package probe answering from [`packages`](Self::packages)
    pub fn package_probe(&self) -> Result<StaticPackageProbe> {
        StaticPackageProbe::from_table(&self.packages).map_err(|e| ConfigError::InvalidValue {
            key: "packages".to_string(),
            message: e.to_string(),
        })
    }
}
