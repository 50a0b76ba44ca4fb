//! # Plexus Plugin System
//!
//! Resolves versioned plugin descriptors into a dependency graph and drives
//! plugin instances through their lifecycle, wiring them together through
//! hard dependencies and capability tags.
//!
//! ## Key Submodules and Responsibilities:
//!
//! - **[`version`]**: Concrete versions and the wildcard/range patterns
//!   dependencies are matched with.
//! - **[`dependency`]**: Hard plugin dependencies, advisory external package
//!   dependencies and the [`PackageProbe`](dependency::PackageProbe) that checks them.
//! - **[`descriptor`]**: The static contract of a plugin ([`PluginDescriptor`]).
//! - **[`graph`]**: Builds the immutable [`DependencyGraph`] (effective versions,
//!   cycles, blocking, load order) from a [`DescriptorSet`].
//! - **[`capability`]**: The [`CapabilityRegistry`] and the hook tables consumers
//!   are notified through.
//! - **[`instance`]**: Lifecycle states, runtime instances and their handles.
//! - **`lifecycle`**: The activation and deactivation transitions.
//! - **[`manager`]**: The [`PluginManager`] trait and [`DefaultPluginManager`].
//! - **[`manifest`]**: Descriptor manifests in JSON, YAML or TOML.
//! - **[`report`]**: Conditions and the [`LoadReport`].
//! - **[`traits`]**: The [`Plugin`] callback trait and [`UnitFactory`].
//! - **[`error`]**: [`PluginSystemError`](error::PluginSystemError).
pub mod capability;
pub mod dependency;
pub mod descriptor;
pub mod error;
pub mod graph;
pub mod instance;
mod lifecycle;
pub mod manager;
pub mod manifest;
pub mod report;
pub mod traits;
pub mod version;

pub use capability::{CapabilityChange, CapabilityHook, CapabilityHooks, CapabilityRegistry, ChangeKind};
pub use dependency::{Dependency, PackageDependency, PackagePolicy, Platform, PluginDependency};
pub use descriptor::{LoadingMode, PluginDescriptor};
pub use error::{PluginResult, PluginSystemError};
pub use graph::{DependencyGraph, DescriptorSet};
pub use instance::{LifecycleState, PluginHandle, Transition};
pub use manager::{DefaultPluginManager, ManagerHandle, PluginManager, UnloadPolicy};
pub use manifest::{load_manifest, ManifestContents};
pub use report::{Condition, ConditionKind, LoadReport, PluginStatus};
pub use traits::{Plugin, PluginError, UnitContext, UnitFactory};
pub use version::{Version, VersionPattern};

// Test module declaration
#[cfg(test)]
mod tests;
