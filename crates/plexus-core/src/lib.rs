pub mod config;
pub mod kernel;
pub mod plugin_system;

// Re-export key public types/traits for easier use by the binary and plugins
pub use config::{ConfigFormat, ManagerConfig};
pub use kernel::error::Error as KernelError;
pub use kernel::Application;
pub use plugin_system::{
    DefaultPluginManager, LifecycleState, LoadReport, Plugin, PluginDescriptor, PluginHandle, PluginManager,
    UnloadPolicy,
};
