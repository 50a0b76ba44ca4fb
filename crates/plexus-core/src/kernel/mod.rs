//! # Plexus Kernel
//!
//! Application bootstrapping and component lifecycle.
//!
//! - **Application Bootstrapping**: [`Application`](bootstrap::Application) owns the
//!   configuration and the plugin manager, loads manifests and drives startup
//!   and shutdown.
//! - **Component Lifecycle**: the [`KernelComponent`](component::KernelComponent) trait.
//! - **Core Constants**: names and defaults in `constants`.
//! - **Error Handling**: [`Error`](error::Error) and the `Result` alias.
pub mod bootstrap;
pub mod component;
pub mod constants;
pub mod error;

pub use bootstrap::Application;
pub use component::KernelComponent;
pub use error::{Error, Result};
