use std::any::Any;
use std::fmt::Debug;

use async_trait::async_trait;

use crate::kernel::error::Result;

/// Core component lifecycle trait for all kernel components
#[async_trait]
pub trait KernelComponent: Any + Send + Sync + Debug {
    fn name(&self) -> &'static str;
    async fn initialize(&self) -> Result<()>;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}
