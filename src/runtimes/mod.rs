//! Container runtime backends.
//!
//! Each backend implements [`ContainerRuntime`] over a real daemon
//! transport.

pub mod docker;

pub use self::docker::DockerRuntime;

use crate::config::DockerConfig;
use crate::error::Result;
use crate::runtime::ContainerRuntime;
use std::sync::Arc;

/// Connects the default backend (Docker) as a shareable runtime handle.
pub fn connect_default(config: DockerConfig) -> Result<Arc<dyn ContainerRuntime>> {
    Ok(Arc::new(DockerRuntime::connect(config)?))
}
