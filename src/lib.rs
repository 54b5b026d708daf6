//! # redeploy
//!
//! **Declarative Container Reconciliation Engine**
//!
//! Given a desired-state descriptor for one container (image, ports,
//! volumes, environment), this crate drives a container runtime to match
//! it: running instances of the image are stopped, stopped containers are
//! pruned, the image is pulled and exactly one fresh container is started.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                          redeploy                             │
//! ├───────────────────────────────────────────────────────────────┤
//! │  ContainerRequest ──normalize──▶ ContainerSpec                │
//! │  "8080:80"  "/srv:/data:ro"  "KEY=a=b"                        │
//! │                              │                                │
//! │  ┌───────────────────────────▼───────────────────────────┐    │
//! │  │                      Reconciler                       │    │
//! │  │  Inspecting → Draining → Pulling → Starting → Done    │    │
//! │  │  partial-drain tolerant │ bounded pull retries        │    │
//! │  └───────────────────────────┬───────────────────────────┘    │
//! │                              │                                │
//! │  ┌───────────────────────────▼───────────────────────────┐    │
//! │  │               ContainerRuntime Trait                  │    │
//! │  │  list_running  stop  prune_stopped  pull_image  run   │    │
//! │  └───────────────────────────┬───────────────────────────┘    │
//! ├──────────────────────────────┼────────────────────────────────┤
//! │                    DockerRuntime (bollard)                    │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use redeploy::{ContainerRequest, DockerConfig, Reconciler, ReconcilerConfig};
//!
//! #[tokio::main]
//! async fn main() -> redeploy::Result<()> {
//!     let mut request = ContainerRequest::new("nginx");
//!     request.ports.push("8080:80".to_string());
//!     let spec = request.normalize()?;
//!
//!     let runtime = redeploy::runtimes::connect_default(DockerConfig::default())?;
//!     let result = Reconciler::new(runtime, ReconcilerConfig::default())
//!         .reconcile(&spec)
//!         .await;
//!     println!("{:?} {:?}", result.phase, result.container_id);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod hostfs;
pub mod reconcile;
pub mod runtime;
pub mod runtimes;
pub mod spec;

// Re-exports
pub use config::{DockerConfig, ReconcilerConfig, Settings};
pub use error::{Error, Result, ValidationError};
pub use hostfs::{HostFs, LocalFs};
pub use reconcile::{Action, Failure, Phase, ReconcileResult, Reconciler};
pub use runtime::{ContainerRuntime, ContainerStatus, RuntimeContainer};
pub use runtimes::DockerRuntime;
pub use spec::{
    ContainerRequest, ContainerSpec, EnvVar, PortMapping, Protocol, VolumeMapping, VolumeMode,
};
