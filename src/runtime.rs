//! Container runtime facade.
//!
//! This trait is the only point of contact between the reconciler and a
//! container daemon. It exposes exactly the capabilities reconciliation
//! needs:
//! - `list_running`: Discover running containers of an image
//! - `stop`: Stop a container
//! - `prune_stopped`: Remove stopped container records
//! - `pull_image`: Fetch an image from its registry
//! - `run`: Create and start a container from a [`ContainerSpec`]
//!
//! Backends live in [`crate::runtimes`]; tests substitute a fake.

use crate::error::Result;
use crate::spec::ContainerSpec;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Container View
// =============================================================================

/// Observed status of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container is running.
    Running,
    /// Container was stopped (created, paused or being removed).
    Stopped,
    /// Container's main process has exited.
    Exited,
}

impl ContainerStatus {
    /// Maps a daemon state string (e.g. Docker's `State` field).
    ///
    /// Anything that is neither running nor exited counts as stopped.
    pub fn from_state(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "running" | "restarting" => Self::Running,
            "exited" | "dead" => Self::Exited,
            _ => Self::Stopped,
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// Read-only view of a container as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeContainer {
    /// Runtime-assigned container ID.
    pub id: String,
    /// Image the container was created from.
    pub image: String,
    /// Current status.
    pub status: ContainerStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl RuntimeContainer {
    /// Returns true if the container is running.
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    /// Returns the 12-character short form of the ID.
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }
}

/// Returns the 12-character short form of a container ID.
pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

// =============================================================================
// Runtime Facade
// =============================================================================

/// Narrow interface over a container runtime daemon.
///
/// # Idempotency
///
/// `stop` and `prune_stopped` must succeed when there is nothing to do:
/// stopping an already-stopped (or already-removed) container is a no-op.
///
/// # Error Contract
///
/// | Operation | Errors |
/// |-----------|--------|
/// | `list_running` | `RuntimeUnavailable` |
/// | `pull_image` | `ImageNotFound` (terminal), `TransientTransport` (retryable) |
/// | `run` | `PortConflict`, `VolumeMountError`, `RuntimeRejected` |
///
/// # Implementations
///
/// - `DockerRuntime`: Docker Engine API via bollard
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns the backend name.
    fn name(&self) -> &str;

    /// Lists running containers created from `image`.
    async fn list_running(&self, image: &str) -> Result<Vec<RuntimeContainer>>;

    /// Stops a container.
    async fn stop(&self, id: &str) -> Result<()>;

    /// Removes all stopped containers, returning the removed IDs.
    async fn prune_stopped(&self) -> Result<Vec<String>>;

    /// Pulls an image so that `run` can use it.
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Creates and starts a container, returning its ID.
    async fn run(&self, spec: &ContainerSpec) -> Result<String>;
}
