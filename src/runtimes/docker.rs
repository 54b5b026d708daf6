//! # Docker Runtime - Docker Engine API Backend
//!
//! Implements the [`ContainerRuntime`] trait over the Docker Engine API using
//! `bollard`.
//!
//! ## Connection
//!
//! | `DockerConfig::host` | Transport |
//! |----------------------|-----------|
//! | `None` | `DOCKER_HOST`, else the platform default socket |
//! | `unix:///path` | Unix socket |
//! | `tcp://host:port`, `http://host:port` | Plain HTTP |
//!
//! Clients for an explicit `unix://` or `tcp://` address connect lazily: an
//! unreachable daemon surfaces as [`Error::RuntimeUnavailable`] from the
//! first call, usually `list_running`. With local defaults the client
//! resolves the socket up front, so a missing socket fails in
//! [`DockerRuntime::connect`] with the same error.
//!
//! Every client uses `DockerConfig::connect_timeout` as its request timeout.
//!
//! ## Error Mapping
//!
//! | Operation | Daemon response | Error |
//! |-----------|-----------------|-------|
//! | stop | 304 / 404 | none (already stopped or gone) |
//! | pull | 404, "manifest unknown", "pull access denied" | `ImageNotFound` |
//! | pull | 5xx, connection failure | `TransientTransport` |
//! | run | "port is already allocated", "address already in use" | `PortConflict` |
//! | run | mount / bind source failures | `VolumeMountError` |
//! | run | anything else | `RuntimeRejected` |
//!
//! ## Pull Semantics
//!
//! The Engine API pulls every tag of a repository when no tag is given, so
//! references are split into repository and tag, defaulting to `latest`.
//!
//! [`ContainerRuntime`]: crate::runtime::ContainerRuntime
//! [`Error::RuntimeUnavailable`]: crate::error::Error::RuntimeUnavailable

use crate::config::DockerConfig;
use crate::constants::DEFAULT_IMAGE_TAG;
use crate::error::{Error, Result};
use crate::runtime::{ContainerRuntime, ContainerStatus, RuntimeContainer, short_id};
use crate::spec::ContainerSpec;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, PruneContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerSummary, HostConfig, PortBinding};
use bollard::{API_DEFAULT_VERSION, Docker};
use chrono::{DateTime, Utc};
use futures_util::stream::TryStreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Docker Engine backend.
pub struct DockerRuntime {
    docker: Docker,
    config: DockerConfig,
}

impl DockerRuntime {
    /// Creates a client for the daemon described by `config`.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`]: unsupported address scheme
    /// - [`Error::RuntimeUnavailable`]: client could not be built
    pub fn connect(config: DockerConfig) -> Result<Self> {
        // Rounded up so a sub-second timeout never becomes zero; the exact
        // value is applied with `with_timeout` below.
        let timeout = config.connect_timeout.as_secs_f64().ceil() as u64;

        let docker = match config.host.as_deref() {
            Some(host) if host.starts_with("unix://") => {
                Docker::connect_with_unix(host, timeout, API_DEFAULT_VERSION)
            }
            Some(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
                Docker::connect_with_http(host, timeout, API_DEFAULT_VERSION)
            }
            Some(host) => {
                return Err(Error::Config(format!(
                    "unsupported daemon address '{}' (expected unix://, tcp:// or http://)",
                    host
                )));
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| Error::RuntimeUnavailable {
            reason: e.to_string(),
        })?
        .with_timeout(config.connect_timeout);

        debug!(
            "Docker client configured for {}",
            config.host.as_deref().unwrap_or("local defaults")
        );

        Ok(Self { docker, config })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn list_running(&self, image: &str) -> Result<Vec<RuntimeContainer>> {
        let mut filters = HashMap::new();
        filters.insert("status".to_string(), vec!["running".to_string()]);
        filters.insert("ancestor".to_string(), vec![image.to_string()]);

        let options = ListContainersOptions {
            all: false,
            filters,
            ..Default::default()
        };

        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| Error::RuntimeUnavailable {
                reason: e.to_string(),
            })?;

        Ok(summaries.into_iter().filter_map(to_runtime_container).collect())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let options = stop_options(self.config.stop_timeout);
        let response = self.docker.stop_container(id, Some(options)).await;

        if stop_outcome(id, response)? {
            info!("Stopped container {}", short_id(id));
        } else {
            debug!("Container {} already stopped", short_id(id));
        }
        Ok(())
    }

    async fn prune_stopped(&self) -> Result<Vec<String>> {
        let response = self
            .docker
            .prune_containers(None::<PruneContainersOptions<String>>)
            .await
            .map_err(|e| Error::PruneFailed {
                reason: e.to_string(),
            })?;

        if let Some(bytes) = response.space_reclaimed {
            debug!("Prune reclaimed {} bytes", bytes);
        }

        Ok(response.containers_deleted.unwrap_or_default())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let (repository, tag) = split_reference(image);
        let options = CreateImageOptions {
            from_image: repository,
            tag,
            ..Default::default()
        };

        let stream = self.docker.create_image(Some(options), None, None);
        futures_util::pin_mut!(stream);

        while let Some(progress) = stream
            .try_next()
            .await
            .map_err(|e| pull_error(image, e))?
        {
            if let Some(message) = progress.error {
                return Err(classify_pull_failure(image, None, &message));
            }
            if let Some(status) = progress.status {
                debug!("{}: {}", image, status);
            }
        }

        Ok(())
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<String> {
        let options = spec
            .name
            .as_deref()
            .map(|name| CreateContainerOptions {
                name,
                platform: None,
            });

        let created = self
            .docker
            .create_container(options, container_config(spec))
            .await
            .map_err(run_error)?;

        for warning in &created.warnings {
            warn!("Docker: {}", warning);
        }

        let id = created.id;
        if let Err(e) = self
            .docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
        {
            // Leave no created-but-never-started container behind.
            let remove = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(remove_err) = self.docker.remove_container(&id, Some(remove)).await {
                warn!(
                    "Failed to remove unstarted container {}: {}",
                    short_id(&id),
                    remove_err
                );
            }
            return Err(run_error(e));
        }

        info!("Started container {}", short_id(&id));
        Ok(id)
    }
}

// =============================================================================
// Conversions
// =============================================================================

fn to_runtime_container(summary: ContainerSummary) -> Option<RuntimeContainer> {
    let id = summary.id?;
    let status = summary
        .state
        .as_deref()
        .map(ContainerStatus::from_state)
        .unwrap_or(ContainerStatus::Running);
    let created_at = summary
        .created
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .unwrap_or_default();

    Some(RuntimeContainer {
        id,
        image: summary.image.unwrap_or_default(),
        status,
        created_at,
    })
}

/// Splits an image reference into the repository and tag to pull.
///
/// Digest references are passed through whole with an empty tag.
pub fn split_reference(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }

    // A ':' before the last '/' belongs to a registry port, not a tag.
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(i) => {
            let split = name_start + i;
            (&image[..split], &image[split + 1..])
        }
        None => (image, DEFAULT_IMAGE_TAG),
    }
}

/// Builds the stop request for a grace period, saturating at `i64::MAX`
/// seconds.
pub fn stop_options(grace: Duration) -> StopContainerOptions {
    StopContainerOptions {
        t: i64::try_from(grace.as_secs()).unwrap_or(i64::MAX),
    }
}

/// Interprets the daemon's answer to a stop request.
///
/// Returns `Ok(true)` if the container was stopped and `Ok(false)` if it
/// was already stopped (304) or no longer exists (404).
pub fn stop_outcome(id: &str, response: std::result::Result<(), BollardError>) -> Result<bool> {
    match response {
        Ok(()) => Ok(true),
        Err(BollardError::DockerResponseServerError {
            status_code: 304 | 404,
            ..
        }) => Ok(false),
        Err(e) => Err(Error::StopFailed {
            id: id.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Builds the Engine API create request for `spec`.
pub fn container_config(spec: &ContainerSpec) -> Config<String> {
    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for port in &spec.ports {
        exposed_ports.insert(port.container_key(), HashMap::new());
        port_bindings.insert(
            port.container_key(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(port.host.clone()),
            }]),
        );
    }

    let binds: Vec<String> = spec.volumes.iter().map(|v| v.bind()).collect();
    let env: Vec<String> = spec.env.iter().map(|e| e.assignment()).collect();

    Config {
        image: Some(spec.image.clone()),
        env: (!env.is_empty()).then_some(env),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        host_config: Some(HostConfig {
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            binds: (!binds.is_empty()).then_some(binds),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// =============================================================================
// Error Classification
// =============================================================================

fn pull_error(image: &str, err: BollardError) -> Error {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => classify_pull_failure(image, Some(status_code), &message),
        BollardError::DockerStreamError { error } => classify_pull_failure(image, None, &error),
        other => Error::TransientTransport {
            operation: format!("pull {}", image),
            reason: other.to_string(),
        },
    }
}

/// Classifies a failed pull as terminal (`ImageNotFound`, `RuntimeRejected`)
/// or retryable (`TransientTransport`).
pub fn classify_pull_failure(image: &str, status: Option<u16>, message: &str) -> Error {
    let lower = message.to_ascii_lowercase();
    let not_found = status == Some(404)
        || lower.contains("not found")
        || lower.contains("manifest unknown")
        || lower.contains("pull access denied")
        || lower.contains("repository does not exist");

    if not_found {
        return Error::ImageNotFound {
            reference: image.to_string(),
        };
    }

    match status {
        Some(code) if (400..500).contains(&code) => Error::RuntimeRejected {
            reason: message.to_string(),
        },
        _ => Error::TransientTransport {
            operation: format!("pull {}", image),
            reason: message.to_string(),
        },
    }
}

fn run_error(err: BollardError) -> Error {
    match err {
        BollardError::DockerResponseServerError { message, .. } => classify_run_failure(&message),
        other => Error::RuntimeUnavailable {
            reason: other.to_string(),
        },
    }
}

/// Classifies a daemon message from container create/start.
pub fn classify_run_failure(message: &str) -> Error {
    let lower = message.to_ascii_lowercase();

    if lower.contains("port is already allocated")
        || lower.contains("address already in use")
        || lower.contains("ports are not available")
    {
        return Error::PortConflict {
            reason: message.to_string(),
        };
    }

    if lower.contains("mount")
        || lower.contains("bind source path")
        || lower.contains("invalid volume")
    {
        return Error::VolumeMountError {
            reason: message.to_string(),
        };
    }

    Error::RuntimeRejected {
        reason: message.to_string(),
    }
}
