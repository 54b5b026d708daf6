//! Reconciler state machine.
//!
//! Drives a container runtime from whatever it is currently running toward
//! the desired [`ContainerSpec`]:
//!
//! ```text
//!   Idle ──▶ Inspecting ──▶ Draining ──▶ Pulling ──▶ Starting ──▶ Done
//!                │              │            ▲    │         │
//!                │              │            │    │         │
//!                │              └────────────┘    │         │
//!                └── (nothing running) ───────────┘         │
//!                                                           │
//!   any step ──────────────────────────────────────────────────▶ Failed
//! ```
//!
//! # Ordering
//!
//! Steps are strictly sequential: every stop completes before the prune,
//! the prune before the pull, the pull before the run. Starting the new
//! container while an old one still holds its ports would double-bind them.
//!
//! # Failure Policy
//!
//! | Step | Failure | Outcome |
//! |------|---------|---------|
//! | Inspecting | any (e.g. daemon down) | Failed |
//! | Draining | some stops fail | recorded, continue |
//! | Draining | all stops fail | Failed (`DrainFailed`) |
//! | Draining | prune fails | recorded, continue |
//! | Pulling | transport error / timeout | retried with backoff, then Failed |
//! | Pulling | image not found | Failed, no retry |
//! | Starting | host volume missing | Failed before `run` |
//! | Starting | any `run` failure | Failed, no retry |
//!
//! Every failure, fatal or not, is kept in [`ReconcileResult::errors`].
//!
//! # Cancellation
//!
//! The caller may cancel through a [`CancellationToken`]. The token is
//! checked before every runtime call and during pull backoff; a call that
//! has already been issued is allowed to finish.

use crate::config::ReconcilerConfig;
use crate::error::{Error, Result};
use crate::hostfs::{HostFs, LocalFs};
use crate::runtime::{ContainerRuntime, RuntimeContainer, short_id};
use crate::spec::ContainerSpec;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Phases and Results
// =============================================================================

/// Reconciler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Inspecting,
    Draining,
    Pulling,
    Starting,
    Done,
    Failed,
}

impl Phase {
    /// Returns true for `Done` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Inspecting => write!(f, "inspecting"),
            Self::Draining => write!(f, "draining"),
            Self::Pulling => write!(f, "pulling"),
            Self::Starting => write!(f, "starting"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// What the reconciliation changed on the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// No new container was started.
    None,
    /// Existing containers were stopped and pruned, then a new one ran.
    Replaced,
    /// Nothing was running; a new container ran.
    Ran,
}

/// A failure observed during reconciliation, with the step and container it
/// belongs to.
#[derive(Debug)]
pub struct Failure {
    /// Phase in which the failure happened.
    pub phase: Phase,
    /// Container involved, if the failure is about one container.
    pub container: Option<String>,
    /// The underlying error.
    pub error: Error,
}

impl Failure {
    fn new(phase: Phase, error: Error) -> Self {
        Self {
            phase,
            container: None,
            error,
        }
    }

    fn for_container(phase: Phase, container: &str, error: Error) -> Self {
        Self {
            phase,
            container: Some(container.to_string()),
            error,
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.container {
            Some(id) => write!(f, "[{}] {}: {}", self.phase, short_id(id), self.error),
            None => write!(f, "[{}] {}", self.phase, self.error),
        }
    }
}

/// Outcome of a reconciliation.
#[derive(Debug)]
pub struct ReconcileResult {
    /// Terminal phase: `Done` or `Failed`.
    pub phase: Phase,
    /// What changed.
    pub action: Action,
    /// ID of the container started, when `Done`.
    pub container_id: Option<String>,
    /// IDs of containers stopped during the drain.
    pub stopped: Vec<String>,
    /// Every failure in the order observed. When `Failed`, the last entry
    /// is the fatal one.
    pub errors: Vec<Failure>,
    /// Phases visited, starting with `Idle`.
    pub trace: Vec<Phase>,
}

impl ReconcileResult {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            action: Action::None,
            container_id: None,
            stopped: Vec::new(),
            errors: Vec::new(),
            trace: vec![Phase::Idle],
        }
    }

    /// Returns true if the desired container is running.
    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Returns the error that failed the reconciliation, if it failed.
    pub fn fatal_error(&self) -> Option<&Error> {
        if self.phase != Phase::Failed {
            return None;
        }
        self.errors.last().map(|f| &f.error)
    }

    /// Returns true if `phase` was visited.
    pub fn visited(&self, phase: Phase) -> bool {
        self.trace.contains(&phase)
    }

    fn enter(&mut self, phase: Phase) {
        debug!("Entering phase {}", phase);
        self.phase = phase;
        self.trace.push(phase);
    }

    fn record(&mut self, failure: Failure) {
        warn!("{}", failure);
        self.errors.push(failure);
    }

    fn finish_done(mut self, id: String) -> Self {
        self.action = if self.stopped.is_empty() {
            Action::Ran
        } else {
            Action::Replaced
        };
        info!("Container {} is running", short_id(&id));
        self.container_id = Some(id);
        self.enter(Phase::Done);
        self
    }

    fn finish_failed(mut self, failure: Failure) -> Self {
        error!("Reconciliation failed: {}", failure);
        self.errors.push(failure);
        self.action = Action::None;
        self.enter(Phase::Failed);
        self
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Drives a [`ContainerRuntime`] toward a [`ContainerSpec`].
///
/// One reconciliation runs at a time; the reconciler holds no state between
/// calls and never retries across invocations.
pub struct Reconciler {
    runtime: Arc<dyn ContainerRuntime>,
    fs: Arc<dyn HostFs>,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Creates a reconciler checking host paths on the local filesystem.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: ReconcilerConfig) -> Self {
        Self {
            runtime,
            fs: Arc::new(LocalFs),
            config,
        }
    }

    /// Replaces the filesystem used for host volume checks.
    pub fn with_host_fs(mut self, fs: Arc<dyn HostFs>) -> Self {
        self.fs = fs;
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Reconciles without external cancellation.
    pub async fn reconcile(&self, spec: &ContainerSpec) -> ReconcileResult {
        self.reconcile_with_cancel(spec, &CancellationToken::new())
            .await
    }

    /// Reconciles, stopping before the next step once `cancel` fires.
    pub async fn reconcile_with_cancel(
        &self,
        spec: &ContainerSpec,
        cancel: &CancellationToken,
    ) -> ReconcileResult {
        info!(image = %spec.image, runtime = self.runtime.name(), "Reconciling");

        let mut result = ReconcileResult::new();
        let outcome = self.drive(spec, cancel, &mut result).await;
        match outcome {
            Ok(id) => result.finish_done(id),
            Err(failure) => result.finish_failed(failure),
        }
    }

    async fn drive(
        &self,
        spec: &ContainerSpec,
        cancel: &CancellationToken,
        result: &mut ReconcileResult,
    ) -> std::result::Result<String, Failure> {
        // Inspecting
        self.enter(result, Phase::Inspecting, cancel)?;
        let running = self
            .bounded(
                format!("list running containers of {}", spec.image),
                self.config.call_timeout,
                self.runtime.list_running(&spec.image),
            )
            .await
            .map_err(|e| Failure::new(Phase::Inspecting, e))?;

        // Draining
        if running.is_empty() {
            info!("No running containers of {}", spec.image);
        } else {
            self.enter(result, Phase::Draining, cancel)?;
            self.drain(&running, cancel, result).await?;
        }

        // Pulling
        self.enter(result, Phase::Pulling, cancel)?;
        self.pull(&spec.image, cancel, result).await?;

        // Starting
        self.enter(result, Phase::Starting, cancel)?;
        if spec.clean_volumes {
            self.check_volumes(spec)?;
        }

        info!("Running container from {}", spec.image);
        self.bounded(
            format!("run {}", spec.image),
            self.config.call_timeout,
            self.runtime.run(spec),
        )
        .await
        .map_err(|e| Failure::new(Phase::Starting, e))
    }

    fn enter(
        &self,
        result: &mut ReconcileResult,
        phase: Phase,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), Failure> {
        if cancel.is_cancelled() {
            return Err(Failure::new(
                result.phase,
                Error::Cancelled {
                    step: phase.to_string(),
                },
            ));
        }
        result.enter(phase);
        Ok(())
    }

    /// Stops every container in discovery order, then prunes.
    async fn drain(
        &self,
        containers: &[RuntimeContainer],
        cancel: &CancellationToken,
        result: &mut ReconcileResult,
    ) -> std::result::Result<(), Failure> {
        info!("Stopping {} running container(s)", containers.len());

        let mut failed = 0;
        for container in containers {
            if cancel.is_cancelled() {
                return Err(Failure::for_container(
                    Phase::Draining,
                    &container.id,
                    Error::Cancelled {
                        step: "stop".to_string(),
                    },
                ));
            }

            debug!(container = %container.short_id(), "Stopping container");
            let stopped = self
                .bounded(
                    format!("stop {}", container.short_id()),
                    self.config.call_timeout,
                    self.runtime.stop(&container.id),
                )
                .await;

            match stopped {
                Ok(()) => result.stopped.push(container.id.clone()),
                Err(e) => {
                    failed += 1;
                    let error = match e {
                        err @ Error::StopFailed { .. } => err,
                        other => Error::StopFailed {
                            id: container.id.clone(),
                            reason: other.to_string(),
                        },
                    };
                    result.record(Failure::for_container(Phase::Draining, &container.id, error));
                }
            }
        }

        if failed == containers.len() {
            return Err(Failure::new(
                Phase::Draining,
                Error::DrainFailed { attempted: failed },
            ));
        }

        if cancel.is_cancelled() {
            return Err(Failure::new(
                Phase::Draining,
                Error::Cancelled {
                    step: "prune".to_string(),
                },
            ));
        }

        let pruned = self
            .bounded(
                "prune stopped containers".to_string(),
                self.config.call_timeout,
                self.runtime.prune_stopped(),
            )
            .await;

        match pruned {
            Ok(ids) => info!("Pruned {} stopped container(s)", ids.len()),
            Err(e) => {
                let error = match e {
                    err @ Error::PruneFailed { .. } => err,
                    other => Error::PruneFailed {
                        reason: other.to_string(),
                    },
                };
                result.record(Failure::new(Phase::Draining, error));
            }
        }

        Ok(())
    }

    /// Pulls the image, retrying transport failures with backoff.
    async fn pull(
        &self,
        image: &str,
        cancel: &CancellationToken,
        result: &mut ReconcileResult,
    ) -> std::result::Result<(), Failure> {
        let attempts = self.config.pull_attempts.max(1);
        let mut attempt = 1;

        loop {
            info!(image = %image, attempt, attempts, "Pulling image");

            let pulled = self
                .bounded(
                    format!("pull {}", image),
                    self.config.pull_timeout,
                    self.runtime.pull_image(image),
                )
                .await;

            match pulled {
                Ok(()) => {
                    info!("Pulled image {}", image);
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    result.record(Failure::new(Phase::Pulling, e));

                    let delay = self.config.backoff_after(attempt);
                    debug!("Retrying pull of {} in {:?}", image, delay);
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(Failure::new(
                                Phase::Pulling,
                                Error::Cancelled { step: "pull retry".to_string() },
                            ));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(Failure::new(Phase::Pulling, e)),
            }
        }
    }

    /// Verifies that every host volume directory exists.
    ///
    /// Missing directories are not created: a missing path usually means a
    /// misconfigured mapping.
    fn check_volumes(&self, spec: &ContainerSpec) -> std::result::Result<(), Failure> {
        for volume in &spec.volumes {
            if !self.fs.is_dir(&volume.host_path) {
                return Err(Failure::new(
                    Phase::Starting,
                    Error::VolumeMissing {
                        path: volume.host_path.clone(),
                    },
                ));
            }
            debug!("Host volume {} present", volume.host_path.display());
        }
        Ok(())
    }

    async fn bounded<T>(
        &self,
        operation: String,
        duration: Duration,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(duration, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation,
                duration,
            }),
        }
    }
}
