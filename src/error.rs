//! Error types for the reconciliation engine.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for reconciliation operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Input rejected by the normalizer, before any runtime call is made.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Port mapping is not `host:container[/protocol]`.
    #[error("malformed port mapping '{mapping}': {reason}")]
    MalformedPortMapping { mapping: String, reason: String },

    /// Volume mapping is not `hostPath:containerPath[:mode]`.
    #[error("malformed volume mapping '{mapping}': {reason}")]
    MalformedVolumeMapping { mapping: String, reason: String },

    /// Environment assignment is not `NAME=value`.
    #[error("malformed environment assignment '{assignment}': {reason}")]
    MalformedEnvAssignment { assignment: String, reason: String },

    /// The same key appears twice.
    #[error("duplicate {kind} '{key}'")]
    DuplicateKey { kind: String, key: String },

    /// Protocol is neither `tcp` nor `udp`.
    #[error("invalid protocol '{0}' (expected tcp or udp)")]
    InvalidProtocol(String),

    /// Image reference failed validation.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// Container name failed validation.
    #[error("invalid container name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// Too many entries, or an entry is too large.
    #[error("{what} exceeds limit: {count} > {limit}")]
    LimitExceeded {
        what: String,
        count: usize,
        limit: usize,
    },
}

/// Errors that can occur while reconciling a container.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Input Errors
    // =========================================================================
    /// Malformed user input.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Settings or descriptor could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// The daemon cannot be reached.
    #[error("container runtime unavailable: {reason}")]
    RuntimeUnavailable { reason: String },

    /// Network failure while talking to a registry or the daemon.
    #[error("transport error during {operation}: {reason}")]
    TransientTransport { operation: String, reason: String },

    /// The image does not exist or is not accessible.
    #[error("image not found: {reference}")]
    ImageNotFound { reference: String },

    /// A requested host port is already bound.
    #[error("port conflict: {reason}")]
    PortConflict { reason: String },

    /// The runtime failed to mount a volume.
    #[error("volume mount failed: {reason}")]
    VolumeMountError { reason: String },

    /// The runtime refused the request for another reason.
    #[error("runtime rejected request: {reason}")]
    RuntimeRejected { reason: String },

    // =========================================================================
    // Reconciliation Errors
    // =========================================================================
    /// A host volume directory is missing.
    #[error("host volume directory does not exist: {}", path.display())]
    VolumeMissing { path: PathBuf },

    /// Stopping a single container failed.
    #[error("failed to stop container '{id}': {reason}")]
    StopFailed { id: String, reason: String },

    /// Every stop attempt during the drain failed.
    #[error("failed to drain: all {attempted} stop attempts failed")]
    DrainFailed { attempted: usize },

    /// Removing stopped containers failed.
    #[error("failed to prune stopped containers: {reason}")]
    PruneFailed { reason: String },

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// The caller abandoned the reconciliation.
    #[error("reconciliation cancelled before {step}")]
    Cancelled { step: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true if retrying the same call may succeed.
    ///
    /// Transport hiccups and timeouts are retryable; everything that needs
    /// operator remediation is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientTransport { .. } | Self::Timeout { .. })
    }

    /// Returns true if the error was raised by input validation.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
