//! # Reconciliation Constants
//!
//! Defines input limits, retry policy defaults and timeouts for the
//! reconciliation engine. These constants are the **single source of truth**
//! for default configuration; [`crate::config`] starts from them and the
//! settings file may override the tunable ones.
//!
//! ## Cross-References
//!
//! - [`crate::spec`]: Uses input limits while normalizing mappings
//! - [`crate::reconcile`]: Uses retry and timeout defaults
//! - [`crate::runtimes::docker`]: Uses the stop grace period and connect timeout

use std::time::Duration;

// =============================================================================
// Input Limits
// =============================================================================
//
// Bounds applied by the normalizer before anything reaches the runtime.
// They keep a malformed descriptor from producing an oversized create
// request.
// =============================================================================

/// Maximum image reference length in bytes.
///
/// Registry implementations may have lower limits.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum container name length in bytes.
pub const MAX_CONTAINER_NAME_LEN: usize = 128;

/// Maximum number of port mappings per container.
pub const MAX_PORT_MAPPINGS: usize = 256;

/// Maximum number of volume mappings per container.
pub const MAX_VOLUME_MAPPINGS: usize = 64;

/// Maximum number of environment variables per container.
pub const MAX_ENV_VARS: usize = 256;

/// Maximum length of an environment variable value (32 KiB).
pub const MAX_ENV_VALUE_LEN: usize = 32 * 1024;

/// Maximum size of a descriptor or settings file (1 MiB).
pub const MAX_DESCRIPTOR_SIZE: usize = 1024 * 1024;

// =============================================================================
// Retry Policy
// =============================================================================
//
// Only image pulls are retried, and only for transport failures. Backoff
// grows by 3/2 per attempt and is capped.
// =============================================================================

/// Total pull attempts (first try included) before giving up.
pub const DEFAULT_PULL_ATTEMPTS: u32 = 3;

/// Delay before the second pull attempt.
pub const DEFAULT_PULL_BACKOFF: Duration = Duration::from_millis(500);

/// Upper bound for the pull backoff delay.
pub const DEFAULT_PULL_BACKOFF_MAX: Duration = Duration::from_secs(5);

// =============================================================================
// Timeouts
// =============================================================================
//
// Every runtime call is bounded so a stuck daemon cannot hang the
// reconciliation forever.
// =============================================================================

/// Timeout for a single image pull attempt (5 minutes).
///
/// Accommodates large images on slow connections while ensuring eventual
/// failure for truly stuck transfers.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout for every other runtime call (list, stop, prune, run).
///
/// Must exceed [`DEFAULT_STOP_GRACE_PERIOD`], since a stop call blocks for
/// up to the grace period before the daemon kills the container.
pub const RUNTIME_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Grace period between SIGTERM and SIGKILL when stopping a container.
pub const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Timeout for establishing the daemon connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

// =============================================================================
// Defaults
// =============================================================================

/// Tag used when an image reference names no tag or digest.
pub const DEFAULT_IMAGE_TAG: &str = "latest";
