//! Engine configuration.
//!
//! Configuration is split the same way the engine is:
//! - [`ReconcilerConfig`]: retry policy and timeouts for the reconciler
//! - [`DockerConfig`]: how to reach the Docker daemon
//!
//! Both are immutable once built and start from the defaults in
//! [`crate::constants`]. A YAML settings file may override individual
//! fields:
//!
//! ```yaml
//! runtime:
//!   host: unix:///var/run/docker.sock
//!   stopTimeoutSecs: 20
//! reconcile:
//!   pullAttempts: 5
//!   pullBackoffMs: 1000
//! ```

use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_PULL_ATTEMPTS, DEFAULT_PULL_BACKOFF,
    DEFAULT_PULL_BACKOFF_MAX, DEFAULT_STOP_GRACE_PERIOD, IMAGE_PULL_TIMEOUT, MAX_DESCRIPTOR_SIZE,
    RUNTIME_CALL_TIMEOUT,
};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Reconciler Configuration
// =============================================================================

/// Retry policy and timeouts for a reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Total pull attempts, first try included. Always at least 1.
    pub pull_attempts: u32,
    /// Delay before the second pull attempt.
    pub pull_backoff: Duration,
    /// Cap on the pull backoff delay.
    pub pull_backoff_max: Duration,
    /// Timeout for a single pull attempt.
    pub pull_timeout: Duration,
    /// Timeout for list, stop, prune and run calls.
    pub call_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            pull_attempts: DEFAULT_PULL_ATTEMPTS,
            pull_backoff: DEFAULT_PULL_BACKOFF,
            pull_backoff_max: DEFAULT_PULL_BACKOFF_MAX,
            pull_timeout: IMAGE_PULL_TIMEOUT,
            call_timeout: RUNTIME_CALL_TIMEOUT,
        }
    }
}

impl ReconcilerConfig {
    /// Returns the delay to wait after failed attempt number `attempt`
    /// (1-based).
    ///
    /// Grows by 3/2 per attempt, capped at `pull_backoff_max`.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let mut delay = self.pull_backoff;
        for _ in 1..attempt {
            delay = (delay * 3 / 2).min(self.pull_backoff_max);
        }
        delay.min(self.pull_backoff_max)
    }
}

// =============================================================================
// Docker Configuration
// =============================================================================

/// Connection settings for the Docker backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerConfig {
    /// Daemon address (`unix://`, `tcp://` or `http://`). `None` uses
    /// `DOCKER_HOST` or the platform default socket.
    pub host: Option<String>,
    /// Grace period before the daemon kills a stopping container.
    pub stop_timeout: Duration,
    /// Timeout for daemon requests at the connection level.
    pub connect_timeout: Duration,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: None,
            stop_timeout: DEFAULT_STOP_GRACE_PERIOD,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

// =============================================================================
// Settings File
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RuntimeSection {
    host: Option<String>,
    stop_timeout_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ReconcileSection {
    pull_attempts: Option<u32>,
    pull_backoff_ms: Option<u64>,
    pull_backoff_max_ms: Option<u64>,
    pull_timeout_secs: Option<u64>,
    call_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SettingsFile {
    #[serde(default)]
    runtime: RuntimeSection,
    #[serde(default)]
    reconcile: ReconcileSection,
}

/// Fully resolved settings: defaults overlaid with a settings file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub runtime: DockerConfig,
    pub reconcile: ReconcilerConfig,
}

impl Settings {
    /// Parses settings from YAML, filling unset fields with defaults.
    ///
    /// # Errors
    ///
    /// - Size exceeds `MAX_DESCRIPTOR_SIZE`
    /// - YAML parsing fails or an unknown key is present
    /// - `pullAttempts` is zero
    /// - The timeouts fail [`Settings::validate`]
    pub fn from_yaml(yaml: &[u8]) -> Result<Self> {
        if yaml.len() > MAX_DESCRIPTOR_SIZE {
            return Err(Error::Config(format!(
                "settings size {} exceeds limit of {}",
                yaml.len(),
                MAX_DESCRIPTOR_SIZE
            )));
        }

        // An empty document deserializes as unit, not as an empty mapping.
        let file: SettingsFile = if yaml.iter().all(u8::is_ascii_whitespace) {
            SettingsFile::default()
        } else {
            serde_yaml::from_slice(yaml).map_err(|e| Error::Config(format!("settings: {}", e)))?
        };

        let mut settings = Self::default();

        let runtime = file.runtime;
        if runtime.host.is_some() {
            settings.runtime.host = runtime.host;
        }
        if let Some(secs) = runtime.stop_timeout_secs {
            settings.runtime.stop_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = runtime.connect_timeout_secs {
            settings.runtime.connect_timeout = Duration::from_secs(secs);
        }

        let reconcile = file.reconcile;
        if let Some(attempts) = reconcile.pull_attempts {
            if attempts == 0 {
                return Err(Error::Config(
                    "settings: pullAttempts must be at least 1".to_string(),
                ));
            }
            settings.reconcile.pull_attempts = attempts;
        }
        if let Some(ms) = reconcile.pull_backoff_ms {
            settings.reconcile.pull_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = reconcile.pull_backoff_max_ms {
            settings.reconcile.pull_backoff_max = Duration::from_millis(ms);
        }
        if let Some(secs) = reconcile.pull_timeout_secs {
            settings.reconcile.pull_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = reconcile.call_timeout_secs {
            settings.reconcile.call_timeout = Duration::from_secs(secs);
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Checks that the timeouts can be honored together.
    ///
    /// # Errors
    ///
    /// - A pull, call or connect timeout is zero
    /// - `stopTimeoutSecs` is not below `callTimeoutSecs`
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("pullTimeoutSecs", self.reconcile.pull_timeout),
            ("callTimeoutSecs", self.reconcile.call_timeout),
            ("connectTimeoutSecs", self.runtime.connect_timeout),
        ];
        for (key, value) in nonzero {
            if value.is_zero() {
                return Err(Error::Config(format!("settings: {} must be positive", key)));
            }
        }

        // A stop blocks for up to the grace period before the daemon kills
        // the container, so the call timeout must outlast it.
        if self.runtime.stop_timeout >= self.reconcile.call_timeout {
            return Err(Error::Config(format!(
                "settings: stopTimeoutSecs ({}s) must be below callTimeoutSecs ({}s)",
                self.runtime.stop_timeout.as_secs(),
                self.reconcile.call_timeout.as_secs()
            )));
        }

        Ok(())
    }

    /// Reads and parses a settings file.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_yaml(&bytes)
    }
}
