//! Desired-state specification and normalizer.
//!
//! Turns the user-facing mapping strings into a validated [`ContainerSpec`]:
//!
//! | Input | Format | Example |
//! |-------|--------|---------|
//! | Port | `host:container[/protocol]` | `8080:80`, `5353:53/udp` |
//! | Volume | `hostPath:containerPath[:mode]` | `/srv/www:/usr/share/nginx/html:ro` |
//! | Environment | `NAME=value` | `JAVA_OPTS=-Xmx1g -Dfoo=bar` |
//!
//! Normalization preserves input order so that reconciliation logs are
//! deterministic, and rejects duplicate keys instead of letting the last
//! entry win.

use crate::constants::{
    MAX_CONTAINER_NAME_LEN, MAX_DESCRIPTOR_SIZE, MAX_ENV_VALUE_LEN, MAX_ENV_VARS,
    MAX_IMAGE_REF_LEN, MAX_PORT_MAPPINGS, MAX_VOLUME_MAPPINGS,
};
use crate::error::{Error, Result, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;

// =============================================================================
// Mapping Types
// =============================================================================

/// Transport protocol of a published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl FromStr for Protocol {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            _ => Err(ValidationError::InvalidProtocol(s.to_string())),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access mode of a bind-mounted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeMode {
    /// Read-only.
    Ro,
    /// Read-write (default).
    #[default]
    Rw,
}

impl VolumeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ro => "ro",
            Self::Rw => "rw",
        }
    }
}

impl std::fmt::Display for VolumeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A published port: host port bound to a container port.
///
/// Both sides are kept as strings since either may be a named port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    pub host: String,
    pub container: String,
    pub protocol: Protocol,
}

impl PortMapping {
    /// Returns the container-side key in `port/protocol` form, e.g. `80/tcp`.
    pub fn container_key(&self) -> String {
        format!("{}/{}", self.container, self.protocol)
    }
}

/// A host directory bind-mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMapping {
    pub host_path: PathBuf,
    pub container_path: String,
    pub mode: VolumeMode,
}

impl VolumeMapping {
    /// Returns the bind in `host:container:mode` form.
    pub fn bind(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host_path.display(),
            self.container_path,
            self.mode
        )
    }
}

/// A single environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    /// Returns the variable in `NAME=value` form.
    pub fn assignment(&self) -> String {
        format!("{}={}", self.name, self.value)
    }
}

// =============================================================================
// Container Specification
// =============================================================================

/// Validated desired state of the container to run.
///
/// Constructed once per invocation by [`ContainerRequest::normalize`] and
/// consumed by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Image reference (e.g., "nginx", "ghcr.io/user/app:v1").
    pub image: String,
    /// Container name, if one was requested.
    pub name: Option<String>,
    /// Published ports in input order.
    pub ports: Vec<PortMapping>,
    /// Bind mounts in input order.
    pub volumes: Vec<VolumeMapping>,
    /// Environment in input order, names unique.
    pub env: Vec<EnvVar>,
    /// Verify that every host volume directory exists before running.
    pub clean_volumes: bool,
}

impl ContainerSpec {
    /// Creates a spec for `image` with no mappings.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            name: None,
            ports: Vec::new(),
            volumes: Vec::new(),
            env: Vec::new(),
            clean_volumes: false,
        }
    }
}

// =============================================================================
// Raw Request
// =============================================================================

/// Raw, user-facing description of the desired container.
///
/// This is what a CLI or a descriptor file produces. Every field is optional
/// at parse time so a descriptor can leave the image to the command line;
/// [`ContainerRequest::normalize`] rejects an empty image. Unknown keys are
/// rejected rather than silently merged.
///
/// ```yaml
/// image: nginx:1.25
/// name: web
/// ports: ["8080:80"]
/// volumes: ["/srv/www:/usr/share/nginx/html:ro"]
/// env: ["TZ=UTC"]
/// cleanVolumes: true
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ContainerRequest {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Default protocol for ports without a `/protocol` suffix.
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default, alias = "environment")]
    pub env: Vec<String>,
    #[serde(default, alias = "cleanHostVolumeDirs")]
    pub clean_volumes: bool,
}

impl ContainerRequest {
    /// Creates a request for `image` with no mappings.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Parses a request from a YAML (or JSON) descriptor.
    ///
    /// # Errors
    ///
    /// - Size exceeds `MAX_DESCRIPTOR_SIZE`
    /// - YAML parsing fails or an unknown key is present
    pub fn from_yaml(yaml: &[u8]) -> Result<Self> {
        if yaml.len() > MAX_DESCRIPTOR_SIZE {
            return Err(Error::Config(format!(
                "descriptor size {} exceeds limit of {}",
                yaml.len(),
                MAX_DESCRIPTOR_SIZE
            )));
        }

        serde_yaml::from_slice(yaml).map_err(|e| Error::Config(format!("descriptor: {}", e)))
    }

    /// Validates the request and produces a [`ContainerSpec`].
    ///
    /// Nothing here talks to the runtime; every error is a
    /// [`ValidationError`].
    pub fn normalize(&self) -> std::result::Result<ContainerSpec, ValidationError> {
        validate_image_reference(&self.image)?;
        if let Some(name) = &self.name {
            validate_container_name(name)?;
        }

        let protocol = match &self.protocol {
            Some(p) => p.parse()?,
            None => Protocol::default(),
        };

        Ok(ContainerSpec {
            image: self.image.clone(),
            name: self.name.clone(),
            ports: parse_ports(&self.ports, protocol)?,
            volumes: parse_volumes(&self.volumes)?,
            env: parse_env(&self.env)?,
            clean_volumes: self.clean_volumes,
        })
    }
}

// =============================================================================
// Validation Helpers
// =============================================================================

/// Validates an image reference.
///
/// Length is bounded by `MAX_IMAGE_REF_LEN` and characters are limited to
/// alphanumerics and `/:.-_@`.
pub fn validate_image_reference(reference: &str) -> std::result::Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidImageReference {
        reference: reference.to_string(),
        reason: reason.to_string(),
    };

    if reference.is_empty() {
        return Err(invalid("reference cannot be empty"));
    }

    if reference.len() > MAX_IMAGE_REF_LEN {
        return Err(invalid(&format!("exceeds {} bytes", MAX_IMAGE_REF_LEN)));
    }

    if !reference
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "/:.-_@".contains(c))
    {
        return Err(invalid("contains invalid characters"));
    }

    Ok(())
}

/// Validates a container name against `[a-zA-Z0-9][a-zA-Z0-9_.-]*`.
pub fn validate_container_name(name: &str) -> std::result::Result<(), ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidName {
        name: name.to_string(),
        reason,
    };

    let Some(first) = name.chars().next() else {
        return Err(invalid("name cannot be empty".to_string()));
    };

    if name.len() > MAX_CONTAINER_NAME_LEN {
        return Err(invalid(format!(
            "exceeds maximum length of {}",
            MAX_CONTAINER_NAME_LEN
        )));
    }

    if !first.is_ascii_alphanumeric() {
        return Err(invalid("must start with an alphanumeric character".to_string()));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
    {
        return Err(invalid(
            "must contain only alphanumeric characters, '_', '.' or '-'".to_string(),
        ));
    }

    Ok(())
}

fn check_limit(
    what: &str,
    count: usize,
    limit: usize,
) -> std::result::Result<(), ValidationError> {
    if count > limit {
        return Err(ValidationError::LimitExceeded {
            what: what.to_string(),
            count,
            limit,
        });
    }
    Ok(())
}

/// Checks a port token: a number in 1..=65535 or a lowercase service name.
fn validate_port_token(token: &str) -> std::result::Result<(), String> {
    if token.is_empty() {
        return Err("empty port".to_string());
    }

    if token.chars().all(|c| c.is_ascii_digit()) {
        return match token.parse::<u32>() {
            Ok(port) if (1..=65535).contains(&port) => Ok(()),
            _ => Err(format!("port '{}' out of range 1-65535", token)),
        };
    }

    let starts_with_letter = token.starts_with(|c: char| c.is_ascii_lowercase());
    if !starts_with_letter
        || !token
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(format!("'{}' is neither a port number nor a port name", token));
    }

    Ok(())
}

// =============================================================================
// Parsers
// =============================================================================

/// Parses one `host:container[/protocol]` port mapping.
///
/// `default_protocol` applies when the container side has no suffix.
pub fn parse_port(
    raw: &str,
    default_protocol: Protocol,
) -> std::result::Result<PortMapping, ValidationError> {
    let malformed = |reason: String| ValidationError::MalformedPortMapping {
        mapping: raw.to_string(),
        reason,
    };

    let (ports, protocol) = match raw.rsplit_once('/') {
        Some((ports, suffix)) => {
            let protocol = suffix
                .parse()
                .map_err(|_| malformed(format!("unknown protocol suffix '{}'", suffix)))?;
            (ports, protocol)
        }
        None => (raw, default_protocol),
    };

    let parts: Vec<&str> = ports.split(':').collect();
    let [host, container] = parts.as_slice() else {
        return Err(malformed("expected host:container".to_string()));
    };

    validate_port_token(host).map_err(|reason| malformed(format!("host side: {}", reason)))?;
    validate_port_token(container)
        .map_err(|reason| malformed(format!("container side: {}", reason)))?;

    Ok(PortMapping {
        host: host.to_string(),
        container: container.to_string(),
        protocol,
    })
}

/// Parses a list of port mappings, rejecting duplicates.
///
/// A container port (per protocol) may be published once, and a host port
/// (per protocol) may be bound once.
pub fn parse_ports(
    raw: &[String],
    default_protocol: Protocol,
) -> std::result::Result<Vec<PortMapping>, ValidationError> {
    check_limit("port mappings", raw.len(), MAX_PORT_MAPPINGS)?;

    let mut container_ports = HashSet::new();
    let mut host_ports = HashSet::new();
    let mut mappings = Vec::with_capacity(raw.len());

    for entry in raw {
        let mapping = parse_port(entry, default_protocol)?;

        if !container_ports.insert((mapping.container.clone(), mapping.protocol)) {
            return Err(ValidationError::DuplicateKey {
                kind: "container port".to_string(),
                key: mapping.container_key(),
            });
        }
        if !host_ports.insert((mapping.host.clone(), mapping.protocol)) {
            return Err(ValidationError::DuplicateKey {
                kind: "host port".to_string(),
                key: format!("{}/{}", mapping.host, mapping.protocol),
            });
        }

        mappings.push(mapping);
    }

    Ok(mappings)
}

/// Parses one `hostPath:containerPath[:mode]` volume mapping.
pub fn parse_volume(raw: &str) -> std::result::Result<VolumeMapping, ValidationError> {
    let malformed = |reason: &str| ValidationError::MalformedVolumeMapping {
        mapping: raw.to_string(),
        reason: reason.to_string(),
    };

    let parts: Vec<&str> = raw.split(':').collect();
    let (host, container, mode) = match parts.as_slice() {
        [host, container] => (*host, *container, VolumeMode::Rw),
        [host, container, "ro"] => (*host, *container, VolumeMode::Ro),
        [host, container, "rw"] => (*host, *container, VolumeMode::Rw),
        [_, _, _] => return Err(malformed("mode must be 'ro' or 'rw'")),
        _ => return Err(malformed("expected hostPath:containerPath[:mode]")),
    };

    if host.is_empty() {
        return Err(malformed("empty host path"));
    }
    if container.is_empty() {
        return Err(malformed("empty container path"));
    }
    if !container.starts_with('/') {
        return Err(malformed("container path must be absolute"));
    }

    Ok(VolumeMapping {
        host_path: PathBuf::from(host),
        container_path: container.to_string(),
        mode,
    })
}

/// Parses a list of volume mappings, rejecting duplicate container paths.
pub fn parse_volumes(raw: &[String]) -> std::result::Result<Vec<VolumeMapping>, ValidationError> {
    check_limit("volume mappings", raw.len(), MAX_VOLUME_MAPPINGS)?;

    let mut seen = HashSet::new();
    let mut mappings = Vec::with_capacity(raw.len());

    for entry in raw {
        let mapping = parse_volume(entry)?;
        if !seen.insert(mapping.container_path.clone()) {
            return Err(ValidationError::DuplicateKey {
                kind: "volume container path".to_string(),
                key: mapping.container_path,
            });
        }
        mappings.push(mapping);
    }

    Ok(mappings)
}

/// Parses one `NAME=value` assignment.
///
/// Only the first `=` delimits: `KEY=a=b` has the value `a=b`.
pub fn parse_env_var(raw: &str) -> std::result::Result<EnvVar, ValidationError> {
    let malformed = |reason: &str| ValidationError::MalformedEnvAssignment {
        assignment: raw.to_string(),
        reason: reason.to_string(),
    };

    let (name, value) = raw.split_once('=').ok_or_else(|| malformed("missing '='"))?;

    if name.is_empty() {
        return Err(malformed("empty variable name"));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(malformed("variable name contains whitespace"));
    }

    check_limit(
        &format!("value of {}", name),
        value.len(),
        MAX_ENV_VALUE_LEN,
    )?;

    Ok(EnvVar {
        name: name.to_string(),
        value: value.to_string(),
    })
}

/// Parses a list of assignments, rejecting duplicate names.
pub fn parse_env(raw: &[String]) -> std::result::Result<Vec<EnvVar>, ValidationError> {
    check_limit("environment variables", raw.len(), MAX_ENV_VARS)?;

    let mut seen = HashSet::new();
    let mut vars = Vec::with_capacity(raw.len());

    for entry in raw {
        let var = parse_env_var(entry)?;
        if !seen.insert(var.name.clone()) {
            return Err(ValidationError::DuplicateKey {
                kind: "environment variable".to_string(),
                key: var.name,
            });
        }
        vars.push(var);
    }

    Ok(vars)
}
