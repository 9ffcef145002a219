//! The build plan
//!
//! A frozen, fully-resolved description of one build: where the base image
//! comes from, where the result goes, which files land in which layers, and
//! how the container runs. Produced by an external front end (build tool
//! plugin or the thin CLI runner) and deserialized as-is; the engine never
//! goes looking for project structure on its own.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::credentials::Credential;
use crate::error::{BuilderError, Result};
use crate::image::config::Platform;
use crate::image::layer::LayerEntry;
use crate::image::manifest::TargetFormat;
use crate::image::reference::ImageReference;

/// One named application layer (e.g. `dependencies`, `resources`,
/// `classes`), an ordered list of file mappings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    #[serde(default)]
    pub entries: Vec<LayerEntry>,
}

/// An exposed port, number plus protocol; wire form `8080/tcp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Port {
    pub number: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let protocol = match self.protocol {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        write!(f, "{}/{}", self.number, protocol)
    }
}

impl FromStr for Port {
    type Err = BuilderError;

    fn from_str(s: &str) -> Result<Self> {
        let (number, protocol) = match s.split_once('/') {
            Some((number, protocol)) => (number, protocol),
            None => (s, "tcp"),
        };
        let number = number
            .parse()
            .map_err(|_| BuilderError::Validation(format!("invalid port '{}'", s)))?;
        let protocol = match protocol.to_ascii_lowercase().as_str() {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            other => {
                return Err(BuilderError::Validation(format!(
                    "unsupported protocol '{}' in port '{}'",
                    other, s
                )));
            }
        };
        Ok(Port { number, protocol })
    }
}

impl TryFrom<String> for Port {
    type Error = BuilderError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Port> for String {
    fn from(port: Port) -> Self {
        port.to_string()
    }
}

/// Container runtime settings layered on top of the base image's config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSettings {
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    /// Ordered `NAME=value` pairs; same-name variables override the base
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub exposed_ports: Vec<Port>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Image creation timestamp; defaults to the epoch for reproducible
    /// output
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
}

/// Where the finished image goes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode")]
pub enum OutputTarget {
    /// Push manifest, config and layers to the target registry
    #[default]
    Registry,
    /// Stream a `docker save` tar into `docker load`
    Daemon,
    /// Write the `docker save` tar to a path
    Tar { path: PathBuf },
}

/// Inline credential and/or named helper for one registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialSpec {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Suffix of a `docker-credential-<suffix>` helper to consult
    #[serde(default)]
    pub helper: Option<String>,
}

impl CredentialSpec {
    pub fn inline_credential(&self) -> Option<Credential> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(Credential::Basic {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanCredentials {
    #[serde(default)]
    pub base: CredentialSpec,
    #[serde(default)]
    pub target: CredentialSpec,
}

fn default_concurrency() -> usize {
    4
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildFlags {
    /// No network calls; base metadata must come from cache
    #[serde(default)]
    pub offline: bool,
    /// Permit plain HTTP / broken TLS toward the registries
    #[serde(default)]
    pub allow_insecure: bool,
    /// Keep base-image state in a project-local cache instead of the shared
    /// user cache
    #[serde(default)]
    pub use_only_project_cache: bool,
    /// Bound on concurrently executing steps
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Cache root override; wins over both cache conventions
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Per-HTTP-call timeout in seconds (default 20)
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
    /// Per-build deadline in seconds; bounds retry backoff
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

impl Default for BuildFlags {
    fn default() -> Self {
        Self {
            offline: false,
            allow_insecure: false,
            use_only_project_cache: false,
            concurrency: default_concurrency(),
            cache_dir: None,
            http_timeout_secs: None,
            deadline_secs: None,
        }
    }
}

/// The complete frozen input to one build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildPlan {
    pub base_image: ImageReference,
    pub target_image: ImageReference,
    /// Extra tags the final manifest is pushed under
    #[serde(default)]
    pub additional_tags: Vec<String>,
    /// Ordered application layers; later layers shadow earlier ones
    #[serde(default)]
    pub layers: Vec<LayerSpec>,
    #[serde(default)]
    pub container: ContainerSettings,
    #[serde(default)]
    pub platform: Platform,
    #[serde(default)]
    pub format: TargetFormat,
    #[serde(default)]
    pub output: OutputTarget,
    #[serde(default)]
    pub credentials: PlanCredentials,
    #[serde(default)]
    pub flags: BuildFlags,
}

impl BuildPlan {
    pub fn validate(&self) -> Result<()> {
        if self.target_image.tag().is_none() {
            return Err(BuilderError::Validation(
                "target image must be tagged, not digest-pinned".to_string(),
            ));
        }
        if self.flags.concurrency == 0 {
            return Err(BuilderError::Validation(
                "concurrency must be greater than 0".to_string(),
            ));
        }
        if self.flags.offline && self.output == OutputTarget::Registry {
            return Err(BuilderError::Validation(
                "offline mode cannot push to a registry; use the tar or daemon output".to_string(),
            ));
        }
        for layer in &self.layers {
            if layer.name.is_empty() {
                return Err(BuilderError::Validation(
                    "layer names must not be empty".to_string(),
                ));
            }
            for entry in &layer.entries {
                entry.validate()?;
            }
        }
        for env in &self.container.env {
            if !env.contains('=') {
                return Err(BuilderError::Validation(format!(
                    "environment entry '{}' is not NAME=value",
                    env
                )));
            }
        }
        Ok(())
    }

    /// All tags the manifest is pushed under, primary first.
    pub fn all_tags(&self) -> Vec<String> {
        let mut tags = vec![self
            .target_image
            .tag()
            .unwrap_or("latest")
            .to_string()];
        for tag in &self.additional_tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        tags
    }
}
