//! Container configuration document
//!
//! The wire JSON referenced by the manifest's config descriptor. Field names
//! follow the Docker/OCI image spec exactly: lowercase top-level keys,
//! Docker-capitalized keys inside `config`, and `rootfs.diff_ids` ordered to
//! mirror the non-empty layers.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::blob::Digest;
use crate::error::{BuilderError, Result};

/// Target platform of an image, `(os, architecture)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Platform::new("linux", "amd64")
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)
    }
}

/// Empty JSON object used as the value type of the ExposedPorts and Volumes
/// maps (`{"8080/tcp": {}}`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyObject {}

/// The `config` sub-document: how to run the container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(rename = "Entrypoint", skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    /// Ordered `NAME=value` pairs
    #[serde(rename = "Env", skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(rename = "Labels", skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    /// Keys of the form `8080/tcp`
    #[serde(rename = "ExposedPorts", skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<BTreeMap<String, EmptyObject>>,
    #[serde(rename = "Volumes", skip_serializing_if = "Option::is_none")]
    pub volumes: Option<BTreeMap<String, EmptyObject>>,
    #[serde(rename = "User", skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(rename = "WorkingDir", skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

/// One history record, parallel to the layer list (empty-layer records carry
/// no corresponding `diff_id`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(rename = "created_by", skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(rename = "empty_layer", skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
}

impl HistoryEntry {
    pub fn is_empty_layer(&self) -> bool {
        self.empty_layer.unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub diff_ids: Vec<Digest>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            fs_type: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// The container configuration wire document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    pub architecture: String,
    pub os: String,
    #[serde(default)]
    pub config: ExecutionConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub rootfs: RootFs,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            created: Some(epoch_timestamp()),
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            config: ExecutionConfig::default(),
            history: Vec::new(),
            rootfs: RootFs::default(),
        }
    }
}

impl ContainerConfig {
    pub fn for_platform(platform: &Platform) -> Self {
        Self {
            architecture: platform.architecture.clone(),
            os: platform.os.clone(),
            ..Self::default()
        }
    }

    /// Parse config bytes pulled from a registry, rejecting documents that
    /// miss required fields.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let config: ContainerConfig =
            serde_json::from_slice(bytes).map_err(|err| BuilderError::BadContainerConfig {
                reason: err.to_string(),
            })?;
        if config.architecture.is_empty() || config.os.is_empty() {
            return Err(BuilderError::BadContainerConfig {
                reason: "architecture and os are required".to_string(),
            });
        }
        if config.rootfs.fs_type != "layers" {
            return Err(BuilderError::BadContainerConfig {
                reason: format!("unsupported rootfs type '{}'", config.rootfs.fs_type),
            });
        }
        Ok(config)
    }

    /// Serialize to canonical bytes (compact, field order fixed by the
    /// struct definitions); the digest of these bytes names the config blob.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Number of non-empty layers recorded in history, which must equal the
    /// number of `diff_ids`.
    pub fn non_empty_history_count(&self) -> usize {
        self.history.iter().filter(|h| !h.is_empty_layer()).count()
    }

    /// Append one layer's `diff_id` and its history record.
    pub fn append_layer(&mut self, diff_id: Digest, history: HistoryEntry) {
        debug_assert!(!history.is_empty_layer());
        self.rootfs.diff_ids.push(diff_id);
        self.history.push(history);
    }
}

/// RFC 3339 rendering of the Unix epoch, the reproducible default for
/// `created` fields.
pub fn epoch_timestamp() -> String {
    format_timestamp(&Utc.timestamp_opt(0, 0).single().unwrap_or_default())
}

pub fn format_timestamp(moment: &DateTime<Utc>) -> String {
    moment.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(byte: u8) -> Digest {
        Digest::of_bytes(&[byte])
    }

    #[test]
    fn epoch_created_is_rfc3339() {
        assert_eq!(epoch_timestamp(), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn wire_keys_match_the_image_spec() {
        let mut config = ContainerConfig::default();
        config.config.entrypoint = Some(vec!["java".to_string(), "-jar".to_string()]);
        config.config.env = Some(vec!["HOME=/home/app".to_string()]);
        config.config.exposed_ports = Some(BTreeMap::from([(
            "8080/tcp".to_string(),
            EmptyObject::default(),
        )]));
        config.config.working_dir = Some("/app".to_string());
        config.append_layer(
            digest(1),
            HistoryEntry {
                created: Some(epoch_timestamp()),
                created_by: Some("jvm-image-builder".to_string()),
                ..HistoryEntry::default()
            },
        );

        let value: serde_json::Value =
            serde_json::from_slice(&config.to_bytes().expect("bytes")).expect("json");
        assert_eq!(value["architecture"], "amd64");
        assert_eq!(value["os"], "linux");
        assert_eq!(value["config"]["Entrypoint"][0], "java");
        assert_eq!(value["config"]["Env"][0], "HOME=/home/app");
        assert!(value["config"]["ExposedPorts"]["8080/tcp"].is_object());
        assert_eq!(value["config"]["WorkingDir"], "/app");
        assert_eq!(value["rootfs"]["type"], "layers");
        assert_eq!(
            value["rootfs"]["diff_ids"][0],
            digest(1).to_string()
        );
        assert_eq!(value["history"][0]["created_by"], "jvm-image-builder");
        // Unset options stay off the wire entirely.
        assert!(value["config"].get("Cmd").is_none());
        assert!(value["config"].get("User").is_none());
    }

    #[test]
    fn parse_accepts_docker_produced_config() {
        let raw = r#"{
            "architecture": "arm64",
            "os": "linux",
            "config": {
                "Env": ["PATH=/usr/bin"],
                "Cmd": ["/bin/sh"],
                "WorkingDir": "/"
            },
            "rootfs": {
                "type": "layers",
                "diff_ids": ["sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"]
            },
            "history": [
                {"created": "2023-01-01T00:00:00Z", "created_by": "sh", "empty_layer": true},
                {"created": "2023-01-01T00:00:01Z", "created_by": "add"}
            ]
        }"#;
        let config = ContainerConfig::parse(raw.as_bytes()).expect("parse");
        assert_eq!(config.architecture, "arm64");
        assert_eq!(config.rootfs.diff_ids.len(), 1);
        // Empty-layer history records contribute no diff_id.
        assert_eq!(config.non_empty_history_count(), 1);
    }

    #[test]
    fn parse_rejects_missing_fields() {
        let err = ContainerConfig::parse(br#"{"os": "linux"}"#).expect_err("must fail");
        assert!(matches!(err, BuilderError::BadContainerConfig { .. }));

        let err = ContainerConfig::parse(
            br#"{"architecture": "amd64", "os": "linux", "rootfs": {"type": "overlay", "diff_ids": []}}"#,
        )
        .expect_err("must fail");
        assert!(matches!(err, BuilderError::BadContainerConfig { .. }));
    }

    #[test]
    fn serialization_is_stable() {
        let mut config = ContainerConfig::default();
        config.config.labels = Some(BTreeMap::from([
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
        ]));
        let first = config.to_bytes().expect("bytes");
        let second = config.to_bytes().expect("bytes");
        assert_eq!(first, second);
        // BTreeMap keys serialize sorted.
        let text = String::from_utf8(first).expect("utf8");
        assert!(text.find("\"a\"").expect("a") < text.find("\"b\"").expect("b"));
    }
}
