//! Manifest documents
//!
//! Base-image manifests arrive in four flavors: legacy schema 1 (read only),
//! Docker v2.2, OCI image manifest, and manifest list / OCI index. They are
//! modeled as a sum type discriminated by the top-level `schemaVersion` and
//! `mediaType`, each variant carrying only the fields meaningful to it.
//! Writes produce v2.2 or OCI documents exclusively.

use serde::{Deserialize, Serialize};

use crate::blob::{Descriptor, Digest};
use crate::error::{BuilderError, Result};
use crate::image::config::Platform;

pub mod media_types {
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    pub const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    pub const SCHEMA1_SIGNED: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";
}

/// `Accept` header value advertising every manifest flavor we can read.
pub const MANIFEST_ACCEPT: &str = concat!(
    "application/vnd.docker.distribution.manifest.v2+json, ",
    "application/vnd.docker.distribution.manifest.list.v2+json, ",
    "application/vnd.oci.image.manifest.v1+json, ",
    "application/vnd.oci.image.index.v1+json, ",
    "application/vnd.docker.distribution.manifest.v1+prettyjws"
);

/// Output manifest flavor requested by the build plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    #[default]
    Docker,
    Oci,
}

impl TargetFormat {
    pub fn manifest_media_type(self) -> &'static str {
        match self {
            TargetFormat::Docker => media_types::DOCKER_MANIFEST,
            TargetFormat::Oci => media_types::OCI_MANIFEST,
        }
    }

    pub fn config_media_type(self) -> &'static str {
        match self {
            TargetFormat::Docker => media_types::DOCKER_CONFIG,
            TargetFormat::Oci => media_types::OCI_CONFIG,
        }
    }

    pub fn layer_media_type(self) -> &'static str {
        match self {
            TargetFormat::Docker => media_types::DOCKER_LAYER,
            TargetFormat::Oci => media_types::OCI_LAYER,
        }
    }
}

/// Wire form of a content descriptor inside a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestDescriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub size: u64,
    pub digest: Digest,
}

impl ManifestDescriptor {
    pub fn from_descriptor(descriptor: &Descriptor, fallback_media_type: &str) -> Self {
        Self {
            media_type: descriptor
                .media_type
                .clone()
                .unwrap_or_else(|| fallback_media_type.to_string()),
            size: descriptor.size,
            digest: descriptor.digest,
        }
    }

    pub fn to_descriptor(&self) -> Descriptor {
        Descriptor::new(self.digest, self.size).with_media_type(self.media_type.clone())
    }
}

/// Docker v2.2 or OCI image manifest: config descriptor plus ordered layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: ManifestDescriptor,
    pub layers: Vec<ManifestDescriptor>,
}

impl ImageManifest {
    pub fn new(format: TargetFormat, config: ManifestDescriptor, layers: Vec<ManifestDescriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(format.manifest_media_type().to_string()),
            config,
            layers,
        }
    }

    pub fn effective_media_type(&self) -> &str {
        self.media_type
            .as_deref()
            .unwrap_or(media_types::DOCKER_MANIFEST)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// One platform entry of a manifest list / OCI index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformManifest {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub size: u64,
    pub digest: Digest,
    pub platform: ListedPlatform,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListedPlatform {
    pub os: String,
    pub architecture: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// Manifest list (Docker) / image index (OCI). Read only: the builder never
/// writes lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestList {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<PlatformManifest>,
}

impl ManifestList {
    /// Select the entry matching `(os, architecture)`, or fail with a
    /// diagnostic naming the platforms that are present.
    pub fn select(&self, platform: &Platform) -> Result<&PlatformManifest> {
        self.manifests
            .iter()
            .find(|m| {
                m.platform.os == platform.os && m.platform.architecture == platform.architecture
            })
            .ok_or_else(|| {
                let available: Vec<String> = self
                    .manifests
                    .iter()
                    .map(|m| format!("{}/{}", m.platform.os, m.platform.architecture))
                    .collect();
                BuilderError::ManifestNotFound {
                    repository: String::new(),
                    reference: format!(
                        "platform {} (manifest list offers: {})",
                        platform,
                        available.join(", ")
                    ),
                }
            })
    }
}

/// Legacy schema 1 manifest. Read only, kept for old base images.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Schema1Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(rename = "fsLayers", default)]
    pub fs_layers: Vec<Schema1FsLayer>,
    #[serde(default)]
    pub history: Vec<Schema1History>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Schema1FsLayer {
    #[serde(rename = "blobSum")]
    pub blob_sum: Digest,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Schema1History {
    #[serde(rename = "v1Compatibility")]
    pub v1_compatibility: String,
}

impl Schema1Manifest {
    /// Layer digests in image order. Schema 1 lists layers newest-first, so
    /// the wire order is reversed; duplicates are real layers and retained.
    pub fn layer_digests(&self) -> Vec<Digest> {
        self.fs_layers.iter().rev().map(|l| l.blob_sum).collect()
    }

    /// The newest `v1Compatibility` record, the closest thing schema 1 has
    /// to a container config.
    pub fn container_config_json(&self) -> Result<serde_json::Value> {
        let first = self.history.first().ok_or_else(|| {
            BuilderError::BadContainerConfig {
                reason: "schema 1 manifest carries no history".to_string(),
            }
        })?;
        Ok(serde_json::from_str(&first.v1_compatibility)?)
    }
}

/// Any manifest document the registry can answer with.
#[derive(Debug, Clone, PartialEq)]
pub enum Manifest {
    Schema1(Schema1Manifest),
    Image(ImageManifest),
    List(ManifestList),
}

impl Manifest {
    /// Parse manifest bytes using the top-level `schemaVersion` as the
    /// discriminator and `mediaType` (from the body or the Content-Type
    /// header) to tell single manifests from lists.
    pub fn parse(bytes: &[u8], content_type: Option<&str>) -> Result<Manifest> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        let schema_version = value
            .get("schemaVersion")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| {
                BuilderError::Parse("manifest is missing schemaVersion".to_string())
            })?;

        match schema_version {
            1 => Ok(Manifest::Schema1(serde_json::from_value(value)?)),
            2 => {
                let media_type = value
                    .get("mediaType")
                    .and_then(|v| v.as_str())
                    .or(content_type)
                    .unwrap_or(media_types::DOCKER_MANIFEST);
                if media_type == media_types::DOCKER_MANIFEST_LIST
                    || media_type == media_types::OCI_INDEX
                    || value.get("manifests").is_some()
                {
                    Ok(Manifest::List(serde_json::from_value(value)?))
                } else {
                    Ok(Manifest::Image(serde_json::from_value(value)?))
                }
            }
            other => Err(BuilderError::Parse(format!(
                "unsupported manifest schemaVersion {}",
                other
            ))),
        }
    }
}
