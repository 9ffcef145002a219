//! Base image steps
//!
//! Resolving the base reference to a single-platform manifest (walking
//! manifest lists), pulling and validating the container config, the
//! offline-mode cache path, and materializing base layers into the local
//! cache when an output mode needs their bytes.

use std::io::Read;

use flate2::read::GzDecoder;
use sha2::{Digest as Sha2Digest, Sha256};

use crate::blob::{Descriptor, Digest};
use crate::cache::{CachedLayer, LayerCache};
use crate::error::{BuilderError, Result};
use crate::image::config::{ContainerConfig, Platform};
use crate::image::manifest::{
    ImageManifest, Manifest, ManifestDescriptor, Schema1Manifest, TargetFormat, media_types,
};
use crate::image::reference::ImageReference;
use crate::logging::Logger;
use crate::registry::RegistryClient;

/// One base layer: the manifest descriptor plus the matching `diff_id` from
/// the base config. Schema 1 bases carry no diff ids; those layers must be
/// materialized before a new config can reference them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseLayer {
    pub descriptor: Descriptor,
    pub diff_id: Option<Digest>,
}

/// The base manifest resolved down to a single platform.
#[derive(Debug, Clone)]
pub enum ResolvedDocument {
    /// The empty `scratch` base; no manifest exists
    Scratch,
    Image(ImageManifest),
    Schema1(Schema1Manifest),
}

#[derive(Debug, Clone)]
pub struct ResolvedBaseManifest {
    pub bytes: Vec<u8>,
    pub digest: Digest,
    pub document: ResolvedDocument,
    /// Set when the manifest came out of the offline cache
    pub from_cache: bool,
}

/// Everything the engine needs to know about the base image.
#[derive(Debug, Clone)]
pub struct BaseImage {
    pub reference: ImageReference,
    /// Digest of the platform-resolved base manifest; reported next to the
    /// base reference so builds record which base they actually used
    pub manifest_digest: Digest,
    pub config: ContainerConfig,
    pub layers: Vec<BaseLayer>,
    /// Schema 1 bases need their layers pulled to recover diff ids
    pub requires_materialization: bool,
}

/// Resolve the base reference to one single-platform manifest. Walks a
/// manifest list / OCI index by `(os, architecture)`; in offline mode the
/// manifest comes solely from the cache.
pub async fn pull_base_manifest(
    client: Option<&RegistryClient>,
    cache: &LayerCache,
    reference: &ImageReference,
    platform: &Platform,
    offline: bool,
    output: &Logger,
) -> Result<ResolvedBaseManifest> {
    if reference.is_scratch() {
        return Ok(ResolvedBaseManifest {
            bytes: Vec::new(),
            digest: Digest::of_bytes(b""),
            document: ResolvedDocument::Scratch,
            from_cache: false,
        });
    }

    if offline {
        let (manifest_bytes, _config_bytes) = cache
            .read_image_metadata(reference)?
            .ok_or_else(|| BuilderError::OfflineMiss {
                resource: format!("base image manifest for {}", reference),
            })?;
        let document = parse_resolved(&manifest_bytes, None, platform)?;
        output.detail(&format!("base manifest for {} served from cache", reference));
        return Ok(ResolvedBaseManifest {
            digest: Digest::of_bytes(&manifest_bytes),
            bytes: manifest_bytes,
            document,
            from_cache: true,
        });
    }

    let client = client.ok_or_else(|| {
        BuilderError::Registry("no registry client for the base image".to_string())
    })?;

    let pulled = client.pull_manifest(&reference.reference()).await?;
    match Manifest::parse(&pulled.bytes, pulled.media_type.as_deref())? {
        Manifest::List(list) => {
            let entry = list.select(platform).map_err(|err| match err {
                BuilderError::ManifestNotFound { reference: detail, .. } => {
                    BuilderError::ManifestNotFound {
                        repository: reference.repository().to_string(),
                        reference: detail,
                    }
                }
                other => other,
            })?;
            output.detail(&format!(
                "manifest list resolved {} to {}",
                platform, entry.digest
            ));
            let sub = client.pull_manifest(&entry.digest.to_string()).await?;
            let document = parse_resolved(&sub.bytes, sub.media_type.as_deref(), platform)?;
            Ok(ResolvedBaseManifest {
                digest: sub.digest,
                bytes: sub.bytes,
                document,
                from_cache: false,
            })
        }
        Manifest::Image(manifest) => Ok(ResolvedBaseManifest {
            digest: pulled.digest,
            bytes: pulled.bytes,
            document: ResolvedDocument::Image(manifest),
            from_cache: false,
        }),
        Manifest::Schema1(manifest) => {
            output.warning(&format!(
                "base image {} uses the legacy schema 1 manifest",
                reference
            ));
            Ok(ResolvedBaseManifest {
                digest: pulled.digest,
                bytes: pulled.bytes,
                document: ResolvedDocument::Schema1(manifest),
                from_cache: false,
            })
        }
    }
}

fn parse_resolved(
    bytes: &[u8],
    media_type: Option<&str>,
    platform: &Platform,
) -> Result<ResolvedDocument> {
    match Manifest::parse(bytes, media_type)? {
        Manifest::Image(manifest) => Ok(ResolvedDocument::Image(manifest)),
        Manifest::Schema1(manifest) => Ok(ResolvedDocument::Schema1(manifest)),
        Manifest::List(_) => Err(BuilderError::Parse(format!(
            "manifest for {} resolved to another manifest list",
            platform
        ))),
    }
}

/// Pull (or read back) the base container config and pair every manifest
/// layer with its `diff_id`. Writes the manifest/config pair through to the
/// cache after an online pull.
pub async fn pull_base_config(
    client: Option<&RegistryClient>,
    cache: &LayerCache,
    reference: &ImageReference,
    platform: &Platform,
    resolved: &ResolvedBaseManifest,
    output: &Logger,
) -> Result<BaseImage> {
    match &resolved.document {
        ResolvedDocument::Scratch => Ok(BaseImage {
            reference: reference.clone(),
            manifest_digest: resolved.digest,
            config: ContainerConfig::for_platform(platform),
            layers: Vec::new(),
            requires_materialization: false,
        }),
        ResolvedDocument::Image(manifest) => {
            let config_bytes = if resolved.from_cache {
                cache
                    .read_image_metadata(reference)?
                    .ok_or_else(|| BuilderError::OfflineMiss {
                        resource: format!("base image config for {}", reference),
                    })?
                    .1
            } else {
                let client = client.ok_or_else(|| {
                    BuilderError::Registry("no registry client for the base image".to_string())
                })?;
                let mut buffer = Vec::with_capacity(manifest.config.size as usize);
                client
                    .pull_blob(&manifest.config.digest, &mut buffer)
                    .await?;
                buffer
            };

            let config = ContainerConfig::parse(&config_bytes)?;
            if manifest.layers.len() != config.rootfs.diff_ids.len() {
                return Err(BuilderError::LayerCountMismatch {
                    manifest_layers: manifest.layers.len(),
                    config_diff_ids: config.rootfs.diff_ids.len(),
                });
            }

            let layers = manifest
                .layers
                .iter()
                .zip(config.rootfs.diff_ids.iter())
                .map(|(descriptor, diff_id)| BaseLayer {
                    descriptor: descriptor.to_descriptor(),
                    diff_id: Some(*diff_id),
                })
                .collect();

            if !resolved.from_cache {
                cache.write_image_metadata(reference, &resolved.bytes, &config_bytes)?;
                output.detail(&format!("cached base image metadata for {}", reference));
            }

            Ok(BaseImage {
                reference: reference.clone(),
                manifest_digest: resolved.digest,
                config,
                layers,
                requires_materialization: false,
            })
        }
        ResolvedDocument::Schema1(manifest) => {
            // v1Compatibility is the nearest thing to a config; it carries
            // no rootfs, so diff ids are recovered by materializing layers.
            let value = manifest.container_config_json()?;
            let config_bytes = serde_json::to_vec(&value)?;
            let config: ContainerConfig = serde_json::from_value(value).map_err(|err| {
                BuilderError::BadContainerConfig {
                    reason: format!("schema 1 v1Compatibility: {}", err),
                }
            })?;

            let layers = manifest
                .layer_digests()
                .into_iter()
                .map(|digest| BaseLayer {
                    descriptor: Descriptor::new(digest, 0)
                        .with_media_type(media_types::DOCKER_LAYER),
                    diff_id: None,
                })
                .collect();

            if !resolved.from_cache {
                cache.write_image_metadata(reference, &resolved.bytes, &config_bytes)?;
            }

            Ok(BaseImage {
                reference: reference.clone(),
                manifest_digest: resolved.digest,
                config,
                layers,
                requires_materialization: true,
            })
        }
    }
}

/// Materialize one base layer into the digest-keyed cache, recovering its
/// `diff_id` by hashing the decompressed stream. Already-cached layers are
/// not re-downloaded; with no client (offline mode) a cache miss is an
/// `OfflineMiss`.
pub async fn pull_and_cache_base_layer(
    client: Option<&RegistryClient>,
    cache: &LayerCache,
    layer: &BaseLayer,
    output: &Logger,
) -> Result<CachedLayer> {
    if let Some(cached) = cache.read_by_digest(&layer.descriptor.digest)? {
        output.detail(&format!(
            "base layer {} already cached",
            layer.descriptor.digest
        ));
        return Ok(cached);
    }

    let client = client.ok_or_else(|| BuilderError::OfflineMiss {
        resource: format!("base layer {}", layer.descriptor.digest),
    })?;

    let mut compressed = Vec::with_capacity(layer.descriptor.size as usize);
    client
        .pull_blob(&layer.descriptor.digest, &mut compressed)
        .await?;

    let diff_id = uncompressed_digest(&compressed)?;
    if let Some(expected) = &layer.diff_id {
        if diff_id != *expected {
            return Err(BuilderError::DigestMismatch {
                expected: expected.to_string(),
                computed: diff_id.to_string(),
            });
        }
    }

    let cached = cache.write_base_layer(
        &layer.descriptor.digest,
        &diff_id,
        std::io::Cursor::new(compressed),
    )?;
    output.detail(&format!("cached base layer {}", cached.digest));
    Ok(cached)
}

/// SHA-256 of the gunzipped bytes (the layer's `diff_id`).
fn uncompressed_digest(compressed: &[u8]) -> Result<Digest> {
    let mut decoder = GzDecoder::new(compressed);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = decoder.read(&mut buffer).map_err(|err| {
            BuilderError::Parse(format!("base layer is not valid gzip: {}", err))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(Digest::from_bytes(hasher.finalize().into()))
}

/// Media type helper when synthesizing manifests for base layers.
pub fn base_layer_media_type(descriptor: &Descriptor, format: TargetFormat) -> String {
    descriptor
        .media_type
        .clone()
        .unwrap_or_else(|| format.layer_media_type().to_string())
}

/// Wire descriptor for a base layer in the output manifest.
pub fn base_layer_manifest_descriptor(
    layer: &BaseLayer,
    format: TargetFormat,
) -> ManifestDescriptor {
    ManifestDescriptor {
        media_type: base_layer_media_type(&layer.descriptor, format),
        size: layer.descriptor.size,
        digest: layer.descriptor.digest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn quiet() -> Logger {
        Logger::new_quiet()
    }

    fn cache(dir: &TempDir) -> LayerCache {
        LayerCache::open(dir.path(), quiet()).expect("cache")
    }

    #[tokio::test]
    async fn scratch_base_is_empty_without_network() {
        let dir = TempDir::new().expect("dir");
        let cache = cache(&dir);
        let reference = ImageReference::parse("scratch").expect("reference");
        let platform = Platform::default();

        let resolved =
            pull_base_manifest(None, &cache, &reference, &platform, false, &quiet())
                .await
                .expect("resolve");
        assert!(matches!(resolved.document, ResolvedDocument::Scratch));

        let base = pull_base_config(None, &cache, &reference, &platform, &resolved, &quiet())
            .await
            .expect("config");
        assert!(base.layers.is_empty());
        assert_eq!(base.config.os, "linux");
        assert!(base.config.rootfs.diff_ids.is_empty());
    }

    #[tokio::test]
    async fn offline_miss_is_a_specific_error() {
        let dir = TempDir::new().expect("dir");
        let cache = cache(&dir);
        let reference = ImageReference::parse("library/alpine:3.18").expect("reference");

        let err = pull_base_manifest(
            None,
            &cache,
            &reference,
            &Platform::default(),
            true,
            &quiet(),
        )
        .await
        .expect_err("must miss");
        assert!(matches!(err, BuilderError::OfflineMiss { .. }));
        assert!(err.to_string().contains("enable network"));
    }

    #[tokio::test]
    async fn offline_hit_reads_the_cached_pair() {
        let dir = TempDir::new().expect("dir");
        let cache = cache(&dir);
        let reference = ImageReference::parse("library/alpine:3.18").expect("reference");
        let platform = Platform::default();

        let config = ContainerConfig {
            rootfs: crate::image::config::RootFs {
                fs_type: "layers".to_string(),
                diff_ids: vec![Digest::of_bytes(b"diff")],
            },
            ..ContainerConfig::default()
        };
        let config_bytes = config.to_bytes().expect("config bytes");
        let manifest = ImageManifest::new(
            TargetFormat::Docker,
            ManifestDescriptor {
                media_type: media_types::DOCKER_CONFIG.to_string(),
                size: config_bytes.len() as u64,
                digest: Digest::of_bytes(&config_bytes),
            },
            vec![ManifestDescriptor {
                media_type: media_types::DOCKER_LAYER.to_string(),
                size: 5,
                digest: Digest::of_bytes(b"blob!"),
            }],
        );
        let manifest_bytes = manifest.to_bytes().expect("manifest bytes");
        cache
            .write_image_metadata(&reference, &manifest_bytes, &config_bytes)
            .expect("seed cache");

        let resolved =
            pull_base_manifest(None, &cache, &reference, &platform, true, &quiet())
                .await
                .expect("resolve");
        assert!(resolved.from_cache);

        let base = pull_base_config(None, &cache, &reference, &platform, &resolved, &quiet())
            .await
            .expect("config");
        assert_eq!(base.layers.len(), 1);
        assert_eq!(base.layers[0].diff_id, Some(Digest::of_bytes(b"diff")));
        assert!(!base.requires_materialization);
    }

    #[test]
    fn uncompressed_digest_matches_payload() {
        let payload = b"uncompressed tar bytes";
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(payload).expect("compress");
        let compressed = encoder.finish().expect("finish");

        let diff_id = uncompressed_digest(&compressed).expect("digest");
        assert_eq!(diff_id, Digest::of_bytes(payload));

        assert!(uncompressed_digest(b"definitely not gzip").is_err());
    }
}
