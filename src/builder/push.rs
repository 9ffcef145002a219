//! Push steps
//!
//! Per-layer push policy (HEAD-skip, cross-repository mount, upload),
//! config blob push, and manifest push under every requested tag. Pushing a
//! layer that the registry already stores costs one `HEAD`; pushing a base
//! layer that lives in a sibling repository costs one mount `POST` and no
//! bytes.

use crate::blob::{Descriptor, Digest};
use crate::error::{BuilderError, Result};
use crate::logging::Logger;
use crate::registry::{MountOutcome, RegistryClient};

/// How one layer reached the target registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerPushOutcome {
    /// `HEAD` answered 200; nothing was sent
    AlreadyPresent,
    /// Cross-repository mount linked the blob; no bytes were sent
    Mounted,
    /// The blob was uploaded
    Uploaded,
}

/// Push one blob under the layer policy. `mount_from` names a repository on
/// the same registry believed to hold the blob (the base image repository);
/// `bytes` supplies the blob lazily so a skip or mount never reads it.
pub async fn push_layer_blob<F, Fut>(
    client: &RegistryClient,
    descriptor: &Descriptor,
    mount_from: Option<&str>,
    bytes: F,
    output: &Logger,
) -> Result<LayerPushOutcome>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<u8>>>,
{
    if client.check_blob(&descriptor.digest).await?.is_some() {
        output.detail(&format!("layer {} already present", descriptor.digest));
        return Ok(LayerPushOutcome::AlreadyPresent);
    }
    mount_or_upload(client, descriptor, mount_from, bytes, output).await
}

/// The mount-then-upload tail of the push policy, for callers that already
/// ran the existence probe as its own step.
pub async fn mount_or_upload<F, Fut>(
    client: &RegistryClient,
    descriptor: &Descriptor,
    mount_from: Option<&str>,
    bytes: F,
    output: &Logger,
) -> Result<LayerPushOutcome>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<u8>>>,
{
    let mut session = None;
    if let Some(source) = mount_from {
        match client.mount_blob(&descriptor.digest, source).await? {
            MountOutcome::Mounted => {
                output.detail(&format!(
                    "layer {} mounted from {}",
                    descriptor.digest, source
                ));
                return Ok(LayerPushOutcome::Mounted);
            }
            MountOutcome::Declined { upload_location } => {
                // The declined mount already opened an upload session;
                // reuse it instead of POSTing again.
                session = upload_location;
            }
        }
    }

    let data = bytes().await?;
    if data.len() as u64 != descriptor.size && descriptor.size != 0 {
        return Err(BuilderError::Validation(format!(
            "layer {} changed size between build and push ({} != {})",
            descriptor.digest,
            data.len(),
            descriptor.size
        )));
    }
    client.push_blob(&descriptor.digest, &data, session).await?;
    output.detail(&format!(
        "layer {} uploaded ({})",
        descriptor.digest,
        output.format_size(data.len() as u64)
    ));
    Ok(LayerPushOutcome::Uploaded)
}

/// Push the container config blob (HEAD-skip applies here too).
pub async fn push_config_blob(
    client: &RegistryClient,
    config_bytes: &[u8],
    output: &Logger,
) -> Result<Descriptor> {
    let descriptor = Descriptor::new(
        Digest::of_bytes(config_bytes),
        config_bytes.len() as u64,
    );
    if client.check_blob(&descriptor.digest).await?.is_some() {
        output.detail(&format!("config {} already present", descriptor.digest));
        return Ok(descriptor);
    }
    client
        .push_blob(&descriptor.digest, config_bytes, None)
        .await?;
    output.detail(&format!("config {} uploaded", descriptor.digest));
    Ok(descriptor)
}

/// Push the manifest under the primary tag and every additional tag.
/// Returns the image digest.
pub async fn push_manifest_tags(
    client: &RegistryClient,
    manifest_bytes: &[u8],
    media_type: &str,
    tags: &[String],
    output: &Logger,
) -> Result<Digest> {
    let mut digest = None;
    for tag in tags {
        let pushed = client.push_manifest(tag, manifest_bytes, media_type).await?;
        output.info(&format!(
            "pushed manifest {} as tag '{}'",
            pushed, tag
        ));
        digest = Some(pushed);
    }
    digest.ok_or_else(|| {
        BuilderError::Validation("no tags to push the manifest under".to_string())
    })
}
