//! Image reference parsing
//!
//! `[registry/]repository[:tag|@sha256:digest]` with the Docker Hub
//! conventions applied: the registry defaults to `registry-1.docker.io`,
//! single-segment Docker Hub repositories get the implied `library/` prefix,
//! and the tag defaults to `latest` when neither a tag nor a digest is given.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::blob::Digest;
use crate::error::{BuilderError, Result};

pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";
const DEFAULT_TAG: &str = "latest";

/// Hostnames treated as aliases of the default registry when matching
/// Docker config entries.
pub const DOCKER_HUB_ALIASES: &[&str] = &[
    "registry-1.docker.io",
    "index.docker.io",
    "docker.io",
    "https://index.docker.io/v1/",
];

/// A parsed image reference. Exactly one of `tag` / `digest` identifies the
/// image; a bare reference carries the `latest` tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<Digest>,
}

impl ImageReference {
    pub fn parse(input: &str) -> Result<Self> {
        if input.is_empty() {
            return Err(invalid(input, 0, "reference is empty"));
        }

        // Split off a digest suffix first; the '@' separator is unambiguous.
        let (remainder, digest) = match input.find('@') {
            Some(at) => {
                let digest = Digest::parse(&input[at + 1..])
                    .map_err(|err| invalid(input, at + 1, &err.to_string()))?;
                (&input[..at], Some(digest))
            }
            None => (input, None),
        };

        // A ':' after the last '/' is a tag separator, otherwise it belongs
        // to a registry host:port.
        let last_slash = remainder.rfind('/');
        let tag = match remainder.rfind(':') {
            Some(colon) if last_slash.is_none_or(|slash| colon > slash) => {
                if digest.is_some() {
                    return Err(invalid(
                        input,
                        colon,
                        "reference carries both a tag and a digest",
                    ));
                }
                let tag = &remainder[colon + 1..];
                validate_tag(input, colon + 1, tag)?;
                Some(tag.to_string())
            }
            _ => None,
        };
        let name_end = match (tag.as_ref(), digest.as_ref()) {
            (Some(tag), _) => remainder.len() - tag.len() - 1,
            _ => remainder.len(),
        };
        let name = &remainder[..name_end];

        // The first path segment is a registry host only when it looks like
        // one (contains '.' or ':', or is "localhost").
        let (registry, mut repository) = match name.find('/') {
            Some(slash) => {
                let first = &name[..slash];
                if first.contains('.') || first.contains(':') || first == "localhost" {
                    (first.to_string(), name[slash + 1..].to_string())
                } else {
                    (DEFAULT_REGISTRY.to_string(), name.to_string())
                }
            }
            None => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        };

        if repository.is_empty() {
            return Err(invalid(input, 0, "repository is empty"));
        }
        validate_repository(input, &repository)?;

        // Docker Hub implies the library/ namespace for official images.
        if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            repository = format!("library/{}", repository);
        }

        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// Tag or digest string used on manifest endpoints.
    pub fn reference(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => tag.clone(),
            (None, None) => DEFAULT_TAG.to_string(),
        }
    }

    pub fn uses_default_registry(&self) -> bool {
        self.registry == DEFAULT_REGISTRY
    }

    /// Whether two references point at the same registry host, so blobs can
    /// be cross-repository mounted between them.
    pub fn same_registry_as(&self, other: &ImageReference) -> bool {
        self.registry == other.registry
    }

    /// The special `scratch` base: an empty image with no registry behind it.
    pub fn is_scratch(&self) -> bool {
        self.registry == DEFAULT_REGISTRY && self.repository == "library/scratch"
    }

    /// Re-target the same image at a different tag.
    pub fn with_tag(&self, tag: &str) -> Self {
        ImageReference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Some(tag.to_string()),
            digest: None,
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)
        } else if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)
        } else {
            Ok(())
        }
    }
}

impl FromStr for ImageReference {
    type Err = BuilderError;

    fn from_str(s: &str) -> Result<Self> {
        ImageReference::parse(s)
    }
}

impl TryFrom<String> for ImageReference {
    type Error = BuilderError;

    fn try_from(value: String) -> Result<Self> {
        ImageReference::parse(&value)
    }
}

impl From<ImageReference> for String {
    fn from(reference: ImageReference) -> Self {
        reference.to_string()
    }
}

fn invalid(input: &str, position: usize, reason: &str) -> BuilderError {
    BuilderError::InvalidImageReference {
        input: input.to_string(),
        position,
        reason: reason.to_string(),
    }
}

fn validate_repository(input: &str, repository: &str) -> Result<()> {
    for (offset, ch) in repository.char_indices() {
        let ok = ch.is_ascii_lowercase()
            || ch.is_ascii_digit()
            || matches!(ch, '/' | '.' | '-' | '_');
        if !ok {
            return Err(invalid(
                input,
                input.find(repository).unwrap_or(0) + offset,
                &format!("repository contains invalid character '{}'", ch),
            ));
        }
    }
    if repository.contains("//") || repository.starts_with('/') || repository.ends_with('/') {
        return Err(invalid(input, 0, "repository has empty path segments"));
    }
    Ok(())
}

fn validate_tag(input: &str, position: usize, tag: &str) -> Result<()> {
    if tag.is_empty() {
        return Err(invalid(input, position, "tag is empty"));
    }
    if tag.len() > 128 {
        return Err(invalid(input, position, "tag exceeds 128 characters"));
    }
    let valid = tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if !valid {
        return Err(invalid(input, position, "tag contains invalid characters"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_segment_gets_library_prefix_and_latest() {
        let reference = ImageReference::parse("alpine").expect("parse");
        assert_eq!(reference.registry(), "registry-1.docker.io");
        assert_eq!(reference.repository(), "library/alpine");
        assert_eq!(reference.tag(), Some("latest"));
        assert!(reference.digest().is_none());
    }

    #[test]
    fn explicit_registry_host() {
        let reference = ImageReference::parse("ghcr.io/org/app:1.0").expect("parse");
        assert_eq!(reference.registry(), "ghcr.io");
        assert_eq!(reference.repository(), "org/app");
        assert_eq!(reference.tag(), Some("1.0"));
    }

    #[test]
    fn localhost_with_port_is_a_registry() {
        let reference = ImageReference::parse("localhost:5000/app:dev").expect("parse");
        assert_eq!(reference.registry(), "localhost:5000");
        assert_eq!(reference.repository(), "app");
        assert_eq!(reference.tag(), Some("dev"));
    }

    #[test]
    fn digest_pinned_reference() {
        let digest_hex = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";
        let raw = format!("library/busybox@sha256:{}", digest_hex);
        let reference = ImageReference::parse(&raw).expect("parse");
        assert_eq!(reference.tag(), None);
        assert_eq!(reference.digest().expect("digest").to_hex(), digest_hex);
        assert_eq!(reference.reference(), format!("sha256:{}", digest_hex));
    }

    #[test]
    fn tag_and_digest_together_rejected() {
        let digest_hex = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";
        let raw = format!("busybox:1.36@sha256:{}", digest_hex);
        let err = ImageReference::parse(&raw).expect_err("must fail");
        assert!(matches!(
            err,
            BuilderError::InvalidImageReference { .. }
        ));
    }

    #[test]
    fn parse_failures_carry_position() {
        let err = ImageReference::parse("repo:").expect_err("must fail");
        match err {
            BuilderError::InvalidImageReference { position, .. } => assert_eq!(position, 5),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn display_roundtrip() {
        for raw in [
            "registry-1.docker.io/library/alpine:3.18",
            "ghcr.io/org/app:1.0",
            "localhost:5000/app:dev",
        ] {
            let reference = ImageReference::parse(raw).expect("parse");
            assert_eq!(reference.to_string(), raw);
        }
    }

    #[test]
    fn scratch_detection() {
        assert!(ImageReference::parse("scratch").expect("parse").is_scratch());
        assert!(!ImageReference::parse("alpine").expect("parse").is_scratch());
    }

    #[test]
    fn with_tag_drops_digest() {
        let digest_hex = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";
        let reference =
            ImageReference::parse(&format!("ghcr.io/org/app@sha256:{}", digest_hex)).expect("parse");
        let tagged = reference.with_tag("stable");
        assert_eq!(tagged.tag(), Some("stable"));
        assert!(tagged.digest().is_none());
    }
}
