//! Manifest endpoints
//!
//! Pull with the full multi-format `Accept` list and push with the exact
//! `Content-Type` of the document. `Docker-Content-Digest` answers are
//! verified against the locally computed digest and rejected on mismatch.

use reqwest::{StatusCode, header};

use crate::blob::Digest;
use crate::error::{BuilderError, Result};
use crate::image::manifest::MANIFEST_ACCEPT;
use crate::registry::client::{RegistryClient, header_string, registry_error_detail};
use crate::registry::retry::with_retries;

/// A pulled manifest document with its wire metadata.
#[derive(Debug, Clone)]
pub struct PulledManifest {
    pub bytes: Vec<u8>,
    /// Media type from the response `Content-Type`
    pub media_type: Option<String>,
    /// Digest of the bytes, verified against `Docker-Content-Digest`
    pub digest: Digest,
}

impl RegistryClient {
    /// `GET /v2/<repo>/manifests/<ref>` for a tag or digest reference.
    pub async fn pull_manifest(&self, reference: &str) -> Result<PulledManifest> {
        let url = self.repo_url(&format!("manifests/{}", reference));
        let response = with_retries(&self.retry, "manifest pull", &self.output, || {
            self.send("manifest pull", || {
                self.http.get(&url).header(header::ACCEPT, MANIFEST_ACCEPT)
            })
        })
        .await?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(BuilderError::ManifestNotFound {
                    repository: self.repository().to_string(),
                    reference: reference.to_string(),
                });
            }
            status => {
                let detail = registry_error_detail(response).await;
                return Err(BuilderError::Registry(format!(
                    "unexpected status {} pulling manifest '{}': {}",
                    status, reference, detail
                )));
            }
        }

        let media_type = header_string(&response, header::CONTENT_TYPE);
        let advertised = header_string(&response, header::HeaderName::from_static("docker-content-digest"));
        let bytes = response.bytes().await?.to_vec();
        let computed = Digest::of_bytes(&bytes);

        // The registry's digest claim and a digest-pinned request must both
        // agree with what we hashed off the wire.
        if let Some(advertised) = advertised {
            let advertised = Digest::parse(advertised.trim())?;
            if advertised != computed {
                return Err(BuilderError::DigestMismatch {
                    expected: advertised.to_string(),
                    computed: computed.to_string(),
                });
            }
        }
        if reference.starts_with("sha256:") {
            let requested = Digest::parse(reference)?;
            if requested != computed {
                return Err(BuilderError::DigestMismatch {
                    expected: requested.to_string(),
                    computed: computed.to_string(),
                });
            }
        }

        Ok(PulledManifest {
            bytes,
            media_type,
            digest: computed,
        })
    }

    /// `PUT /v2/<repo>/manifests/<tag>` with the document's media type.
    /// Returns the image digest the registry recorded.
    pub async fn push_manifest(
        &self,
        tag: &str,
        bytes: &[u8],
        media_type: &str,
    ) -> Result<Digest> {
        let url = self.repo_url(&format!("manifests/{}", tag));
        let response = with_retries(&self.retry, "manifest push", &self.output, || {
            self.send("manifest push", || {
                self.http
                    .put(&url)
                    .header(header::CONTENT_TYPE, media_type)
                    .body(bytes.to_vec())
            })
        })
        .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = registry_error_detail(response).await;
            return Err(BuilderError::Registry(format!(
                "manifest push for tag '{}' answered {}: {}",
                tag, status, detail
            )));
        }

        let computed = Digest::of_bytes(bytes);
        if let Some(advertised) =
            header_string(&response, header::HeaderName::from_static("docker-content-digest"))
        {
            let advertised = Digest::parse(advertised.trim())?;
            if advertised != computed {
                return Err(BuilderError::DigestMismatch {
                    expected: advertised.to_string(),
                    computed: computed.to_string(),
                });
            }
        }
        Ok(computed)
    }
}
