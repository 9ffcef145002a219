//! Blob endpoints
//!
//! Existence probe (`HEAD`), streaming pull with digest verification,
//! cross-repository mount, and push via monolithic or chunked-resumable
//! upload. Every operation goes through the client's auth-aware `send` and
//! the transient retry loop.

use std::io::Write;

use futures_util::StreamExt;
use reqwest::{StatusCode, header};
use sha2::{Digest as Sha2Digest, Sha256};

use crate::blob::Digest;
use crate::error::{BuilderError, Result};
use crate::registry::client::{RegistryClient, registry_error_detail};
use crate::registry::retry::with_retries;

/// Size up to which a blob goes out in one `PUT`; larger blobs use the
/// chunked `PATCH` protocol.
pub const MONOLITHIC_UPLOAD_LIMIT: u64 = 16 * 1024 * 1024;
const CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Outcome of a cross-repository mount attempt.
#[derive(Debug)]
pub enum MountOutcome {
    /// 201: the registry linked the blob; nothing to upload
    Mounted,
    /// 202: the registry declined and opened a regular upload session
    Declined { upload_location: Option<String> },
}

impl RegistryClient {
    /// `HEAD /v2/<repo>/blobs/<digest>`: `Some(content length)` when the
    /// blob is present.
    pub async fn check_blob(&self, digest: &Digest) -> Result<Option<u64>> {
        let url = self.repo_url(&format!("blobs/{}", digest));
        let response = with_retries(&self.retry, "blob check", &self.output, || {
            self.send("blob check", || self.http.head(&url))
        })
        .await?;

        match response.status() {
            StatusCode::OK => {
                let length = response
                    .headers()
                    .get(header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                Ok(Some(length))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(BuilderError::Registry(format!(
                "unexpected status {} checking blob {}",
                status, digest
            ))),
        }
    }

    /// `GET /v2/<repo>/blobs/<digest>`: stream into `writer`, verifying the
    /// bytes against the requested digest. A single corrupted byte surfaces
    /// as `DigestMismatch`.
    pub async fn pull_blob<W: Write + Send>(&self, digest: &Digest, writer: &mut W) -> Result<u64> {
        let url = self.repo_url(&format!("blobs/{}", digest));
        let response = with_retries(&self.retry, "blob pull", &self.output, || {
            self.send("blob pull", || self.http.get(&url))
        })
        .await?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(BuilderError::BlobNotFound {
                    repository: self.repository().to_string(),
                    digest: digest.to_string(),
                });
            }
            status => {
                return Err(BuilderError::Registry(format!(
                    "unexpected status {} pulling blob {}",
                    status, digest
                )));
            }
        }

        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| BuilderError::Transient {
                operation: "blob pull".to_string(),
                reason: format!("stream interrupted: {}", err),
                retry_after: None,
            })?;
            hasher.update(&chunk);
            writer.write_all(&chunk)?;
            written += chunk.len() as u64;
        }

        let computed = Digest::from_bytes(hasher.finalize().into());
        if computed != *digest {
            return Err(BuilderError::DigestMismatch {
                expected: digest.to_string(),
                computed: computed.to_string(),
            });
        }
        Ok(written)
    }

    /// `POST /v2/<repo>/blobs/uploads/?mount=<digest>&from=<source>`: ask
    /// the registry to link a blob it already stores under another
    /// repository. 201 means mounted; 202 means declined, with a regular
    /// upload session opened instead.
    pub async fn mount_blob(&self, digest: &Digest, from_repository: &str) -> Result<MountOutcome> {
        let url = format!(
            "{}?mount={}&from={}",
            self.repo_url("blobs/uploads/"),
            digest,
            from_repository
        );
        let response = with_retries(&self.retry, "blob mount", &self.output, || {
            self.send("blob mount", || self.http.post(&url))
        })
        .await?;

        match response.status() {
            StatusCode::CREATED => {
                self.output.detail(&format!(
                    "mounted {} from {}",
                    digest, from_repository
                ));
                Ok(MountOutcome::Mounted)
            }
            StatusCode::ACCEPTED => Ok(MountOutcome::Declined {
                upload_location: response
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| self.resolve_location(v)),
            }),
            status => {
                let detail = registry_error_detail(response).await;
                Err(BuilderError::BlobPushRefused {
                    repository: self.repository().to_string(),
                    digest: digest.to_string(),
                    detail: format!("mount answered {}: {}", status, detail),
                })
            }
        }
    }

    /// Push one blob. Monolithic `POST` + `PUT` for small blobs, chunked
    /// `PATCH` with `Content-Range` resume for large ones. An existing
    /// upload session (from a declined mount) is reused when given.
    pub async fn push_blob(
        &self,
        digest: &Digest,
        data: &[u8],
        session: Option<String>,
    ) -> Result<()> {
        let location = match session {
            Some(location) => location,
            None => self.start_upload_session().await?,
        };

        if (data.len() as u64) <= MONOLITHIC_UPLOAD_LIMIT {
            match self.monolithic_upload(&location, digest, data).await {
                Ok(()) => return Ok(()),
                // Some registries reject single-shot PUTs; fall back to the
                // chunked protocol on a fresh session.
                Err(BuilderError::BlobPushRefused { detail, .. })
                    if detail.contains("BLOB_UPLOAD_INVALID") =>
                {
                    self.output
                        .detail("monolithic upload rejected; retrying chunked");
                }
                Err(err) => return Err(err),
            }
            let location = self.start_upload_session().await?;
            return self.chunked_upload(&location, digest, data).await;
        }

        self.chunked_upload(&location, digest, data).await
    }

    /// `POST /v2/<repo>/blobs/uploads/`: open an upload session.
    async fn start_upload_session(&self) -> Result<String> {
        let url = self.repo_url("blobs/uploads/");
        let response = with_retries(&self.retry, "upload session", &self.output, || {
            self.send("upload session", || self.http.post(&url))
        })
        .await?;

        if response.status() != StatusCode::ACCEPTED {
            let status = response.status();
            let detail = registry_error_detail(response).await;
            return Err(BuilderError::Registry(format!(
                "cannot open upload session (status {}): {}",
                status, detail
            )));
        }
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                BuilderError::Registry("upload session response has no Location".to_string())
            })?;
        Ok(self.resolve_location(location))
    }

    /// Single `PUT <location>?digest=<d>` with the whole body.
    async fn monolithic_upload(&self, location: &str, digest: &Digest, data: &[u8]) -> Result<()> {
        let url = append_digest(location, digest);
        let response = with_retries(&self.retry, "blob upload", &self.output, || {
            self.send("blob upload", || {
                self.http
                    .put(&url)
                    .header(header::CONTENT_TYPE, "application/octet-stream")
                    .header(header::CONTENT_LENGTH, data.len())
                    .body(data.to_vec())
            })
        })
        .await?;

        self.expect_created(digest, response).await
    }

    /// Chunked upload: repeated `PATCH` with `Content-Range`, terminated by
    /// a bodyless `PUT ?digest=`. A 416 answer re-synchronizes from the
    /// registry's committed `Range`.
    async fn chunked_upload(&self, location: &str, digest: &Digest, data: &[u8]) -> Result<()> {
        let total = data.len();
        let mut offset: usize = 0;
        let mut location = location.to_string();
        let mut resyncs: u32 = 0;

        while offset < total {
            let end = (offset + CHUNK_SIZE).min(total);
            let chunk = &data[offset..end];

            let response = with_retries(&self.retry, "blob chunk", &self.output, || {
                self.send("blob chunk", || {
                    self.http
                        .patch(&location)
                        .header(header::CONTENT_TYPE, "application/octet-stream")
                        .header(header::CONTENT_LENGTH, chunk.len())
                        .header(
                            header::CONTENT_RANGE,
                            format!("{}-{}/{}", offset, end - 1, total),
                        )
                        .body(chunk.to_vec())
                })
            })
            .await?;

            match response.status() {
                StatusCode::ACCEPTED | StatusCode::NO_CONTENT | StatusCode::CREATED => {
                    if let Some(next) = response
                        .headers()
                        .get(header::LOCATION)
                        .and_then(|v| v.to_str().ok())
                    {
                        location = self.resolve_location(next);
                    }
                    offset = end;
                }
                StatusCode::RANGE_NOT_SATISFIABLE => {
                    // The registry tells us how much it actually has; resume
                    // from there instead of failing the upload.
                    resyncs += 1;
                    if resyncs > 3 {
                        return Err(BuilderError::BlobPushRefused {
                            repository: self.repository().to_string(),
                            digest: digest.to_string(),
                            detail: "upload keeps falling out of range sync".to_string(),
                        });
                    }
                    let committed = response
                        .headers()
                        .get(header::RANGE)
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_range_end)
                        .ok_or_else(|| {
                            BuilderError::Registry(
                                "416 without a usable Range header".to_string(),
                            )
                        })?;
                    self.output.detail(&format!(
                        "upload out of sync; resuming from byte {}",
                        committed + 1
                    ));
                    offset = (committed + 1).min(total);
                }
                status => {
                    let detail = registry_error_detail(response).await;
                    return Err(BuilderError::BlobPushRefused {
                        repository: self.repository().to_string(),
                        digest: digest.to_string(),
                        detail: format!("chunk answered {}: {}", status, detail),
                    });
                }
            }
        }

        let url = append_digest(&location, digest);
        let response = with_retries(&self.retry, "blob finalize", &self.output, || {
            self.send("blob finalize", || {
                self.http.put(&url).header(header::CONTENT_LENGTH, 0)
            })
        })
        .await?;
        self.expect_created(digest, response).await
    }

    async fn expect_created(&self, digest: &Digest, response: reqwest::Response) -> Result<()> {
        let status = response.status();
        if status == StatusCode::CREATED || status == StatusCode::NO_CONTENT || status.is_success()
        {
            return Ok(());
        }
        let detail = registry_error_detail(response).await;
        Err(BuilderError::BlobPushRefused {
            repository: self.repository().to_string(),
            digest: digest.to_string(),
            detail: format!("upload answered {}: {}", status, detail),
        })
    }
}

fn append_digest(location: &str, digest: &Digest) -> String {
    if location.contains('?') {
        format!("{}&digest={}", location, digest)
    } else {
        format!("{}?digest={}", location, digest)
    }
}

/// Parse the end offset out of a `Range: 0-<n>` (or `bytes=0-<n>`) header.
fn parse_range_end(raw: &str) -> Option<usize> {
    let raw = raw.trim().trim_start_matches("bytes=");
    let (_, end) = raw.split_once('-')?;
    end.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_digest_handles_query_strings() {
        let digest = Digest::of_bytes(b"x");
        assert_eq!(
            append_digest("https://r/upload/1", &digest),
            format!("https://r/upload/1?digest={}", digest)
        );
        assert_eq!(
            append_digest("https://r/upload/1?state=abc", &digest),
            format!("https://r/upload/1?state=abc&digest={}", digest)
        );
    }

    #[test]
    fn range_end_parsing() {
        assert_eq!(parse_range_end("0-1023"), Some(1023));
        assert_eq!(parse_range_end("bytes=0-511"), Some(511));
        assert_eq!(parse_range_end("garbage"), None);
    }
}
