//! Registry client core
//!
//! One client instance talks to one repository on one registry. The builder
//! wires in credentials, the retry policy and the insecure-registry switch;
//! [`RegistryClient::connect`] probes `GET /v2/` to settle the scheme
//! (falling back to plain HTTP only when the per-build switch allows it)
//! and to surface the authentication challenge early.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode, header};
use serde::Deserialize;

use crate::credentials::Credential;
use crate::error::{BuilderError, Result};
use crate::logging::Logger;
use crate::registry::auth::Access;
use crate::registry::retry::{RetryPolicy, is_transient_status, transient_from_status};
use crate::registry::token_manager::TokenManager;

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(20);
const USER_AGENT: &str = concat!("jvm-image-builder/", env!("CARGO_PKG_VERSION"));

pub struct RegistryClientBuilder {
    registry_host: String,
    repository: String,
    access: Access,
    credential: Option<Credential>,
    allow_insecure: bool,
    timeout: Duration,
    retry: RetryPolicy,
    output: Logger,
}

impl RegistryClientBuilder {
    pub fn new(registry_host: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            registry_host: registry_host.into(),
            repository: repository.into(),
            access: Access::Pull,
            credential: None,
            allow_insecure: false,
            timeout: DEFAULT_HTTP_TIMEOUT,
            retry: RetryPolicy::default(),
            output: Logger::new(false),
        }
    }

    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    pub fn with_credential(mut self, credential: Option<Credential>) -> Self {
        self.credential = credential;
        self
    }

    pub fn with_allow_insecure(mut self, allow_insecure: bool) -> Self {
        self.allow_insecure = allow_insecure;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_output(mut self, output: Logger) -> Self {
        self.output = output;
        self
    }

    pub fn build(self) -> Result<RegistryClient> {
        let mut builder = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(self.timeout);
        if self.allow_insecure {
            // The explicit per-build switch also tolerates broken certs.
            builder = builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        let http = builder.build().map_err(BuilderError::from)?;

        let tokens = TokenManager::new(
            http.clone(),
            self.registry_host.clone(),
            self.repository.clone(),
            self.access,
            self.credential,
            self.output.clone(),
        );

        Ok(RegistryClient {
            http,
            base_url: format!("https://{}", self.registry_host),
            registry_host: self.registry_host,
            repository: self.repository,
            allow_insecure: self.allow_insecure,
            tokens,
            retry: self.retry,
            output: self.output,
        })
    }
}

pub struct RegistryClient {
    pub(crate) http: Client,
    pub(crate) base_url: String,
    registry_host: String,
    repository: String,
    allow_insecure: bool,
    pub(crate) tokens: TokenManager,
    pub(crate) retry: RetryPolicy,
    pub(crate) output: Logger,
}

impl RegistryClient {
    pub fn builder(
        registry_host: impl Into<String>,
        repository: impl Into<String>,
    ) -> RegistryClientBuilder {
        RegistryClientBuilder::new(registry_host, repository)
    }

    pub fn registry_host(&self) -> &str {
        &self.registry_host
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub(crate) fn api_url(&self) -> String {
        format!("{}/v2/", self.base_url)
    }

    pub(crate) fn v2_url(&self, repository: &str, tail: &str) -> String {
        format!("{}/v2/{}/{}", self.base_url, repository, tail)
    }

    pub(crate) fn repo_url(&self, tail: &str) -> String {
        self.v2_url(&self.repository, tail)
    }

    /// Resolve an upload `Location` header against the registry base.
    pub(crate) fn resolve_location(&self, location: &str) -> String {
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else if location.starts_with('/') {
            format!("{}{}", self.base_url, location)
        } else {
            format!("{}/v2/{}/blobs/uploads/{}", self.base_url, self.repository, location)
        }
    }

    /// Probe `GET /v2/`. Settles the scheme — falling back to HTTP on a
    /// connection/TLS failure when insecure registries are allowed — and
    /// performs the initial authentication exchange when challenged.
    pub async fn connect(&mut self) -> Result<()> {
        let probe = self.http.get(self.api_url()).send().await;
        let response = match probe {
            Ok(response) => response,
            Err(err) if self.allow_insecure && (err.is_connect() || err.is_timeout()) => {
                self.output.warning(&format!(
                    "TLS connection to {} failed ({}); falling back to plain HTTP",
                    self.registry_host, err
                ));
                self.base_url = format!("http://{}", self.registry_host);
                self.http.get(self.api_url()).send().await?
            }
            Err(err) => return Err(err.into()),
        };

        match response.status() {
            StatusCode::OK => {
                self.output.detail(&format!(
                    "registry {} speaks the v2 API anonymously",
                    self.registry_host
                ));
                Ok(())
            }
            StatusCode::UNAUTHORIZED => {
                let challenge = header_string(&response, header::WWW_AUTHENTICATE);
                self.tokens
                    .handle_unauthorized(challenge.as_deref())
                    .await?;
                self.output
                    .detail(&format!("authenticated against {}", self.registry_host));
                Ok(())
            }
            status if is_transient_status(status) => {
                Err(transient_from_status("api probe", status, retry_after(&response)))
            }
            status => Err(BuilderError::Registry(format!(
                "registry {} does not speak the v2 API (status {})",
                self.registry_host, status
            ))),
        }
    }

    /// Send one request with the current authorization. Every 401 runs the
    /// auth state machine and retries the originating request in place; the
    /// token manager's refresh budget bounds how often that can happen.
    /// Transient statuses map to `Transient` for the retry loop.
    pub(crate) async fn send<F>(&self, operation: &str, make: F) -> Result<Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut auth = self.tokens.authorization().await;
        loop {
            let mut request = make();
            if let Some(value) = &auth {
                request = request.header(header::AUTHORIZATION, value);
            }
            let response = request.send().await?;
            if response.status() != StatusCode::UNAUTHORIZED {
                return self.classify(operation, response);
            }

            // Another caller may have refreshed while this request was in
            // flight; reuse its token before spending a refresh of our own.
            let challenge = header_string(&response, header::WWW_AUTHENTICATE);
            auth = match self.tokens.refreshed_since(auth.as_deref()).await {
                Some(token) => Some(token),
                None => Some(
                    self.tokens
                        .handle_unauthorized(challenge.as_deref())
                        .await?,
                ),
            };
        }
    }

    /// Map transient statuses to `Transient`; 403 to `Forbidden`; everything
    /// else is handed to the caller for interpretation.
    fn classify(&self, operation: &str, response: Response) -> Result<Response> {
        let status = response.status();
        if is_transient_status(status) {
            return Err(transient_from_status(operation, status, retry_after(&response)));
        }
        if status == StatusCode::FORBIDDEN {
            return Err(BuilderError::Forbidden {
                registry: self.registry_host.clone(),
                repository: self.repository.clone(),
                detail: format!("during {}", operation),
            });
        }
        Ok(response)
    }
}

/// Seconds from a `Retry-After` header, when present and numeric.
pub(crate) fn retry_after(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

pub(crate) fn header_string(response: &Response, name: header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

/// Registry error body: `{"errors":[{"code":…,"message":…}]}`. Folded into
/// error messages when present.
pub(crate) async fn registry_error_detail(response: Response) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        errors: Vec<ErrorEntry>,
    }
    #[derive(Deserialize)]
    struct ErrorEntry {
        code: Option<String>,
        message: Option<String>,
    }

    let raw = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&raw) {
        Ok(body) if !body.errors.is_empty() => body
            .errors
            .iter()
            .map(|e| {
                format!(
                    "{}: {}",
                    e.code.as_deref().unwrap_or("UNKNOWN"),
                    e.message.as_deref().unwrap_or("")
                )
            })
            .collect::<Vec<_>>()
            .join("; "),
        _ => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> RegistryClient {
        RegistryClient::builder("my.reg", "org/app")
            .with_output(Logger::new_quiet())
            .build()
            .expect("build client")
    }

    #[test]
    fn urls_are_rooted_at_v2() {
        let client = client();
        assert_eq!(client.api_url(), "https://my.reg/v2/");
        assert_eq!(
            client.repo_url("blobs/uploads/"),
            "https://my.reg/v2/org/app/blobs/uploads/"
        );
        assert_eq!(
            client.v2_url("library/alpine", "manifests/3.18"),
            "https://my.reg/v2/library/alpine/manifests/3.18"
        );
    }

    #[test]
    fn location_resolution() {
        let client = client();
        assert_eq!(
            client.resolve_location("https://cdn.example/upload/1"),
            "https://cdn.example/upload/1"
        );
        assert_eq!(
            client.resolve_location("/v2/org/app/blobs/uploads/1"),
            "https://my.reg/v2/org/app/blobs/uploads/1"
        );
        assert_eq!(
            client.resolve_location("session-1"),
            "https://my.reg/v2/org/app/blobs/uploads/session-1"
        );
    }
}
