//! Credential resolution
//!
//! A credential retriever produces an optional credential for a registry
//! host. The resolver composes retrievers in a fixed priority order:
//!
//! 1. the credential supplied inline for this image,
//! 2. a named `docker-credential-<suffix>` helper,
//! 3. `credHelpers` / `credsStore` from the Docker config file,
//! 4. inline `auths` entries from the same file,
//! 5. the well-known platform helper binaries.
//!
//! First hit wins. A retriever that errors is logged and skipped; "no
//! credential anywhere" is a valid outcome (anonymous pulls work).

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{BuilderError, Result};
use crate::image::reference::DOCKER_HUB_ALIASES;
use crate::logging::Logger;

const DOCKER_CONFIG_ENV_VAR: &str = "DOCKER_CONFIG";
const DOCKER_CONFIG_FILENAME: &str = "config.json";

/// A resolved registry credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Username and password (or a PAT used as a password)
    Basic { username: String, password: String },
    /// OAuth refresh token (Docker config `identitytoken`); exchanged at the
    /// token endpoint via `grant_type=refresh_token`
    RefreshToken { token: String },
}

/// One source of credentials for a registry host.
#[async_trait]
pub trait CredentialRetriever: Send + Sync {
    fn name(&self) -> &str;

    async fn retrieve(&self, registry: &str) -> Result<Option<Credential>>;
}

/// Priority-ordered chain of retrievers.
pub struct CredentialResolver {
    retrievers: Vec<Box<dyn CredentialRetriever>>,
    output: Logger,
}

impl CredentialResolver {
    /// Standard chain for one image: optional inline credential and optional
    /// named helper first, then the Docker config file, then the well-known
    /// platform helpers.
    pub fn standard(
        inline: Option<Credential>,
        helper_suffix: Option<String>,
        output: Logger,
    ) -> Self {
        let mut retrievers: Vec<Box<dyn CredentialRetriever>> = Vec::new();
        if let Some(credential) = inline {
            retrievers.push(Box::new(InlineRetriever { credential }));
        }
        if let Some(suffix) = helper_suffix {
            retrievers.push(Box::new(HelperRetriever { suffix }));
        }
        retrievers.push(Box::new(DockerConfigRetriever { path_override: None }));
        retrievers.push(Box::new(WellKnownHelpersRetriever));
        Self { retrievers, output }
    }

    pub fn with_retrievers(retrievers: Vec<Box<dyn CredentialRetriever>>, output: Logger) -> Self {
        Self { retrievers, output }
    }

    /// Walk the chain; first hit wins, failures are demoted to skips.
    pub async fn resolve(&self, registry: &str) -> Result<Option<Credential>> {
        for retriever in &self.retrievers {
            match retriever.retrieve(registry).await {
                Ok(Some(credential)) => {
                    self.output.detail(&format!(
                        "credentials for {} from {}",
                        registry,
                        retriever.name()
                    ));
                    return Ok(Some(credential));
                }
                Ok(None) => {}
                Err(err) => {
                    self.output.warning(&format!(
                        "credential retriever {} failed for {}: {}",
                        retriever.name(),
                        registry,
                        err
                    ));
                }
            }
        }
        self.output
            .detail(&format!("no credentials found for {}", registry));
        Ok(None)
    }
}

/// The credential supplied directly in the build plan.
struct InlineRetriever {
    credential: Credential,
}

#[async_trait]
impl CredentialRetriever for InlineRetriever {
    fn name(&self) -> &str {
        "inline credential"
    }

    async fn retrieve(&self, _registry: &str) -> Result<Option<Credential>> {
        Ok(Some(self.credential.clone()))
    }
}

/// A named `docker-credential-<suffix>` helper.
struct HelperRetriever {
    suffix: String,
}

#[async_trait]
impl CredentialRetriever for HelperRetriever {
    fn name(&self) -> &str {
        "named credential helper"
    }

    async fn retrieve(&self, registry: &str) -> Result<Option<Credential>> {
        run_credential_helper(&format!("docker-credential-{}", self.suffix), registry).await
    }
}

/// The Docker config file: `credHelpers`, `credsStore`, then `auths`.
struct DockerConfigRetriever {
    path_override: Option<PathBuf>,
}

#[async_trait]
impl CredentialRetriever for DockerConfigRetriever {
    fn name(&self) -> &str {
        "docker config"
    }

    async fn retrieve(&self, registry: &str) -> Result<Option<Credential>> {
        let path = match &self.path_override {
            Some(path) => path.clone(),
            None => match docker_config_path() {
                Some(path) => path,
                None => return Ok(None),
            },
        };
        if !path.exists() {
            return Ok(None);
        }
        let config: DockerConfig = serde_json::from_str(&std::fs::read_to_string(&path)?)?;

        // credHelpers entry for this host beats the global credsStore.
        let helper = candidate_registry_keys(registry)
            .iter()
            .find_map(|key| config.cred_helpers.get(key).cloned())
            .or_else(|| config.creds_store.clone());
        if let Some(helper) = helper {
            for key in candidate_registry_keys(registry) {
                if let Some(credential) =
                    run_credential_helper(&format!("docker-credential-{}", helper), &key).await?
                {
                    return Ok(Some(credential));
                }
            }
        }

        for key in candidate_registry_keys(registry) {
            if let Some(entry) = config.auths.get(&key) {
                return parse_auth_entry(entry).map(Some);
            }
        }
        Ok(None)
    }
}

/// Helper binaries Docker installs per platform; tried last, silently
/// skipped when not on PATH.
struct WellKnownHelpersRetriever;

const WELL_KNOWN_HELPERS: &[(&str, &str)] = &[
    ("macos", "docker-credential-osxkeychain"),
    ("windows", "docker-credential-wincred"),
    ("linux", "docker-credential-secretservice"),
    ("linux", "docker-credential-pass"),
];

#[async_trait]
impl CredentialRetriever for WellKnownHelpersRetriever {
    fn name(&self) -> &str {
        "well-known credential helpers"
    }

    async fn retrieve(&self, registry: &str) -> Result<Option<Credential>> {
        for (os, helper) in WELL_KNOWN_HELPERS {
            if *os != std::env::consts::OS {
                continue;
            }
            if let Some(credential) = run_credential_helper(helper, registry).await? {
                return Ok(Some(credential));
            }
        }
        Ok(None)
    }
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
    #[serde(rename = "credsStore")]
    creds_store: Option<String>,
    #[serde(rename = "credHelpers", default)]
    cred_helpers: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct DockerAuthEntry {
    auth: Option<String>,
    identitytoken: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

fn docker_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(DOCKER_CONFIG_ENV_VAR) {
        let path = PathBuf::from(path);
        return Some(if path.is_dir() {
            path.join(DOCKER_CONFIG_FILENAME)
        } else {
            path
        });
    }
    Some(dirs::home_dir()?.join(".docker").join(DOCKER_CONFIG_FILENAME))
}

/// Docker Hub is addressed under several historical keys; other hosts match
/// literally.
fn candidate_registry_keys(registry: &str) -> Vec<String> {
    if DOCKER_HUB_ALIASES.contains(&registry) {
        DOCKER_HUB_ALIASES.iter().map(|k| k.to_string()).collect()
    } else {
        vec![registry.to_string()]
    }
}

fn parse_auth_entry(entry: &DockerAuthEntry) -> Result<Credential> {
    if let Some(token) = entry.identitytoken.as_deref().filter(|t| !t.is_empty()) {
        return Ok(Credential::RefreshToken {
            token: token.to_string(),
        });
    }
    if let (Some(username), Some(password)) = (entry.username.as_deref(), entry.password.as_deref())
    {
        if !username.is_empty() && !password.is_empty() {
            return Ok(Credential::Basic {
                username: username.to_string(),
                password: password.to_string(),
            });
        }
    }
    if let Some(encoded) = entry.auth.as_deref().filter(|a| !a.is_empty()) {
        let decoded = BASE64_STANDARD
            .decode(encoded)
            .map_err(|err| BuilderError::Parse(format!("auths entry is not base64: {}", err)))?;
        let decoded = String::from_utf8_lossy(&decoded).to_string();
        let (username, password) = decoded.split_once(':').ok_or_else(|| {
            BuilderError::Parse("auths entry is missing the ':' separator".to_string())
        })?;
        return Ok(Credential::Basic {
            username: username.to_string(),
            password: password.to_string(),
        });
    }
    Err(BuilderError::Parse(
        "auths entry carries no supported fields".to_string(),
    ))
}

/// Messages a helper prints on stderr that mean "no credential stored", as
/// opposed to a real failure.
const NO_CREDENTIAL_MARKERS: &[&str] = &[
    "credentials not found",
    "no credentials server url",
    "serverurl not set",
];

/// Invoke one credential helper: host on stdin, JSON on stdout.
async fn run_credential_helper(binary: &str, server_url: &str) -> Result<Option<Credential>> {
    let mut child = match Command::new(binary)
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(BuilderError::Subprocess(format!(
                "cannot spawn {}: {}",
                binary, err
            )));
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(server_url.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
        if NO_CREDENTIAL_MARKERS
            .iter()
            .any(|marker| stderr.contains(marker))
        {
            return Ok(None);
        }
        return Err(BuilderError::Subprocess(format!(
            "{} exited with {}: {}",
            binary,
            output.status,
            stderr.trim()
        )));
    }

    parse_helper_output(&output.stdout).map(Some)
}

fn parse_helper_output(raw: &[u8]) -> Result<Credential> {
    #[derive(Deserialize)]
    struct HelperOutput {
        #[serde(rename = "Username", default)]
        username: String,
        #[serde(rename = "Secret")]
        secret: String,
    }

    let output: HelperOutput = serde_json::from_slice(raw)
        .map_err(|err| BuilderError::Parse(format!("credential helper output: {}", err)))?;
    if output.secret.is_empty() {
        return Err(BuilderError::Parse(
            "credential helper returned an empty secret".to_string(),
        ));
    }
    // Docker's convention: a "<token>" username marks an identity token.
    if output.username.is_empty() || output.username == "<token>" {
        return Ok(Credential::RefreshToken {
            token: output.secret,
        });
    }
    Ok(Credential::Basic {
        username: output.username,
        password: output.secret,
    })
}
