//! Registry authentication primitives
//!
//! `WWW-Authenticate` challenge parsing and the token endpoint exchange.
//! Username/password credentials go out as basic auth on a GET; OAuth
//! refresh tokens go out as a `grant_type=refresh_token` form POST. The
//! response carries the bearer token under either `token` or `access_token`.

use reqwest::Client;
use serde::Deserialize;

use crate::credentials::Credential;
use crate::error::{BuilderError, Result};
use crate::logging::Logger;

/// Actions a scope requests on a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Pull,
    Push,
}

impl Access {
    fn actions(self) -> &'static str {
        match self {
            Access::Pull => "pull",
            // Pushes also read (HEAD probes, mounts), so the scope carries both.
            Access::Push => "pull,push",
        }
    }
}

/// Scope string for one repository: `repository:<repo>:<actions>`.
pub fn repository_scope(repository: &str, access: Access) -> String {
    format!("repository:{}:{}", repository, access.actions())
}

/// Parsed `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthChallenge {
    Basic {
        realm: Option<String>,
    },
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

impl AuthChallenge {
    /// Parse `Basic realm="…"` or `Bearer realm="…",service="…",scope="…"`.
    pub fn parse(header: &str) -> Result<AuthChallenge> {
        let header = header.trim();
        let (scheme, params) = match header.split_once(' ') {
            Some((scheme, params)) => (scheme, params),
            None => (header, ""),
        };

        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for param in params.split(',') {
            let param = param.trim();
            if let Some((key, value)) = param.split_once('=') {
                let value = value.trim().trim_matches('"').to_string();
                match key.trim().to_ascii_lowercase().as_str() {
                    "realm" => realm = Some(value),
                    "service" => service = Some(value),
                    "scope" => scope = Some(value),
                    _ => {}
                }
            }
        }

        match scheme.to_ascii_lowercase().as_str() {
            "basic" => Ok(AuthChallenge::Basic { realm }),
            "bearer" => Ok(AuthChallenge::Bearer {
                realm: realm.ok_or_else(|| {
                    BuilderError::Registry(
                        "bearer challenge is missing the realm parameter".to_string(),
                    )
                })?,
                service,
                scope,
            }),
            other => Err(BuilderError::Registry(format!(
                "unsupported authentication scheme '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Fetch a bearer token for `scope` from the challenge's realm.
///
/// A missing `service` parameter defaults to the registry host, matching
/// what registries that omit it expect back.
pub async fn fetch_token(
    client: &Client,
    challenge: &AuthChallenge,
    registry_host: &str,
    scope: &str,
    credential: Option<&Credential>,
    output: &Logger,
) -> Result<String> {
    let (realm, service) = match challenge {
        AuthChallenge::Bearer { realm, service, .. } => (
            realm.as_str(),
            service.clone().unwrap_or_else(|| registry_host.to_string()),
        ),
        AuthChallenge::Basic { .. } => {
            return Err(BuilderError::Registry(
                "cannot fetch a bearer token for a basic challenge".to_string(),
            ));
        }
    };

    // Realms are absolute URLs; registries occasionally hand out garbage.
    let realm_url = url::Url::parse(realm).map_err(|err| {
        BuilderError::Registry(format!("challenge realm '{}' is not a URL: {}", realm, err))
    })?;

    output.detail(&format!(
        "token exchange at {} (service={}, scope={})",
        realm_url, service, scope
    ));

    let response = match credential {
        Some(Credential::RefreshToken { token }) => {
            let form = [
                ("grant_type", "refresh_token"),
                ("refresh_token", token.as_str()),
                ("service", service.as_str()),
                ("scope", scope),
            ];
            client.post(realm_url).form(&form).send().await?
        }
        other => {
            let mut request = client
                .get(realm_url)
                .query(&[("service", service.as_str()), ("scope", scope)]);
            if let Some(Credential::Basic { username, password }) = other {
                request = request.basic_auth(username, Some(password));
            }
            request.send().await?
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BuilderError::Unauthorized {
            registry: registry_host.to_string(),
            challenge: Some(format!("token endpoint answered {}: {}", status, body)),
        });
    }

    let parsed: TokenResponse = response.json().await.map_err(|err| {
        BuilderError::Registry(format!("token response is not valid JSON: {}", err))
    })?;
    parsed
        .token
        .or(parsed.access_token)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            BuilderError::Registry(
                "token response carries neither token nor access_token".to_string(),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bearer_challenge() {
        let challenge = AuthChallenge::parse(
            "Bearer realm=\"https://auth.docker.io/token\",service=\"registry.docker.io\",scope=\"repository:library/alpine:pull\"",
        )
        .expect("parse");
        assert_eq!(
            challenge,
            AuthChallenge::Bearer {
                realm: "https://auth.docker.io/token".to_string(),
                service: Some("registry.docker.io".to_string()),
                scope: Some("repository:library/alpine:pull".to_string()),
            }
        );
    }

    #[test]
    fn parse_bearer_without_service() {
        let challenge =
            AuthChallenge::parse("Bearer realm=\"https://my.reg/token\"").expect("parse");
        assert_eq!(
            challenge,
            AuthChallenge::Bearer {
                realm: "https://my.reg/token".to_string(),
                service: None,
                scope: None,
            }
        );
    }

    #[test]
    fn parse_basic_challenge() {
        let challenge = AuthChallenge::parse("Basic realm=\"Registry\"").expect("parse");
        assert_eq!(
            challenge,
            AuthChallenge::Basic {
                realm: Some("Registry".to_string())
            }
        );
    }

    #[test]
    fn parse_rejects_unknown_scheme_and_missing_realm() {
        assert!(AuthChallenge::parse("Digest realm=\"x\"").is_err());
        assert!(AuthChallenge::parse("Bearer service=\"x\"").is_err());
    }

    #[test]
    fn scope_strings() {
        assert_eq!(
            repository_scope("library/alpine", Access::Pull),
            "repository:library/alpine:pull"
        );
        assert_eq!(
            repository_scope("myrepo/app", Access::Push),
            "repository:myrepo/app:pull,push"
        );
    }
}
