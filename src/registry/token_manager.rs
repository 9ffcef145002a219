//! Authentication state machine and token refresh
//!
//! One [`TokenManager`] per registry client instance owns the state machine
//! `UNAUTH → BASIC | BEARER(token)`. A single async lock guards refresh, so
//! only one token exchange runs at a time; callers that queued behind the
//! lock re-read the refreshed token on wake instead of refreshing again.
//! Refreshes are counted against a per-client budget of 5; past that the 401
//! is surfaced as `Unauthorized`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use reqwest::Client;
use tokio::sync::Mutex;

use crate::credentials::Credential;
use crate::error::{BuilderError, Result};
use crate::logging::Logger;
use crate::registry::auth::{Access, AuthChallenge, fetch_token, repository_scope};

/// Maximum re-authentications per client before a 401 becomes fatal.
const MAX_TOKEN_REFRESHES: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
enum AuthState {
    Unauthenticated,
    Basic,
    Bearer { token: String, generation: u32 },
}

struct TokenManagerInner {
    state: Mutex<AuthState>,
    refreshes: AtomicU32,
}

/// Thread-safe authentication state shared by every operation of one
/// registry client.
#[derive(Clone)]
pub struct TokenManager {
    http: Client,
    registry_host: String,
    repository: String,
    access: Access,
    credential: Option<Credential>,
    inner: Arc<TokenManagerInner>,
    output: Logger,
}

impl TokenManager {
    pub fn new(
        http: Client,
        registry_host: String,
        repository: String,
        access: Access,
        credential: Option<Credential>,
        output: Logger,
    ) -> Self {
        Self {
            http,
            registry_host,
            repository,
            access,
            credential,
            inner: Arc::new(TokenManagerInner {
                state: Mutex::new(AuthState::Unauthenticated),
                refreshes: AtomicU32::new(0),
            }),
            output,
        }
    }

    /// Current `Authorization` header value, if any.
    pub async fn authorization(&self) -> Option<String> {
        match &*self.inner.state.lock().await {
            AuthState::Unauthenticated => None,
            AuthState::Basic => self.basic_header(),
            AuthState::Bearer { token, .. } => Some(format!("Bearer {}", token)),
        }
    }

    fn basic_header(&self) -> Option<String> {
        match &self.credential {
            Some(Credential::Basic { username, password }) => Some(format!(
                "Basic {}",
                BASE64_STANDARD.encode(format!("{}:{}", username, password))
            )),
            _ => None,
        }
    }

    /// React to a 401: parse the challenge and advance the state machine.
    /// Returns the header value to retry with.
    ///
    /// Caller convention: one in-place retry per 401. The refresh budget
    /// bounds how often this can loop across the client's lifetime.
    pub async fn handle_unauthorized(&self, www_authenticate: Option<&str>) -> Result<String> {
        let challenge = match www_authenticate {
            Some(header) => AuthChallenge::parse(header)?,
            None => {
                return Err(self.unauthorized(www_authenticate));
            }
        };

        let mut state = self.inner.state.lock().await;

        // Only re-authentication while already holding a bearer token counts
        // against the refresh budget; the initial exchange is free.
        if matches!(*state, AuthState::Bearer { .. })
            && self.inner.refreshes.fetch_add(1, Ordering::SeqCst) >= MAX_TOKEN_REFRESHES
        {
            self.output.warning(&format!(
                "authentication against {} keeps expiring; giving up after {} refreshes",
                self.registry_host, MAX_TOKEN_REFRESHES
            ));
            return Err(self.unauthorized(www_authenticate));
        }

        match challenge {
            AuthChallenge::Basic { .. } => {
                // Already answering with basic auth and still 401 → fatal.
                if *state == AuthState::Basic {
                    return Err(self.unauthorized(www_authenticate));
                }
                let header = self
                    .basic_header()
                    .ok_or_else(|| self.unauthorized(www_authenticate))?;
                *state = AuthState::Basic;
                Ok(header)
            }
            bearer @ AuthChallenge::Bearer { .. } => {
                let scope = repository_scope(&self.repository, self.access);
                let token = fetch_token(
                    &self.http,
                    &bearer,
                    &self.registry_host,
                    &scope,
                    self.credential.as_ref(),
                    &self.output,
                )
                .await?;
                let generation = match &*state {
                    AuthState::Bearer { generation, .. } => generation + 1,
                    _ => 1,
                };
                *state = AuthState::Bearer {
                    token: token.clone(),
                    generation,
                };
                Ok(format!("Bearer {}", token))
            }
        }
    }

    /// Whether another caller refreshed since `seen` was read; those callers
    /// should reuse the new token instead of burning a refresh.
    pub async fn refreshed_since(&self, seen: Option<&str>) -> Option<String> {
        match (&*self.inner.state.lock().await, seen) {
            (AuthState::Bearer { token, .. }, Some(previous)) => {
                let current = format!("Bearer {}", token);
                (current != previous).then_some(current)
            }
            (AuthState::Bearer { token, .. }, None) => Some(format!("Bearer {}", token)),
            _ => None,
        }
    }

    pub fn refresh_count(&self) -> u32 {
        self.inner.refreshes.load(Ordering::SeqCst)
    }

    fn unauthorized(&self, www_authenticate: Option<&str>) -> BuilderError {
        BuilderError::Unauthorized {
            registry: self.registry_host.clone(),
            challenge: www_authenticate.map(|h| h.to_string()),
        }
    }
}
