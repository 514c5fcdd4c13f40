use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::wire::{TokenError, TokenResponse};
use crate::{Result, SpfyError};

pub const DEFAULT_TOKEN_URL: &str = "https://accounts.spotify.com/api/token";

/// How the session was obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AuthFlow {
    /// User-delegated token; expiry must be resolved by the application.
    AuthorizationCode,
    /// App-only token that the client may fetch again on its own.
    ClientCredentials,
}

/// A bearer token and, when known, when it stops being valid.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub expires_at: Option<Instant>,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at: None,
        }
    }

    pub fn expiring_in(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(Instant::now() + ttl);
        self
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at <= Instant::now())
    }

    /// `Authorization` header value.
    pub fn authorization(&self) -> String {
        normalize_bearer_authorization(&self.access_token)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Session source consumed by the request executor.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    fn flow(&self) -> AuthFlow;

    fn is_authenticated(&self) -> bool;

    /// Identity whose usage counter is bumped, if any.
    fn user_id(&self) -> Option<String> {
        None
    }

    /// Current credentials; may be expired.
    async fn credentials(&self) -> Result<Credentials>;

    async fn reauthenticate(&self, flow: AuthFlow) -> Result<()>;
}

/// A fixed user-delegated token.
pub struct BearerToken {
    credentials: Credentials,
    user_id: Option<String>,
}

impl BearerToken {
    /// If the token is missing the `Bearer ` prefix, it is added when sent.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            credentials: Credentials::new(token),
            user_id: None,
        }
    }

    pub fn expiring_in(mut self, ttl: Duration) -> Self {
        self.credentials = self.credentials.expiring_in(ttl);
        self
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("credentials", &self.credentials)
            .field("user_id", &self.user_id)
            .finish()
    }
}

#[async_trait]
impl AuthProvider for BearerToken {
    fn flow(&self) -> AuthFlow {
        AuthFlow::AuthorizationCode
    }

    fn is_authenticated(&self) -> bool {
        !self.credentials.access_token.trim().is_empty()
    }

    fn user_id(&self) -> Option<String> {
        self.user_id.clone()
    }

    async fn credentials(&self) -> Result<Credentials> {
        Ok(self.credentials.clone())
    }

    async fn reauthenticate(&self, _flow: AuthFlow) -> Result<()> {
        Err(SpfyError::Auth(
            "a fixed bearer token cannot be refreshed".to_owned(),
        ))
    }
}

/// OAuth2 client-credentials grant.
pub struct ClientCredentials {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    token: RwLock<Option<Credentials>>,
}

impl ClientCredentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token_url: DEFAULT_TOKEN_URL.to_owned(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token: RwLock::new(None),
        }
    }

    /// Reads `SPFY_CLIENT_ID` and `SPFY_CLIENT_SECRET`.
    pub fn from_env() -> Result<Self> {
        let client_id = std::env::var("SPFY_CLIENT_ID")
            .map_err(|_| SpfyError::Config("missing SPFY_CLIENT_ID environment variable".to_owned()))?;
        let client_secret = std::env::var("SPFY_CLIENT_SECRET").map_err(|_| {
            SpfyError::Config("missing SPFY_CLIENT_SECRET environment variable".to_owned())
        })?;
        if client_id.trim().is_empty() || client_secret.trim().is_empty() {
            return Err(SpfyError::Config(
                "SPFY_CLIENT_ID and SPFY_CLIENT_SECRET must not be empty".to_owned(),
            ));
        }
        Ok(Self::new(client_id, client_secret))
    }

    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }

    /// Fetches a fresh token from the token endpoint.
    pub async fn authenticate(&self) -> Result<()> {
        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(SpfyError::Transport)?;

        let status = response.status();
        let body = response.text().await.map_err(SpfyError::Transport)?;
        if !status.is_success() {
            let reason = serde_json::from_str::<TokenError>(&body)
                .map(|err| match err.error_description {
                    Some(description) => format!("{}: {description}", err.error),
                    None => err.error,
                })
                .unwrap_or(body);
            return Err(SpfyError::Auth(format!(
                "token endpoint answered {}: {reason}",
                status.as_u16()
            )));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|err| SpfyError::Auth(format!("invalid token response: {err}")))?;
        let mut credentials = Credentials::new(token.access_token);
        if let Some(expires_in) = token.expires_in {
            credentials = credentials.expiring_in(Duration::from_secs(expires_in));
        }
        tracing::debug!(expires_in = ?token.expires_in, "obtained client-credentials token");
        *self.token.write() = Some(credentials);
        Ok(())
    }
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("authenticated", &self.token.read().is_some())
            .finish()
    }
}

#[async_trait]
impl AuthProvider for ClientCredentials {
    fn flow(&self) -> AuthFlow {
        AuthFlow::ClientCredentials
    }

    fn is_authenticated(&self) -> bool {
        self.token.read().is_some()
    }

    async fn credentials(&self) -> Result<Credentials> {
        self.token.read().clone().ok_or(SpfyError::AuthRequired)
    }

    async fn reauthenticate(&self, flow: AuthFlow) -> Result<()> {
        if flow != AuthFlow::ClientCredentials {
            return Err(SpfyError::Auth(format!(
                "cannot switch a client-credentials session to {flow:?}"
            )));
        }
        self.authenticate().await
    }
}

pub(crate) fn normalize_bearer_authorization(token: &str) -> String {
    let trimmed = token.trim();
    let prefix = trimmed.get(..7);
    if prefix.is_some_and(|value| value.eq_ignore_ascii_case("bearer ")) {
        trimmed.to_owned()
    } else {
        format!("Bearer {trimmed}")
    }
}
