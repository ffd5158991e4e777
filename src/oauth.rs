use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::config::ClientConfig;
use crate::error::{Error, ExchangeError};
use crate::pending::ConsumedRequest;

const DEFAULT_EXPIRES_IN_SECS: i64 = 300;
const DEFAULT_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
const DEFAULT_REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Tokens issued by the provider for one grant.
///
/// Immutable: a refresh produces a new `TokenSet` and the session swaps it in
/// whole.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    access_token: String,
    refresh_token: Option<String>,
    id_token: String,
    #[serde(with = "time::serde::rfc3339")]
    expires_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    refresh_expires_at: Option<OffsetDateTime>,
    token_type: String,
    scope: Option<String>,
}

impl TokenSet {
    /// Create a bearer token set with no refresh token.
    #[must_use]
    pub fn new(
        access_token: impl Into<String>,
        id_token: impl Into<String>,
        expires_at: OffsetDateTime,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            id_token: id_token.into(),
            expires_at,
            refresh_expires_at: None,
            token_type: "Bearer".into(),
            scope: None,
        }
    }

    #[must_use]
    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_refresh_expires_at(mut self, at: OffsetDateTime) -> Self {
        self.refresh_expires_at = Some(at);
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    #[must_use]
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    #[must_use]
    pub fn id_token(&self) -> &str {
        &self.id_token
    }

    #[must_use]
    pub fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }

    #[must_use]
    pub fn refresh_expires_at(&self) -> Option<OffsetDateTime> {
        self.refresh_expires_at
    }

    #[must_use]
    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Whether the access token is expired, or will be within `skew`.
    #[must_use]
    pub fn is_access_expired(&self, now: OffsetDateTime, skew: Duration) -> bool {
        self.expires_at - skew <= now
    }

    /// Whether the refresh token is known to have expired.
    #[must_use]
    pub fn is_refresh_expired(&self, now: OffsetDateTime) -> bool {
        self.refresh_expires_at.is_some_and(|at| at <= now)
    }
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Token response from the Keycloak token endpoint.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    refresh_expires_in: Option<i64>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    /// Build a token set. `previous` supplies the tokens a refresh response
    /// may omit (ID token, rotated-away refresh token).
    fn into_token_set(
        self,
        issued_at: OffsetDateTime,
        previous: Option<&TokenSet>,
    ) -> Result<TokenSet, ExchangeError> {
        if !self.token_type.eq_ignore_ascii_case("bearer") {
            return Err(ExchangeError::Malformed(format!(
                "unsupported token_type {:?}",
                self.token_type
            )));
        }
        if self.access_token.is_empty() {
            return Err(ExchangeError::Malformed("empty access_token".into()));
        }

        let id_token = match (self.id_token, previous) {
            (Some(token), _) if !token.is_empty() => token,
            (_, Some(prev)) => prev.id_token.clone(),
            _ => return Err(ExchangeError::MissingIdToken),
        };

        let expires_in = self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS).max(0);
        // Keycloak reports 0 for offline tokens that never expire.
        let refresh_expires_at = self
            .refresh_expires_in
            .filter(|secs| *secs > 0)
            .map(|secs| lifetime_end(issued_at, secs, "refresh_expires_in"))
            .transpose()?;
        let expires_at = lifetime_end(issued_at, expires_in, "expires_in")?;

        let (refresh_token, refresh_expires_at) = match (self.refresh_token, previous) {
            (Some(token), _) => (Some(token), refresh_expires_at),
            (None, Some(prev)) => (prev.refresh_token.clone(), prev.refresh_expires_at),
            (None, None) => (None, None),
        };

        Ok(TokenSet {
            access_token: self.access_token,
            refresh_token,
            id_token,
            expires_at,
            refresh_expires_at,
            token_type: self.token_type,
            scope: self.scope,
        })
    }
}

fn lifetime_end(
    issued_at: OffsetDateTime,
    secs: i64,
    field: &str,
) -> Result<OffsetDateTime, ExchangeError> {
    issued_at
        .checked_add(Duration::seconds(secs))
        .ok_or_else(|| ExchangeError::Malformed(format!("{field} out of range")))
}

/// OAuth2 error body (RFC 6749 §5.2).
#[derive(Deserialize)]
struct ProviderError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Bounded exponential backoff for transient token endpoint failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: std::time::Duration,
    pub max_delay: std::time::Duration,
}

impl RetryPolicy {
    /// Never retry.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: std::time::Duration::from_millis(200),
            max_delay: std::time::Duration::from_secs(2),
        }
    }
}

/// Client for the Keycloak token endpoint.
///
/// Authenticates with `client_secret_post`. The secret only ever travels in
/// the form body; it is not logged and not part of any error.
pub struct TokenClient {
    config: Arc<ClientConfig>,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl TokenClient {
    /// Create a client with 5s connect / 10s total timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be built.
    pub fn new(config: Arc<ClientConfig>) -> Result<Self, Error> {
        Ok(Self {
            config,
            http: default_http_client()?,
            retry: RetryPolicy::default(),
        })
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Exchange an authorization code for tokens.
    ///
    /// Takes a [`ConsumedRequest`], so this cannot be called before the
    /// callback's `state` has been validated and consumed.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::Rejected`] if the provider refuses the code,
    /// [`ExchangeError::MissingIdToken`] if the response has no ID token, or a
    /// transient variant once retries are exhausted.
    pub async fn exchange_code(
        &self,
        code: &str,
        request: &ConsumedRequest,
    ) -> Result<TokenSet, ExchangeError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri().as_str()),
            ("client_id", self.config.client_id()),
            ("client_secret", self.config.client_secret()),
            ("code_verifier", request.code_verifier()),
        ];

        let issued_at = OffsetDateTime::now_utc();
        let response = self.post_form(&params, "token exchange").await?;
        response.into_token_set(issued_at, None)
    }

    /// Redeem the refresh token of `current` for a new token set.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::Rejected`] (typically `invalid_grant`) if the
    /// refresh token is no longer valid, or a transient variant once retries
    /// are exhausted.
    pub async fn refresh(&self, current: &TokenSet) -> Result<TokenSet, ExchangeError> {
        let refresh_token = current.refresh_token().ok_or_else(|| ExchangeError::Rejected {
            status: 400,
            error: "invalid_grant".into(),
            description: Some("no refresh token".into()),
        })?;

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id()),
            ("client_secret", self.config.client_secret()),
        ];

        let issued_at = OffsetDateTime::now_utc();
        let response = self.post_form(&params, "token refresh").await?;
        response.into_token_set(issued_at, Some(current))
    }

    async fn post_form(
        &self,
        params: &[(&str, &str)],
        operation: &'static str,
    ) -> Result<TokenResponse, ExchangeError> {
        let mut attempt = 0;
        loop {
            match self.post_form_once(params).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    attempt += 1;
                    tracing::warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient token endpoint failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::warn!(operation, error = %e, "Token endpoint request failed");
                    return Err(e);
                }
            }
        }
    }

    async fn post_form_once(&self, params: &[(&str, &str)]) -> Result<TokenResponse, ExchangeError> {
        let response = self
            .http
            .post(self.config.token_endpoint())
            .form(params)
            .send()
            .await
            .map_err(ExchangeError::from_reqwest)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ExchangeError::Unavailable {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<ProviderError>(&body) {
                Ok(err) => ExchangeError::Rejected {
                    status: status.as_u16(),
                    error: err.error,
                    description: err.error_description,
                },
                Err(_) => ExchangeError::Rejected {
                    status: status.as_u16(),
                    error: "unknown_error".into(),
                    description: None,
                },
            });
        }

        let body = response.bytes().await.map_err(ExchangeError::from_reqwest)?;
        serde_json::from_slice::<TokenResponse>(&body)
            .map_err(|e| ExchangeError::Malformed(e.to_string()))
    }
}

pub(crate) fn default_http_client() -> Result<reqwest::Client, Error> {
    reqwest::Client::builder()
        .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
        .timeout(DEFAULT_REQUEST_TIMEOUT)
        .build()
        .map_err(|e| Error::Config(format!("http client: {e}")))
}
