//! The relying-party engine: login, callback, logout.

use std::sync::{Arc, Weak};

use time::Duration;
use tokio::task::JoinHandle;
use url::Url;

use crate::authorize;
use crate::config::ClientConfig;
use crate::error::Error;
use crate::jwks::JwksCache;
use crate::logout;
use crate::oauth::{RetryPolicy, TokenClient, TokenSet, default_http_client};
use crate::pending::{MemoryPendingStore, PendingRequests, PendingStore};
use crate::session::{MemorySessionStore, SessionManager, SessionStore};
use crate::token::{IdTokenClaims, IdTokenVerifier};
use crate::types::{SessionId, Subject};

/// Where to send the browser to start a login.
#[derive(Debug, Clone)]
pub struct LoginRedirect {
    pub url: Url,
    /// The registered `state` value, for correlation in logs and tests.
    pub state: String,
}

/// Tokens from a successful code exchange, before ID token verification.
#[derive(Debug)]
pub struct CodeExchange {
    pub tokens: TokenSet,
    /// Nonce the ID token must carry.
    pub nonce: String,
    pub return_to: Option<String>,
}

/// A completed login.
#[derive(Debug)]
pub struct LoginOutcome {
    pub session_id: SessionId,
    pub subject: Subject,
    pub claims: IdTokenClaims,
    pub return_to: Option<String>,
}

/// Keycloak relying party.
///
/// Owns the pending-login table, the session manager, the token endpoint
/// client and the ID token verifier. Share it behind an [`Arc`].
///
/// # Example
///
/// ```rust,ignore
/// let config = ClientConfig::from_env()?;
/// let rp = Arc::new(RelyingParty::new(config)?);
///
/// let redirect = rp.begin_login(None).await?;
/// // ... browser returns to /callback?code=..&state=..
/// let outcome = rp.complete_login(&code, &state).await?;
/// ```
pub struct RelyingParty<P = MemoryPendingStore, S = MemorySessionStore> {
    config: Arc<ClientConfig>,
    pending: PendingRequests<P>,
    sessions: SessionManager<S>,
    client: Arc<TokenClient>,
    verifier: IdTokenVerifier,
}

impl RelyingParty {
    /// Relying party with in-memory stores and default timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        Self::builder(config).build()
    }

    #[must_use]
    pub fn builder(config: ClientConfig) -> RelyingPartyBuilder {
        RelyingPartyBuilder {
            config,
            pending: MemoryPendingStore::new(),
            sessions: MemorySessionStore::new(),
            pending_ttl: None,
            session_ttl: None,
            http: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl<P: PendingStore, S: SessionStore> RelyingParty<P, S> {
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn pending(&self) -> &PendingRequests<P> {
        &self.pending
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionManager<S> {
        &self.sessions
    }

    #[must_use]
    pub fn token_client(&self) -> &TokenClient {
        &self.client
    }

    #[must_use]
    pub fn verifier(&self) -> &IdTokenVerifier {
        &self.verifier
    }

    /// Register a login attempt and build the provider redirect.
    ///
    /// `return_to` is kept only if it is a same-origin path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Capacity`] if too many logins are pending.
    pub async fn begin_login(&self, return_to: Option<&str>) -> Result<LoginRedirect, Error> {
        let request = self.pending.generate(return_to).await?;
        let url = authorize::authorization_url_for(&self.config, &request);
        tracing::debug!("Login started");
        Ok(LoginRedirect {
            url,
            state: request.state,
        })
    }

    /// Consume `state` and exchange `code` for tokens.
    ///
    /// The pending request is consumed before any network call, so an
    /// unknown or replayed `state` never reaches the token endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] or [`Error::TokenExchange`].
    pub async fn exchange(&self, code: &str, state: &str) -> Result<CodeExchange, Error> {
        let request = self.pending.consume(state).await?;
        let tokens = self.client.exchange_code(code, &request).await?;
        let request = request.into_inner();
        Ok(CodeExchange {
            tokens,
            nonce: request.nonce,
            return_to: request.return_to,
        })
    }

    /// Finish a login: consume state, exchange the code, verify the ID token
    /// and create a session.
    ///
    /// Nothing is stored unless every step succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`], [`Error::TokenExchange`],
    /// [`Error::Verification`] or [`Error::Capacity`].
    pub async fn complete_login(&self, code: &str, state: &str) -> Result<LoginOutcome, Error> {
        let exchange = self.exchange(code, state).await?;
        let claims = self
            .verifier
            .verify(exchange.tokens.id_token(), &exchange.nonce)
            .await
            .inspect_err(|e| tracing::warn!(error = %e, "ID token rejected"))?;

        let subject = Subject(claims.sub.clone());
        let session_id = self.sessions.create(subject.clone(), exchange.tokens).await?;
        tracing::info!(subject = %subject, "Login completed");

        Ok(LoginOutcome {
            session_id,
            subject,
            claims,
            return_to: exchange.return_to,
        })
    }

    /// Destroy the session (if any) and build the provider logout URL.
    ///
    /// Always returns a usable URL. Without a live session the URL carries no
    /// `id_token_hint`; store failures are logged and do not block logout.
    pub async fn logout(&self, session_id: Option<&SessionId>) -> Url {
        let removed = match session_id {
            Some(id) => match self.sessions.destroy(id).await {
                Ok(removed) => removed,
                Err(e) => {
                    tracing::warn!(error = %e, "Session removal failed during logout");
                    None
                }
            },
            None => None,
        };

        if let Some(session) = &removed {
            tracing::info!(subject = %session.subject(), "Session ended by logout");
        }
        let hint = removed.as_ref().map(|session| session.tokens().id_token());
        logout::build_logout_url(&self.config, hint)
    }

    /// Purge expired pending logins and idle sessions once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] on backend failure.
    pub async fn sweep(&self) -> Result<(usize, usize), Error> {
        let pending = self.pending.purge_expired().await?;
        let sessions = self.sessions.purge_idle().await?;
        Ok((pending, sessions))
    }

    /// Run [`sweep`](Self::sweep) every `period` on the Tokio runtime.
    ///
    /// The task holds a weak reference and exits once the relying party is
    /// dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: std::time::Duration) -> JoinHandle<()> {
        let rp: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(rp) = rp.upgrade() else {
                    break;
                };
                match rp.sweep().await {
                    Ok((0, 0)) => {}
                    Ok((pending, sessions)) => {
                        tracing::debug!(pending, sessions, "Swept expired entries");
                    }
                    Err(e) => tracing::warn!(error = %e, "Sweep failed"),
                }
            }
        })
    }
}

/// Builder for [`RelyingParty`] with custom stores or timeouts.
pub struct RelyingPartyBuilder<P = MemoryPendingStore, S = MemorySessionStore> {
    config: ClientConfig,
    pending: P,
    sessions: S,
    pending_ttl: Option<Duration>,
    session_ttl: Option<Duration>,
    http: Option<reqwest::Client>,
    retry: RetryPolicy,
}

impl<P: PendingStore, S: SessionStore> RelyingPartyBuilder<P, S> {
    #[must_use]
    pub fn pending_store<P2: PendingStore>(self, store: P2) -> RelyingPartyBuilder<P2, S> {
        RelyingPartyBuilder {
            config: self.config,
            pending: store,
            sessions: self.sessions,
            pending_ttl: self.pending_ttl,
            session_ttl: self.session_ttl,
            http: self.http,
            retry: self.retry,
        }
    }

    #[must_use]
    pub fn session_store<S2: SessionStore>(self, store: S2) -> RelyingPartyBuilder<P, S2> {
        RelyingPartyBuilder {
            config: self.config,
            pending: self.pending,
            sessions: store,
            pending_ttl: self.pending_ttl,
            session_ttl: self.session_ttl,
            http: self.http,
            retry: self.retry,
        }
    }

    /// How long a login may stay pending (default 10 minutes).
    #[must_use]
    pub fn pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = Some(ttl);
        self
    }

    /// Session idle timeout (default 30 minutes).
    #[must_use]
    pub fn session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = Some(ttl);
        self
    }

    /// HTTP client for the token and JWKS endpoints.
    #[must_use]
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http = Some(client);
        self
    }

    #[must_use]
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be built.
    pub fn build(self) -> Result<RelyingParty<P, S>, Error> {
        let http = match self.http {
            Some(http) => http,
            None => default_http_client()?,
        };
        let config = Arc::new(self.config);

        let client = Arc::new(
            TokenClient::new(config.clone())?
                .with_http_client(http.clone())
                .with_retry_policy(self.retry),
        );
        let jwks = Arc::new(JwksCache::new(http, config.jwks_uri()));
        let verifier = IdTokenVerifier::new(config.clone(), jwks);

        let mut pending = PendingRequests::new(self.pending);
        if let Some(ttl) = self.pending_ttl {
            pending = pending.with_ttl(ttl);
        }
        let mut sessions =
            SessionManager::new(self.sessions, client.clone()).with_clock_skew(config.clock_skew());
        if let Some(ttl) = self.session_ttl {
            sessions = sessions.with_idle_ttl(ttl);
        }

        tracing::debug!(issuer = %config.issuer(), "Relying party configured");
        Ok(RelyingParty {
            config,
            pending,
            sessions,
            client,
            verifier,
        })
    }
}
