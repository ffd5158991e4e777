/// Errors surfaced by the relying-party engine.
///
/// Every provider or store failure is translated into one of these kinds at
/// the component boundary, so the HTTP layer can map them to status codes
/// without inspecting provider payloads.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Missing or malformed configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Callback presented an unknown, expired or already consumed `state`.
    #[error("invalid or expired authorization state")]
    InvalidState,

    /// Authorization code exchange failed.
    #[error("token exchange failed: {0}")]
    TokenExchange(#[from] ExchangeError),

    /// ID token failed verification.
    #[error("ID token verification failed: {0}")]
    Verification(#[from] VerificationError),

    /// Session could not be refreshed; the user has to log in again.
    #[error("session refresh failed: {0}")]
    Refresh(#[from] RefreshError),

    /// The pending-login or session table is full.
    #[error("capacity exceeded: {0}")]
    Capacity(&'static str),

    /// No live session exists for the given id.
    #[error("session not found")]
    SessionNotFound,

    /// Backing store failure other than capacity.
    #[error("store error: {0}")]
    Store(String),
}

/// Token endpoint failures.
///
/// [`is_transient`](Self::is_transient) separates failures worth retrying
/// (timeouts, connection errors, 5xx) from terminal rejections.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum ExchangeError {
    /// The provider answered 4xx. `error` is the OAuth2 error code.
    #[error("provider rejected the request ({status}): {error}")]
    Rejected {
        status: u16,
        error: String,
        description: Option<String>,
    },

    /// The provider answered 5xx.
    #[error("provider unavailable ({status})")]
    Unavailable { status: u16 },

    #[error("provider request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    /// The success response could not be turned into a token set.
    #[error("malformed token response: {0}")]
    Malformed(String),

    #[error("token response is missing id_token")]
    MissingIdToken,
}

impl ExchangeError {
    /// Whether retrying the same request could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::Timeout | Self::Transport(_)
        )
    }

    /// OAuth2 error code returned by the provider, if any.
    #[must_use]
    pub fn provider_error(&self) -> Option<&str> {
        match self {
            Self::Rejected { error, .. } => Some(error),
            _ => None,
        }
    }

    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(e.without_url().to_string())
        }
    }
}

/// ID token verification failures, one variant per check.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum VerificationError {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("no signing key matches kid {0:?}")]
    UnknownKey(Option<String>),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("issuer mismatch: got {actual:?}")]
    IssuerMismatch { actual: String },

    #[error("audience does not contain the client id")]
    AudienceMismatch,

    #[error("token expired")]
    Expired,

    #[error("nonce mismatch")]
    NonceMismatch,

    #[error("missing claim: {0}")]
    MissingClaim(&'static str),

    #[error("signing keys unavailable: {0}")]
    KeySetUnavailable(String),

    #[error("timed out fetching signing keys")]
    Timeout,
}

/// Refresh failures.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum RefreshError {
    #[error("session has no refresh token")]
    NoRefreshToken,

    #[error("refresh token expired")]
    Expired,

    /// The provider refused the refresh token (revoked, reused, session ended).
    #[error("refresh token rejected: {0}")]
    Rejected(String),

    /// Transient provider failure; the session is kept.
    #[error("provider unavailable: {0}")]
    Unavailable(ExchangeError),
}

/// Failures reported by a pending-state or session backend.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("store is full")]
    Full,

    /// An entry with the same key is already live.
    #[error("key already present")]
    Conflict,

    #[error("backend error: {0}")]
    Backend(String),
}

impl Error {
    pub(crate) fn from_store(e: StoreError, what: &'static str) -> Self {
        match e {
            StoreError::Full => Self::Capacity(what),
            other => Self::Store(other.to_string()),
        }
    }
}
