use axum::http::StatusCode;
use axum::http::header::CACHE_CONTROL;
use axum::response::{Html, IntoResponse, Response};

use crate::error::{Error, RefreshError};

const FAILURE_PAGE: &str = "<!doctype html>\n<html><head><title>Authentication failed</title></head>\
<body><h1>Authentication failed</h1><p><a href=\"/login\">Log in again</a></p></body></html>\n";

/// Authentication errors for the HTTP layer.
///
/// Every variant renders the same generic page; only the status code
/// differs. Detail is logged, never sent to the browser.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No session cookie.
    #[error("Not authenticated")]
    Unauthenticated,

    /// Session cookie present but the session is gone or unrefreshable.
    #[error("Session expired")]
    SessionExpired,

    /// Callback without an authorization code.
    #[error("Missing authorization code")]
    MissingCode,

    /// Unknown, expired or replayed `state`.
    #[error("Invalid authorization state")]
    InvalidState,

    /// The provider redirected back with `?error=`, or refused the code.
    #[error("Login rejected: {0}")]
    Rejected(String),

    /// ID token failed verification.
    #[error("ID token rejected: {0}")]
    Forbidden(String),

    /// Provider unreachable or failing.
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// Too many pending logins or sessions.
    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    /// Store failure.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AuthError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingCode => StatusCode::BAD_REQUEST,
            Self::Unauthenticated | Self::SessionExpired | Self::InvalidState | Self::Rejected(_) => {
                StatusCode::UNAUTHORIZED
            }
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Unavailable(_) => StatusCode::BAD_GATEWAY,
            Self::Capacity(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) | Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Auth internal error");
        } else {
            tracing::warn!(error = %self, status = status.as_u16(), "Authentication failed");
        }
        (status, [(CACHE_CONTROL, "no-store")], Html(FAILURE_PAGE)).into_response()
    }
}

impl From<Error> for AuthError {
    fn from(e: Error) -> Self {
        match e {
            Error::InvalidState => Self::InvalidState,
            Error::SessionNotFound => Self::SessionExpired,
            Error::TokenExchange(e) if e.is_transient() => Self::Unavailable(e.to_string()),
            Error::TokenExchange(e) => Self::Rejected(e.to_string()),
            Error::Verification(e) => Self::Forbidden(e.to_string()),
            Error::Refresh(RefreshError::Unavailable(e)) => Self::Unavailable(e.to_string()),
            Error::Refresh(e) => {
                tracing::info!(cause = %e, "Session can no longer be refreshed");
                Self::SessionExpired
            }
            Error::Capacity(what) => Self::Capacity(what.to_string()),
            Error::Config(msg) => Self::Config(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}
