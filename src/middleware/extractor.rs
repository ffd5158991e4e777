use axum::extract::{FromRequestParts, OptionalFromRequestParts};
use axum::http::request::Parts;
use axum_extra::extract::PrivateCookieJar;
use time::OffsetDateTime;

use super::cookies;
use super::error::AuthError;
use super::state::AuthState;
use crate::engine::RelyingParty;
use crate::error::Error;
use crate::pending::PendingStore;
use crate::session::SessionStore;
use crate::types::{SessionId, Subject};

/// Authenticated session extracted from the session cookie.
///
/// Use as an Axum extractor in route handlers. Returns `401 Unauthorized`
/// if no live session exists. Tokens stay on the server; handlers that need
/// an access token call
/// [`SessionManager::access_token`](crate::SessionManager::access_token).
///
/// # Example
///
/// ```rust,ignore
/// async fn protected(auth: AuthSession) -> impl IntoResponse {
///     format!("Hello, {}", auth.subject)
/// }
///
/// // Optional: accessible to both authenticated and anonymous users
/// async fn public(auth: Option<AuthSession>) -> impl IntoResponse {
///     match auth {
///         Some(a) => format!("Hello, {}", a.subject),
///         None => "Hello, guest".to_string(),
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct AuthSession {
    /// Session ID (from cookie).
    pub session_id: SessionId,
    /// `sub` claim of the verified ID token.
    pub subject: Subject,
    /// Access-token expiry of the current token set.
    pub expires_at: OffsetDateTime,
}

/// Look up the session named by the cookie `cookie_name` in `jar`.
///
/// Returns `Ok(None)` when there is no cookie or the session is gone.
///
/// # Errors
///
/// Returns [`AuthError::Internal`] on store failure.
pub async fn resolve_session<P: PendingStore, S: SessionStore>(
    rp: &RelyingParty<P, S>,
    jar: &PrivateCookieJar,
    cookie_name: &str,
) -> Result<Option<AuthSession>, AuthError> {
    let Some(session_id) = cookies::get_session_id(jar, cookie_name) else {
        return Ok(None);
    };

    match rp.sessions().get(&session_id).await {
        Ok(session) => Ok(Some(AuthSession {
            session_id,
            subject: session.subject().clone(),
            expires_at: session.tokens().expires_at(),
        })),
        Err(Error::SessionNotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl<P: PendingStore, S: SessionStore> FromRequestParts<AuthState<P, S>> for AuthSession {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AuthState<P, S>,
    ) -> Result<Self, Self::Rejection> {
        let jar = <PrivateCookieJar as FromRequestParts<_>>::from_request_parts(parts, state)
            .await
            .map_err(|_| AuthError::Unauthenticated)?;

        if jar.get(&state.settings.session_cookie_name).is_none() {
            return Err(AuthError::Unauthenticated);
        }
        resolve_session(state.rp.as_ref(), &jar, &state.settings.session_cookie_name)
            .await?
            .ok_or(AuthError::SessionExpired)
    }
}

impl<P: PendingStore, S: SessionStore> OptionalFromRequestParts<AuthState<P, S>> for AuthSession {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AuthState<P, S>,
    ) -> Result<Option<Self>, Self::Rejection> {
        let jar = <PrivateCookieJar as FromRequestParts<_>>::from_request_parts(parts, state)
            .await
            .map_err(|_| AuthError::Unauthenticated)?;
        resolve_session(state.rp.as_ref(), &jar, &state.settings.session_cookie_name).await
    }
}
