use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::http::header::{CACHE_CONTROL, LOCATION};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use axum_extra::extract::PrivateCookieJar;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::cookies;
use super::error::AuthError;
use super::state::AuthState;
use crate::pending::PendingStore;
use crate::session::{Session, SessionStore};

/// Create the relying party router.
///
/// | Route | |
/// |---|---|
/// | `GET /login` | 302 to Keycloak (`?return_to=/path` optional) |
/// | `GET /callback` | completes the login, sets the session cookie, 302 home |
/// | `GET /logout` | ends the session, 302 to Keycloak's end-session endpoint |
/// | `POST /token/refresh` | refreshes the session's tokens, returns metadata |
pub fn auth_routes<P: PendingStore, S: SessionStore>(state: AuthState<P, S>) -> Router {
    Router::new()
        .route("/login", get(login::<P, S>))
        .route("/callback", get(callback::<P, S>))
        .route("/logout", get(logout::<P, S>))
        .route("/token/refresh", post(refresh::<P, S>))
        .with_state(state)
}

/// `302 Found` to `location`. Axum's `Redirect` only offers 303/307/308.
struct Found(String);

impl IntoResponse for Found {
    fn into_response(self) -> Response {
        (
            StatusCode::FOUND,
            [(LOCATION, self.0), (CACHE_CONTROL, "no-store".to_string())],
        )
            .into_response()
    }
}

// ── Login ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct LoginParams {
    return_to: Option<String>,
}

async fn login<P: PendingStore, S: SessionStore>(
    State(state): State<AuthState<P, S>>,
    Query(params): Query<LoginParams>,
) -> Result<Found, AuthError> {
    let redirect = state.rp.begin_login(params.return_to.as_deref()).await?;
    Ok(Found(redirect.url.into()))
}

// ── Callback ───────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

async fn callback<P: PendingStore, S: SessionStore>(
    State(state): State<AuthState<P, S>>,
    jar: PrivateCookieJar,
    Query(params): Query<CallbackParams>,
) -> Result<(PrivateCookieJar, Found), AuthError> {
    if let Some(error) = &params.error {
        let desc = params.error_description.as_deref().unwrap_or("none");
        tracing::warn!(error = %error, description = %desc, "OAuth2 error from Keycloak");
        // The attempt is over either way; do not leave it pending.
        if let Some(pending) = params.state.as_deref() {
            if state.rp.pending().consume(pending).await.is_ok() {
                tracing::debug!("Discarded pending login after provider error");
            }
        }
        return Err(AuthError::Rejected(error.clone()));
    }

    let code = params
        .code
        .filter(|code| !code.is_empty())
        .ok_or(AuthError::MissingCode)?;
    let received_state = params.state.ok_or(AuthError::InvalidState)?;

    let outcome = state.rp.complete_login(&code, &received_state).await?;

    let name = &state.settings.session_cookie_name;
    if let Some(previous) = cookies::get_session_id(&jar, name) {
        if let Err(e) = state.rp.sessions().destroy(&previous).await {
            tracing::warn!(error = %e, "Failed to drop previous session on re-login");
        }
    }

    let session_cookie =
        cookies::session_cookie(name, &outcome.session_id, state.settings.secure_cookies);

    tracing::info!(subject = %outcome.subject, "Keycloak login successful");

    let target = outcome
        .return_to
        .unwrap_or_else(|| state.settings.home_redirect.clone());
    Ok((jar.add(session_cookie), Found(target)))
}

// ── Logout ─────────────────────────────────────────────────────────

async fn logout<P: PendingStore, S: SessionStore>(
    State(state): State<AuthState<P, S>>,
    jar: PrivateCookieJar,
) -> (PrivateCookieJar, Found) {
    let name = &state.settings.session_cookie_name;
    let session_id = cookies::get_session_id(&jar, name);
    let end_session = state.rp.logout(session_id.as_ref()).await;

    let clear_cookie = cookies::clear_session_cookie(name);
    (jar.remove(clear_cookie), Found(end_session.into()))
}

// ── Refresh ────────────────────────────────────────────────────────

/// Token metadata returned by `POST /token/refresh`. Never the tokens.
#[derive(Debug, Serialize)]
struct RefreshResponse {
    token_type: String,
    #[serde(with = "time::serde::rfc3339")]
    expires_at: OffsetDateTime,
    scope: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    refreshed_at: Option<OffsetDateTime>,
}

impl From<&Session> for RefreshResponse {
    fn from(session: &Session) -> Self {
        let tokens = session.tokens();
        Self {
            token_type: tokens.token_type().to_string(),
            expires_at: tokens.expires_at(),
            scope: tokens.scope().map(str::to_owned),
            refreshed_at: session.last_refreshed_at(),
        }
    }
}

async fn refresh<P: PendingStore, S: SessionStore>(
    State(state): State<AuthState<P, S>>,
    jar: PrivateCookieJar,
) -> Response {
    let name = &state.settings.session_cookie_name;
    let Some(session_id) = cookies::get_session_id(&jar, name) else {
        return AuthError::Unauthenticated.into_response();
    };

    match state.rp.sessions().refresh(&session_id).await {
        Ok(session) => Json(RefreshResponse::from(&session)).into_response(),
        Err(e) => match AuthError::from(e) {
            AuthError::SessionExpired => {
                if let Err(e) = state.rp.sessions().destroy(&session_id).await {
                    tracing::warn!(error = %e, "Failed to drop session after refresh failure");
                }
                let clear_cookie = cookies::clear_session_cookie(name);
                (jar.remove(clear_cookie), AuthError::SessionExpired).into_response()
            }
            other => other.into_response(),
        },
    }
}
