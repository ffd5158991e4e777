//! Plug-and-play Keycloak login for Axum.
//!
//! Mounts `/login`, `/callback`, `/logout` and `/token/refresh` on top of a
//! [`RelyingParty`](crate::RelyingParty) and provides the [`AuthSession`]
//! extractor for your own handlers.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use keycloak_rp::{ClientConfig, RelyingParty};
//! use keycloak_rp::middleware::{AuthSession, AuthState, RpAuthConfig, auth_routes};
//!
//! let rp = Arc::new(RelyingParty::new(ClientConfig::from_env()?)?);
//! let state = AuthState::new(rp, RpAuthConfig::from_env()?);
//!
//! let app = axum::Router::new()
//!     .route("/", get(home))
//!     .with_state(state.clone())
//!     .merge(auth_routes(state));
//!
//! async fn home(auth: Option<AuthSession>) -> String { /* ... */ }
//! ```

mod config;
mod cookies;
mod error;
mod extractor;
mod routes;
mod state;

pub use config::RpAuthConfig;
pub use error::AuthError;
pub use extractor::{AuthSession, resolve_session};
pub use routes::auth_routes;
pub use state::AuthState;

/// Re-export cookie key type for builder API.
pub use axum_extra::extract::cookie::Key as CookieKey;
