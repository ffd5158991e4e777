use std::sync::Arc;

use axum::extract::FromRef;
use axum_extra::extract::cookie::Key;

use super::config::{AuthSettings, RpAuthConfig};
use crate::engine::RelyingParty;
use crate::pending::{MemoryPendingStore, PendingStore};
use crate::session::{MemorySessionStore, SessionStore};

/// Shared state for the auth routes and the [`AuthSession`](super::AuthSession)
/// extractor.
pub struct AuthState<P = MemoryPendingStore, S = MemorySessionStore> {
    pub(super) rp: Arc<RelyingParty<P, S>>,
    pub(super) settings: AuthSettings,
}

impl<P: PendingStore, S: SessionStore> AuthState<P, S> {
    #[must_use]
    pub fn new(rp: Arc<RelyingParty<P, S>>, config: RpAuthConfig) -> Self {
        Self {
            rp,
            settings: config.settings,
        }
    }

    #[must_use]
    pub fn relying_party(&self) -> &Arc<RelyingParty<P, S>> {
        &self.rp
    }
}

// Manual Clone: avoid derive adding `P: Clone, S: Clone` bounds.
impl<P, S> Clone for AuthState<P, S> {
    fn clone(&self) -> Self {
        Self {
            rp: self.rp.clone(),
            settings: self.settings.clone(),
        }
    }
}

// PrivateCookieJar requires Key to be extractable from state
impl<P: PendingStore, S: SessionStore> FromRef<AuthState<P, S>> for Key {
    fn from_ref(state: &AuthState<P, S>) -> Self {
        state.settings.cookie_key.clone()
    }
}
