//! Pending authorization requests: issue-and-track, then check-and-consume.
//!
//! A login registers an [`AuthRequestState`] keyed by its `state` value.
//! The callback can only reach the token endpoint with a
//! [`ConsumedRequest`], and the only way to obtain one is
//! [`PendingRequests::consume`], which removes the entry atomically.

use std::future::Future;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::error::{Error, StoreError};
use crate::pkce;

const DEFAULT_PENDING_TTL_SECS: i64 = 600;
const DEFAULT_PENDING_CAPACITY: usize = 10_000;
const MAX_RETURN_TO_LEN: usize = 2048;

/// Server-side record of one in-flight login attempt.
#[derive(Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct AuthRequestState {
    pub state: String,
    pub nonce: String,
    pub code_verifier: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Same-origin path to land on after login.
    pub return_to: Option<String>,
}

impl AuthRequestState {
    pub(crate) fn generate(return_to: Option<&str>, now: OffsetDateTime) -> Self {
        Self {
            state: pkce::generate_state(),
            nonce: pkce::generate_nonce(),
            code_verifier: pkce::generate_code_verifier(),
            created_at: now,
            return_to: return_to.and_then(sanitize_return_to),
        }
    }

    /// S256 PKCE challenge derived from the stored verifier.
    #[must_use]
    pub fn code_challenge(&self) -> String {
        pkce::generate_code_challenge(&self.code_verifier)
    }

    #[must_use]
    pub fn is_expired(&self, ttl: Duration, now: OffsetDateTime) -> bool {
        self.created_at + ttl <= now
    }
}

impl std::fmt::Debug for AuthRequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRequestState")
            .field("created_at", &self.created_at)
            .field("return_to", &self.return_to)
            .finish_non_exhaustive()
    }
}

/// A pending request that has been removed from the store.
///
/// Holding one proves the callback's `state` was issued by this server,
/// has not expired, and has not been used before.
#[derive(Debug)]
pub struct ConsumedRequest(AuthRequestState);

impl ConsumedRequest {
    #[must_use]
    pub fn nonce(&self) -> &str {
        &self.0.nonce
    }

    #[must_use]
    pub fn code_verifier(&self) -> &str {
        &self.0.code_verifier
    }

    #[must_use]
    pub fn return_to(&self) -> Option<&str> {
        self.0.return_to.as_deref()
    }

    #[must_use]
    pub fn into_inner(self) -> AuthRequestState {
        self.0
    }
}

/// Backing table for pending authorization requests.
///
/// Implement this for a shared store (Redis, a database) to run several
/// instances behind a load balancer. `take` must be an atomic
/// check-and-delete: two concurrent calls with the same `state` must not
/// both return the entry.
pub trait PendingStore: Send + Sync + 'static {
    /// Register a request. Fails with [`StoreError::Conflict`] if the state
    /// value is already pending, or [`StoreError::Full`] at capacity.
    fn insert(
        &self,
        request: AuthRequestState,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Remove and return the request registered under `state`.
    fn take(
        &self,
        state: &str,
    ) -> impl Future<Output = Result<Option<AuthRequestState>, StoreError>> + Send;

    /// Drop every request created before `cutoff`. Returns the count removed.
    fn purge_created_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> impl Future<Output = Result<usize, StoreError>> + Send;
}

/// In-process [`PendingStore`] on a sharded concurrent map.
pub struct MemoryPendingStore {
    entries: DashMap<String, AuthRequestState>,
    capacity: usize,
}

impl MemoryPendingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_PENDING_CAPACITY)
    }

    /// Limit the number of concurrently pending logins.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryPendingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingStore for MemoryPendingStore {
    async fn insert(&self, request: AuthRequestState) -> Result<(), StoreError> {
        if self.entries.len() >= self.capacity {
            return Err(StoreError::Full);
        }
        match self.entries.entry(request.state.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict),
            Entry::Vacant(slot) => {
                slot.insert(request);
                Ok(())
            }
        }
    }

    async fn take(&self, state: &str) -> Result<Option<AuthRequestState>, StoreError> {
        Ok(self.entries.remove(state).map(|(_, request)| request))
    }

    async fn purge_created_before(&self, cutoff: OffsetDateTime) -> Result<usize, StoreError> {
        let before = self.entries.len();
        self.entries.retain(|_, request| request.created_at > cutoff);
        Ok(before.saturating_sub(self.entries.len()))
    }
}

/// State/nonce generator and consumer on top of a [`PendingStore`].
pub struct PendingRequests<P> {
    store: P,
    ttl: Duration,
}

impl<P: PendingStore> PendingRequests<P> {
    #[must_use]
    pub fn new(store: P) -> Self {
        Self {
            store,
            ttl: Duration::seconds(DEFAULT_PENDING_TTL_SECS),
        }
    }

    /// How long a login attempt may stay pending (default 10 minutes).
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn store(&self) -> &P {
        &self.store
    }

    /// Generate a fresh state/nonce pair and register it as pending.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Capacity`] if the store stays full after expired
    /// entries are purged, or [`Error::Store`] on backend failure.
    pub async fn generate(&self, return_to: Option<&str>) -> Result<AuthRequestState, Error> {
        let mut purged = false;
        let mut attempts = 0;
        loop {
            let request = AuthRequestState::generate(return_to, OffsetDateTime::now_utc());
            match self.store.insert(request.clone()).await {
                Ok(()) => return Ok(request),
                Err(StoreError::Conflict) if attempts < 3 => attempts += 1,
                Err(StoreError::Full) if !purged => {
                    purged = true;
                    let removed = self.purge_expired().await?;
                    tracing::debug!(removed, "Pending store full, purged expired requests");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to register authorization request");
                    return Err(Error::from_store(e, "pending logins"));
                }
            }
        }
    }

    /// Atomically remove the request for `state`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if `state` is unknown, already
    /// consumed, or expired.
    pub async fn consume(&self, state: &str) -> Result<ConsumedRequest, Error> {
        if state.is_empty() {
            return Err(Error::InvalidState);
        }
        let request = self
            .store
            .take(state)
            .await
            .map_err(|e| Error::from_store(e, "pending logins"))?
            .ok_or(Error::InvalidState)?;

        if request.is_expired(self.ttl, OffsetDateTime::now_utc()) {
            tracing::debug!("Authorization request expired before callback");
            return Err(Error::InvalidState);
        }
        Ok(ConsumedRequest(request))
    }

    /// Drop requests older than the TTL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] on backend failure.
    pub async fn purge_expired(&self) -> Result<usize, Error> {
        let cutoff = OffsetDateTime::now_utc() - self.ttl;
        self.store
            .purge_created_before(cutoff)
            .await
            .map_err(|e| Error::from_store(e, "pending logins"))
    }
}

/// Accept only same-origin absolute paths (`/dashboard?tab=1`).
fn sanitize_return_to(raw: &str) -> Option<String> {
    let valid = raw.len() <= MAX_RETURN_TO_LEN
        && raw.starts_with('/')
        && !raw.starts_with("//")
        && !raw.starts_with("/\\")
        && !raw.chars().any(char::is_control);
    valid.then(|| raw.to_string())
}
