//! Server-side sessions.
//!
//! [`SessionStore`] is the storage seam; [`MemorySessionStore`] is the
//! in-process implementation. [`SessionManager`] layers idle expiry and
//! refresh coordination on top of any store.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;

use crate::error::{Error, RefreshError, StoreError};
use crate::oauth::{TokenClient, TokenSet};
use crate::types::{SessionId, Subject};

const DEFAULT_SESSION_TTL_SECS: i64 = 30 * 60;
const DEFAULT_SESSION_CAPACITY: usize = 100_000;

/// An authenticated session and its current token set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    id: SessionId,
    subject: Subject,
    tokens: Arc<TokenSet>,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    last_refreshed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    last_accessed_at: OffsetDateTime,
    /// Bumped on every token replacement.
    generation: u64,
}

impl Session {
    fn new(id: SessionId, subject: Subject, tokens: TokenSet, now: OffsetDateTime) -> Self {
        Self {
            id,
            subject,
            tokens: Arc::new(tokens),
            created_at: now,
            last_refreshed_at: None,
            last_accessed_at: now,
            generation: 0,
        }
    }

    fn with_tokens(&self, tokens: TokenSet, now: OffsetDateTime) -> Self {
        Self {
            id: self.id.clone(),
            subject: self.subject.clone(),
            tokens: Arc::new(tokens),
            created_at: self.created_at,
            last_refreshed_at: Some(now),
            last_accessed_at: now,
            generation: self.generation + 1,
        }
    }

    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    #[must_use]
    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    /// The current token set. Shared, never mutated in place.
    #[must_use]
    pub fn tokens(&self) -> &Arc<TokenSet> {
        &self.tokens
    }

    #[must_use]
    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    #[must_use]
    pub fn last_refreshed_at(&self) -> Option<OffsetDateTime> {
        self.last_refreshed_at
    }

    #[must_use]
    pub fn last_accessed_at(&self) -> OffsetDateTime {
        self.last_accessed_at
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn is_idle(&self, ttl: Duration, now: OffsetDateTime) -> bool {
        self.last_accessed_at + ttl <= now
    }
}

/// Session persistence.
///
/// Implement this for a shared store to run several instances. The manager
/// serialises token replacement per session, so `replace` only needs to be
/// atomic per key; it must not resurrect a removed session.
///
/// # Example
///
/// ```rust,ignore
/// impl SessionStore for RedisSessions {
///     async fn insert(&self, session: Session) -> Result<(), StoreError> {
///         // SET key value NX EX ttl
///     }
///     // ...
/// }
/// ```
pub trait SessionStore: Send + Sync + 'static {
    /// Insert a new session. Fails with [`StoreError::Conflict`] if the id is
    /// taken, or [`StoreError::Full`] at capacity.
    fn insert(&self, session: Session) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Look up a session by id.
    fn get(
        &self,
        id: &SessionId,
    ) -> impl Future<Output = Result<Option<Session>, StoreError>> + Send;

    /// Replace a live session. Returns `false` if it no longer exists.
    fn replace(&self, session: Session) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Record activity. Returns `false` if the session no longer exists.
    fn touch(
        &self,
        id: &SessionId,
        at: OffsetDateTime,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Remove a session, returning it if it existed.
    fn remove(
        &self,
        id: &SessionId,
    ) -> impl Future<Output = Result<Option<Session>, StoreError>> + Send;

    /// Remove sessions not accessed since `cutoff`. Returns the count removed.
    fn purge_idle_since(
        &self,
        cutoff: OffsetDateTime,
    ) -> impl Future<Output = Result<usize, StoreError>> + Send;
}

/// In-process [`SessionStore`] on a sharded concurrent map.
pub struct MemorySessionStore {
    sessions: DashMap<SessionId, Session>,
    capacity: usize,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SESSION_CAPACITY)
    }

    /// Limit the number of live sessions. New logins are rejected at the
    /// limit; existing sessions are never evicted to make room.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            capacity,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: Session) -> Result<(), StoreError> {
        if self.sessions.len() >= self.capacity {
            return Err(StoreError::Full);
        }
        match self.sessions.entry(session.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict),
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    async fn get(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.get(id).map(|entry| entry.value().clone()))
    }

    async fn replace(&self, session: Session) -> Result<bool, StoreError> {
        match self.sessions.get_mut(&session.id) {
            Some(mut entry) => {
                *entry = session;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn touch(&self, id: &SessionId, at: OffsetDateTime) -> Result<bool, StoreError> {
        match self.sessions.get_mut(id) {
            Some(mut entry) => {
                entry.last_accessed_at = entry.last_accessed_at.max(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.remove(id).map(|(_, session)| session))
    }

    async fn purge_idle_since(&self, cutoff: OffsetDateTime) -> Result<usize, StoreError> {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| session.last_accessed_at > cutoff);
        Ok(before.saturating_sub(self.sessions.len()))
    }
}

/// Session lifecycle: create, get, refresh, destroy.
///
/// Sessions idle for longer than the TTL are evicted lazily when accessed
/// and eagerly by [`purge_idle`](Self::purge_idle). Refresh is serialised
/// per session id; concurrent callers share one provider round-trip.
pub struct SessionManager<S> {
    store: S,
    client: Arc<TokenClient>,
    idle_ttl: Duration,
    clock_skew: Duration,
    refresh_locks: DashMap<SessionId, Arc<RefreshFlight>>,
}

/// Per-session refresh coordination. `completed` only moves while `last` is
/// locked, so a waiter that saw an older count finds that attempt's outcome
/// in `last`.
#[derive(Default)]
struct RefreshFlight {
    completed: AtomicU64,
    last: Mutex<Option<Result<Session, RefreshError>>>,
}

impl<S: SessionStore> SessionManager<S> {
    #[must_use]
    pub fn new(store: S, client: Arc<TokenClient>) -> Self {
        Self {
            store,
            client,
            idle_ttl: Duration::seconds(DEFAULT_SESSION_TTL_SECS),
            clock_skew: Duration::ZERO,
            refresh_locks: DashMap::new(),
        }
    }

    /// Idle timeout (default 30 minutes).
    #[must_use]
    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = ttl;
        self
    }

    /// Margin before access-token expiry at which a token counts as expired.
    #[must_use]
    pub fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew;
        self
    }

    #[must_use]
    pub fn idle_ttl(&self) -> Duration {
        self.idle_ttl
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Create a session for a verified subject.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Capacity`] if the store is full.
    pub async fn create(&self, subject: Subject, tokens: TokenSet) -> Result<SessionId, Error> {
        let now = OffsetDateTime::now_utc();
        let mut session = Session::new(SessionId::generate(), subject, tokens, now);
        let mut attempts = 0;
        loop {
            match self.store.insert(session.clone()).await {
                Ok(()) => return Ok(session.id),
                Err(StoreError::Conflict) if attempts < 3 => {
                    attempts += 1;
                    session.id = SessionId::generate();
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Session creation failed");
                    return Err(Error::from_store(e, "sessions"));
                }
            }
        }
    }

    /// Look up a live session and record the access.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] if the session does not exist or has
    /// been idle longer than the TTL (it is evicted in that case).
    pub async fn get(&self, id: &SessionId) -> Result<Session, Error> {
        let mut session = self.load_live(id).await?;
        let now = OffsetDateTime::now_utc();
        if !self.store.touch(id, now).await.map_err(store_err)? {
            return Err(Error::SessionNotFound);
        }
        session.last_accessed_at = now;
        Ok(session)
    }

    /// Replace the session's token set using its refresh token.
    ///
    /// Only one refresh per session id reaches the provider at a time. A
    /// caller that waited on an in-flight refresh gets that refresh's result,
    /// failures included, without contacting the provider again.
    /// If the provider rejects the refresh token the session is destroyed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] if the session is gone, or
    /// [`Error::Refresh`] if the tokens cannot be refreshed.
    pub async fn refresh(&self, id: &SessionId) -> Result<Session, Error> {
        let observed = self.load_live(id).await?;
        let flight = self.refresh_flight(id);
        let seen = flight.completed.load(Ordering::Acquire);
        let result = {
            let mut last = flight.last.lock().await;
            let shared = if flight.completed.load(Ordering::Acquire) == seen {
                None
            } else {
                last.clone()
            };
            match shared {
                Some(outcome) => {
                    tracing::debug!("Sharing result of concurrent refresh");
                    outcome.map_err(Error::from)
                }
                None => {
                    let result = self.refresh_locked(id, observed.generation).await;
                    *last = match &result {
                        Ok(session) => Some(Ok(session.clone())),
                        Err(Error::Refresh(e)) => Some(Err(e.clone())),
                        Err(_) => None,
                    };
                    flight.completed.fetch_add(1, Ordering::Release);
                    result
                }
            }
        };
        drop(flight);
        self.refresh_locks
            .remove_if(id, |_, flight| Arc::strong_count(flight) == 1);
        result
    }

    async fn refresh_locked(&self, id: &SessionId, observed: u64) -> Result<Session, Error> {
        let current = self.load_live(id).await?;
        if current.generation != observed {
            tracing::debug!(subject = %current.subject, "Refresh already completed by concurrent caller");
            return Ok(current);
        }

        let now = OffsetDateTime::now_utc();
        if current.tokens.refresh_token().is_none() {
            return Err(RefreshError::NoRefreshToken.into());
        }
        if current.tokens.is_refresh_expired(now) {
            self.discard(id).await;
            return Err(RefreshError::Expired.into());
        }

        match self.client.refresh(&current.tokens).await {
            Ok(tokens) => {
                let next = current.with_tokens(tokens, OffsetDateTime::now_utc());
                if !self.store.replace(next.clone()).await.map_err(store_err)? {
                    return Err(Error::SessionNotFound);
                }
                tracing::info!(subject = %next.subject, generation = next.generation, "Session tokens refreshed");
                Ok(next)
            }
            Err(e) if e.is_transient() => Err(RefreshError::Unavailable(e).into()),
            Err(e) => {
                tracing::warn!(subject = %current.subject, error = %e, "Refresh token rejected, ending session");
                self.discard(id).await;
                let code = e.provider_error().unwrap_or("rejected").to_string();
                Err(RefreshError::Rejected(code).into())
            }
        }
    }

    /// Return an access token that is valid for at least the clock skew,
    /// refreshing first if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] or [`Error::Refresh`].
    pub async fn access_token(&self, id: &SessionId) -> Result<String, Error> {
        let session = self.get(id).await?;
        if !session
            .tokens
            .is_access_expired(OffsetDateTime::now_utc(), self.clock_skew)
        {
            return Ok(session.tokens.access_token().to_string());
        }
        let session = self.refresh(id).await?;
        Ok(session.tokens.access_token().to_string())
    }

    /// Destroy a session. Destroying a missing session is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] on backend failure.
    pub async fn destroy(&self, id: &SessionId) -> Result<Option<Session>, Error> {
        let removed = self.store.remove(id).await.map_err(store_err)?;
        self.refresh_locks
            .remove_if(id, |_, flight| Arc::strong_count(flight) == 1);
        Ok(removed)
    }

    /// Evict every session idle for longer than the TTL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] on backend failure.
    pub async fn purge_idle(&self) -> Result<usize, Error> {
        let cutoff = OffsetDateTime::now_utc() - self.idle_ttl;
        self.store.purge_idle_since(cutoff).await.map_err(store_err)
    }

    async fn load_live(&self, id: &SessionId) -> Result<Session, Error> {
        let session = self
            .store
            .get(id)
            .await
            .map_err(store_err)?
            .ok_or(Error::SessionNotFound)?;

        if session.is_idle(self.idle_ttl, OffsetDateTime::now_utc()) {
            tracing::debug!(subject = %session.subject, "Evicting idle session");
            self.discard(id).await;
            return Err(Error::SessionNotFound);
        }
        Ok(session)
    }

    async fn discard(&self, id: &SessionId) {
        if let Err(e) = self.store.remove(id).await {
            tracing::warn!(error = %e, "Failed to remove session");
        }
    }

    fn refresh_flight(&self, id: &SessionId) -> Arc<RefreshFlight> {
        self.refresh_locks
            .entry(id.clone())
            .or_default()
            .clone()
    }
}

fn store_err(e: StoreError) -> Error {
    Error::from_store(e, "sessions")
}
