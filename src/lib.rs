#![doc = include_str!("../README.md")]

pub mod authorize;
pub mod config;
pub mod engine;
pub mod error;
pub mod jwks;
pub mod logout;
pub mod oauth;
pub mod pending;
pub mod pkce;
pub mod session;
pub mod token;
pub mod types;

#[cfg(feature = "middleware")]
pub mod middleware;

// Re-exports for convenient access
pub use authorize::{authorization_url_for, build_authorization_url};
pub use config::ClientConfig;
pub use engine::{CodeExchange, LoginOutcome, LoginRedirect, RelyingParty, RelyingPartyBuilder};
pub use error::{Error, ExchangeError, RefreshError, StoreError, VerificationError};
pub use jwks::JwksCache;
pub use logout::build_logout_url;
pub use oauth::{RetryPolicy, TokenClient, TokenSet};
pub use pending::{AuthRequestState, ConsumedRequest, MemoryPendingStore, PendingRequests, PendingStore};
pub use session::{MemorySessionStore, Session, SessionManager, SessionStore};
pub use token::{Audience, IdTokenClaims, IdTokenVerifier};
pub use types::{SessionId, Subject};
