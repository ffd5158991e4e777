use axum_extra::extract::cookie::Key;
use time::Duration;

use super::error::AuthError;

const DEFAULT_SESSION_TTL_SECS: i64 = 30 * 60;

/// Cookie and redirect settings shared by the route handlers.
#[derive(Clone)]
pub(crate) struct AuthSettings {
    pub(crate) cookie_key: Key,
    pub(crate) session_cookie_name: String,
    pub(crate) session_ttl: Duration,
    pub(crate) secure_cookies: bool,
    pub(crate) home_redirect: String,
}

impl AuthSettings {
    fn defaults() -> Self {
        Self {
            cookie_key: Key::generate(),
            session_cookie_name: "__kc_session".into(),
            session_ttl: Duration::seconds(DEFAULT_SESSION_TTL_SECS),
            secure_cookies: true,
            home_redirect: "/".into(),
        }
    }
}

/// HTTP-layer settings for the relying party routes.
///
/// Provider settings live in [`ClientConfig`](crate::ClientConfig); this only
/// covers the browser side. Use [`from_env()`](RpAuthConfig::from_env) for
/// convention-based setup, or [`new()`](RpAuthConfig::new) with `with_*`
/// methods for full control.
pub struct RpAuthConfig {
    pub(super) settings: AuthSettings,
}

impl RpAuthConfig {
    /// Defaults: ephemeral cookie key, `__kc_session` cookie, 30 minute
    /// session TTL, secure cookies, home at `/`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            settings: AuthSettings::defaults(),
        }
    }

    /// Create config from environment variables.
    ///
    /// # Optional env vars
    /// - `COOKIE_KEY`: Cookie encryption key bytes (at least 64)
    /// - `SESSION_COOKIE_NAME`: Session cookie name
    /// - `SESSION_TTL_SECS`: Session idle timeout in seconds
    /// - `DEV_INSECURE_COOKIES`: Set to `"1"` or `"true"` to drop the `Secure`
    ///   flag for plain-HTTP local development
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Config`] if a variable is set but invalid.
    pub fn from_env() -> Result<Self, AuthError> {
        let mut config = Self::new();

        if let Ok(k) = std::env::var("COOKIE_KEY") {
            let key = Key::try_from(k.as_bytes()).map_err(|_| {
                AuthError::Config(
                    "COOKIE_KEY is set but invalid (must be at least 64 bytes). \
                     Remove the env var to use an ephemeral key, or provide a valid key."
                        .into(),
                )
            })?;
            config = config.with_cookie_key(key);
        }
        if let Ok(name) = std::env::var("SESSION_COOKIE_NAME") {
            if name.trim().is_empty() {
                return Err(AuthError::Config("SESSION_COOKIE_NAME is empty".into()));
            }
            config = config.with_session_cookie_name(name.trim());
        }
        if let Ok(secs) = std::env::var("SESSION_TTL_SECS") {
            let secs: u32 = secs
                .trim()
                .parse()
                .map_err(|e| AuthError::Config(format!("SESSION_TTL_SECS: {e}")))?;
            config = config.with_session_ttl(Duration::seconds(i64::from(secs)));
        }

        let insecure = matches!(
            std::env::var("DEV_INSECURE_COOKIES").as_deref(),
            Ok("1") | Ok("true"),
        );
        if insecure {
            tracing::warn!("DEV_INSECURE_COOKIES set, session cookie sent without Secure flag");
        }

        Ok(config.with_secure_cookies(!insecure))
    }

    #[must_use]
    pub fn with_cookie_key(mut self, key: Key) -> Self {
        self.settings.cookie_key = key;
        self
    }

    #[must_use]
    pub fn with_session_cookie_name(mut self, name: impl Into<String>) -> Self {
        self.settings.session_cookie_name = name.into();
        self
    }

    /// Session idle timeout. The cookie itself carries no expiry; hand this
    /// to [`RelyingPartyBuilder::session_ttl`](crate::RelyingPartyBuilder::session_ttl).
    #[must_use]
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.settings.session_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_secure_cookies(mut self, secure: bool) -> Self {
        self.settings.secure_cookies = secure;
        self
    }

    /// Where a completed login lands when no return path was requested.
    #[must_use]
    pub fn with_home_redirect(mut self, path: impl Into<String>) -> Self {
        self.settings.home_redirect = path.into();
        self
    }

    #[must_use]
    pub fn session_cookie_name(&self) -> &str {
        &self.settings.session_cookie_name
    }

    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        self.settings.session_ttl
    }
}

impl Default for RpAuthConfig {
    fn default() -> Self {
        Self::new()
    }
}
