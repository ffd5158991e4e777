use std::fmt;
use std::path::Path;

use serde::Deserialize;
use time::Duration;
use url::Url;

use crate::error::Error;

const DEFAULT_CLOCK_SKEW_SECS: i64 = 60;

/// Keycloak client configuration.
///
/// Loaded once at startup and shared read-only. Every provider endpoint is
/// derived from the server URL and realm, so there is nothing to keep in sync.
///
/// ```rust,ignore
/// use keycloak_rp::ClientConfig;
///
/// let config = ClientConfig::new(
///     "http://localhost:8080".parse()?,
///     "myrealm",
///     "my-app",
///     "s3cret",
///     "http://localhost:5174/callback".parse()?,
///     "http://localhost:5174/".parse()?,
/// )?
/// .with_scopes(vec!["openid".into(), "profile".into()]);
/// ```
#[derive(Clone)]
#[non_exhaustive]
pub struct ClientConfig {
    server_url: Url,
    realm: String,
    client_id: String,
    client_secret: String,
    redirect_uri: Url,
    post_logout_redirect_uri: Url,
    scopes: Vec<String>,
    clock_skew: Duration,
}

impl ClientConfig {
    /// Create a configuration from the required values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a string value is empty or a URL is not an
    /// absolute `http`/`https` URL.
    pub fn new(
        server_url: Url,
        realm: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: Url,
        post_logout_redirect_uri: Url,
    ) -> Result<Self, Error> {
        let realm = realm.into();
        let client_id = client_id.into();
        let client_secret = client_secret.into();

        require_http("server URL", &server_url)?;
        require_http("redirect URI", &redirect_uri)?;
        require_http("post-logout redirect URI", &post_logout_redirect_uri)?;
        require_non_empty("realm", &realm)?;
        require_non_empty("client id", &client_id)?;
        require_non_empty("client secret", &client_secret)?;

        Ok(Self {
            server_url,
            realm,
            client_id,
            client_secret,
            redirect_uri,
            post_logout_redirect_uri,
            scopes: vec!["openid".into()],
            clock_skew: Duration::seconds(DEFAULT_CLOCK_SKEW_SECS),
        })
    }

    /// Load configuration from environment variables.
    ///
    /// # Required env vars
    /// - `KEYCLOAK_URL`: Keycloak base URL, e.g. `http://localhost:8080`
    /// - `KEYCLOAK_REALM`
    /// - `KEYCLOAK_CLIENT_ID`
    /// - `KEYCLOAK_CLIENT_SECRET`
    /// - `KEYCLOAK_REDIRECT_URI`: this application's `/callback` URL
    /// - `KEYCLOAK_POST_LOGOUT_REDIRECT_URI`
    ///
    /// # Optional env vars
    /// - `KEYCLOAK_SCOPES`: comma-separated scopes (`openid` is always added)
    /// - `KEYCLOAK_CLOCK_SKEW_SECS`: tolerance for `exp` checks (default 60)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a required variable is missing or invalid.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::new(
            env_url("KEYCLOAK_URL")?,
            env_required("KEYCLOAK_REALM")?,
            env_required("KEYCLOAK_CLIENT_ID")?,
            env_required("KEYCLOAK_CLIENT_SECRET")?,
            env_url("KEYCLOAK_REDIRECT_URI")?,
            env_url("KEYCLOAK_POST_LOGOUT_REDIRECT_URI")?,
        )?;

        if let Ok(scopes) = std::env::var("KEYCLOAK_SCOPES") {
            config = config.with_scopes(scopes.split(',').map(|s| s.trim().to_string()).collect());
        }
        if let Ok(skew) = std::env::var("KEYCLOAK_CLOCK_SKEW_SECS") {
            let secs: u32 = skew
                .parse()
                .map_err(|e| Error::Config(format!("KEYCLOAK_CLOCK_SKEW_SECS: {e}")))?;
            config = config.with_clock_skew(Duration::seconds(i64::from(secs)));
        }

        Ok(config)
    }

    /// Load configuration from a `keycloak-config.json` file.
    ///
    /// Expected keys: `serverUrl`, `realm`, `clientId`, `clientSecret`,
    /// `redirectUri`, `logoutRedirectUri`, and optionally `scopes` and
    /// `clockSkewSecs`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read, is not valid JSON,
    /// or contains invalid values.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    /// Parse the `keycloak-config.json` format from a string.
    ///
    /// # Errors
    ///
    /// See [`from_json_file`](Self::from_json_file).
    pub fn from_json_str(raw: &str) -> Result<Self, Error> {
        let file: ConfigFile =
            serde_json::from_str(raw).map_err(|e| Error::Config(format!("config file: {e}")))?;

        let mut config = Self::new(
            file.server_url,
            file.realm,
            file.client_id,
            file.client_secret,
            file.redirect_uri,
            file.logout_redirect_uri,
        )?;
        if let Some(scopes) = file.scopes {
            config = config.with_scopes(scopes);
        }
        if let Some(secs) = file.clock_skew_secs {
            config = config.with_clock_skew(Duration::seconds(i64::from(secs)));
        }
        Ok(config)
    }

    /// Override the requested scopes. `openid` is always kept first.
    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = normalize_scopes(scopes.iter().map(String::as_str));
        self
    }

    /// Override the clock-skew tolerance applied to token expiry checks.
    #[must_use]
    pub fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = if skew.is_negative() { Duration::ZERO } else { skew };
        self
    }

    #[must_use]
    pub fn server_url(&self) -> &Url {
        &self.server_url
    }

    #[must_use]
    pub fn realm(&self) -> &str {
        &self.realm
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub(crate) fn client_secret(&self) -> &str {
        &self.client_secret
    }

    #[must_use]
    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    #[must_use]
    pub fn post_logout_redirect_uri(&self) -> &Url {
        &self.post_logout_redirect_uri
    }

    #[must_use]
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    #[must_use]
    pub fn clock_skew(&self) -> Duration {
        self.clock_skew
    }

    /// Expected `iss` claim: `{server}/realms/{realm}`.
    #[must_use]
    pub fn issuer(&self) -> String {
        self.realm_url(&[]).to_string()
    }

    #[must_use]
    pub fn authorization_endpoint(&self) -> Url {
        self.realm_url(&["protocol", "openid-connect", "auth"])
    }

    #[must_use]
    pub fn token_endpoint(&self) -> Url {
        self.realm_url(&["protocol", "openid-connect", "token"])
    }

    #[must_use]
    pub fn end_session_endpoint(&self) -> Url {
        self.realm_url(&["protocol", "openid-connect", "logout"])
    }

    #[must_use]
    pub fn jwks_uri(&self) -> Url {
        self.realm_url(&["protocol", "openid-connect", "certs"])
    }

    fn realm_url(&self, tail: &[&str]) -> Url {
        let mut url = self.server_url.clone();
        url.set_query(None);
        url.set_fragment(None);
        // server_url is validated as http(s), which always has a base
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push("realms")
                .push(&self.realm)
                .extend(tail);
        }
        url
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server_url", &self.server_url.as_str())
            .field("realm", &self.realm)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[redacted]")
            .field("redirect_uri", &self.redirect_uri.as_str())
            .field("post_logout_redirect_uri", &self.post_logout_redirect_uri.as_str())
            .field("scopes", &self.scopes)
            .field("clock_skew", &self.clock_skew)
            .finish()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    server_url: Url,
    realm: String,
    client_id: String,
    client_secret: String,
    redirect_uri: Url,
    logout_redirect_uri: Url,
    #[serde(default)]
    scopes: Option<Vec<String>>,
    #[serde(default)]
    clock_skew_secs: Option<u32>,
}

/// Deduplicate scopes and force `openid` to the front.
pub(crate) fn normalize_scopes<'a>(scopes: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut out = vec!["openid".to_string()];
    for scope in scopes {
        let scope = scope.trim();
        if !scope.is_empty() && !out.iter().any(|s| s == scope) {
            out.push(scope.to_string());
        }
    }
    out
}

fn require_http(what: &str, url: &Url) -> Result<(), Error> {
    match url.scheme() {
        "http" | "https" if url.has_host() => Ok(()),
        _ => Err(Error::Config(format!("{what} must be an http(s) URL, got {url}"))),
    }
}

fn require_non_empty(what: &str, value: &str) -> Result<(), Error> {
    if value.trim().is_empty() {
        return Err(Error::Config(format!("{what} is required")));
    }
    Ok(())
}

fn env_required(name: &str) -> Result<String, Error> {
    std::env::var(name).map_err(|_| Error::Config(format!("{name} is required")))
}

fn env_url(name: &str) -> Result<Url, Error> {
    env_required(name)?
        .parse()
        .map_err(|e| Error::Config(format!("{name}: {e}")))
}
