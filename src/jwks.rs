use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::DecodingKey;
use reqwest::header::CACHE_CONTROL;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use url::Url;

use crate::error::VerificationError;

const DEFAULT_JWKS_MAX_AGE: Duration = Duration::from_secs(300);
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    kty: String,
    #[serde(default)]
    alg: Option<String>,
    #[serde(default, rename = "use")]
    key_use: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

/// One fetched generation of the provider's signing keys.
struct KeySet {
    keyed: HashMap<String, DecodingKey>,
    unkeyed: Vec<DecodingKey>,
    fetched_at: Instant,
    max_age: Duration,
}

impl KeySet {
    fn lookup(&self, kid: Option<&str>) -> Option<DecodingKey> {
        match kid {
            Some(kid) => self.keyed.get(kid).cloned(),
            // Without a kid the choice is only unambiguous for a single key.
            None if self.keyed.len() + self.unkeyed.len() == 1 => self
                .unkeyed
                .first()
                .cloned()
                .or_else(|| self.keyed.values().next().cloned()),
            None => None,
        }
    }

    fn is_stale(&self) -> bool {
        self.fetched_at.elapsed() >= self.max_age
    }
}

/// Cache of the provider's JWKS.
///
/// Reads take a shared lock. A key-id miss or a stale set triggers a refetch
/// under a single-flight guard: callers queued behind an in-flight fetch
/// reuse its result instead of fetching again.
pub struct JwksCache {
    http: reqwest::Client,
    jwks_uri: Url,
    keys: RwLock<Option<Arc<KeySet>>>,
    refresh_guard: Mutex<()>,
}

impl JwksCache {
    #[must_use]
    pub fn new(http: reqwest::Client, jwks_uri: Url) -> Self {
        Self {
            http,
            jwks_uri,
            keys: RwLock::new(None),
            refresh_guard: Mutex::new(()),
        }
    }

    /// Resolve the verification key for a token's `kid`.
    ///
    /// # Errors
    ///
    /// Returns [`VerificationError::UnknownKey`] if no key matches after a
    /// refresh, or [`VerificationError::KeySetUnavailable`] /
    /// [`VerificationError::Timeout`] if the JWKS cannot be fetched.
    pub async fn key_for(&self, kid: Option<&str>) -> Result<DecodingKey, VerificationError> {
        let seen = self.keys.read().await.clone();
        if let Some(set) = seen.as_ref().filter(|set| !set.is_stale()) {
            if let Some(key) = set.lookup(kid) {
                return Ok(key);
            }
        }

        let set = self.refresh(seen.as_ref()).await?;
        set.lookup(kid)
            .ok_or_else(|| VerificationError::UnknownKey(kid.map(str::to_owned)))
    }

    async fn refresh(&self, seen: Option<&Arc<KeySet>>) -> Result<Arc<KeySet>, VerificationError> {
        let _guard = self.refresh_guard.lock().await;

        if let Some(current) = self.keys.read().await.clone() {
            let replaced = seen.is_none_or(|seen| !Arc::ptr_eq(seen, &current));
            if replaced && !current.is_stale() {
                return Ok(current);
            }
            // Unknown kids must not turn into a fetch per request.
            if !current.is_stale() && current.fetched_at.elapsed() < MIN_REFRESH_INTERVAL {
                return Ok(current);
            }
        }

        let fresh = Arc::new(self.fetch().await?);
        *self.keys.write().await = Some(fresh.clone());
        Ok(fresh)
    }

    async fn fetch(&self) -> Result<KeySet, VerificationError> {
        tracing::debug!(jwks_uri = %self.jwks_uri, "Fetching JWKS");
        let response = self
            .http
            .get(self.jwks_uri.clone())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(fetch_error)?;

        let max_age = response
            .headers()
            .get(CACHE_CONTROL)
            .and_then(|h| h.to_str().ok())
            .and_then(parse_max_age)
            .map_or(DEFAULT_JWKS_MAX_AGE, Duration::from_secs);

        let document: JwksDocument = response.json().await.map_err(fetch_error)?;
        let set = key_set_from_document(document, max_age)?;
        tracing::info!(keys = set.keyed.len() + set.unkeyed.len(), "JWKS refreshed");
        Ok(set)
    }
}

fn key_set_from_document(
    document: JwksDocument,
    max_age: Duration,
) -> Result<KeySet, VerificationError> {
    let mut keyed = HashMap::new();
    let mut unkeyed = Vec::new();

    for key in document.keys {
        if key.kty != "RSA" {
            continue;
        }
        if key
            .alg
            .as_deref()
            .is_some_and(|alg| !matches!(alg, "RS256" | "RS384" | "RS512"))
        {
            continue;
        }
        // Keycloak publishes `enc` keys next to `sig` keys.
        if key.key_use.as_deref().is_some_and(|u| u != "sig") {
            continue;
        }
        let (Some(n), Some(e)) = (key.n.as_deref(), key.e.as_deref()) else {
            continue;
        };
        let Ok(decoding_key) = DecodingKey::from_rsa_components(n, e) else {
            tracing::warn!(kid = ?key.kid, "Skipping unparseable JWK");
            continue;
        };

        match key.kid {
            Some(kid) if !kid.trim().is_empty() => {
                keyed.insert(kid, decoding_key);
            }
            _ => unkeyed.push(decoding_key),
        }
    }

    if keyed.is_empty() && unkeyed.is_empty() {
        return Err(VerificationError::KeySetUnavailable(
            "jwks does not contain usable RSA signing keys".into(),
        ));
    }

    Ok(KeySet {
        keyed,
        unkeyed,
        fetched_at: Instant::now(),
        max_age,
    })
}

fn fetch_error(e: reqwest::Error) -> VerificationError {
    if e.is_timeout() {
        VerificationError::Timeout
    } else {
        VerificationError::KeySetUnavailable(e.without_url().to_string())
    }
}

fn parse_max_age(cache_control: &str) -> Option<u64> {
    cache_control
        .split(',')
        .map(str::trim)
        .find_map(|directive| {
            directive
                .strip_prefix("max-age=")
                .and_then(|val| val.parse::<u64>().ok())
        })
}
