use std::sync::Arc;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Validation, decode, decode_header};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use time::OffsetDateTime;

use crate::config::ClientConfig;
use crate::error::VerificationError;
use crate::jwks::JwksCache;

/// `aud` is either a single string or an array of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    #[must_use]
    pub fn contains(&self, client_id: &str) -> bool {
        match self {
            Self::One(aud) => aud == client_id,
            Self::Many(auds) => auds.iter().any(|aud| aud == client_id),
        }
    }
}

#[derive(Deserialize)]
struct RawClaims {
    #[serde(default)]
    iss: Option<String>,
    #[serde(default)]
    aud: Option<Audience>,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    nonce: Option<String>,
    #[serde(default)]
    sub: Option<String>,
    #[serde(flatten)]
    rest: Map<String, JsonValue>,
}

/// Claims of a verified ID token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct IdTokenClaims {
    pub sub: String,
    pub iss: String,
    pub aud: Audience,
    pub exp: i64,
    pub nonce: String,
    /// Remaining claims (`iat`, `azp`, `preferred_username`, `email`, ...).
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl IdTokenClaims {
    /// Gets an additional claim by name.
    #[must_use]
    pub fn get_claim(&self, key: &str) -> Option<&JsonValue> {
        self.extra.get(key)
    }

    #[must_use]
    pub fn preferred_username(&self) -> Option<&str> {
        self.extra.get("preferred_username").and_then(JsonValue::as_str)
    }
}

/// Verifies Keycloak ID tokens.
///
/// Checks run in a fixed order and stop at the first failure: signature,
/// issuer, audience, expiry, nonce. Each failure has its own
/// [`VerificationError`] variant.
pub struct IdTokenVerifier {
    config: Arc<ClientConfig>,
    jwks: Arc<JwksCache>,
}

impl IdTokenVerifier {
    #[must_use]
    pub fn new(config: Arc<ClientConfig>, jwks: Arc<JwksCache>) -> Self {
        Self { config, jwks }
    }

    /// Verify `id_token` and bind it to the nonce of the originating login.
    ///
    /// # Errors
    ///
    /// Returns the [`VerificationError`] of the first failed check.
    pub async fn verify(
        &self,
        id_token: &str,
        expected_nonce: &str,
    ) -> Result<IdTokenClaims, VerificationError> {
        let claims = self.verify_signature(id_token).await?;
        check_claims(claims, &self.config, expected_nonce, OffsetDateTime::now_utc())
    }

    async fn verify_signature(&self, id_token: &str) -> Result<RawClaims, VerificationError> {
        let header =
            decode_header(id_token).map_err(|e| VerificationError::Malformed(e.to_string()))?;
        if !matches!(header.alg, Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512) {
            return Err(VerificationError::UnsupportedAlgorithm(format!("{:?}", header.alg)));
        }

        let key = self.jwks.key_for(header.kid.as_deref()).await?;

        // Signature only; claims are checked below in a fixed order.
        let mut validation = Validation::new(header.alg);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        decode::<RawClaims>(id_token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => VerificationError::InvalidSignature,
                _ => VerificationError::Malformed(e.to_string()),
            })
    }
}

fn check_claims(
    claims: RawClaims,
    config: &ClientConfig,
    expected_nonce: &str,
    now: OffsetDateTime,
) -> Result<IdTokenClaims, VerificationError> {
    let iss = claims.iss.ok_or(VerificationError::MissingClaim("iss"))?;
    if iss != config.issuer() {
        return Err(VerificationError::IssuerMismatch { actual: iss });
    }

    let aud = claims.aud.ok_or(VerificationError::MissingClaim("aud"))?;
    if !aud.contains(config.client_id()) {
        return Err(VerificationError::AudienceMismatch);
    }

    let exp = claims.exp.ok_or(VerificationError::MissingClaim("exp"))?;
    if exp + config.clock_skew().whole_seconds() <= now.unix_timestamp() {
        return Err(VerificationError::Expired);
    }

    let nonce = claims.nonce.ok_or(VerificationError::MissingClaim("nonce"))?;
    if nonce != expected_nonce {
        return Err(VerificationError::NonceMismatch);
    }

    let sub = claims
        .sub
        .filter(|sub| !sub.is_empty())
        .ok_or(VerificationError::MissingClaim("sub"))?;

    Ok(IdTokenClaims {
        sub,
        iss,
        aud,
        exp,
        nonce,
        extra: claims.rest,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::Duration;

    use super::*;

    fn test_config() -> ClientConfig {
        ClientConfig::new(
            "http://localhost:8080".parse().unwrap(),
            "test-realm",
            "test-client",
            "test-secret",
            "http://localhost:5174/callback".parse().unwrap(),
            "http://localhost:5174/".parse().unwrap(),
        )
        .unwrap()
        .with_clock_skew(Duration::seconds(30))
    }

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    fn raw(value: JsonValue) -> RawClaims {
        serde_json::from_value(value).unwrap()
    }

    fn valid_claims() -> JsonValue {
        json!({
            "iss": "http://localhost:8080/realms/test-realm",
            "aud": "test-client",
            "exp": 1_700_000_300,
            "iat": 1_700_000_000,
            "nonce": "n1",
            "sub": "user-1",
            "preferred_username": "alice"
        })
    }

    fn with(field: &str, value: JsonValue) -> RawClaims {
        let mut claims = valid_claims();
        claims[field] = value;
        raw(claims)
    }

    #[test]
    fn accepts_valid_claims() {
        let claims = check_claims(raw(valid_claims()), &test_config(), "n1", now()).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.preferred_username(), Some("alice"));
        assert_eq!(claims.get_claim("iat"), Some(&json!(1_700_000_000)));
    }

    #[test]
    fn rejects_wrong_issuer() {
        let err = check_claims(
            with("iss", json!("http://evil/realms/test-realm")),
            &test_config(),
            "n1",
            now(),
        )
        .unwrap_err();
        assert!(matches!(err, VerificationError::IssuerMismatch { .. }));
    }

    #[test]
    fn audience_array_must_contain_client() {
        let ok = with("aud", json!(["account", "test-client"]));
        assert!(check_claims(ok, &test_config(), "n1", now()).is_ok());

        let err = check_claims(with("aud", json!(["account"])), &test_config(), "n1", now())
            .unwrap_err();
        assert_eq!(err, VerificationError::AudienceMismatch);
    }

    #[test]
    fn expiry_allows_clock_skew() {
        // expired 10s ago, inside the 30s tolerance
        let recent = with("exp", json!(1_699_999_990));
        assert!(check_claims(recent, &test_config(), "n1", now()).is_ok());

        let stale = with("exp", json!(1_699_999_960));
        assert_eq!(
            check_claims(stale, &test_config(), "n1", now()).unwrap_err(),
            VerificationError::Expired
        );
    }

    #[test]
    fn rejects_nonce_mismatch() {
        assert_eq!(
            check_claims(raw(valid_claims()), &test_config(), "other", now()).unwrap_err(),
            VerificationError::NonceMismatch
        );
    }

    #[test]
    fn checks_run_in_order() {
        // wrong audience and wrong nonce: audience is reported first
        let claims = with("aud", json!("someone-else"));
        assert_eq!(
            check_claims(claims, &test_config(), "other", now()).unwrap_err(),
            VerificationError::AudienceMismatch
        );
    }

    #[test]
    fn missing_claims_are_reported_by_name() {
        let mut claims = valid_claims();
        claims.as_object_mut().unwrap().remove("nonce");
        assert_eq!(
            check_claims(raw(claims), &test_config(), "n1", now()).unwrap_err(),
            VerificationError::MissingClaim("nonce")
        );

        assert_eq!(
            check_claims(with("sub", json!("")), &test_config(), "n1", now()).unwrap_err(),
            VerificationError::MissingClaim("sub")
        );
    }
}
