//! Mock Keycloak for integration tests.
//!
//! Signs ID tokens with fixed RSA test keys and serves the token and JWKS
//! endpoints from a `wiremock` server.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use keycloak_rp::{ClientConfig, RelyingParty, RetryPolicy};
use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use serde_json::{Value, json};
use url::Url;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const REALM: &str = "test-realm";
pub const CLIENT_ID: &str = "test-client";
pub const CLIENT_SECRET: &str = "test-secret-do-not-log";
pub const SUBJECT: &str = "f9a1c6d2-user-1";

pub struct TestKey {
    pub kid: &'static str,
    encoding: EncodingKey,
    pub jwk: Value,
}

impl TestKey {
    fn load(pem: &str, kid: &'static str) -> Self {
        let private = RsaPrivateKey::from_pkcs1_pem(pem).unwrap();
        let jwk = json!({
            "kid": kid,
            "kty": "RSA",
            "alg": "RS256",
            "use": "sig",
            "n": URL_SAFE_NO_PAD.encode(private.n().to_bytes_be()),
            "e": URL_SAFE_NO_PAD.encode(private.e().to_bytes_be()),
        });
        Self {
            kid,
            encoding: EncodingKey::from_rsa_pem(pem.as_bytes()).unwrap(),
            jwk,
        }
    }

    /// Sign `claims` as an RS256 JWT with this key's `kid`.
    pub fn sign(&self, claims: &Value) -> String {
        self.sign_with_kid(claims, self.kid)
    }

    pub fn sign_with_kid(&self, claims: &Value, kid: &str) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(kid.to_string());
        jsonwebtoken::encode(&header, claims, &self.encoding).unwrap()
    }
}

/// The realm's active signing key.
pub fn signing_key() -> &'static TestKey {
    static KEY: OnceLock<TestKey> = OnceLock::new();
    KEY.get_or_init(|| TestKey::load(include_str!("../fixtures/test_rsa_key.pem"), "realm-key-1"))
}

/// A key the realm does not publish.
pub fn foreign_key() -> &'static TestKey {
    static KEY: OnceLock<TestKey> = OnceLock::new();
    KEY.get_or_init(|| TestKey::load(include_str!("../fixtures/other_rsa_key.pem"), "foreign-key"))
}

pub fn issuer(server: &MockServer) -> String {
    format!("{}/realms/{REALM}", server.uri())
}

pub fn token_path() -> String {
    format!("/realms/{REALM}/protocol/openid-connect/token")
}

pub fn jwks_path() -> String {
    format!("/realms/{REALM}/protocol/openid-connect/certs")
}

pub fn client_config(server: &MockServer) -> ClientConfig {
    ClientConfig::new(
        server.uri().parse().unwrap(),
        REALM,
        CLIENT_ID,
        CLIENT_SECRET,
        "http://localhost:5174/callback".parse().unwrap(),
        "http://localhost:5174/".parse().unwrap(),
    )
    .unwrap()
}

/// Short backoff so retry tests stay fast.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
    }
}

pub fn relying_party(server: &MockServer) -> RelyingParty {
    RelyingParty::builder(client_config(server))
        .retry_policy(fast_retry())
        .build()
        .unwrap()
}

pub fn now_secs() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Claims Keycloak puts in an ID token for `nonce`.
pub fn id_token_claims(server: &MockServer, nonce: &str) -> Value {
    let now = now_secs();
    json!({
        "iss": issuer(server),
        "aud": CLIENT_ID,
        "azp": CLIENT_ID,
        "sub": SUBJECT,
        "nonce": nonce,
        "iat": now,
        "exp": now + 300,
        "typ": "ID",
        "preferred_username": "alice",
    })
}

/// Keycloak token endpoint success body.
pub fn token_body(access_token: &str, refresh_token: &str, id_token: Option<&str>) -> Value {
    let mut body = json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": 300,
        "refresh_token": refresh_token,
        "refresh_expires_in": 1800,
        "scope": "openid profile email",
        "session_state": "4c1f",
        "not-before-policy": 0,
    });
    if let Some(id_token) = id_token {
        body["id_token"] = json!(id_token);
    }
    body
}

pub fn oauth_error(error: &str, description: &str) -> Value {
    json!({ "error": error, "error_description": description })
}

pub async fn mount_jwks(server: &MockServer, keys: &[&TestKey]) {
    let keys: Vec<Value> = keys.iter().map(|k| k.jwk.clone()).collect();
    Mock::given(method("GET"))
        .and(path(jwks_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "keys": keys })))
        .mount(server)
        .await;
}

/// Token endpoint answering the code exchange with a valid ID token for `nonce`.
pub async fn mount_code_exchange(server: &MockServer, nonce: &str) {
    let id_token = signing_key().sign(&id_token_claims(server, nonce));
    Mock::given(method("POST"))
        .and(path(token_path()))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(token_body(
                "access-1",
                "refresh-1",
                Some(&id_token),
            )),
        )
        .mount(server)
        .await;
}

pub fn query_params(url: &Url) -> HashMap<String, String> {
    url.query_pairs().into_owned().collect()
}
