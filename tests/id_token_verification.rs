//! ID token verification against a mocked Keycloak JWKS endpoint.

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{EncodingKey, Header};
use keycloak_rp::VerificationError;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod common;
use common::{
    CLIENT_ID, SUBJECT, foreign_key, id_token_claims, jwks_path, mount_jwks, now_secs,
    relying_party, signing_key,
};

#[tokio::test]
async fn test_valid_token_is_accepted() {
    let server = MockServer::start().await;
    mount_jwks(&server, &[signing_key()]).await;
    let rp = relying_party(&server);

    let token = signing_key().sign(&id_token_claims(&server, "n1"));
    let claims = rp.verifier().verify(&token, "n1").await.unwrap();

    assert_eq!(claims.sub, SUBJECT);
    assert!(claims.aud.contains(CLIENT_ID));
    assert_eq!(claims.nonce, "n1");
    assert_eq!(claims.preferred_username(), Some("alice"));
    assert_eq!(claims.get_claim("azp"), Some(&json!(CLIENT_ID)));
}

#[tokio::test]
async fn test_nonce_mismatch_is_rejected_despite_valid_signature() {
    let server = MockServer::start().await;
    mount_jwks(&server, &[signing_key()]).await;
    let rp = relying_party(&server);

    let token = signing_key().sign(&id_token_claims(&server, "n1"));
    let err = rp.verifier().verify(&token, "n2").await.unwrap_err();
    assert_eq!(err, VerificationError::NonceMismatch);
}

#[tokio::test]
async fn test_expired_token_is_rejected() {
    let server = MockServer::start().await;
    mount_jwks(&server, &[signing_key()]).await;
    let rp = relying_party(&server);

    // default tolerance is 60s
    let mut claims = id_token_claims(&server, "n1");
    claims["exp"] = json!(now_secs() - 120);
    let token = signing_key().sign(&claims);

    let err = rp.verifier().verify(&token, "n1").await.unwrap_err();
    assert_eq!(err, VerificationError::Expired);
}

#[tokio::test]
async fn test_recently_expired_token_is_within_skew() {
    let server = MockServer::start().await;
    mount_jwks(&server, &[signing_key()]).await;
    let rp = relying_party(&server);

    let mut claims = id_token_claims(&server, "n1");
    claims["exp"] = json!(now_secs() - 10);
    let token = signing_key().sign(&claims);

    assert!(rp.verifier().verify(&token, "n1").await.is_ok());
}

#[tokio::test]
async fn test_forged_signature_is_rejected() {
    let server = MockServer::start().await;
    mount_jwks(&server, &[signing_key()]).await;
    let rp = relying_party(&server);

    // signed by a foreign key but claiming the realm key's kid
    let token = foreign_key().sign_with_kid(&id_token_claims(&server, "n1"), signing_key().kid);

    let err = rp.verifier().verify(&token, "n1").await.unwrap_err();
    assert_eq!(err, VerificationError::InvalidSignature);
}

#[tokio::test]
async fn test_unknown_kid_is_rejected() {
    let server = MockServer::start().await;
    mount_jwks(&server, &[signing_key()]).await;
    let rp = relying_party(&server);

    let token = foreign_key().sign(&id_token_claims(&server, "n1"));
    let err = rp.verifier().verify(&token, "n1").await.unwrap_err();
    assert_eq!(
        err,
        VerificationError::UnknownKey(Some(foreign_key().kid.to_string()))
    );
}

#[tokio::test]
async fn test_token_signed_with_any_published_key_is_accepted() {
    let server = MockServer::start().await;
    mount_jwks(&server, &[signing_key(), foreign_key()]).await;
    let rp = relying_party(&server);

    let token = foreign_key().sign(&id_token_claims(&server, "n1"));
    assert!(rp.verifier().verify(&token, "n1").await.is_ok());
}

#[tokio::test]
async fn test_wrong_audience_and_issuer_are_rejected() {
    let server = MockServer::start().await;
    mount_jwks(&server, &[signing_key()]).await;
    let rp = relying_party(&server);

    let mut claims = id_token_claims(&server, "n1");
    claims["aud"] = json!(["account", "another-client"]);
    let token = signing_key().sign(&claims);
    assert_eq!(
        rp.verifier().verify(&token, "n1").await.unwrap_err(),
        VerificationError::AudienceMismatch
    );

    let mut claims = id_token_claims(&server, "n1");
    claims["iss"] = json!("https://evil.example/realms/test-realm");
    let token = signing_key().sign(&claims);
    assert!(matches!(
        rp.verifier().verify(&token, "n1").await.unwrap_err(),
        VerificationError::IssuerMismatch { .. }
    ));
}

#[tokio::test]
async fn test_symmetric_algorithm_is_rejected() {
    let server = MockServer::start().await;
    mount_jwks(&server, &[signing_key()]).await;
    let rp = relying_party(&server);

    let token = jsonwebtoken::encode(
        &Header::default(),
        &id_token_claims(&server, "n1"),
        &EncodingKey::from_secret(b"client-secret-as-hmac-key"),
    )
    .unwrap();

    let err = rp.verifier().verify(&token, "n1").await.unwrap_err();
    assert!(matches!(err, VerificationError::UnsupportedAlgorithm(_)));
}

#[tokio::test]
async fn test_garbage_token_is_malformed() {
    let server = MockServer::start().await;
    let rp = relying_party(&server);

    let err = rp.verifier().verify("not-a-jwt", "n1").await.unwrap_err();
    assert!(matches!(err, VerificationError::Malformed(_)));
}

#[tokio::test]
async fn test_jwks_outage_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(jwks_path()))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let rp = relying_party(&server);

    let token = signing_key().sign(&id_token_claims(&server, "n1"));
    let err = rp.verifier().verify(&token, "n1").await.unwrap_err();
    assert!(matches!(err, VerificationError::KeySetUnavailable(_)));
}

#[tokio::test]
async fn test_concurrent_cache_misses_fetch_jwks_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(jwks_path()))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "keys": [signing_key().jwk.clone()] }))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;
    let rp = Arc::new(relying_party(&server));
    let token = signing_key().sign(&id_token_claims(&server, "n1"));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let rp = rp.clone();
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            rp.verifier().verify(&token, "n1").await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    // a cached key needs no further fetch
    assert!(rp.verifier().verify(&token, "n1").await.is_ok());
}
