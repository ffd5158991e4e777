use url::Url;

use crate::config::{ClientConfig, normalize_scopes};
use crate::pending::AuthRequestState;

/// Build the Keycloak authorization URL for a login attempt.
///
/// Pure construction: `{issuer}/protocol/openid-connect/auth` with
/// `client_id`, `redirect_uri`, `response_type=code`, `scope`, `state`
/// and `nonce`. `scopes` overrides the configured scopes; `openid` is always
/// included.
#[must_use]
pub fn build_authorization_url(
    config: &ClientConfig,
    state: &str,
    nonce: &str,
    scopes: Option<&[String]>,
) -> Url {
    let scope = match scopes {
        Some(requested) => normalize_scopes(requested.iter().map(String::as_str)),
        None => config.scopes().to_vec(),
    }
    .join(" ");

    let mut url = config.authorization_endpoint();
    url.query_pairs_mut()
        .append_pair("client_id", config.client_id())
        .append_pair("redirect_uri", config.redirect_uri().as_str())
        .append_pair("response_type", "code")
        .append_pair("scope", &scope)
        .append_pair("state", state)
        .append_pair("nonce", nonce);
    url
}

/// Authorization URL for a registered request, including the PKCE challenge.
#[must_use]
pub fn authorization_url_for(config: &ClientConfig, request: &AuthRequestState) -> Url {
    let mut url = build_authorization_url(config, &request.state, &request.nonce, None);
    url.query_pairs_mut()
        .append_pair("code_challenge", &request.code_challenge())
        .append_pair("code_challenge_method", "S256");
    url
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

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
    }

    fn query(url: &Url) -> HashMap<String, String> {
        url.query_pairs().into_owned().collect()
    }

    #[test]
    fn contains_required_parameters() {
        let url = build_authorization_url(&test_config(), "s1", "n1", None);

        assert_eq!(url.path(), "/realms/test-realm/protocol/openid-connect/auth");
        let params = query(&url);
        assert_eq!(params["client_id"], "test-client");
        assert_eq!(params["redirect_uri"], "http://localhost:5174/callback");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["scope"], "openid");
        assert_eq!(params["state"], "s1");
        assert_eq!(params["nonce"], "n1");
        assert!(url.as_str().contains("state=s1&nonce=n1"));
    }

    #[test]
    fn values_are_percent_encoded() {
        let url = build_authorization_url(&test_config(), "a b&c=d", "n/1", None);
        assert!(url.as_str().contains("state=a+b%26c%3Dd"));
        assert!(url.as_str().contains("redirect_uri=http%3A%2F%2Flocalhost%3A5174%2Fcallback"));

        let reparsed: Url = url.as_str().parse().unwrap();
        assert_eq!(query(&reparsed)["state"], "a b&c=d");
        assert_eq!(query(&reparsed)["nonce"], "n/1");
    }

    #[test]
    fn requested_scopes_always_include_openid() {
        let scopes = vec!["email".to_string(), "profile".to_string()];
        let url = build_authorization_url(&test_config(), "s", "n", Some(scopes.as_slice()));
        assert_eq!(query(&url)["scope"], "openid email profile");
    }

    #[test]
    fn registered_request_adds_pkce_challenge() {
        let request = AuthRequestState::generate(Some("/home"), time::OffsetDateTime::now_utc());
        let url = authorization_url_for(&test_config(), &request);
        let params = query(&url);
        assert_eq!(params["state"], request.state);
        assert_eq!(params["nonce"], request.nonce);
        assert_eq!(params["code_challenge"], request.code_challenge());
        assert_eq!(params["code_challenge_method"], "S256");
        assert!(!url.as_str().contains(&request.code_verifier));
    }

    #[test]
    fn deterministic_for_same_inputs() {
        let config = test_config();
        assert_eq!(
            build_authorization_url(&config, "s", "n", None),
            build_authorization_url(&config, "s", "n", None)
        );
    }
}
