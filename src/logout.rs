use url::Url;

use crate::config::ClientConfig;

/// Build the Keycloak end-session URL.
///
/// `{issuer}/protocol/openid-connect/logout` with `post_logout_redirect_uri`,
/// `client_id` and, when known, `id_token_hint`. Keycloak needs either the
/// hint or `client_id` to honour the post-logout redirect without asking the
/// user to confirm.
#[must_use]
pub fn build_logout_url(config: &ClientConfig, id_token_hint: Option<&str>) -> Url {
    let mut url = config.end_session_endpoint();
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair(
                "post_logout_redirect_uri",
                config.post_logout_redirect_uri().as_str(),
            )
            .append_pair("client_id", config.client_id());
        if let Some(hint) = id_token_hint.filter(|hint| !hint.is_empty()) {
            query.append_pair("id_token_hint", hint);
        }
    }
    url
}
