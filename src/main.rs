use std::path::Path;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use keycloak_rp::middleware::{AuthSession, AuthState, RpAuthConfig, auth_routes};
use keycloak_rp::{ClientConfig, RelyingParty};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "keycloak-config.json";
const DEFAULT_PORT: u16 = 5174;
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("keycloak_rp=info")),
        )
        .init();

    let config = load_client_config()?;
    let auth_config = RpAuthConfig::from_env()?;
    tracing::info!(issuer = %config.issuer(), client_id = %config.client_id(), "Loaded Keycloak client");

    let rp = Arc::new(
        RelyingParty::builder(config)
            .session_ttl(auth_config.session_ttl())
            .build()?,
    );
    let _sweeper = rp.spawn_sweeper(SWEEP_INTERVAL);

    let state = AuthState::new(rp, auth_config);
    let app = Router::new()
        .route("/", get(home))
        .with_state(state.clone())
        .merge(auth_routes(state));

    let port = match std::env::var("PORT") {
        Ok(port) => port.parse::<u16>().map_err(|e| format!("PORT: {e}"))?,
        Err(_) => DEFAULT_PORT,
    };
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "Listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// `KEYCLOAK_CONFIG` (or `./keycloak-config.json` if present), else env vars.
fn load_client_config() -> Result<ClientConfig, keycloak_rp::Error> {
    match std::env::var("KEYCLOAK_CONFIG") {
        Ok(path) => ClientConfig::from_json_file(path),
        Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            ClientConfig::from_json_file(DEFAULT_CONFIG_PATH)
        }
        Err(_) => ClientConfig::from_env(),
    }
}

async fn home(auth: Option<AuthSession>) -> String {
    match auth {
        Some(auth) => format!("Logged in as {}\n\nLog out: /logout\n", auth.subject),
        None => "Not logged in\n\nLog in: /login\n".to_string(),
    }
}
