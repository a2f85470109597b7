use std::sync::Arc;

use authbridge::config::AuthConfig;
use authbridge::identity::ClerkClient;
use authbridge::routes;
use authbridge::session::user_info::LoadUserInfo;
use authbridge::state::AppState;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // .env is optional.
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()
        .expect("invalid PORT");

    let config = AuthConfig::from_env().expect("auth config");
    let identity = ClerkClient::from_config(&config).expect("identity client init failed");
    tracing::info!(api_url = %config.api_url, wait = ?config.auth_wait_timeout, "identity client initialized");

    let autoload = config.autoload_user_info;
    let state = AppState::new(config, Arc::new(identity));
    if autoload {
        state.register_on_auth_change_handler(Arc::new(LoadUserInfo));
        tracing::info!("user info autoload enabled");
    }

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "authbridge listening");
    axum::serve(listener, app).await.expect("server failed");
}
