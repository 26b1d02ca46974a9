use std::net::SocketAddr;

use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use taskplane_server::{config, routes, AppState};

#[tokio::main]
async fn main() {
    // Load .env
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load config
    let config = config::Config::from_env();
    let port = config.port;

    if config.agent_tokens.is_empty() {
        tracing::warn!("AGENT_TOKENS is empty, no agent will be able to authenticate");
    }

    // Wire components and start background workers
    let state = AppState::new(config.clone());
    let shutdown = state.shutdown.clone();

    // Build CORS layer
    let cors_origins: Vec<String> = config.cors_origins();
    let is_wildcard = cors_origins.len() == 1 && cors_origins[0] == "*";

    let cors = if is_wildcard {
        CorsLayer::new()
            .allow_origin(AllowOrigin::any())
            .allow_methods(AllowMethods::any())
            .allow_headers(AllowHeaders::any())
    } else {
        let origins: Vec<axum::http::HeaderValue> = cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(AllowMethods::any())
            .allow_headers(AllowHeaders::any())
            .allow_credentials(true)
    };

    // Build router
    let app = routes::create_router(state)
        .layer(cors)
        .layer(TimeoutLayer::new(config.http_timeout))
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind listen port");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        })
        .await
        .expect("server error");
}
