mod config;
mod db;
mod error;
mod handlers;
mod middleware;
mod models;
mod services;

use axum::{
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::db::Database;
use crate::middleware::identity::{IdentityProvider, ProxyHeaderIdentity};
use crate::services::{StreamCipher, Sweeper};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<Config>,
    pub cipher: Arc<StreamCipher>,
    pub identity: Arc<dyn IdentityProvider>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vaultdrop=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting VaultDrop...");

    // Load configuration
    let config = Config::load()?;
    let config = Arc::new(config);
    tracing::info!("Configuration loaded");

    // Initialize database
    let db = Database::new(&config.database.path).await?;
    db.run_migrations().await?;
    tracing::info!("Database initialized");

    let cipher = Arc::new(StreamCipher::from_hex_secret(&config.vault.master_secret)?);

    // Finish any reclamation interrupted by a previous shutdown
    match Sweeper::run_once(&db).await {
        Ok(stats) => tracing::info!(reclaimed = stats.reclaimed, "Startup sweep completed"),
        Err(e) => tracing::error!("Startup sweep failed: {:?}", e),
    }

    // Reclaim expired files in the background
    let sweeper = Sweeper::start(
        db.clone(),
        Duration::from_secs(config.vault.sweep_interval_secs),
    );

    // Create app state
    let state = AppState {
        db,
        config: config.clone(),
        cipher,
        identity: Arc::new(ProxyHeaderIdentity),
    };

    // Build router
    let app = create_router(state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    sweeper.stop().await;

    Ok(())
}

fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Token-holder routes (no auth required; delete authenticates in-handler)
    let public_routes = Router::new()
        .route(
            "/files/:token",
            get(handlers::file::download_file).delete(handlers::file::delete_file),
        )
        .route("/files/:token/info", get(handlers::file::file_info))
        .route("/files/:token/verify", post(handlers::file::verify_file));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route(
            "/files",
            get(handlers::file::list_my_files).post(handlers::file::upload_file),
        )
        .route("/files/:token/policy", put(handlers::file::update_policy))
        .route("/files/:token/logs", get(handlers::file::list_access_logs))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::identity::identity_middleware,
        ));

    // Combine all routes under /api/v1
    Router::new()
        .nest("/api/v1", public_routes.merge(protected_routes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
