use std::{net::SocketAddr, sync::Arc};

use axum::{
    routing::{delete, get, patch, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use watchroom_config::Config;
use watchroom_db::PersistenceGateway;

use crate::{http, reaper, registry::ConnectionRegistry};

/// Shared app state, cloned per request (everything inside is already an `Arc`).
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<dyn PersistenceGateway>,
    pub registry: Arc<ConnectionRegistry>,
    pub config: Arc<Config>,
}

/// Builds the gateway router (shared between production startup and tests).
pub fn build_gateway_app(
    gateway: Arc<dyn PersistenceGateway>,
    registry: Arc<ConnectionRegistry>,
    config: Arc<Config>,
) -> Router {
    let state = AppState { gateway, registry, config };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(http::status))
        .route("/api/login", post(http::login))
        .route("/api/logout", post(http::logout))
        .route("/api/register", post(http::register))
        .route("/api/forgot-password", post(http::forgot_password))
        .route("/api/forgot-password/{token}", get(http::check_reset_token))
        .route("/api/reset-password", post(http::reset_password))
        .route("/api/change-password", post(http::change_password))
        .route("/api/change-username", post(http::change_username))
        .route("/api/change-email", post(http::change_email))
        .route("/api/change-avatar", post(http::change_avatar))
        .route("/api/delete-account", delete(http::delete_account))
        .route("/api/usernames", get(http::usernames))
        .route("/api/room", post(http::create_room))
        .route("/api/room/{id}", get(http::get_room))
        .route("/api/room/{id}", patch(http::update_room))
        .route("/api/room/{id}/join", get(http::join_room))
        .route("/api/room/{id}/subtitle", get(http::get_subtitle))
        .route("/api/room/{id}/subtitle", post(http::upload_subtitle))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Connects to the configured backend, starts the reaper, and serves the
/// gateway app until the process is terminated.
pub async fn start_gateway(bind: &str, config: Config) -> anyhow::Result<()> {
    config.validate()?;

    let gateway = watchroom_db::connect(config.database, &config.database_url).await?;
    let registry = ConnectionRegistry::new();
    let config = Arc::new(config);

    tokio::spawn(reaper::run(Arc::clone(&gateway), Arc::clone(&registry)));

    let app = build_gateway_app(Arc::clone(&gateway), Arc::clone(&registry), Arc::clone(&config));

    let addr: SocketAddr = format!("{bind}:{}", config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, database = ?config.database, "watchroom gateway listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
