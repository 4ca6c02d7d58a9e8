mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use classchat_api::auth::{self, AppState, AppStateInner};
use classchat_api::conversations;
use classchat_api::middleware::require_auth;
use classchat_db::Database;
use classchat_gateway::connection::{self, Session};
use classchat_gateway::dispatcher::Dispatcher;
use classchat_gateway::messaging::Messenger;

use crate::config::Config;

#[derive(Clone)]
struct ServerState {
    messenger: Messenger<Database>,
    jwt_secret: String,
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "classchat=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = Arc::new(Database::open(&PathBuf::from(&config.db_path))?);

    // Shared state
    let messenger = Messenger::new(db.clone(), Dispatcher::new());
    let app_state: AppState = Arc::new(AppStateInner {
        db,
        jwt_secret: config.jwt_secret.clone(),
    });
    let state = ServerState {
        messenger,
        jwt_secret: config.jwt_secret.clone(),
    };

    // Routes
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/conversations", get(conversations::list_conversations))
        .route("/conversations/{conversation_id}/messages", get(conversations::get_messages))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_auth))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("classchat server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// `?token=` authenticates at upgrade time; without it the client must send
/// IDENTIFY as its first frame.
async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    match query.token {
        Some(token) => {
            let Some(claims) = connection::decode_token(&token, &state.jwt_secret) else {
                warn!("Rejected gateway upgrade with invalid token");
                return StatusCode::UNAUTHORIZED.into_response();
            };
            let session = Session::from(claims);
            ws.on_upgrade(move |socket| {
                connection::handle_connection_authenticated(socket, state.messenger, session)
            })
        }
        None => ws.on_upgrade(move |socket| {
            connection::handle_connection(socket, state.messenger, state.jwt_secret)
        }),
    }
}
