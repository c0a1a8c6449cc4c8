use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    http::HeaderValue,
    response::IntoResponse,
    routing::{get, post},
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use animus_api::{AppState, AppStateInner, auth, health};
use animus_core::{AuthService, ChatRouter, PersonaRegistry};
use animus_engine::PersonaEngine;
use animus_engine::deepseek::DeepSeekEngine;
use animus_engine::template::TemplateEngine;
use animus_gateway::GatewayState;
use animus_gateway::connection;
use animus_gateway::dispatcher::Dispatcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "animus=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("ANIMUS_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("ANIMUS_DB_PATH").unwrap_or_else(|_| "animus.db".into());
    let host = std::env::var("ANIMUS_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("ANIMUS_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init database
    let db = Arc::new(animus_db::Database::open(&PathBuf::from(&db_path))?);

    // Persona backend: real collaborator when a key is configured, otherwise
    // the deterministic template engine (useful for local dev and demos).
    let engine: Arc<dyn PersonaEngine> = match std::env::var("DEEPSEEK_API_KEY") {
        Ok(key) if !key.is_empty() => {
            let api_url = std::env::var("DEEPSEEK_API_URL").ok();
            info!("Using DeepSeek persona engine");
            Arc::new(DeepSeekEngine::new(key, api_url))
        }
        _ => {
            info!("DEEPSEEK_API_KEY not set, using template persona engine");
            Arc::new(TemplateEngine)
        }
    };

    // Shared services
    let auth_service = Arc::new(AuthService::new(db.clone(), jwt_secret));
    let registry = Arc::new(PersonaRegistry::new(db.clone(), engine));
    registry.preload().await?;
    let chat = Arc::new(ChatRouter::new(db, registry.clone()));

    let app_state: AppState = Arc::new(AppStateInner {
        auth: auth_service.clone(),
        registry: registry.clone(),
    });

    let gateway_state = GatewayState {
        auth: auth_service,
        registry,
        chat,
        dispatcher: Dispatcher::new(),
    };

    // Routes
    let api_routes = Router::new()
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/verify", post(auth::verify))
        .route("/api/auth/guest", post(auth::guest))
        .route("/health", get(health::health))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(gateway_state);

    let app = Router::new()
        .merge(api_routes)
        .merge(ws_route)
        .layer(cors_layer()?)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Animus server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Permissive by default; ANIMUS_CORS_ORIGINS (comma-separated) locks the
/// allowed origins down for deployments.
fn cors_layer() -> anyhow::Result<CorsLayer> {
    match std::env::var("ANIMUS_CORS_ORIGINS") {
        Ok(origins) if !origins.trim().is_empty() => {
            let origins = origins
                .split(',')
                .map(|o| HeaderValue::from_str(o.trim()))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any))
        }
        _ => Ok(CorsLayer::permissive()),
    }
}

async fn ws_upgrade(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, state))
}
