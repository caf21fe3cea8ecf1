use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use relay_store::StoreOp;

use crate::config::ServerConfig;
use crate::connection::{self, ConnectionRegistry};
use crate::routing::{Inbound, OperatorVerifier, RoutingEngine};

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RoutingEngine>,
    pub registry: Arc<ConnectionRegistry>,
    pub inbound_tx: mpsc::Sender<Inbound>,
    pub heartbeat_interval: std::time::Duration,
    pub started_at: DateTime<Utc>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle that keeps the routing loop
/// and background tasks alive.
pub async fn start(
    config: ServerConfig,
    verifier: Box<dyn OperatorVerifier>,
    mirror: Option<mpsc::UnboundedSender<StoreOp>>,
    seed: Vec<relay_core::Conversation>,
) -> Result<ServerHandle, std::io::Error> {
    let registry = Arc::new(ConnectionRegistry::new(
        config.max_send_queue,
        config.client_timeout,
    ));
    let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(1024);

    let engine = Arc::new(RoutingEngine::new(
        Arc::clone(&registry),
        config.routing.clone(),
        verifier,
        mirror,
        inbound_tx.clone(),
    ));
    engine.seed(seed);

    let routing_handle = tokio::spawn(Arc::clone(&engine).run(inbound_rx));
    let cleanup_handle = connection::start_cleanup_task(
        Arc::clone(&registry),
        inbound_tx.clone(),
        config.cleanup_interval,
    );

    let app_state = AppState {
        engine: Arc::clone(&engine),
        registry,
        inbound_tx,
        heartbeat_interval: config.heartbeat_interval,
        started_at: Utc::now(),
    };

    let router = build_router(app_state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "relay server started");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        engine,
        _server: server_handle,
        _routing: routing_handle,
        _cleanup: cleanup_handle,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    pub engine: Arc<RoutingEngine>,
    _server: tokio::task::JoinHandle<()>,
    _routing: tokio::task::JoinHandle<()>,
    _cleanup: tokio::task::JoinHandle<()>,
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (connection_id, rx) = state.registry.register();
    tracing::info!(connection_id = %connection_id, "client connected");

    connection::handle_ws_connection(
        socket,
        connection_id,
        rx,
        state.registry,
        state.inbound_tx,
        state.heartbeat_interval,
    )
    .await;
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = (Utc::now() - state.started_at).num_seconds();
    axum::Json(serde_json::json!({
        "status": "healthy",
        "uptimeSecs": uptime,
        "connections": state.registry.count(),
    }))
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(state.engine.stats())
}
