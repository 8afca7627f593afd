use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use cartsync_core::{CartLimits, CartMachine, Catalog};
use cartsync_settings::CartsyncSettings;
use cartsync_store::CartStore;
use cartsync_telemetry::MetricsRecorder;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::client::{self, ClientRegistry};
use crate::service::CartService;
use crate::sessions::{self, SessionRegistry};

/// Grace period for background tasks after shutdown is signalled.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
    pub cleanup_interval: Duration,
    /// `None` disables idle eviction.
    pub idle_timeout: Option<Duration>,
    pub eviction_interval: Duration,
    pub allow_explicit_close: bool,
    pub limits: CartLimits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&CartsyncSettings::default())
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &CartsyncSettings) -> Self {
        let server = &settings.server;
        let sessions = &settings.sessions;
        Self {
            host: server.host.clone(),
            port: server.port,
            max_send_queue: server.max_send_queue,
            heartbeat_interval: Duration::from_secs(server.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(server.client_timeout_secs),
            cleanup_interval: Duration::from_secs(server.cleanup_interval_secs),
            idle_timeout: (sessions.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(sessions.idle_timeout_secs)),
            eviction_interval: Duration::from_secs(sessions.eviction_interval_secs),
            allow_explicit_close: sessions.allow_explicit_close,
            limits: CartLimits {
                max_lines: sessions.max_lines,
                max_line_quantity: sessions.max_line_quantity,
            },
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CartService>,
    pub heartbeat_interval: Duration,
    pub shutdown: CancellationToken,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    catalog: Arc<dyn Catalog>,
    store: Arc<dyn CartStore>,
    metrics: Arc<MetricsRecorder>,
) -> Result<ServerHandle, std::io::Error> {
    let shutdown = CancellationToken::new();

    let clients = Arc::new(ClientRegistry::new(config.max_send_queue, config.client_timeout));
    let sessions = Arc::new(SessionRegistry::new(
        store,
        config.idle_timeout,
        Arc::clone(&metrics),
    ));
    let service = Arc::new(CartService::new(
        Arc::clone(&sessions),
        Arc::clone(&clients),
        catalog,
        CartMachine::new(config.limits),
        metrics,
        config.allow_explicit_close,
    ));

    let cleanup = client::start_cleanup_task(
        clients,
        Arc::clone(&service),
        config.cleanup_interval,
        shutdown.clone(),
    );
    let eviction =
        sessions::start_eviction_task(sessions, config.eviction_interval, shutdown.clone());

    let router = build_router(AppState {
        service,
        heartbeat_interval: config.heartbeat_interval,
        shutdown: shutdown.clone(),
    });
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(
        host = %config.host,
        port = local_addr.port(),
        idle_timeout_secs = config.idle_timeout.map(|d| d.as_secs()),
        allow_explicit_close = config.allow_explicit_close,
        "cartsync server started"
    );

    let serve_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(serve_shutdown.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        tasks: vec![server, cleanup, eviction],
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Token cancelled when the server shuts down.
    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signal shutdown and wait for the background tasks to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        tracing::info!(task_count = self.tasks.len(), "shutting down");
        let drain = futures::future::join_all(self.tasks);
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
            tracing::warn!("shutdown timed out after {SHUTDOWN_TIMEOUT:?}");
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a new WebSocket connection.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (client, rx) = state.service.connect();
    client::handle_ws_connection(
        socket,
        client,
        rx,
        state.service,
        state.heartbeat_interval,
        state.shutdown,
    )
    .await;
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    sessions: usize,
    connections: usize,
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(Health {
        status: "healthy",
        sessions: state.service.sessions().count(),
        connections: state.service.clients().count(),
    })
}

/// Metrics snapshot as JSON.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.metrics().report())
}
