//! Connection handlers for Relay server.
//!
//! Routes WebSocket upgrades into client sessions and serves the health and
//! metrics endpoints.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard, MetricsSnapshot};
use crate::middleware;
use anyhow::Result;
use axum::{
    extract::{ws::WebSocket, ConnectInfo, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use relay_protocol::unix_timestamp;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tenvis_relay_core::{Hub, HubHandle, RateLimiter, Session, SessionError};
use tenvis_relay_transport::WebSocketConnection;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Submission handle for the hub.
    pub hub: HubHandle,
    /// Per-IP request limiter.
    pub limiter: Arc<RateLimiter<IpAddr>>,
    /// Server configuration.
    pub config: Config,
    /// When the server started.
    pub started: Instant,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(hub: HubHandle, limiter: Arc<RateLimiter<IpAddr>>, config: Config) -> Self {
        Self {
            hub,
            limiter,
            config,
            started: Instant::now(),
        }
    }
}

/// Build the router with all routes and middleware.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/api/health", get(health_handler))
        .route("/api/metrics", get(metrics_handler))
        .layer(axum::middleware::from_fn(middleware::log_request))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            middleware::rate_limit,
        ))
        .layer(axum::middleware::from_fn(middleware::security_headers))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until interrupted.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    serve(listener, config, shutdown_signal()).await
}

/// Serve on `listener` until `signal` resolves.
///
/// Shutting down stops the hub, which closes every client queue so each
/// session sends a close frame and ends.
///
/// # Errors
///
/// Returns an error if the listener fails.
pub async fn serve<F>(listener: TcpListener, config: Config, signal: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (hub, hub_task) = Hub::spawn(config.hub_config());
    let limiter = Arc::new(RateLimiter::new(config.rate_limit_config()));
    let cleanup = limiter.spawn_cleanup(config.cleanup_interval());

    let addr = listener.local_addr()?;
    info!("Relay server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let state = Arc::new(AppState::new(hub.clone(), limiter, config));
    let shutdown_hub = hub.clone();
    let result = axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        signal.await;
        info!("Shutting down");
        if shutdown_hub.shutdown().await.is_err() {
            debug!("Hub already stopped");
        }
    })
    .await;

    cleanup.stop();
    if result.is_err() {
        // The shutdown future never ran.
        let _ = hub.shutdown().await;
    }
    if let Err(e) = hub_task.await {
        warn!(error = %e, "Hub task failed");
    }

    result?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": unix_timestamp(),
    }))
}

/// Process metrics handler.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.hub.stats().await {
        Ok(stats) => {
            metrics::record_hub_stats(&stats);
            Json(MetricsSnapshot::collect(state.started, &stats)).into_response()
        }
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let limit = state.config.limits.max_message_size;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_websocket(socket, addr, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, addr: SocketAddr, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let session = Session::new(state.hub.clone(), state.config.session_config());
    let id = session.id();
    debug!(client = %id, remote = %addr, "WebSocket connected");

    let conn = WebSocketConnection::new(socket, Some(addr));
    let result = session.run(Box::new(conn)).await;

    let reason = end_reason(&result);
    metrics::record_session_end(reason);
    match result {
        Ok(()) => debug!(client = %id, "WebSocket disconnected"),
        Err(e) => debug!(client = %id, reason, error = %e, "WebSocket disconnected"),
    }
}

fn end_reason(result: &Result<(), SessionError>) -> &'static str {
    match result {
        Ok(()) => "closed",
        Err(SessionError::Transport(_)) => "transport",
        Err(SessionError::Protocol(_)) => "protocol",
        Err(SessionError::IdleTimeout(_)) => "idle_timeout",
        Err(SessionError::Hub(_)) => "hub",
        Err(SessionError::Writer(_)) => "writer",
    }
}
