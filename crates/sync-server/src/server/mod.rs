//! HTTP delivery API and process-level server startup.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde_json::json;
use sync_router::{
    AuthKeyId, ConnectionInfo, ConnectionRegistry, DeliveryRequest, DispatchSummary,
    FanoutDispatcher, InMemoryStatusLookup, SessionStatus, SyncError, SyncServer, UserId,
};
use tokio_util::sync::CancellationToken;
use tower_http::{
    compression::CompressionLayer,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

use crate::config::ServerConfig;

/// Shared state for HTTP handlers.
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub lookup: Arc<InMemoryStatusLookup>,
    pub dispatcher: FanoutDispatcher<InMemoryStatusLookup>,
}

impl AppState {
    pub fn new(registry: Arc<ConnectionRegistry>, lookup: Arc<InMemoryStatusLookup>) -> Self {
        let dispatcher = FanoutDispatcher::new(Arc::clone(&registry), Arc::clone(&lookup));
        Self {
            registry,
            lookup,
            dispatcher,
        }
    }
}

/// Error returned by delivery API handlers.
#[derive(Debug)]
pub struct ApiError(SyncError);

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SyncError::StatusLookup(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(json!({ "error": self.0.to_string(), "kind": self.0.kind() })),
        )
            .into_response()
    }
}

/// Start the stream listener and the HTTP delivery API.
///
/// Both stop when `shutdown` is cancelled; an error in either cancels the other.
pub async fn start(config: ServerConfig, shutdown: CancellationToken) -> Result<()> {
    let registry = Arc::new(ConnectionRegistry::new(config.queue_capacity));
    let lookup = Arc::new(InMemoryStatusLookup::new());
    let state = Arc::new(AppState::new(Arc::clone(&registry), lookup));

    let stream_server = SyncServer::new(config.stream_config(), Arc::clone(&registry));
    let stream_listener = stream_server
        .bind()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind stream listener: {}", e))?;
    let http_listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .map_err(|e| {
            anyhow::anyhow!("Failed to bind HTTP listener on {}: {}", config.http_addr, e)
        })?;

    let stream_handle = tokio::spawn(stream_server.run(stream_listener, shutdown.clone()));
    let http_handle = tokio::spawn(start_http_server(state, http_listener, shutdown.clone()));

    let (stream_result, http_result) = tokio::join!(
        async {
            let result = stream_handle.await;
            shutdown.cancel();
            match result {
                Ok(Ok(())) => {
                    info!("Stream listener stopped");
                    Ok(())
                }
                Ok(Err(e)) => Err(anyhow::anyhow!("Stream listener error: {}", e)),
                Err(e) => Err(anyhow::anyhow!("Stream listener task failed: {}", e)),
            }
        },
        async {
            let result = http_handle.await;
            shutdown.cancel();
            match result {
                Ok(Ok(())) => {
                    info!("HTTP server stopped");
                    Ok(())
                }
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow::anyhow!("HTTP server task failed: {}", e)),
            }
        }
    );

    stream_result.and(http_result)
}

/// Start the HTTP server with graceful shutdown support.
async fn start_http_server(
    state: Arc<AppState>,
    listener: tokio::net::TcpListener,
    stop_token: CancellationToken,
) -> Result<()> {
    let app = create_router(state);

    let addr = listener.local_addr()?;
    info!("Starting delivery API on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            stop_token.cancelled().await;
            info!("HTTP server received shutdown signal, draining connections");
        })
        .await?;

    Ok(())
}

/// Create the Axum router with all routes and middleware
fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/deliver", post(deliver_handler))
        .route("/v1/sessions", put(session_online_handler))
        .route(
            "/v1/sessions/:user_id/:auth_key_id",
            delete(session_offline_handler),
        )
        .route("/v1/connections", get(connections_handler))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
}

/// Simple health check endpoint (for load balancers)
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "sync-server",
            "version": env!("CARGO_PKG_VERSION"),
            "connections": state.registry.connection_count(),
        })),
    )
}

/// Fan a delivery request out to the owning session servers.
///
/// Responds once the server groups are spawned, before the updates are written.
async fn deliver_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DeliveryRequest>,
) -> Result<(StatusCode, Json<DispatchSummary>), ApiError> {
    let receipt = state.dispatcher.dispatch(request).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt.summary())))
}

async fn session_online_handler(
    State(state): State<Arc<AppState>>,
    Json(status): Json<SessionStatus>,
) -> StatusCode {
    state.lookup.set_online(status);
    StatusCode::NO_CONTENT
}

async fn session_offline_handler(
    State(state): State<Arc<AppState>>,
    Path((user_id, auth_key_id)): Path<(UserId, AuthKeyId)>,
) -> StatusCode {
    if state.lookup.set_offline(user_id, auth_key_id) {
        StatusCode::NO_CONTENT
    } else {
        warn!(user_id, auth_key_id, "Offline report for unknown session");
        StatusCode::NOT_FOUND
    }
}

async fn connections_handler(State(state): State<Arc<AppState>>) -> Json<Vec<ConnectionInfo>> {
    Json(state.registry.list_connections())
}
