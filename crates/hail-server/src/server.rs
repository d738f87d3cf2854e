use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use hail_core::events::{self, JoinPayload};
use hail_core::IdentityKind;
use hail_store::{Database, IdentityRepo};
use hail_telemetry::{LogQuery, SqliteLogSink};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::config::{Heartbeat, ServerConfig};
use crate::connection::{self, ConnectionHub};
use crate::delivery::DeliveryGateway;
use crate::presence::{PresenceSynchronizer, Session};
use crate::reaper::Reaper;
use crate::registry::SessionRegistry;
use crate::rooms::RoomRouter;
use crate::transport::Transport;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<ConnectionHub>,
    pub registry: Arc<SessionRegistry>,
    pub presence: Arc<PresenceSynchronizer>,
    pub repo: Arc<IdentityRepo>,
    pub heartbeat: Heartbeat,
    pub log_sink: Option<Arc<SqliteLogSink>>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, cors_origin: &str) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/presence", get(presence_handler))
        .route("/presence/online", get(online_handler))
        .route("/logs", get(logs_handler))
        .with_state(state)
        .layer(cors_layer(cors_origin))
}

fn cors_layer(origin: &str) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE])
        .allow_credentials(true);
    match HeaderValue::from_str(origin) {
        Ok(value) => layer.allow_origin(AllowOrigin::list([value])),
        Err(e) => {
            tracing::warn!(origin, error = %e, "Invalid CORS origin, cross-origin calls disabled");
            layer
        }
    }
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(config: ServerConfig, db: Database) -> Result<ServerHandle, std::io::Error> {
    start_with_telemetry(config, db, None).await
}

/// [`start`], also serving persisted warn+ logs from `log_sink` at `/logs`.
pub async fn start_with_telemetry(
    config: ServerConfig,
    db: Database,
    log_sink: Option<Arc<SqliteLogSink>>,
) -> Result<ServerHandle, std::io::Error> {
    let repo = Arc::new(IdentityRepo::new(db));
    if config.reset_presence_on_start {
        match repo.reset_presence() {
            Ok(reset) if reset > 0 => tracing::info!(reset, "Cleared presence left over from last run"),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to reset presence"),
        }
    }

    let hub = Arc::new(ConnectionHub::new(config.max_send_queue));
    let transport: Arc<dyn Transport> = hub.clone();
    let registry = Arc::new(SessionRegistry::new());

    let presence = Arc::new(PresenceSynchronizer::new(
        Arc::clone(&registry),
        Arc::clone(&transport),
        repo.clone(),
    ));
    let rooms = Arc::new(RoomRouter::new(Arc::clone(&registry), Arc::clone(&transport)));
    let delivery = Arc::new(DeliveryGateway::new(
        Arc::clone(&transport),
        Arc::clone(&registry),
        config.ack_timeout(),
    ));

    let cancel = CancellationToken::new();
    let reaper = Arc::new(
        Reaper::new(Arc::clone(&registry), Arc::clone(&transport), config.reaper.clone())
            .with_store(repo.clone()),
    );
    let reaper_handle = reaper.spawn(cancel.child_token());

    let app_state = AppState {
        hub: Arc::clone(&hub),
        registry: Arc::clone(&registry),
        presence: Arc::clone(&presence),
        repo,
        heartbeat: config.heartbeat(),
        log_sink,
    };
    let router = build_router(app_state, &config.cors_origin);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), cors_origin = %config.cors_origin, "Presence server started");

    let serve_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(serve_cancel.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "Server error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        registry,
        rooms,
        delivery,
        presence,
        hub,
        cancel,
        tasks: vec![server_handle, reaper_handle],
    })
}

/// Handle returned by `start()`. Exposes the components that business
/// logic uses to reach connected riders and drivers.
pub struct ServerHandle {
    pub port: u16,
    pub registry: Arc<SessionRegistry>,
    pub rooms: Arc<RoomRouter>,
    pub delivery: Arc<DeliveryGateway>,
    pub presence: Arc<PresenceSynchronizer>,
    hub: Arc<ConnectionHub>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn connection_count(&self) -> usize {
        self.hub.count()
    }

    /// Stop accepting connections, close every session, stop the reaper,
    /// and wait briefly for background tasks to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let closed = self.hub.close_all();
        tracing::info!(closed, "Shutting down");

        let drain = futures::future::join_all(self.tasks);
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
            tracing::warn!("Shutdown timed out, some tasks may still be running");
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Serve one client: route its events until the transport closes, then
/// release whatever identity it held.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (conn, rx) = state.hub.register();
    let mut session = Session::new(conn.session_id.clone(), conn.opened_at);
    tracing::info!(session_id = %session.session_id, "WebSocket client connected");

    let (event_tx, mut event_rx) = mpsc::channel::<(String, Value)>(64);
    let driver = tokio::spawn(connection::drive(
        socket,
        conn,
        rx,
        Arc::clone(&state.hub),
        state.heartbeat,
        event_tx,
    ));

    while let Some((event, data)) = event_rx.recv().await {
        match event.as_str() {
            events::JOIN => {
                let payload: JoinPayload = serde_json::from_value(data).unwrap_or_default();
                // Outcome already reported to the client.
                let _ = state.presence.handle_join(&mut session, &payload).await;
            }
            events::ERROR => {
                tracing::warn!(session_id = %session.session_id, data = %data, "Client reported error");
            }
            other => {
                tracing::debug!(session_id = %session.session_id, event = other, "Ignoring unknown event");
            }
        }
    }

    let _ = driver.await;
    match state.presence.disconnect(&mut session).await {
        Ok(outcome) => {
            tracing::info!(session_id = %session.session_id, ?outcome, "WebSocket client disconnected");
        }
        Err(e) => {
            tracing::warn!(session_id = %session.session_id, error_kind = e.error_kind(), error = %e, "Disconnect not persisted");
        }
    }
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "sessions": state.hub.count(),
        "identities": state.registry.size(),
    }))
}

/// Active connection records.
async fn presence_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut records = state.registry.snapshot();
    records.sort_by(|a, b| a.bound_at.cmp(&b.bound_at));
    Json(records)
}

#[derive(Debug, Deserialize)]
struct OnlineQuery {
    kind: Option<IdentityKind>,
}

/// Identities the store marks online, as of the last persisted write.
async fn online_handler(
    State(state): State<AppState>,
    Query(query): Query<OnlineQuery>,
) -> impl IntoResponse {
    match state.repo.list_online(query.kind) {
        Ok(rows) => (StatusCode::OK, Json(json!(rows))),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to list online identities");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
        }
    }
}

async fn logs_handler(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> impl IntoResponse {
    let Some(sink) = state.log_sink else {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "log persistence disabled"})));
    };
    match sink.query(&query) {
        Ok(records) => (StatusCode::OK, Json(json!(records))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}
